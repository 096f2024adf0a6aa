//! Entities, identifiers, and the on-disk row form.

use crate::error::{StoreError, StoreResult};
use crate::expiration::Evictable;
use cascade_codec::Key;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved key holding the persisted class state record.
pub const STATE_KEY: [u8; 2] = [0x01, 0x01];

/// Reserved key holding the last committed (or last indexed) version,
/// as a decimal string.
pub const LAST_VERSION_KEY: [u8; 2] = [0x01, 0x02];

/// Every entity key starts at or above this byte, so a scan with this
/// exclusive lower bound yields all entities and no reserved rows.
pub const ENTITY_RANGE_START: [u8; 1] = [0x02];

/// Fixed per-entry weight charged to the expiration strategy on top of
/// the serialized payload size.
pub const ENTRY_OVERHEAD: u64 = 64;

/// An entity identifier: a positive integer or a non-numeric string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityId {
    /// A positive integer id.
    Num(u64),
    /// A non-numeric string id.
    Text(String),
}

impl EntityId {
    /// Validates a numeric id: positive and exactly representable in
    /// the key encoding.
    pub fn from_u64(id: u64) -> StoreResult<Self> {
        if id == 0 || id > (1 << 53) {
            return Err(StoreError::bad_id(id.to_string()));
        }
        Ok(Self::Num(id))
    }

    /// Validates a string id, rejecting strings that parse as positive
    /// numbers (those must be supplied as numbers).
    pub fn parse(id: &str) -> StoreResult<Self> {
        if id.is_empty() {
            return Err(StoreError::bad_id(id));
        }
        if let Ok(parsed) = id.parse::<f64>() {
            if parsed > 0.0 {
                return Err(StoreError::bad_id(id));
            }
        }
        Ok(Self::Text(id.to_string()))
    }

    /// Returns the codec key for this id.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_key(&self) -> Key {
        match self {
            Self::Num(n) => Key::Int(*n as i64),
            Self::Text(s) => Key::Text(s.clone()),
        }
    }

    /// Recovers an id from a decoded key.
    #[allow(clippy::cast_sign_loss)]
    pub fn from_key(key: &Key) -> StoreResult<Self> {
        match key {
            Key::Int(i) if *i > 0 => Ok(Self::Num(*i as u64)),
            Key::Text(s) => Ok(Self::Text(s.clone())),
            other => Err(StoreError::bad_id(other.to_string())),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for EntityId {
    /// Panics on invalid ids; use [`EntityId::from_u64`] for fallible
    /// conversion. Intended for literals in application code and tests.
    fn from(id: u64) -> Self {
        Self::from_u64(id).expect("invalid numeric entity id")
    }
}

/// The coarse lifecycle of an entity's in-memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Nothing loaded yet.
    Unloaded,
    /// A load is in progress.
    LoadingLocalData,
    /// The cached value matches the persisted row.
    UpToDate,
    /// The persisted row is a version-only invalidation marker.
    Invalidated,
    /// No persisted row exists.
    NoLocalData,
}

/// A decoded entity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row version.
    pub version: u64,
    /// Serialized value; `None` for a version-only invalidation row.
    pub json: Option<String>,
}

/// Encodes a row: `"<version>,<json>"` with a value, `"<version>"`
/// alone for an invalidation marker.
#[must_use]
pub fn encode_row(version: u64, json: Option<&str>) -> Vec<u8> {
    match json {
        Some(json) => format!("{version},{json}").into_bytes(),
        None => version.to_string().into_bytes(),
    }
}

/// Decodes a row produced by [`encode_row`].
pub fn decode_row(bytes: &[u8]) -> StoreResult<Row> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::corrupt("row bytes are not UTF-8"))?;
    let (version_text, json) = match text.find(',') {
        Some(at) => (&text[..at], Some(text[at + 1..].to_string())),
        None => (text, None),
    };
    let version = version_text
        .parse::<u64>()
        .map_err(|_| StoreError::corrupt(format!("bad row version: {version_text}")))?;
    Ok(Row { version, json })
}

/// The persisted class state record stored at [`STATE_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedClassState {
    /// Version the class started from.
    pub start_version: u64,
    /// Fingerprint of the class's transform, or its explicit version.
    pub db_version: String,
}

/// Mutable in-memory state of one entity.
#[derive(Debug, Default)]
pub struct EntityState {
    /// Cache lifecycle.
    pub ready: ReadyState,
    /// Current version.
    pub version: u64,
    /// Serialized value, when known.
    pub as_json: Option<String>,
    /// Deserialized value, built lazily.
    pub cached_value: Option<serde_json::Value>,
}

impl Default for ReadyState {
    fn default() -> Self {
        Self::Unloaded
    }
}

/// One live entity: the canonical in-memory object for a `(class, id)`.
///
/// The identity map guarantees at most one live `Entity` per id; all
/// mutation goes through the owning class.
pub struct Entity {
    /// The entity's identifier.
    pub id: EntityId,
    state: Mutex<EntityState>,
}

impl Entity {
    /// Creates an unloaded entity.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            state: Mutex::new(EntityState::default()),
        }
    }

    /// Locks and returns the entity's state.
    pub fn state(&self) -> parking_lot::MutexGuard<'_, EntityState> {
        self.state.lock()
    }

    /// Returns the current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Returns the current ready state.
    #[must_use]
    pub fn ready(&self) -> ReadyState {
        self.state.lock().ready
    }

    /// Returns the weight this entity charges the expiration strategy.
    #[must_use]
    pub fn weight(&self) -> u64 {
        let state = self.state.lock();
        ENTRY_OVERHEAD + state.as_json.as_ref().map_or(0, |j| j.len() as u64)
    }
}

impl Evictable for Entity {
    fn clear_cache(&self) {
        let mut state = self.state.lock();
        state.as_json = None;
        state.cached_value = None;
        if matches!(state.ready, ReadyState::UpToDate | ReadyState::Invalidated) {
            state.ready = ReadyState::Unloaded;
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("ready", &state.ready)
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}
