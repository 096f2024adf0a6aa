//! Class registration and schema versioning.
//!
//! A class registers under a unique name with a `dbVersion` fingerprint
//! of its transform. At registration the persisted state record is
//! compared against the current fingerprint: a match adopts the stored
//! start version; a mismatch clears the table, runs the class's reset,
//! and persists a fresh record. Sources must be registered before their
//! dependents, which makes the class graph a DAG by construction.

use crate::class::{ClassDescriptor, EntityClass, VersionSpec};
use crate::completion::Completion;
use crate::config::StoreConfig;
use crate::entity::{PersistedClassState, ENTITY_RANGE_START, LAST_VERSION_KEY, STATE_KEY};
use crate::error::{StoreError, StoreResult};
use crate::events::UpdateListener;
use crate::expiration::ExpirationStrategy;
use crate::version::VersionSource;
use cascade_kv::{KvEngine, KvTable, ScanRange};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// Key for the transform fingerprint HMAC.
const VERSION_HMAC_KEY: &[u8] = b"portal";

/// A computed class fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// The `dbVersion` value persisted in the state record.
    pub db_version: String,
    /// Source-file modification time, when derived from a file.
    pub transform_version: Option<u64>,
}

/// Computes the fingerprint for a version spec.
pub fn fingerprint(spec: &VersionSpec) -> StoreResult<Fingerprint> {
    match spec {
        VersionSpec::Explicit(version) => Ok(Fingerprint {
            db_version: version.to_string(),
            transform_version: None,
        }),
        VersionSpec::SourceText(text) => Ok(Fingerprint {
            db_version: hmac_hex(text.as_bytes()),
            transform_version: None,
        }),
        VersionSpec::SourceFile(path) => {
            let contents = std::fs::read(path)?;
            let mtime = std::fs::metadata(path)?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Ok(Fingerprint {
                db_version: hmac_hex(&contents),
                transform_version: Some(mtime),
            })
        }
    }
}

fn hmac_hex(message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(VERSION_HMAC_KEY).expect("HMAC can take key of any size");
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The class registry owned by a store.
pub struct Registry {
    engine: Arc<dyn KvEngine>,
    versions: Arc<VersionSource>,
    expiration: Arc<ExpirationStrategy>,
    config: StoreConfig,
    classes: RwLock<HashMap<String, Arc<EntityClass>>>,
}

impl Registry {
    /// Creates an empty registry over `engine`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn KvEngine>,
        versions: Arc<VersionSource>,
        expiration: Arc<ExpirationStrategy>,
        config: StoreConfig,
    ) -> Self {
        Self {
            engine,
            versions,
            expiration,
            config,
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a class from its descriptor.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` for a duplicate name and
    /// `UnknownClass` when a source has not been registered yet.
    pub fn register(&self, descriptor: ClassDescriptor) -> StoreResult<Arc<EntityClass>> {
        if self.classes.read().contains_key(&descriptor.name) {
            return Err(StoreError::already_registered(&descriptor.name));
        }

        // Sources register first; the dependency graph is acyclic by
        // construction.
        let mut sources = Vec::with_capacity(descriptor.sources.len());
        for name in &descriptor.sources {
            sources.push(
                self.get(name)
                    .ok_or_else(|| StoreError::unknown_class(name))?,
            );
        }

        let print = fingerprint(&descriptor.version_spec)?;
        let table = self.engine.open(&descriptor.name)?;
        let class = EntityClass::new(
            descriptor,
            Arc::clone(&table),
            Arc::clone(&self.versions),
            Arc::clone(&self.expiration),
            self.config.clone(),
        );
        class.set_resolved_sources(sources.clone());
        class.set_transform_version(print.transform_version);

        let (ready, ready_handle) = Completion::new();
        class.set_ready(ready_handle);

        // Adopt the persisted watermark before anything writes.
        if let Some(bytes) = table.get(&LAST_VERSION_KEY)? {
            if let Some(version) = parse_watermark(&bytes) {
                class.batcher().observe_version(version);
            }
        }

        let stored: Option<PersistedClassState> = table
            .get(&STATE_KEY)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        match &stored {
            Some(state) if state.db_version == print.db_version => {
                class.set_start_version(state.start_version);
            }
            _ => {
                let start_version = self.versions.next();
                class.set_start_version(start_version);

                let has_rows = !table
                    .scan(&ScanRange::all().gt(ENTITY_RANGE_START.to_vec()).keys_only())?
                    .is_empty();
                let clear_db = stored.is_some() || has_rows;
                if clear_db {
                    info!(
                        class = class.name(),
                        db_version = %print.db_version,
                        "schema fingerprint changed, resetting table"
                    );
                }
                class.reset_all(clear_db)?;

                let record = PersistedClassState {
                    start_version,
                    db_version: print.db_version.clone(),
                };
                let version = self.versions.next();
                class
                    .batcher()
                    .put(STATE_KEY.to_vec(), serde_json::to_vec(&record)?, version);
            }
        }

        // Derived classes subscribe to their sources and replay what
        // they missed while offline.
        if class.descriptor().transform.is_some() {
            for source in &sources {
                source.notifies(Arc::clone(&class) as Arc<dyn UpdateListener>);
            }
            class.catch_up_from_sources()?;
        }

        {
            let mut classes = self.classes.write();
            if classes.contains_key(class.name()) {
                return Err(StoreError::already_registered(class.name()));
            }
            classes.insert(class.name().to_string(), Arc::clone(&class));
        }

        ready.complete();
        Ok(class)
    }

    /// Looks up a registered class.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<EntityClass>> {
        self.classes.read().get(name).cloned()
    }

    /// Returns every registered class.
    #[must_use]
    pub fn classes(&self) -> Vec<Arc<EntityClass>> {
        self.classes.read().values().cloned().collect()
    }
}

fn parse_watermark(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use cascade_kv::MemoryEngine;
    use serde_json::json;
    use std::time::Duration;

    fn registry_over(engine: Arc<MemoryEngine>) -> Registry {
        Registry::new(
            engine,
            Arc::new(VersionSource::new()),
            Arc::new(ExpirationStrategy::new(1 << 20)),
            StoreConfig::new().batch_linger(Duration::from_millis(1)),
        )
    }

    #[test]
    fn duplicate_name_rejected() {
        let registry = registry_over(Arc::new(MemoryEngine::new()));
        registry
            .register(ClassDescriptor::persisted("foo"))
            .unwrap();
        assert!(matches!(
            registry.register(ClassDescriptor::persisted("foo")),
            Err(StoreError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn unknown_source_rejected() {
        let registry = registry_over(Arc::new(MemoryEngine::new()));
        let descriptor = ClassDescriptor::cached(
            "derived",
            vec!["missing".into()],
            Arc::new(|_: &[Option<serde_json::Value>]| None),
        );
        assert!(matches!(
            registry.register(descriptor),
            Err(StoreError::UnknownClass { .. })
        ));
    }

    #[test]
    fn reregister_same_version_keeps_rows() {
        let engine = Arc::new(MemoryEngine::new());
        {
            let registry = registry_over(Arc::clone(&engine));
            let foo = registry
                .register(ClassDescriptor::persisted("foo").with_version(VersionSpec::Explicit(7)))
                .unwrap();
            foo.set(&EntityId::Num(1), json!({"a": 1})).unwrap().wait();
        }
        let registry = registry_over(Arc::clone(&engine));
        let foo = registry
            .register(ClassDescriptor::persisted("foo").with_version(VersionSpec::Explicit(7)))
            .unwrap();
        foo.when_ready().wait();
        assert_eq!(foo.entries().unwrap().len(), 1);
    }

    #[test]
    fn version_change_clears_table() {
        let engine = Arc::new(MemoryEngine::new());
        {
            let registry = registry_over(Arc::clone(&engine));
            let foo = registry
                .register(ClassDescriptor::persisted("foo").with_version(VersionSpec::Explicit(1)))
                .unwrap();
            foo.set(&EntityId::Num(1), json!({"a": 1})).unwrap();
            foo.flush_writes();
        }
        let registry = registry_over(Arc::clone(&engine));
        let foo = registry
            .register(ClassDescriptor::persisted("foo").with_version(VersionSpec::Explicit(2)))
            .unwrap();
        foo.when_ready().wait();
        assert!(foo.entries().unwrap().is_empty());
    }

    #[test]
    fn source_text_fingerprints_differ() {
        let a = fingerprint(&VersionSpec::SourceText("fn a() {}".into())).unwrap();
        let b = fingerprint(&VersionSpec::SourceText("fn b() {}".into())).unwrap();
        assert_ne!(a.db_version, b.db_version);
        assert_eq!(a.db_version.len(), 64);
    }

    #[test]
    fn watermark_adopted_on_reopen() {
        let engine = Arc::new(MemoryEngine::new());
        let watermark = {
            let registry = registry_over(Arc::clone(&engine));
            let foo = registry
                .register(ClassDescriptor::persisted("foo"))
                .unwrap();
            foo.set(&EntityId::Num(1), json!(1)).unwrap().wait();
            foo.last_version()
        };
        let registry = registry_over(Arc::clone(&engine));
        let foo = registry
            .register(ClassDescriptor::persisted("foo"))
            .unwrap();
        assert_eq!(foo.last_version(), watermark);
    }
}
