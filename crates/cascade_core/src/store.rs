//! The object store facade.

use crate::class::{ClassDescriptor, EntityClass, TransformFn, VersionSpec};
use crate::config::StoreConfig;
use crate::entity::{PersistedClassState, STATE_KEY};
use crate::error::{StoreError, StoreResult};
use crate::events::UpdateListener;
use crate::expiration::ExpirationStrategy;
use crate::index::{IndexByFn, IndexClass};
use crate::registry::{fingerprint, Registry};
use crate::version::VersionSource;
use cascade_kv::{KvEngine, KvTable, MemoryEngine};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The main store handle.
///
/// Owns the KV engine, the class registry, the expiration strategy, and
/// the version sequence; classes and indexes are defined through it and
/// share those services.
///
/// # Example
///
/// ```rust,ignore
/// use cascade_core::{ClassDescriptor, ObjectStore};
///
/// let store = ObjectStore::open_in_memory();
/// let tasks = store.define(ClassDescriptor::persisted("tasks"))?;
/// tasks.set(&1.into(), serde_json::json!({"title": "write docs"}))?;
/// ```
pub struct ObjectStore {
    engine: Arc<dyn KvEngine>,
    config: StoreConfig,
    versions: Arc<VersionSource>,
    expiration: Arc<ExpirationStrategy>,
    registry: Registry,
    indexes: RwLock<HashMap<String, Arc<IndexClass>>>,
}

impl ObjectStore {
    /// Opens a store over an engine.
    #[must_use]
    pub fn open(engine: Arc<dyn KvEngine>, config: StoreConfig) -> Self {
        let versions = Arc::new(VersionSource::new());
        let expiration = Arc::new(ExpirationStrategy::new(config.cache_capacity));
        let registry = Registry::new(
            Arc::clone(&engine),
            Arc::clone(&versions),
            Arc::clone(&expiration),
            config.clone(),
        );
        Self {
            engine,
            config,
            versions,
            expiration,
            registry,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a fresh in-memory store for testing.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self::open(Arc::new(MemoryEngine::new()), StoreConfig::default())
    }

    /// Returns the engine the store runs over.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the store's version sequence.
    #[must_use]
    pub fn versions(&self) -> &Arc<VersionSource> {
        &self.versions
    }

    /// Registers a class from its descriptor.
    pub fn define(&self, descriptor: ClassDescriptor) -> StoreResult<Arc<EntityClass>> {
        self.registry.register(descriptor)
    }

    /// Registers a derived class over `sources`.
    pub fn define_cached(
        &self,
        name: impl Into<String>,
        sources: Vec<String>,
        transform: TransformFn,
    ) -> StoreResult<Arc<EntityClass>> {
        self.define(ClassDescriptor::cached(name, sources, transform))
    }

    /// Defines an index over a registered source class.
    pub fn define_index(
        &self,
        source: &str,
        name: impl Into<String>,
        index_by: IndexByFn,
    ) -> StoreResult<Arc<IndexClass>> {
        self.define_index_with(source, name, index_by, VersionSpec::Explicit(1))
    }

    /// Defines an index with an explicit version spec for its schema
    /// fingerprint. A fingerprint change clears the index table, so the
    /// resume that follows becomes a full rebuild.
    pub fn define_index_with(
        &self,
        source: &str,
        name: impl Into<String>,
        index_by: IndexByFn,
        version_spec: VersionSpec,
    ) -> StoreResult<Arc<IndexClass>> {
        let name = name.into();
        if self.indexes.read().contains_key(&name) || self.registry.get(&name).is_some() {
            return Err(StoreError::already_registered(&name));
        }
        let source_class = self
            .registry
            .get(source)
            .ok_or_else(|| StoreError::unknown_class(source))?;

        let table = self.engine.open(&name)?;
        let print = fingerprint(&version_spec)?;
        let stored: Option<PersistedClassState> = table
            .get(&STATE_KEY)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        let matches = stored
            .as_ref()
            .is_some_and(|state| state.db_version == print.db_version);
        if !matches {
            if stored.is_some() {
                info!(index = %name, "index fingerprint changed, rebuilding");
            }
            // Clearing drops the watermark too, so resume rebuilds.
            table.clear()?;
            let record = PersistedClassState {
                start_version: self.versions.next(),
                db_version: print.db_version,
            };
            table.put(&STATE_KEY, &serde_json::to_vec(&record)?)?;
        }

        let index = IndexClass::new(name.clone(), table, Arc::clone(&source_class), index_by);
        source_class.notifies(Arc::clone(&index) as Arc<dyn UpdateListener>);
        // Settle the source's pending batches so resume scans a
        // consistent snapshot.
        source_class.flush_writes();
        index.resume()?;

        self.indexes.write().insert(name, Arc::clone(&index));
        Ok(index)
    }

    /// Looks up a registered class.
    #[must_use]
    pub fn class(&self, name: &str) -> Option<Arc<EntityClass>> {
        self.registry.get(name)
    }

    /// Looks up a defined index.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<Arc<IndexClass>> {
        self.indexes.read().get(name).cloned()
    }

    /// Waits until every index is idle and every class's writes are
    /// durable.
    pub fn drain(&self) {
        let indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        for index in &indexes {
            index.drain();
        }
        for class in self.registry.classes() {
            class.flush_writes();
        }
        // Index passes may have invalidated derived rows; settle those
        // writes too.
        for index in &indexes {
            index.drain();
        }
    }

    /// Flushes everything and releases the store.
    pub fn close(&self) {
        self.drain();
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("classes", &self.registry.classes().len())
            .field("indexes", &self.indexes.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use serde_json::json;

    #[test]
    fn define_and_look_up() {
        let store = ObjectStore::open_in_memory();
        store.define(ClassDescriptor::persisted("foo")).unwrap();
        assert!(store.class("foo").is_some());
        assert!(store.class("bar").is_none());
    }

    #[test]
    fn index_name_collision_rejected() {
        let store = ObjectStore::open_in_memory();
        store.define(ClassDescriptor::persisted("foo")).unwrap();
        store
            .define_index(
                "foo",
                "foo-by-a",
                Arc::new(|value: &serde_json::Value| {
                    vec![crate::index::IndexEmission::key_only(
                        value["a"].as_str().unwrap_or_default(),
                    )]
                }),
            )
            .unwrap();
        let err = store
            .define_index(
                "foo",
                "foo-by-a",
                Arc::new(|_: &serde_json::Value| Vec::new()),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyRegistered { .. }));
    }

    #[test]
    fn unknown_index_source_rejected() {
        let store = ObjectStore::open_in_memory();
        let err = store
            .define_index(
                "missing",
                "idx",
                Arc::new(|_: &serde_json::Value| Vec::new()),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownClass { .. }));
    }

    #[test]
    fn drain_settles_writes() {
        let store = ObjectStore::open_in_memory();
        let foo = store.define(ClassDescriptor::persisted("foo")).unwrap();
        foo.set(&EntityId::Num(1), json!({"a": 1})).unwrap();
        store.drain();
        assert!(foo.write_completion().is_complete());
    }
}
