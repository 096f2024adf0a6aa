//! Cascade: a persistent, reactive, incrementally-indexed object store
//! over an ordered key-value engine.
//!
//! Application classes bind to backing tables; each entity has an
//! identifier, a JSON value, and a monotonic version. Derived indexes
//! and cached transforms stay consistent with their sources through
//! update events, per-index work queues, and batched commits, while a
//! store-wide size-weighted LRU bounds in-memory cache weight.

pub mod batcher;
pub mod cached;
pub mod class;
pub mod completion;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod events;
pub mod expiration;
pub mod identity;
pub mod index;
pub mod permission;
pub mod registry;
pub mod store;
pub mod version;

pub use class::{ClassDescriptor, EntityClass, TransformFn, ValueOutcome, VersionSpec};
pub use completion::{Completion, CompletionHandle};
pub use config::StoreConfig;
pub use context::{Context, Session};
pub use entity::{Entity, EntityId, ReadyState, Row};
pub use error::{StoreError, StoreResult};
pub use events::{Origin, UpdateEvent, UpdateKind, UpdateListener};
pub use expiration::{CacheKey, Evictable, ExpirationStrategy};
pub use identity::RetentionPolicy;
pub use index::{IndexByFn, IndexClass, IndexEmission, IndexPhase, IndexedEntry};
pub use permission::{Decision, PermissionCheck, Permissioned};
pub use store::ObjectStore;
pub use version::VersionSource;
