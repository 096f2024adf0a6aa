//! Per-class identity map: at most one live object per id.

use crate::entity::{Entity, EntityId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// How the identity map retains instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Hold weak references; instances drop when no holder remains.
    Weak,
    /// Pin every live instance.
    Strong,
}

enum Slot {
    Strong(Arc<Entity>),
    Weak(Weak<Entity>),
}

impl Slot {
    fn upgrade(&self) -> Option<Arc<Entity>> {
        match self {
            Self::Strong(entity) => Some(Arc::clone(entity)),
            Self::Weak(entity) => entity.upgrade(),
        }
    }
}

/// Maps ids to their canonical live instance.
///
/// Lookup returns the existing instance or inserts a newly constructed
/// one; with the weak policy, dead slots are replaced transparently.
pub struct IdentityMap {
    policy: RetentionPolicy,
    instances: Mutex<HashMap<EntityId, Slot>>,
}

impl IdentityMap {
    /// Creates an identity map with the given retention policy.
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the canonical instance for `id`, constructing one when no
    /// live instance exists.
    pub fn get_or_insert(&self, id: &EntityId) -> Arc<Entity> {
        let mut instances = self.instances.lock();
        if let Some(slot) = instances.get(id) {
            if let Some(entity) = slot.upgrade() {
                return entity;
            }
        }
        let entity = Arc::new(Entity::new(id.clone()));
        let slot = match self.policy {
            RetentionPolicy::Strong => Slot::Strong(Arc::clone(&entity)),
            RetentionPolicy::Weak => Slot::Weak(Arc::downgrade(&entity)),
        };
        instances.insert(id.clone(), slot);
        entity
    }

    /// Returns the live instance for `id`, if any.
    pub fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.instances.lock().get(id).and_then(Slot::upgrade)
    }

    /// Returns whether `entity` is the canonical instance for its id.
    pub fn is_canonical(&self, entity: &Arc<Entity>) -> bool {
        self.get(&entity.id)
            .is_some_and(|canonical| Arc::ptr_eq(&canonical, entity))
    }

    /// Removes the entry for `id`.
    pub fn remove(&self, id: &EntityId) {
        self.instances.lock().remove(id);
    }

    /// Returns the live instances currently in the map.
    pub fn live(&self) -> Vec<Arc<Entity>> {
        self.instances
            .lock()
            .values()
            .filter_map(Slot::upgrade)
            .collect()
    }

    /// Returns the number of live instances.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.instances
            .lock()
            .values()
            .filter(|slot| slot.upgrade().is_some())
            .count()
    }
}
