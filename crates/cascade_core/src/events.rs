//! Update events and listener fan-out.
//!
//! Classes publish an [`UpdateEvent`] for every committed mutation, and
//! dependents (indexes, derived classes, application code) register as
//! listeners. Events flow strictly downstream: a listener reacts by
//! enqueuing work on its own queue, never by calling back into the
//! publisher.

use crate::completion::CompletionHandle;
use cascade_codec::Key;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// The subject came into existence.
    Added,
    /// The subject changed value.
    Replaced,
    /// The subject was removed.
    Deleted,
    /// The class was reset wholesale.
    Reset,
}

/// Where a chain of updates originated.
///
/// `Initialization` marks startup replay so consumers can distinguish
/// catch-up traffic from fresh user mutations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    /// Startup replay of missed updates.
    Initialization,
    /// A user-caused mutation on the named class.
    Class(String),
}

/// A single update event.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    /// Kind of change.
    pub kind: UpdateKind,
    /// Name of the publishing class.
    pub class: String,
    /// The affected subject: an entity id, or an index key for events
    /// published by an index.
    pub subject: Key,
    /// Version of the change; allocated by the publisher when absent.
    pub version: Option<u64>,
    /// Origins of the update chain.
    pub origins: BTreeSet<Origin>,
    /// The subject's serialized value before this change, when the
    /// publisher tracks previous values. `Some(None)` means the subject
    /// had no value.
    pub previous: Option<Option<String>>,
    /// Suppresses the cache-reset step of the update protocol.
    pub no_reset: bool,
    /// Resolves when the change is durably written.
    pub when_written: Option<CompletionHandle>,
    /// Handles collected from listeners that enqueued follow-up work;
    /// the publisher waits on these to know downstream is readable.
    pub updates_in_progress: Vec<CompletionHandle>,
}

impl UpdateEvent {
    /// Creates an event of `kind` for `subject`, originating from the
    /// named class.
    #[must_use]
    pub fn new(kind: UpdateKind, class: impl Into<String>, subject: Key) -> Self {
        let class = class.into();
        let mut origins = BTreeSet::new();
        origins.insert(Origin::Class(class.clone()));
        Self {
            kind,
            class,
            subject,
            version: None,
            origins,
            previous: None,
            no_reset: false,
            when_written: None,
            updates_in_progress: Vec::new(),
        }
    }

    /// Marks the event as startup replay.
    #[must_use]
    pub fn from_initialization(mut self) -> Self {
        self.origins.insert(Origin::Initialization);
        self
    }

    /// Sets the carried version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Returns whether this event is startup replay.
    #[must_use]
    pub fn is_initialization(&self) -> bool {
        self.origins.contains(&Origin::Initialization)
    }
}

/// A consumer of update events.
pub trait UpdateListener: Send + Sync {
    /// Handles one event. Implementations push any follow-up work handle
    /// into `event.updates_in_progress`.
    fn on_update(&self, event: &mut UpdateEvent);
}

/// An ordered set of listeners.
///
/// Emission clones the current listener list first, so a listener may
/// register or deregister others without deadlocking.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn UpdateListener>>>,
}

impl ListenerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn notifies(&self, listener: Arc<dyn UpdateListener>) {
        self.listeners.write().push(listener);
    }

    /// Deregisters a listener, matching by identity.
    pub fn stop_notifies(&self, listener: &Arc<dyn UpdateListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Fans the event out to every registered listener.
    pub fn emit(&self, event: &mut UpdateEvent) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_update(event);
        }
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Key>>,
    }

    impl UpdateListener for Recorder {
        fn on_update(&self, event: &mut UpdateEvent) {
            self.seen.lock().push(event.subject.clone());
            event
                .updates_in_progress
                .push(crate::completion::CompletionHandle::resolved());
        }
    }

    #[test]
    fn emit_reaches_all_listeners() {
        let set = ListenerSet::new();
        let a = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        set.notifies(a.clone());
        set.notifies(b.clone());

        let mut event = UpdateEvent::new(UpdateKind::Replaced, "foo", Key::Int(1));
        set.emit(&mut event);

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 1);
        assert_eq!(event.updates_in_progress.len(), 2);
    }

    #[test]
    fn stop_notifies_removes_by_identity() {
        let set = ListenerSet::new();
        let listener: Arc<dyn UpdateListener> = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        set.notifies(listener.clone());
        assert_eq!(set.len(), 1);
        set.stop_notifies(&listener);
        assert!(set.is_empty());
    }

    #[test]
    fn initialization_origin() {
        let event =
            UpdateEvent::new(UpdateKind::Replaced, "foo", Key::Int(1)).from_initialization();
        assert!(event.is_initialization());
        assert!(event.origins.contains(&Origin::Class("foo".into())));
    }
}
