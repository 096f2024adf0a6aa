//! Permissioned class wrappers.
//!
//! Instead of intercepting method calls, a [`Permissioned`] wrapper
//! explicitly re-exposes the class's public operations: each call
//! derives a child context carrying the caller's session, runs every
//! permission check, and only then delegates to the wrapped class.
//! Listener registration delegates too, so downstream listeners attach
//! to the real class.

use crate::class::{EntityClass, ValueOutcome};
use crate::completion::CompletionHandle;
use crate::context::Context;
use crate::entity::{Entity, EntityId};
use crate::error::{StoreError, StoreResult};
use crate::events::UpdateListener;
use std::sync::Arc;

/// Outcome of one permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed.
    Allow,
    /// The call is rejected; the diagnostic reaches the caller.
    Deny(String),
}

/// A named permission check over the call context.
#[derive(Clone)]
pub struct PermissionCheck {
    name: String,
    check: Arc<dyn Fn(&Context) -> Decision + Send + Sync>,
}

impl PermissionCheck {
    /// Creates a named check.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Context) -> Decision + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// A check requiring any session to be present.
    #[must_use]
    pub fn authenticated() -> Self {
        Self::new("authenticated", |ctx: &Context| {
            if ctx.session.is_some() {
                Decision::Allow
            } else {
                Decision::Deny("no session".into())
            }
        })
    }

    /// A check requiring the session subject to equal `subject`.
    #[must_use]
    pub fn subject_is(subject: impl Into<String>) -> Self {
        let subject = subject.into();
        Self::new(format!("subject:{subject}"), move |ctx: &Context| {
            match &ctx.session {
                Some(session) if session.subject == subject => Decision::Allow,
                Some(session) => {
                    Decision::Deny(format!("subject '{}' not allowed", session.subject))
                }
                None => Decision::Deny("no session".into()),
            }
        })
    }
}

/// A class handle whose operations run permission checks first.
pub struct Permissioned {
    inner: Arc<EntityClass>,
    checks: Vec<PermissionCheck>,
}

impl Permissioned {
    /// Wraps a class with permission checks.
    #[must_use]
    pub fn new(inner: Arc<EntityClass>, checks: Vec<PermissionCheck>) -> Self {
        Self { inner, checks }
    }

    /// Returns the wrapped class.
    #[must_use]
    pub fn inner(&self) -> &Arc<EntityClass> {
        &self.inner
    }

    /// Runs every check; the first denial fails the call with that
    /// check's diagnostic. On success returns the derived child context
    /// the delegated call runs in.
    fn authorize(&self, ctx: &Context) -> StoreResult<Context> {
        for check in &self.checks {
            if let Decision::Deny(diagnostic) = (check.check)(ctx) {
                return Err(StoreError::access_denied(&check.name, diagnostic));
            }
        }
        Ok(ctx.new_child())
    }

    /// Permissioned [`EntityClass::value_of`].
    pub fn value_of(&self, ctx: &Context, id: &EntityId) -> StoreResult<ValueOutcome> {
        let child = self.authorize(ctx)?;
        self.inner.value_of(id, &child)
    }

    /// Permissioned [`EntityClass::for_ids`].
    pub fn for_ids(&self, ctx: &Context, ids: &[EntityId]) -> StoreResult<Vec<Arc<Entity>>> {
        self.authorize(ctx)?;
        Ok(self.inner.for_ids(ids))
    }

    /// Permissioned [`EntityClass::set`].
    pub fn set(
        &self,
        ctx: &Context,
        id: &EntityId,
        value: serde_json::Value,
    ) -> StoreResult<CompletionHandle> {
        self.authorize(ctx)?;
        self.inner.set(id, value)
    }

    /// Permissioned [`EntityClass::patch`].
    pub fn patch(
        &self,
        ctx: &Context,
        id: &EntityId,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<CompletionHandle> {
        self.authorize(ctx)?;
        self.inner.patch(id, properties)
    }

    /// Permissioned [`EntityClass::remove`].
    pub fn remove(&self, ctx: &Context, id: &EntityId) -> StoreResult<CompletionHandle> {
        self.authorize(ctx)?;
        self.inner.remove(id)
    }

    /// Permissioned [`EntityClass::entries`].
    pub fn entries(
        &self,
        ctx: &Context,
    ) -> StoreResult<Vec<(EntityId, serde_json::Value)>> {
        self.authorize(ctx)?;
        self.inner.entries()
    }

    /// Subscribes a listener to the wrapped class, so downstream
    /// attaches to the real publisher.
    pub fn notifies(&self, listener: Arc<dyn UpdateListener>) {
        self.inner.notifies(listener);
    }

    /// Unsubscribes a listener from the wrapped class.
    pub fn stop_notifies(&self, listener: &Arc<dyn UpdateListener>) {
        self.inner.stop_notifies(listener);
    }
}
