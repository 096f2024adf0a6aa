//! Per-call ambient context.

use std::collections::BTreeMap;
use std::sync::Arc;

/// The session a call runs on behalf of.
///
/// Permission checks inspect the session; the store itself only carries
/// it through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Who the caller is.
    pub subject: String,
    /// Free-form claims for permission checks.
    pub claims: BTreeMap<String, String>,
}

impl Session {
    /// Creates a session for `subject` with no claims.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: BTreeMap::new(),
        }
    }

    /// Adds a claim.
    #[must_use]
    pub fn claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

/// Per-call ambient: a preferred version, an if-modified-since hint, and
/// a session reference.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Preferred version for reads.
    pub version: Option<u64>,
    /// Skip returning a payload when the entity still has this version.
    pub if_modified_since: Option<u64>,
    /// The calling session, if any.
    pub session: Option<Arc<Session>>,
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context for a session.
    #[must_use]
    pub fn for_session(session: Session) -> Self {
        Self {
            session: Some(Arc::new(session)),
            ..Self::default()
        }
    }

    /// Sets the preferred version.
    pub fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    /// Sets the if-modified-since hint.
    #[must_use]
    pub fn if_modified_since(mut self, version: u64) -> Self {
        self.if_modified_since = Some(version);
        self
    }

    /// Derives the context for a nested call: the same session and read
    /// hints, with no version mutation. The permission layer wraps every
    /// delegated call in one of these.
    #[must_use]
    pub fn new_child(&self) -> Self {
        self.clone()
    }

    /// Runs `f` with this context as the ambient one.
    pub fn execute_within<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_carries_session_and_hints_unmutated() {
        let mut ctx = Context::for_session(Session::new("alice"));
        ctx.set_version(42);
        let ctx = ctx.if_modified_since(41);

        let child = ctx.new_child();
        assert_eq!(child.session.as_ref().unwrap().subject, "alice");
        assert_eq!(child.version, Some(42));
        assert_eq!(child.if_modified_since, Some(41));
    }
}
