//! Session context for engine logs
//!
//! Several sync engines can live in one process (tests build one per case).
//! A [`SessionContextGuard`] tags everything logged on the current thread
//! with the engine session it belongs to.

use std::cell::RefCell;

use uuid::Uuid;

/// Session data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContextData {
    /// Unique id of this engine session
    pub session_id: Uuid,
    /// Name of the client owning the engine
    pub client: String,
}

thread_local! {
    static SESSION_CONTEXT: RefCell<Option<SessionContextData>> = const { RefCell::new(None) };
}

/// RAII guard for the session context
///
/// Dropping the guard restores the previous context, so guards nest.
pub struct SessionContextGuard {
    previous: Option<SessionContextData>,
}

impl SessionContextGuard {
    /// Enter a new session for `client`
    pub fn new(client: impl Into<String>) -> Self {
        Self::with_session_id(client, Uuid::new_v4())
    }

    /// Enter a known session, e.g. one restored after a restart
    pub fn with_session_id(client: impl Into<String>, session_id: Uuid) -> Self {
        let data = SessionContextData {
            session_id,
            client: client.into(),
        };
        let previous = SESSION_CONTEXT.with(|ctx| ctx.borrow_mut().replace(data));
        Self { previous }
    }

    pub fn current() -> Option<SessionContextData> {
        SESSION_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_session_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.session_id)
    }
}

impl Drop for SessionContextGuard {
    fn drop(&mut self) {
        SESSION_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block inside a session context
///
/// ```ignore
/// with_session!("reader", {
///     tracing::info!("Resolving article");
/// });
/// ```
#[macro_export]
macro_rules! with_session {
    ($client:expr, $body:block) => {{
        let _guard = $crate::context::SessionContextGuard::new($client);
        $body
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard() {
        assert!(SessionContextGuard::current().is_none());
        {
            let _guard = SessionContextGuard::new("reader");
            let ctx = SessionContextGuard::current().unwrap();
            assert_eq!(ctx.client, "reader");
        }
        assert!(SessionContextGuard::current().is_none());
    }

    #[test]
    fn test_nested_sessions() {
        let outer_id = Uuid::new_v4();
        let _outer = SessionContextGuard::with_session_id("reader", outer_id);
        {
            let _inner = SessionContextGuard::new("importer");
            assert_eq!(SessionContextGuard::current().unwrap().client, "importer");
            assert_ne!(SessionContextGuard::current_session_id(), Some(outer_id));
        }
        assert_eq!(SessionContextGuard::current_session_id(), Some(outer_id));
    }

    #[test]
    fn test_macro() {
        let client = with_session!("macro", {
            SessionContextGuard::current().map(|ctx| ctx.client)
        });
        assert_eq!(client.as_deref(), Some("macro"));
        assert!(SessionContextGuard::current().is_none());
    }
}
