//! Session registry.
//!
//! Every connection gets a session whose id doubles as the authentication
//! nonce. Sessions that are not authenticated within their timeout are
//! destroyed by a timer. Authentication is one-way: once set the flag is
//! never cleared.

use crate::protocol::messages::SessionInfo;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default time a session may stay unauthenticated.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// An interactive process bound to a session.
pub trait AttachedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Queue input for the process. Returns false once the process is gone.
    fn write(&self, input: &str) -> bool;

    fn resize(&mut self, cols: u16, rows: u16);

    fn kill(&mut self);
}

/// Generate a session id: 32 bytes from a CSPRNG, hex encoded.
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct Session {
    created: Instant,
    created_at: DateTime<Utc>,
    timeout: Duration,
    authenticated: bool,
    connection: Option<Transport>,
    process: Option<Box<dyn AttachedProcess>>,
    timer: Option<JoinHandle<()>>,
}

impl Session {
    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            created_at: self.created_at.timestamp_millis(),
            timeout_ms: self.timeout.as_millis() as u64,
            authenticated: self.authenticated,
        }
    }
}

type Sessions = Mutex<HashMap<String, Session>>;

/// Process-wide table of sessions keyed by token.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session and start its authentication timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(&self, timeout: Duration, connection: Option<Transport>) -> String {
        let id = generate_token();
        let timer = tokio::spawn(Self::expire_after(
            Arc::downgrade(&self.sessions),
            id.clone(),
            timeout,
        ));

        self.lock().insert(
            id.clone(),
            Session {
                created: Instant::now(),
                created_at: Utc::now(),
                timeout,
                authenticated: false,
                connection,
                process: None,
                timer: Some(timer),
            },
        );
        debug!("Created session {}", short(&id));
        id
    }

    async fn expire_after(sessions: Weak<Sessions>, id: String, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let Some(sessions) = sessions.upgrade() else {
            return;
        };
        let registry = SessionRegistry { sessions };
        if registry.is_authenticated(&id) {
            return;
        }
        if registry.remove(&id, false) {
            info!("Session {} timed out before authenticating", short(&id));
        }
    }

    /// Destroy a session. Returns whether a session was actually removed.
    pub fn destroy(&self, id: &str) -> bool {
        self.remove(id, true)
    }

    fn remove(&self, id: &str, cancel_timer: bool) -> bool {
        let Some(mut session) = self.lock().remove(id) else {
            return false;
        };

        if let Some(timer) = session.timer.take() {
            if cancel_timer {
                timer.abort();
            }
        }
        if let Some(mut process) = session.process.take() {
            process.kill();
        }
        if let Some(connection) = session.connection.take() {
            connection.close();
        }
        debug!("Destroyed session {}", short(id));
        true
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.lock().get(id).map(|session| session.info(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Ids of every live session.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_authenticated(&self, id: &str) -> bool {
        self.lock().get(id).is_some_and(|session| session.authenticated)
    }

    /// Ids of every authenticated session.
    pub fn authenticated(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, session)| session.authenticated)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether the session has outlived its timeout. `None` if it does not exist.
    pub fn is_expired(&self, id: &str) -> Option<bool> {
        self.lock()
            .get(id)
            .map(|session| session.created.elapsed() > session.timeout)
    }

    /// Mark a session authenticated and stop its timer.
    ///
    /// Returns true when the session was not authenticated before.
    pub fn mark_authenticated(&self, id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let first = !session.authenticated;
        session.authenticated = true;
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        Ok(first)
    }

    /// Connection a session pushes through, if it has one.
    pub fn connection(&self, id: &str) -> Option<Transport> {
        self.lock()
            .get(id)
            .and_then(|session| session.connection.clone())
    }

    /// Attach an interactive process, killing any previous one.
    pub fn attach_process(
        &self,
        id: &str,
        process: Box<dyn AttachedProcess>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Some(mut previous) = session.process.replace(process) {
            previous.kill();
        }
        Ok(())
    }

    /// Run `f` against the session's attached process, if any.
    pub fn with_process<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut dyn AttachedProcess) -> R,
    ) -> Option<R> {
        let mut sessions = self.lock();
        let process = sessions.get_mut(id)?.process.as_mut()?;
        Some(f(process.as_mut()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Destroy every session.
    pub fn clear(&self) {
        for id in self.list() {
            self.destroy(&id);
        }
    }
}

/// Abbreviated token for log lines.
pub fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProcess {
        killed: Arc<AtomicUsize>,
    }

    impl AttachedProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(42)
        }

        fn write(&self, _input: &str) -> bool {
            true
        }

        fn resize(&mut self, _cols: u16, _rows: u16) {}

        fn kill(&mut self) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let registry = SessionRegistry::new();
        let id = registry.create(DEFAULT_SESSION_TIMEOUT, None);

        let info = registry.get(&id).unwrap();
        assert_eq!(info.id, id);
        assert!(!info.authenticated);
        assert_eq!(info.timeout_ms, 60_000);
        assert_eq!(registry.list(), vec![id]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.create(DEFAULT_SESSION_TIMEOUT, None);

        assert!(registry.destroy(&id));
        assert!(!registry.destroy(&id));
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_session_times_out() {
        let registry = SessionRegistry::new();
        let id = registry.create(Duration::from_millis(30), None);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_authenticated_session_survives_timeout() {
        let registry = SessionRegistry::new();
        let id = registry.create(Duration::from_millis(30), None);
        assert!(registry.mark_authenticated(&id).unwrap());
        assert!(!registry.mark_authenticated(&id).unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registry.is_authenticated(&id));
        assert_eq!(registry.is_expired(&id), Some(true));
    }

    #[tokio::test]
    async fn test_destroy_kills_attached_process_once() {
        let registry = SessionRegistry::new();
        let id = registry.create(DEFAULT_SESSION_TIMEOUT, None);
        let killed = Arc::new(AtomicUsize::new(0));
        registry
            .attach_process(
                &id,
                Box::new(FakeProcess {
                    killed: Arc::clone(&killed),
                }),
            )
            .unwrap();

        assert_eq!(registry.with_process(&id, |p| p.pid()), Some(Some(42)));

        registry.destroy(&id);
        registry.destroy(&id);
        assert_eq!(killed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attaching_replaces_and_kills_previous() {
        let registry = SessionRegistry::new();
        let id = registry.create(DEFAULT_SESSION_TIMEOUT, None);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .attach_process(&id, Box::new(FakeProcess { killed: Arc::clone(&first) }))
            .unwrap();
        registry
            .attach_process(&id, Box::new(FakeProcess { killed: Arc::clone(&second) }))
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_unknown_session_fails() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.mark_authenticated("nope"),
            Err(SessionError::NotFound("nope".into()))
        );
        let flag = AtomicBool::new(false);
        assert!(registry.with_process("nope", |_| flag.store(true, Ordering::SeqCst)).is_none());
        assert!(!flag.load(Ordering::SeqCst));
    }
}
