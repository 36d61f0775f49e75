//! Daemon state shared by every connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use admin_core::auth::{Authenticator, Ed25519Verifier};
use admin_core::session::SessionRegistry;
use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::contexts::ContextRegistry;
use crate::log_forward::LogForwarder;
use crate::users::JsonUserDirectory;

/// Connection timing.
#[derive(Debug, Clone, Copy)]
pub struct HostSettings {
    /// Time a session may stay unauthenticated
    pub session_timeout: Duration,
    /// Outbound inactivity before a keepalive
    pub keepalive: Duration,
}

impl From<&Config> for HostSettings {
    fn from(config: &Config) -> Self {
        Self {
            session_timeout: config.session_timeout(),
            keepalive: config.keepalive(),
        }
    }
}

pub struct Host {
    pub(crate) settings: HostSettings,
    pub(crate) sessions: SessionRegistry,
    pub(crate) contexts: ContextRegistry,
    pub(crate) users: Arc<JsonUserDirectory>,
    pub(crate) authenticator: Authenticator,
    pub(crate) logs: LogForwarder,
}

impl Host {
    pub fn new(
        settings: HostSettings,
        sessions: SessionRegistry,
        contexts: ContextRegistry,
        users: Arc<JsonUserDirectory>,
        logs: LogForwarder,
    ) -> Self {
        let authenticator = Authenticator::new(
            sessions.clone(),
            users.clone(),
            Arc::new(Ed25519Verifier),
        );
        Self {
            settings,
            sessions,
            contexts,
            users,
            authenticator,
            logs,
        }
    }

    /// Load users and start watching every configured context.
    pub async fn from_config(config: &Config, config_dir: &Path, logs: LogForwarder) -> Result<Self> {
        let sessions = SessionRegistry::new();
        let users = Arc::new(JsonUserDirectory::load(config.users_path(config_dir))?);
        let contexts =
            ContextRegistry::from_config(sessions.clone(), &config.contexts, config.quiescence())
                .await?;
        info!(
            "Host ready with {} context(s) and {} user(s)",
            contexts.ids().len(),
            users.usernames().len()
        );
        Ok(Self::new(config.into(), sessions, contexts, users, logs))
    }

    pub fn settings(&self) -> HostSettings {
        self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn logs(&self) -> &LogForwarder {
        &self.logs
    }

    /// Destroy every session, then stop every watcher.
    pub async fn shutdown(self) {
        self.sessions.clear();
        self.contexts.shutdown().await;
    }
}
