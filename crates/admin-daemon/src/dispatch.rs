//! Message dispatch for one session.
//!
//! Every inbound message that did not resolve a pending request ends up in
//! `Host::handle`. `AUTH` is always accepted and unknown names are logged and
//! dropped. Every other method requires the session to be authenticated.
//! Failures never end the connection: they are answered at this boundary.

use admin_core::auth::AuthOutcome;
use admin_core::fs::FsError;
use admin_core::protocol::messages::{
    AuthRequest, ContextInfo, FileContent, FileNotStored, FileRequest, PtyRequest, StoreFile,
    UNAUTHORIZED, UserQuery, names,
};
use admin_core::protocol::Frame;
use admin_core::session::short;
use admin_core::transport::{Transport, TransportError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::contexts::ContentStore;
use crate::host::Host;
use crate::log_forward;
use crate::pty;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("401")]
    Unauthorized,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

type Result<T> = std::result::Result<T, DispatchError>;

/// Methods a session may call once authenticated.
const METHODS: &[&str] = &[
    names::CONTEXTS,
    names::FILES_IN_CONTEXT,
    names::GET_FILE_CONTENT,
    names::SET_FILE_CONTEXT,
    names::SESSIONS,
    names::SESSION,
    names::CLOSE_SESSION,
    names::USERS,
    names::USER,
    names::PTY,
];

fn payload<T: DeserializeOwned>(frame: &Frame, name: &'static str) -> Result<T> {
    frame
        .payload_as()
        .ok_or(DispatchError::MalformedPayload(name))
}

impl Host {
    /// Handle one message from `session`, answering any failure.
    pub async fn handle(&self, session: &str, connection: &Transport, frame: Frame) {
        let name = frame.name.clone();
        match self.dispatch(session, connection, frame).await {
            Ok(()) => {}
            Err(DispatchError::Unauthorized) => {
                debug!("Session {} sent {} before authenticating", short(session), name);
                let _ = connection.send_json(names::ERR, &UNAUTHORIZED);
            }
            Err(DispatchError::UnknownMessage(name)) => {
                warn!("Session {} sent unknown message {}", short(session), name);
            }
            Err(DispatchError::Transport(e)) => {
                debug!("Session {} gone while answering {}: {}", short(session), name, e);
            }
            Err(e) => {
                error!("Failed to handle {} from {}: {}", name, short(session), e);
                let _ = connection.send_json(names::ERR, &e.to_string());
            }
        }
    }

    async fn dispatch(&self, session: &str, connection: &Transport, frame: Frame) -> Result<()> {
        if frame.name == names::AUTH {
            return self.on_auth(session, connection, frame.payload_as()).await;
        }
        if !METHODS.contains(&frame.name.as_str()) {
            return Err(DispatchError::UnknownMessage(frame.name));
        }
        if !self.sessions.is_authenticated(session) {
            return Err(DispatchError::Unauthorized);
        }

        match frame.name.as_str() {
            names::CONTEXTS => {
                let contexts: Vec<ContextInfo> = self
                    .contexts
                    .ids()
                    .into_iter()
                    .map(|id| ContextInfo { id })
                    .collect();
                connection.send_json(names::CONTEXTS, &contexts)?;
            }
            names::FILES_IN_CONTEXT => {
                let ids = frame
                    .payload_as::<Vec<String>>()
                    .unwrap_or_else(|| self.contexts.ids());
                let manifests = self.contexts.manifests(&ids).await;
                connection.send_json(names::FILES_IN_CONTEXT, &manifests)?;
            }
            names::GET_FILE_CONTENT => {
                let request: FileRequest = payload(&frame, names::GET_FILE_CONTENT)?;
                let reply = self.file_content(request).await;
                connection.send_json(names::FILE_CONTENT, &reply)?;
            }
            names::SET_FILE_CONTEXT => {
                let request: StoreFile = payload(&frame, names::SET_FILE_CONTEXT)?;
                self.on_store(session, connection, request).await?;
            }
            names::SESSIONS => {
                connection.send_json(names::SESSIONS, &self.sessions.list())?;
            }
            names::SESSION => {
                let id: String = payload(&frame, names::SESSION)?;
                connection.send_json(names::SESSION, &self.sessions.get(&id))?;
            }
            names::CLOSE_SESSION => {
                let id = frame
                    .payload_as::<String>()
                    .unwrap_or_else(|| session.to_string());
                connection.send_json(names::SESSION_REMOVED, &id)?;
                if self.sessions.destroy(&id) {
                    self.contexts.forget_session(&id);
                }
            }
            names::USERS => {
                connection.send_json(names::USERNAMES, &self.users.usernames())?;
            }
            names::USER => {
                let query: UserQuery = frame.payload_as().unwrap_or_default();
                let profile = self
                    .users
                    .find(query.username.as_deref(), query.email.as_deref());
                connection.send_json(names::USER, &profile)?;
            }
            names::PTY => {
                let request: PtyRequest = payload(&frame, names::PTY)?;
                pty::handle(&self.sessions, session, connection, request)?;
            }
            other => return Err(DispatchError::UnknownMessage(other.to_string())),
        }
        Ok(())
    }

    async fn on_auth(
        &self,
        session: &str,
        connection: &Transport,
        request: Option<AuthRequest>,
    ) -> Result<()> {
        let Some(outcome) = self.authenticator.answer(session, connection, request).await else {
            return Ok(());
        };
        // One forwarder per session, started when it becomes authenticated
        if outcome.first() {
            if let Some(target_connection) = self.sessions.connection(outcome.session()) {
                log_forward::forward(self.logs.subscribe(), target_connection);
            }
        }
        if let AuthOutcome::Delegated { target, .. } = &outcome {
            debug!("Session {} approved {}", short(session), short(target));
        }
        Ok(())
    }

    async fn file_content(&self, request: FileRequest) -> FileContent {
        let result = match self.contexts.get(&request.context_id) {
            Some(context) => context.read(&request.file_path).await,
            None => Err(FsError::NotFound(format!("context {}", request.context_id))),
        };
        let (content, err) = match result {
            Ok(bytes) => (Some(STANDARD.encode(bytes)), None),
            Err(e) => {
                debug!("Cannot serve {}: {}", request.file_path, e);
                (None, Some(e.to_string()))
            }
        };
        FileContent {
            context_id: request.context_id,
            file_path: request.file_path,
            content,
            err,
        }
    }

    async fn on_store(&self, session: &str, connection: &Transport, request: StoreFile) -> Result<()> {
        let content = match request.content.as_deref().map(|c| STANDARD.decode(c)) {
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(e)) => {
                return not_stored(connection, request, format!("Invalid content encoding: {}", e));
            }
            None => None,
        };

        let stored = self
            .contexts
            .store(session, &request.context_id, &request.file_path, content.as_deref())
            .await;
        match stored {
            Ok(()) => {
                debug!(
                    "[{}] {} {}",
                    request.context_id,
                    if content.is_some() { "stored" } else { "deleted" },
                    request.file_path
                );
                Ok(())
            }
            Err(e) => not_stored(connection, request, e.to_string()),
        }
    }
}

fn not_stored(connection: &Transport, request: StoreFile, message: String) -> Result<()> {
    warn!("Not stored {}:{}: {}", request.context_id, request.file_path, message);
    connection.send_json(
        names::FILE_NOT_STORED,
        &FileNotStored {
            context_id: request.context_id,
            file_path: request.file_path,
            message,
        },
    )?;
    Ok(())
}
