//! Peer side of a session.
//!
//! `Client::connect` opens the WebSocket and reads the host's challenge.
//! After `authenticate` (or `wait_for_approval` when another session
//! approves this one), `start_sync` mirrors every host context below a local
//! base directory and `run` handles host pushes until the connection ends.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use admin_core::auth::Ed25519Signer;
use admin_core::fs::{FileSystem, NativeFs};
use admin_core::protocol::Frame;
use admin_core::protocol::messages::{
    AuthChallenge, AuthRequest, ChangeNotice, DelegatedAuth, FileNotStored, LogRecord, NewTerm,
    UNAUTHORIZED, UserProfile, names,
};
use admin_core::remote::{Remote, TransportRemote};
use admin_core::sync_engine::{SyncEngine, SyncReport};
use admin_core::transport::{KEEPALIVE_INTERVAL, Transport, TransportError};
use admin_core::watcher::{DirectoryWatcher, NotifyBackend, QUIESCENCE};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};

/// Who the client signs in as.
pub struct Identity {
    pub username: Option<String>,
    pub email: Option<String>,
    pub signer: Ed25519Signer,
}

impl Identity {
    fn answer(&self, token: &str, target: Option<&str>) -> AuthRequest {
        let target = target.unwrap_or(token);
        AuthRequest {
            username: self.username.clone(),
            email: self.email.clone(),
            signature: self.signer.sign(target),
            token: Some(target.to_string()),
        }
    }
}

/// One mirrored context.
struct Mirror {
    notices: mpsc::UnboundedSender<ChangeNotice>,
    watcher: DirectoryWatcher,
    task: JoinHandle<()>,
}

pub struct Client {
    transport: Transport,
    inbound: mpsc::UnboundedReceiver<Frame>,
    token: String,
    mirrors: HashMap<String, Mirror>,
}

impl Client {
    /// Connect to `url` and wait for the host's challenge.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (transport, inbound) = Transport::spawn(ws, KEEPALIVE_INTERVAL);
        let mut client = Self {
            transport,
            inbound,
            token: String::new(),
            mirrors: HashMap::new(),
        };

        let frame = client.next_reply(&[names::AUTH]).await?;
        let challenge: AuthChallenge = frame
            .payload_as()
            .ok_or_else(|| ClientError::Protocol("AUTH without token".into()))?;
        client.token = challenge.token;
        debug!("Connected to {}", url);
        Ok(client)
    }

    /// This connection's session token.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Answer the challenge with a signature over our own token.
    pub async fn authenticate(&mut self, identity: &Identity) -> Result<UserProfile> {
        self.transport
            .send_json(names::AUTH, &identity.answer(&self.token, None))?;
        self.wait_for_approval().await
    }

    /// Approve another pending session by signing its token.
    pub async fn approve(&mut self, identity: &Identity, token: &str) -> Result<DelegatedAuth> {
        self.transport
            .send_json(names::AUTH, &identity.answer(&self.token, Some(token)))?;
        let frame = self.next_reply(&[names::AUTH_USR]).await?;
        let approved: DelegatedAuth = frame
            .payload_as()
            .ok_or_else(|| ClientError::Protocol("AUTH_USR without user".into()))?;
        info!("Approved session {} for {}", token, approved.user.username);
        Ok(approved)
    }

    /// Wait until this session is authenticated, by us or another session.
    pub async fn wait_for_approval(&mut self) -> Result<UserProfile> {
        let frame = self.next_reply(&[names::USR]).await?;
        let profile: UserProfile = frame
            .payload_as()
            .ok_or_else(|| ClientError::Protocol("USR without profile".into()))?;
        info!("Authenticated as {}", profile.username);
        Ok(profile)
    }

    /// Next inbound message named one of `expected`.
    ///
    /// `ERR "401"` fails with `Unauthorized`; anything else is handled as a
    /// regular push.
    async fn next_reply(&mut self, expected: &[&str]) -> Result<Frame> {
        loop {
            let frame = self
                .inbound
                .recv()
                .await
                .ok_or(TransportError::ConnectionClosed)?;
            if expected.contains(&frame.name.as_str()) {
                return Ok(frame);
            }
            self.on_push(frame)?;
        }
    }

    /// Mirror every host context into `<base_dir>/<context id>`.
    ///
    /// Contexts reconcile concurrently. Live mirroring of a context starts
    /// once its reconciliation is done. Returns the reconciliation reports.
    pub async fn start_sync(&mut self, base_dir: &Path) -> Result<Vec<(String, SyncReport)>> {
        let remote = Arc::new(TransportRemote::new(self.transport.clone()));
        let contexts = remote.contexts().await?;
        info!("Host serves {} context(s)", contexts.len());

        let mut prepared = Vec::new();
        for context in contexts {
            if context.is_empty() || context.contains(['/', '\\']) || context == ".." {
                warn!("Skipping context with unusable id {:?}", context);
                continue;
            }
            let root = base_dir.join(&context);
            std::fs::create_dir_all(&root)?;

            let backend = NotifyBackend::new(&root);
            let fs: Arc<dyn FileSystem> = Arc::new(NativeFs::new(backend.root().to_path_buf()));
            // Watch before reconciling so the ignore set sees our own writes
            let (watcher, batches) =
                DirectoryWatcher::start(Arc::clone(&fs), Arc::new(backend), QUIESCENCE).await?;
            let engine = Arc::new(SyncEngine::new(context.clone(), Arc::clone(&remote), fs));
            prepared.push((context, engine, watcher, batches));
        }

        let reports = join_all(
            prepared
                .iter()
                .map(|(_, engine, _, _)| engine.reconcile()),
        )
        .await;

        let mut summary = Vec::new();
        for ((context, engine, watcher, batches), report) in prepared.into_iter().zip(reports) {
            let report = report?;
            let (notices, notices_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(async move {
                if let Err(e) = engine.mirror(batches, notices_rx).await {
                    error!("[{}] Mirroring stopped: {}", engine.context(), e);
                }
            });
            self.mirrors.insert(
                context.clone(),
                Mirror {
                    notices,
                    watcher,
                    task,
                },
            );
            summary.push((context, report));
        }
        Ok(summary)
    }

    /// Handle host pushes until the connection closes.
    ///
    /// Returns `Unauthorized` when the host rejects the session.
    pub async fn run(mut self) -> Result<()> {
        let result = loop {
            let Some(frame) = self.inbound.recv().await else {
                info!("Connection closed");
                break Ok(());
            };
            if let Err(e) = self.on_push(frame) {
                break Err(e);
            }
        };
        self.stop().await;
        result
    }

    fn on_push(&mut self, frame: Frame) -> Result<()> {
        match frame.name.as_str() {
            names::ERR => {
                let reason = frame.payload_as::<String>().unwrap_or_default();
                if reason == UNAUTHORIZED {
                    self.transport.close();
                    return Err(ClientError::Unauthorized);
                }
                warn!("Host error: {}", reason);
            }
            names::LOG => {
                if let Some(record) = frame.payload_as::<LogRecord>() {
                    info!("[host] {}", record.message);
                }
            }
            names::CHANGE => {
                let Some(notice) = frame.payload_as::<ChangeNotice>() else {
                    warn!("Malformed change notice");
                    return Ok(());
                };
                match self.mirrors.get(&notice.id) {
                    Some(mirror) => {
                        let _ = mirror.notices.send(notice);
                    }
                    None => debug!("Change in unmirrored context {}", notice.id),
                }
            }
            names::FILE_NOT_STORED => {
                if let Some(failed) = frame.payload_as::<FileNotStored>() {
                    warn!(
                        "Host did not store {}:{}: {}",
                        failed.context_id, failed.file_path, failed.message
                    );
                }
            }
            names::USR => {
                if let Some(profile) = frame.payload_as::<UserProfile>() {
                    info!("Session approved for {}", profile.username);
                }
            }
            names::NEW_TERM => {
                if let Some(term) = frame.payload_as::<NewTerm>() {
                    info!("Shell started with pid {:?}", term.pid);
                }
            }
            names::TERM => {
                if let Some(output) = frame.payload_as::<String>() {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(output.as_bytes());
                    let _ = stdout.flush();
                }
            }
            other => debug!("Ignoring {}", other),
        }
        Ok(())
    }

    /// Stop mirroring and close the connection.
    pub async fn stop(&mut self) {
        for (_, mirror) in self.mirrors.drain() {
            mirror.task.abort();
            mirror.watcher.stop().await;
        }
        self.transport.close();
    }
}
