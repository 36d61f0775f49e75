use admin_core::auth::AuthError;
use admin_core::sync_engine::SyncError;
use admin_core::transport::TransportError;
use admin_core::watcher::WatchError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The host answered `ERR "401"`.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Invalid key: {0}")]
    Key(#[from] AuthError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
