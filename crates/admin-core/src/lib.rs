//! admin-core: shared library for authenticated remote administration.
//!
//! This crate provides the core functionality for:
//! - Framing named messages and correlating responses with requests
//! - Session bookkeeping and Ed25519 challenge-response authentication
//! - Watching a directory tree and reporting debounced change batches
//! - Mirroring host content directories onto a peer
//! - FileSystem and Remote trait abstractions

pub mod auth;
pub mod fs;
pub mod ignore;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod sync_engine;
pub mod transport;
pub mod tree;
pub mod watcher;

pub use auth::{
    AuthError, AuthOutcome, Authenticator, DirectoryOracle, Ed25519Signer, Ed25519Verifier,
    NamedKey, SignatureVerifier, UserRecord,
};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs, NativeFs, content_path};
pub use ignore::{Echo, IgnoreSet};
pub use protocol::{Frame, Inbound, names};
pub use remote::{Remote, TransportRemote};
pub use session::{AttachedProcess, SessionError, SessionRegistry};
pub use sync_engine::{SyncEngine, SyncError, SyncReport};
pub use transport::{KEEPALIVE_INTERVAL, Transport, TransportError};
pub use tree::{FileLeaf, FileTree, TreeNode};
pub use watcher::{
    ChangeBatch, DirectoryWatcher, ManualBackend, NotifyBackend, QUIESCENCE, WatchBackend,
    WatchError,
};
