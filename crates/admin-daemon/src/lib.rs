//! admin-daemon library: the host side of the administration protocol.
//!
//! Exposes the daemon components so integration tests and the binary share
//! one implementation.

pub mod config;
pub mod contexts;
pub mod dispatch;
pub mod host;
pub mod log_forward;
pub mod pty;
pub mod server;
pub mod users;

pub use config::{Config, ContextConfig};
pub use contexts::{ContentStore, ContextRegistry, ServedContext};
pub use dispatch::DispatchError;
pub use host::{Host, HostSettings};
pub use log_forward::LogForwarder;
pub use users::JsonUserDirectory;
