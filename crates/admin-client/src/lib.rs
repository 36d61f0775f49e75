//! admin-client library: the peer side of the administration protocol.
//!
//! Signs in to a host, optionally approves another pending session, and
//! mirrors every host context into a local directory.

pub mod client;
pub mod error;
pub mod keys;

pub use client::{Client, Identity};
pub use error::{ClientError, Result};
pub use keys::{generate_key_pair, load_signer, public_key_path};
