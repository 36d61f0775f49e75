//! Wire protocol for the administration channel.
//!
//! This module defines:
//! - Text framing of named messages (`name` or `name\n<json>`)
//! - Partial structural matching used to correlate responses with requests
//! - Typed payloads for every message in the catalog

pub mod frame;
pub mod matcher;
pub mod messages;

pub use frame::{Frame, Inbound, MAX_FRAME_SIZE, PING};
pub use matcher::{matches_partial, structurally_equal};
pub use messages::names;
