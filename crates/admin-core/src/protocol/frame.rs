//! Text framing.
//!
//! Each WebSocket text frame carries one message: either a bare `name`, or
//! `name\n<payload>` where the payload is JSON. A payload that fails to parse
//! is treated as absent. The literal frame `ping` is a keepalive and never
//! carries a payload.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Reserved keepalive frame.
pub const PING: &str = "ping";

/// Maximum accepted frame size (50MB); larger frames are dropped.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// A named message with an optional structured payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub payload: Option<Value>,
}

/// Result of parsing an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Keepalive, to be ignored
    Ping,
    /// Regular message
    Frame(Frame),
}

impl Frame {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// A frame without payload.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// A frame carrying a serialized payload.
    pub fn with<T: Serialize>(name: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(name, Some(serde_json::to_value(payload)?)))
    }

    /// Encode to the wire text representation.
    pub fn encode(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{}\n{}", self.name, payload),
            None => self.name.clone(),
        }
    }

    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Inbound {
        if text == PING {
            return Inbound::Ping;
        }
        let (name, payload) = match text.split_once('\n') {
            Some((name, raw)) => (name, serde_json::from_str(raw).ok()),
            None => (text, None),
        };
        Inbound::Frame(Self::new(name, payload))
    }

    /// Deserialize the payload into a typed value, if present and well-formed.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.payload
            .as_ref()
            .and_then(|value| T::deserialize(value).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_with_and_without_payload() {
        assert_eq!(Frame::bare("contexts").encode(), "contexts");
        let frame = Frame::new("ERR", Some(json!("401")));
        assert_eq!(frame.encode(), "ERR\n\"401\"");
    }

    #[test]
    fn test_parse_ping_is_reserved() {
        assert_eq!(Frame::parse("ping"), Inbound::Ping);
        // A ping-named frame with a payload is an ordinary message
        assert!(matches!(Frame::parse("ping\n{}"), Inbound::Frame(_)));
    }

    #[test]
    fn test_parse_payload() {
        let Inbound::Frame(frame) = Frame::parse("AUTH\n{\"token\":\"abc\"}") else {
            panic!("expected frame");
        };
        assert_eq!(frame.name, "AUTH");
        assert_eq!(frame.payload, Some(json!({"token": "abc"})));
    }

    #[test]
    fn test_unparseable_payload_is_absent() {
        let Inbound::Frame(frame) = Frame::parse("change\n{not json") else {
            panic!("expected frame");
        };
        assert_eq!(frame.name, "change");
        assert!(frame.payload.is_none());
    }

    #[test]
    fn test_payload_with_newlines_survives() {
        let frame = Frame::new("log", Some(json!({"message": "a\nb"})));
        let Inbound::Frame(parsed) = Frame::parse(&frame.encode()) else {
            panic!("expected frame");
        };
        assert_eq!(parsed, frame);
    }
}
