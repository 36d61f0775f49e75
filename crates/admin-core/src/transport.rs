//! Message transport and request/response correlation over one WebSocket.
//!
//! A `Transport` owns two tasks per connection:
//! - a writer that emits frames strictly in the order they were issued and
//!   sends a `ping` keepalive after an interval without outbound traffic
//! - a reader that parses frames, resolves pending requests, and forwards
//!   every unmatched message to the dispatch channel returned by `spawn`
//!
//! Pending requests are kept per message name in registration order. An
//! inbound message resolves the first pending entry whose partial payload it
//! satisfies. When the connection closes every pending request is rejected
//! with `TransportError::ConnectionClosed`.

use crate::protocol::{Frame, Inbound, MAX_FRAME_SIZE, PING, matches_partial};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

/// Outbound inactivity after which a keepalive is sent.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(40);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

struct PendingRequest {
    expected: Option<Value>,
    reply: oneshot::Sender<Result<Option<Value>>>,
}

/// Pending requests keyed by expected message name.
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<String, VecDeque<PendingRequest>>,
    closed: bool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next `name` message matching `expected`.
    pub fn register(
        &mut self,
        name: &str,
        expected: Option<Value>,
    ) -> oneshot::Receiver<Result<Option<Value>>> {
        let (reply, rx) = oneshot::channel();
        if self.closed {
            let _ = reply.send(Err(TransportError::ConnectionClosed));
        } else {
            self.pending
                .entry(name.to_string())
                .or_default()
                .push_back(PendingRequest { expected, reply });
        }
        rx
    }

    /// Resolve the first matching pending request, or hand the frame back.
    pub fn resolve(&mut self, frame: Frame) -> Option<Frame> {
        let Some(queue) = self.pending.get_mut(&frame.name) else {
            return Some(frame);
        };

        // Requests whose caller gave up are pruned on the way
        queue.retain(|pending| !pending.reply.is_closed());

        let position = queue
            .iter()
            .position(|pending| matches_partial(pending.expected.as_ref(), frame.payload.as_ref()));

        let matched = position.and_then(|index| queue.remove(index));
        if queue.is_empty() {
            self.pending.remove(&frame.name);
        }

        match matched {
            Some(pending) => {
                let _ = pending.reply.send(Ok(frame.payload));
                None
            }
            None => Some(frame),
        }
    }

    /// Reject every pending request; later registrations fail immediately.
    pub fn reject_all(&mut self) {
        self.closed = true;
        for (_, queue) in self.pending.drain() {
            for pending in queue {
                let _ = pending.reply.send(Err(TransportError::ConnectionClosed));
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

/// A response that has been registered but not yet received.
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Option<Value>>>,
}

impl PendingResponse {
    /// Wait for the matching message. There is no timeout: the wait only
    /// ends with the response or with the connection closing.
    pub async fn wait(self) -> Result<Option<Value>> {
        self.rx
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }
}

enum Outgoing {
    Text(String),
    Close,
}

/// Cloneable handle to one duplex connection.
#[derive(Clone)]
pub struct Transport {
    outbox: mpsc::UnboundedSender<Outgoing>,
    correlator: Arc<Mutex<Correlator>>,
    closed: watch::Receiver<bool>,
}

impl Transport {
    /// Start reader and writer tasks over a WebSocket stream.
    ///
    /// Returns the handle and the dispatch channel carrying every inbound
    /// message that did not resolve a pending request. The channel ends when
    /// the connection closes.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        keepalive: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws.split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let correlator = Arc::new(Mutex::new(Correlator::new()));

        tokio::spawn(Self::write_loop(
            write,
            outbox_rx,
            keepalive,
            closed.clone(),
            Arc::clone(&closed_tx),
        ));
        tokio::spawn(Self::read_loop(
            read,
            Arc::clone(&correlator),
            dispatch_tx,
            closed_tx,
        ));

        (
            Self {
                outbox,
                correlator,
                closed,
            },
            dispatch_rx,
        )
    }

    async fn write_loop<W>(
        mut write: W,
        mut outbox: mpsc::UnboundedReceiver<Outgoing>,
        keepalive: Duration,
        mut closed: watch::Receiver<bool>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) where
        W: futures::Sink<Message, Error = WsError> + Unpin,
    {
        loop {
            let outgoing = tokio::select! {
                outgoing = outbox.recv() => outgoing,
                _ = tokio::time::sleep(keepalive) => Some(Outgoing::Text(PING.to_string())),
                _ = closed.changed() => break,
            };

            match outgoing {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        debug!("Write failed, closing transport: {}", e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = closed_tx.send(true);
    }

    async fn read_loop<R>(
        mut read: R,
        correlator: Arc<Mutex<Correlator>>,
        dispatch: mpsc::UnboundedSender<Frame>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) where
        R: futures::Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        let mut closed = closed_tx.subscribe();
        loop {
            let next = tokio::select! {
                next = read.next() => next,
                _ = closed.changed() => break,
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => break,
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
            };

            if text.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame exceeds max size ({} > {}), dropping",
                    text.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }

            let Inbound::Frame(frame) = Frame::parse(&text) else {
                continue;
            };

            let unmatched = correlator
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .resolve(frame);
            if let Some(frame) = unmatched {
                if dispatch.send(frame).is_err() {
                    debug!("Dispatch receiver dropped");
                }
            }
        }

        correlator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reject_all();
        let _ = closed_tx.send(true);
    }

    /// Send a message. Messages are emitted in call order.
    pub fn send(&self, name: &str, payload: Option<Value>) -> Result<()> {
        self.send_frame(Frame::new(name, payload))
    }

    /// Send a message with a serialized payload.
    pub fn send_json<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        let frame =
            Frame::with(name, payload).map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.send_frame(frame)
    }

    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbox
            .send(Outgoing::Text(frame.encode()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Register a pending request for the next `name` message matching `expected`.
    ///
    /// Register before sending the message that provokes the response.
    pub fn expect(&self, name: &str, expected: Option<Value>) -> PendingResponse {
        let rx = self
            .correlator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(name, expected);
        PendingResponse { rx }
    }

    /// Wait for the next `name` message matching `expected`.
    pub async fn request(&self, name: &str, expected: Option<Value>) -> Result<Option<Value>> {
        self.expect(name, expected).wait().await
    }

    /// Send a message and wait for its correlated response.
    ///
    /// Registration and send happen under one lock, so concurrent calls
    /// register in the same order their messages go out.
    pub async fn call<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        reply: &str,
        expected: Option<Value>,
    ) -> Result<Option<Value>> {
        let pending = {
            let mut correlator = self.correlator.lock().unwrap_or_else(|e| e.into_inner());
            let rx = correlator.register(reply, expected);
            self.send_json(name, payload)?;
            PendingResponse { rx }
        };
        pending.wait().await
    }

    /// Close the connection after already queued messages are written.
    pub fn close(&self) {
        let _ = self.outbox.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending_count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// A connected pair of raw WebSocket streams over an in-memory pipe.
    pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    async fn next_text(ws: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            match timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return text,
                Ok(Some(Ok(_))) => continue,
                other => panic!("expected a text frame, got {:?}", other.map(|m| m.is_some())),
            }
        }
    }

    #[test]
    fn test_correlator_picks_first_matching_entry() {
        let mut correlator = Correlator::new();
        let mut first = correlator.register("fileContent", Some(json!({"filePath": "/a"})));
        let mut second = correlator.register("fileContent", Some(json!({"filePath": "/b"})));

        let unmatched = correlator.resolve(Frame::new(
            "fileContent",
            Some(json!({"filePath": "/b", "content": ""})),
        ));

        assert!(unmatched.is_none());
        assert!(first.try_recv().is_err());
        assert_eq!(
            second.try_recv().unwrap(),
            Ok(Some(json!({"filePath": "/b", "content": ""})))
        );
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_correlator_returns_unmatched_frames() {
        let mut correlator = Correlator::new();
        let _pending = correlator.register("change", Some(json!({"id": "web"})));

        let frame = Frame::new("change", Some(json!({"id": "docs"})));
        assert_eq!(correlator.resolve(frame.clone()), Some(frame));

        let other = Frame::bare("log");
        assert_eq!(correlator.resolve(other.clone()), Some(other));
    }

    #[test]
    fn test_correlator_same_expectation_resolves_in_order() {
        let mut correlator = Correlator::new();
        let mut first = correlator.register("contexts", None);
        let mut second = correlator.register("contexts", None);

        assert!(correlator.resolve(Frame::new("contexts", Some(json!([1])))).is_none());
        assert_eq!(first.try_recv().unwrap(), Ok(Some(json!([1]))));
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_reject_all_fails_pending_and_future_requests() {
        let mut correlator = Correlator::new();
        let mut pending = correlator.register("USR", None);

        correlator.reject_all();

        assert_eq!(
            pending.try_recv().unwrap(),
            Err(TransportError::ConnectionClosed)
        );
        let mut late = correlator.register("USR", None);
        assert_eq!(late.try_recv().unwrap(), Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_request_resolves_and_unsolicited_goes_to_dispatch() {
        let (server_ws, mut peer) = ws_pair().await;
        let (transport, mut dispatch) = Transport::spawn(server_ws, KEEPALIVE_INTERVAL);

        let pending = transport.expect("fileContent", Some(json!({"filePath": "/a.txt"})));
        peer.send(Message::Text("log\n{\"message\":\"hi\"}".into()))
            .await
            .unwrap();
        peer.send(Message::Text(
            "fileContent\n{\"filePath\":\"/a.txt\",\"content\":\"eA==\"}".into(),
        ))
        .await
        .unwrap();

        let response = timeout(Duration::from_secs(2), pending.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, Some(json!({"filePath": "/a.txt", "content": "eA=="})));

        let unsolicited = timeout(Duration::from_secs(2), dispatch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unsolicited.name, "log");
    }

    #[tokio::test]
    async fn test_sends_preserve_order() {
        let (server_ws, mut peer) = ws_pair().await;
        let (transport, _dispatch) = Transport::spawn(server_ws, KEEPALIVE_INTERVAL);

        for i in 0..20 {
            transport.send("n", Some(json!(i))).unwrap();
        }

        for i in 0..20 {
            assert_eq!(next_text(&mut peer).await, format!("n\n{}", i));
        }
    }

    #[tokio::test]
    async fn test_ping_is_ignored_on_receipt() {
        let (server_ws, mut peer) = ws_pair().await;
        let (_transport, mut dispatch) = Transport::spawn(server_ws, KEEPALIVE_INTERVAL);

        peer.send(Message::Text("ping".into())).await.unwrap();
        peer.send(Message::Text("contexts\n{}".into())).await.unwrap();

        let frame = timeout(Duration::from_secs(2), dispatch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.name, "contexts");
    }

    #[tokio::test]
    async fn test_keepalive_after_inactivity() {
        let (server_ws, mut peer) = ws_pair().await;
        let (_transport, _dispatch) = Transport::spawn(server_ws, Duration::from_millis(50));

        assert_eq!(next_text(&mut peer).await, "ping");
    }

    #[tokio::test]
    async fn test_close_rejects_pending_requests() {
        let (server_ws, peer) = ws_pair().await;
        let (transport, mut dispatch) = Transport::spawn(server_ws, KEEPALIVE_INTERVAL);

        let pending = transport.expect("USR", None);
        drop(peer);

        let result = timeout(Duration::from_secs(2), pending.wait()).await.unwrap();
        assert_eq!(result, Err(TransportError::ConnectionClosed));
        assert!(timeout(Duration::from_secs(2), dispatch.recv()).await.unwrap().is_none());

        timeout(Duration::from_secs(2), transport.closed()).await.unwrap();
        assert_eq!(
            transport.send("x", None),
            Err(TransportError::ConnectionClosed)
        );
    }
}
