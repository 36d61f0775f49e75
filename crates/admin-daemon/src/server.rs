//! WebSocket listener and per-connection session loop.
//!
//! Every accepted connection gets its own session, announced to the peer as
//! `AUTH {token}`. Messages of one connection are handled strictly in arrival
//! order; connections never wait on each other.

use std::net::SocketAddr;
use std::sync::Arc;

use admin_core::protocol::messages::{AuthChallenge, names};
use admin_core::session::short;
use admin_core::transport::Transport;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info};

use crate::host::Host;

/// Bind to an address and return the TCP listener.
pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("WebSocket server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until the listener fails or the task is aborted.
pub async fn run(host: Arc<Host>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept_connection(Arc::clone(&host), stream, addr));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn accept_connection(host: Arc<Host>, stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks (like `nc -z`) connect and close without a handshake.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };
    debug!("New connection from {}", addr);
    serve(host, ws).await;
}

/// Run one session over an established WebSocket until it closes.
pub async fn serve<S>(host: Arc<Host>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let settings = host.settings();
    let (connection, mut inbound) = Transport::spawn(ws, settings.keepalive);
    let session = host
        .sessions()
        .create(settings.session_timeout, Some(connection.clone()));
    debug!("Session {} opened", short(&session));

    let challenge = AuthChallenge {
        token: session.clone(),
    };
    if connection.send_json(names::AUTH, &challenge).is_ok() {
        while let Some(frame) = inbound.recv().await {
            host.handle(&session, &connection, frame).await;
        }
    }

    host.sessions().destroy(&session);
    host.contexts().forget_session(&session);
    debug!("Session {} closed", short(&session));
}
