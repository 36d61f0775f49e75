//! The host as seen from a synchronizing peer.

use crate::protocol::messages::{
    ContextFiles, ContextInfo, FileContent, FileRequest, StoreFile, names,
};
use crate::sync_engine::{Result, SyncError};
use crate::transport::Transport;
use crate::tree::FileTree;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

/// Content operations a peer performs against the host.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Ids of every context the host serves.
    async fn contexts(&self) -> Result<Vec<String>>;

    /// Current manifest of one context.
    async fn manifest(&self, context: &str) -> Result<FileTree>;

    /// Bytes of one file.
    async fn fetch(&self, context: &str, path: &str) -> Result<Vec<u8>>;

    /// Store a file, or delete it when `content` is `None`.
    async fn store(&self, context: &str, path: &str, content: Option<&[u8]>) -> Result<()>;
}

/// `Remote` over the message transport.
#[derive(Clone)]
pub struct TransportRemote {
    transport: Transport,
}

impl TransportRemote {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    name: &str,
    payload: Option<serde_json::Value>,
) -> Result<T> {
    let payload = payload.ok_or_else(|| SyncError::Protocol(format!("{} without payload", name)))?;
    serde_json::from_value(payload)
        .map_err(|e| SyncError::Protocol(format!("malformed {}: {}", name, e)))
}

#[async_trait]
impl Remote for TransportRemote {
    async fn contexts(&self) -> Result<Vec<String>> {
        let payload = self
            .transport
            .call(names::CONTEXTS, &json!({}), names::CONTEXTS, None)
            .await?;
        let contexts: Vec<ContextInfo> = decode(names::CONTEXTS, payload)?;
        Ok(contexts.into_iter().map(|context| context.id).collect())
    }

    async fn manifest(&self, context: &str) -> Result<FileTree> {
        let payload = self
            .transport
            .call(
                names::FILES_IN_CONTEXT,
                &[context],
                names::FILES_IN_CONTEXT,
                None,
            )
            .await?;
        let manifests: Vec<ContextFiles> = decode(names::FILES_IN_CONTEXT, payload)?;
        manifests
            .into_iter()
            .find(|manifest| manifest.id == context)
            .map(|manifest| manifest.files)
            .ok_or_else(|| SyncError::Protocol(format!("no manifest for context {}", context)))
    }

    async fn fetch(&self, context: &str, path: &str) -> Result<Vec<u8>> {
        let request = FileRequest {
            context_id: context.to_string(),
            file_path: path.to_string(),
        };
        let payload = self
            .transport
            .call(
                names::GET_FILE_CONTENT,
                &request,
                names::FILE_CONTENT,
                Some(json!({"contextId": context, "filePath": path})),
            )
            .await?;
        let response: FileContent = decode(names::FILE_CONTENT, payload)?;

        match (response.content, response.err) {
            (Some(content), _) => STANDARD.decode(content).map_err(|e| SyncError::Transfer {
                path: path.to_string(),
                message: e.to_string(),
            }),
            (None, err) => Err(SyncError::Transfer {
                path: path.to_string(),
                message: err.unwrap_or_else(|| "no content".to_string()),
            }),
        }
    }

    async fn store(&self, context: &str, path: &str, content: Option<&[u8]>) -> Result<()> {
        let message = StoreFile {
            context_id: context.to_string(),
            file_path: path.to_string(),
            content: content.map(|bytes| STANDARD.encode(bytes)),
        };
        self.transport.send_json(names::SET_FILE_CONTEXT, &message)?;
        Ok(())
    }
}
