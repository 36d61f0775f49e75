//! Served contexts: watched content directories.
//!
//! Every context keeps a `DirectoryWatcher` running over its root. The
//! watcher's mirror tree is the manifest handed to peers, and each flushed
//! batch is pushed to every authenticated session as a `change` notice.
//!
//! Paths a session stored itself through `setFileContext` are withheld from
//! that session's next notice, so a peer is never told about its own upload.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use admin_core::fs::{FileSystem, FsError, NativeFs, content_path};
use admin_core::protocol::messages::{ChangeNotice, ContextFiles, names};
use admin_core::session::{SessionRegistry, short};
use admin_core::tree::FileTree;
use admin_core::watcher::{
    ChangeBatch, DirectoryWatcher, NotifyBackend, WatchBackend, WatchError,
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ContextConfig;

/// Read and write access to the files of one context.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError>;

    /// Store `content` at `path`, or delete the file when `content` is `None`.
    async fn write(&self, path: &str, content: Option<&[u8]>) -> Result<(), FsError>;
}

/// One served directory.
pub struct ServedContext {
    id: String,
    fs: Arc<dyn FileSystem>,
    watcher: DirectoryWatcher,
}

impl ServedContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn manifest(&self) -> Result<FileTree, WatchError> {
        self.watcher.manifest().await
    }
}

#[async_trait]
impl ContentStore for ServedContext {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.fs.read(&content_path(path)?).await
    }

    async fn write(&self, path: &str, content: Option<&[u8]>) -> Result<(), FsError> {
        let path = content_path(path)?;
        match content {
            Some(content) => self.fs.write(&path, content).await,
            None => self.fs.delete(&path).await,
        }
    }
}

/// Paths each session stored, per context, not yet seen in a batch.
type StoredPaths = Mutex<HashMap<String, HashSet<(String, String)>>>;

/// All served contexts, keyed by id.
pub struct ContextRegistry {
    contexts: BTreeMap<String, ServedContext>,
    sessions: SessionRegistry,
    stored: Arc<StoredPaths>,
    broadcasters: Vec<JoinHandle<()>>,
}

impl ContextRegistry {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            contexts: BTreeMap::new(),
            sessions,
            stored: Arc::new(Mutex::new(HashMap::new())),
            broadcasters: Vec::new(),
        }
    }

    /// Start serving every configured directory with native watches.
    pub async fn from_config(
        sessions: SessionRegistry,
        contexts: &[ContextConfig],
        quiescence: Duration,
    ) -> Result<Self> {
        let mut registry = Self::new(sessions);
        for context in contexts {
            std::fs::create_dir_all(&context.path)
                .with_context(|| format!("Failed to create context root: {:?}", context.path))?;
            let backend = NotifyBackend::new(&context.path);
            let fs = Arc::new(NativeFs::new(backend.root().to_path_buf()));
            registry
                .add(&context.id, fs, Arc::new(backend), quiescence)
                .await
                .with_context(|| format!("Failed to watch context {}", context.id))?;
            info!("Serving context {} from {:?}", context.id, context.path);
        }
        Ok(registry)
    }

    /// Start serving one context.
    pub async fn add(
        &mut self,
        id: &str,
        fs: Arc<dyn FileSystem>,
        backend: Arc<dyn WatchBackend>,
        quiescence: Duration,
    ) -> Result<(), WatchError> {
        let (watcher, batches) =
            DirectoryWatcher::start(Arc::clone(&fs), backend, quiescence).await?;

        self.broadcasters.push(tokio::spawn(broadcast_changes(
            id.to_string(),
            batches,
            self.sessions.clone(),
            Arc::clone(&self.stored),
        )));
        self.contexts.insert(
            id.to_string(),
            ServedContext {
                id: id.to_string(),
                fs,
                watcher,
            },
        );
        Ok(())
    }

    pub fn ids(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&ServedContext> {
        self.contexts.get(id)
    }

    /// Manifests of the requested contexts; unknown ids are skipped.
    pub async fn manifests(&self, ids: &[String]) -> Vec<ContextFiles> {
        let mut manifests = Vec::new();
        for id in ids {
            let Some(context) = self.contexts.get(id) else {
                debug!("Manifest requested for unknown context {}", id);
                continue;
            };
            match context.manifest().await {
                Ok(files) => manifests.push(ContextFiles {
                    id: id.clone(),
                    files,
                }),
                Err(e) => debug!("No manifest for {}: {}", id, e),
            }
        }
        manifests
    }

    /// Store on behalf of `session`, withholding the path from its next notice.
    pub async fn store(
        &self,
        session: &str,
        context: &str,
        path: &str,
        content: Option<&[u8]>,
    ) -> Result<(), FsError> {
        let served = self
            .contexts
            .get(context)
            .ok_or_else(|| FsError::NotFound(format!("context {}", context)))?;
        let path = content_path(path)?;

        let key = (context.to_string(), path.clone());
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session.to_string())
            .or_default()
            .insert(key.clone());

        let result = served.write(&path, content).await;
        if result.is_err() {
            if let Some(paths) = self
                .stored
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_mut(session)
            {
                paths.remove(&key);
            }
        }
        result
    }

    /// Drop suppression state of a closed session.
    pub fn forget_session(&self, session: &str) {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
    }

    /// Stop every watcher, closing all native handles.
    pub async fn shutdown(mut self) {
        for task in self.broadcasters.drain(..) {
            task.abort();
        }
        for (_, context) in std::mem::take(&mut self.contexts) {
            context.watcher.stop().await;
        }
    }
}

impl Drop for ContextRegistry {
    fn drop(&mut self) {
        for task in &self.broadcasters {
            task.abort();
        }
    }
}

/// Build the notice for one session, consuming its withheld paths.
fn notice_for(
    context: &str,
    batch: &ChangeBatch,
    withheld: Option<&mut HashSet<(String, String)>>,
) -> ChangeNotice {
    let mut notice = ChangeNotice {
        id: context.to_string(),
        new_files: batch.new_files.clone(),
        removed_files: batch.removed_files.clone(),
    };
    if let Some(withheld) = withheld {
        let mut keep = |path: &String| !withheld.remove(&(context.to_string(), path.clone()));
        notice.new_files.retain(&mut keep);
        notice.removed_files.retain(&mut keep);
    }
    notice
}

async fn broadcast_changes(
    context: String,
    mut batches: mpsc::UnboundedReceiver<ChangeBatch>,
    sessions: SessionRegistry,
    stored: Arc<StoredPaths>,
) {
    while let Some(batch) = batches.recv().await {
        debug!(
            "[{}] {} new, {} removed files",
            context,
            batch.new_files.len(),
            batch.removed_files.len()
        );

        for session in sessions.authenticated() {
            let Some(connection) = sessions.connection(&session) else {
                continue;
            };
            let notice = {
                let mut stored = stored.lock().unwrap_or_else(|e| e.into_inner());
                notice_for(&context, &batch, stored.get_mut(&session))
            };
            if notice.is_empty() {
                continue;
            }
            if connection.send_json(names::CHANGE, &notice).is_err() {
                debug!("Session {} closed before change notice", short(&session));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admin_core::fs::InMemoryFs;
    use admin_core::watcher::ManualBackend;

    #[test]
    fn test_notice_withholds_own_paths_once() {
        let batch = ChangeBatch {
            new_files: vec!["/a.txt".into(), "/b.txt".into()],
            removed_files: vec!["/c.txt".into()],
            ..Default::default()
        };
        let mut withheld: HashSet<(String, String)> = [
            ("web".to_string(), "/a.txt".to_string()),
            ("web".to_string(), "/c.txt".to_string()),
            ("docs".to_string(), "/b.txt".to_string()),
        ]
        .into_iter()
        .collect();

        let notice = notice_for("web", &batch, Some(&mut withheld));

        assert_eq!(notice.new_files, vec!["/b.txt"]);
        assert!(notice.removed_files.is_empty());
        assert_eq!(withheld.len(), 1);

        let again = notice_for("web", &batch, Some(&mut withheld));
        assert_eq!(again.new_files.len(), 2);
    }

    #[tokio::test]
    async fn test_store_validates_paths_and_serves_manifest() {
        let sessions = SessionRegistry::new();
        let mut registry = ContextRegistry::new(sessions);
        let fs = Arc::new(InMemoryFs::new());
        fs.write("/index.html", b"<html>").await.unwrap();
        registry
            .add(
                "web",
                fs.clone(),
                Arc::new(ManualBackend::new()),
                Duration::from_millis(20),
            )
            .await
            .unwrap();

        assert!(matches!(
            registry.store("s", "web", "/../etc/passwd", Some(b"x")).await,
            Err(FsError::InvalidPath(_))
        ));
        registry.store("s", "web", "notes/a.txt", Some(b"a")).await.unwrap();
        assert_eq!(fs.read("/notes/a.txt").await.unwrap(), b"a");

        let manifests = registry.manifests(&["web".into(), "nope".into()]).await;
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].files.contains_key("index.html"));

        let served = registry.get("web").unwrap();
        served.write("/notes/a.txt", None).await.unwrap();
        assert!(matches!(served.read("/notes/a.txt").await, Err(FsError::NotFound(_))));
    }
}
