//! SyncEngine: keeps one local directory converged with one host context.
//!
//! The engine works in two phases:
//!
//! 1. Bulk reconciliation. The local tree is enumerated, the host manifest is
//!    requested and walked. Missing or older local files are downloaded, and
//!    local entries the host does not have are deleted.
//! 2. Live mirroring. Watcher batches are uploaded to the host, and host
//!    `change` notices are applied locally.
//!
//! Every local write or delete made on behalf of the host is first marked in
//! the `IgnoreSet`, so the watcher report it causes is not sent back.

use crate::fs::{FileSystem, FsError};
use crate::ignore::{Echo, IgnoreSet};
use crate::protocol::messages::ChangeNotice;
use crate::remote::Remote;
use crate::transport::TransportError;
use crate::tree::{TreeNode, walk};
use crate::watcher::ChangeBatch;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What a bulk reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: Vec<String>,
    pub deleted_files: Vec<String>,
    pub deleted_directories: Vec<String>,
    pub failed: Vec<String>,
}

impl SyncReport {
    /// Number of files transferred or deleted.
    pub fn transfers(&self) -> usize {
        self.downloaded.len() + self.deleted_files.len()
    }
}

pub struct SyncEngine<R: Remote + ?Sized> {
    context: String,
    remote: Arc<R>,
    fs: Arc<dyn FileSystem>,
    ignore: Arc<IgnoreSet>,
}

impl<R: Remote + ?Sized> SyncEngine<R> {
    pub fn new(context: impl Into<String>, remote: Arc<R>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            context: context.into(),
            remote,
            fs,
            ignore: Arc::new(IgnoreSet::new()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    /// Every local path below the root, mapped to whether it is a directory.
    async fn existing(&self) -> Result<BTreeMap<String, bool>> {
        let mut existing = BTreeMap::new();
        let mut queue = vec![String::new()];
        while let Some(dir) = queue.pop() {
            for entry in self.fs.list(&dir).await? {
                let path = format!("{}/{}", dir, entry.name);
                if entry.is_dir {
                    queue.push(path.clone());
                }
                existing.insert(path, entry.is_dir);
            }
        }
        Ok(existing)
    }

    /// Bulk phase: make the local tree match the host manifest.
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let mut existing = self.existing().await?;
        let manifest = self.remote.manifest(&self.context).await?;

        let mut directories = Vec::new();
        let mut candidates = Vec::new();
        walk(&manifest, |path, node| match node {
            TreeNode::Directory(_) => directories.push(path.to_string()),
            TreeNode::File(leaf) => candidates.push((path.to_string(), leaf.modified_millis())),
        });

        for dir in directories {
            if existing.remove(&dir) != Some(true) {
                self.fs.mkdir(&dir).await?;
            }
        }

        let mut downloads = Vec::new();
        for (path, remote_millis) in candidates {
            match existing.remove(&path) {
                Some(false) => {
                    let stat = self.fs.stat(&path).await?;
                    if (stat.mtime_millis as i64) < remote_millis {
                        downloads.push(path);
                    }
                }
                _ => downloads.push(path),
            }
        }

        let mut report = SyncReport::default();
        for path in downloads {
            match self.download(&path).await {
                Ok(()) => report.downloaded.push(path),
                Err(e) => {
                    warn!("[{}] Failed to download {}: {}", self.context, path, e);
                    report.failed.push(path);
                }
            }
        }

        let (files, mut dirs): (Vec<_>, Vec<_>) =
            existing.into_iter().partition(|(_, is_dir)| !*is_dir);

        for (path, _) in files {
            self.ignore.insert(&path, Echo::Delete);
            match self.fs.delete(&path).await {
                Ok(()) => report.deleted_files.push(path),
                Err(e) => {
                    self.ignore.forget(&path);
                    warn!("[{}] Failed to delete {}: {}", self.context, path, e);
                }
            }
        }

        // Directories go only once empty; removing a child can empty its parent
        loop {
            let mut removed = false;
            let mut remaining = Vec::new();
            for (path, is_dir) in dirs {
                if self.fs.list(&path).await?.is_empty() {
                    self.fs.delete(&path).await?;
                    report.deleted_directories.push(path);
                    removed = true;
                } else {
                    remaining.push((path, is_dir));
                }
            }
            dirs = remaining;
            if !removed {
                break;
            }
        }

        info!(
            "[{}] Reconciled: {} downloaded, {} files and {} directories deleted",
            self.context,
            report.downloaded.len(),
            report.deleted_files.len(),
            report.deleted_directories.len()
        );
        Ok(report)
    }

    async fn download(&self, path: &str) -> Result<()> {
        let content = self.remote.fetch(&self.context, path).await?;
        self.ignore.insert(path, Echo::Write);
        if let Err(e) = self.fs.write(path, &content).await {
            self.ignore.forget(path);
            return Err(e.into());
        }
        debug!("[{}] Downloaded {} ({} bytes)", self.context, path, content.len());
        Ok(())
    }

    /// Live phase: send local changes the host has not caused itself.
    ///
    /// Returns the number of messages sent.
    pub async fn upload(&self, batch: &ChangeBatch) -> Result<usize> {
        let mut sent = 0;

        for path in &batch.new_files {
            if self.ignore.take(path, Echo::Write) {
                continue;
            }
            let content = match self.fs.read(path).await {
                Ok(content) => content,
                // Gone again before we got to it; its removal follows
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            self.remote
                .store(&self.context, path, Some(&content))
                .await?;
            debug!("[{}] Uploaded {}", self.context, path);
            sent += 1;
        }

        for path in &batch.removed_files {
            if self.ignore.take(path, Echo::Delete) {
                continue;
            }
            self.remote.store(&self.context, path, None).await?;
            debug!("[{}] Removed {} on host", self.context, path);
            sent += 1;
        }

        Ok(sent)
    }

    /// Apply a host `change` notice locally.
    pub async fn apply(&self, notice: &ChangeNotice) -> Result<()> {
        for path in &notice.new_files {
            if let Err(e) = self.download(path).await {
                warn!("[{}] Failed to download {}: {}", self.context, path, e);
            }
        }

        for path in &notice.removed_files {
            if !self.fs.exists(path).await? {
                continue;
            }
            self.ignore.insert(path, Echo::Delete);
            if let Err(e) = self.fs.delete(path).await {
                self.ignore.forget(path);
                warn!("[{}] Failed to delete {}: {}", self.context, path, e);
            }
        }
        Ok(())
    }

    /// Reconcile, then mirror until both channels close.
    ///
    /// Batches and notices that arrive during reconciliation are held in
    /// their channels and handled afterwards.
    pub async fn run(
        &self,
        batches: mpsc::UnboundedReceiver<ChangeBatch>,
        notices: mpsc::UnboundedReceiver<ChangeNotice>,
    ) -> Result<()> {
        self.reconcile().await?;
        self.mirror(batches, notices).await
    }

    /// Live phase: upload batches and apply notices until both channels close.
    pub async fn mirror(
        &self,
        mut batches: mpsc::UnboundedReceiver<ChangeBatch>,
        mut notices: mpsc::UnboundedReceiver<ChangeNotice>,
    ) -> Result<()> {
        let mut batches_open = true;
        let mut notices_open = true;
        while batches_open || notices_open {
            tokio::select! {
                batch = batches.recv(), if batches_open => match batch {
                    Some(batch) => match self.upload(&batch).await {
                        Ok(_) => {}
                        Err(SyncError::Transport(e)) => return Err(e.into()),
                        Err(e) => warn!("[{}] Upload failed: {}", self.context, e),
                    },
                    None => batches_open = false,
                },
                notice = notices.recv(), if notices_open => match notice {
                    Some(notice) => {
                        if let Err(e) = self.apply(&notice).await {
                            warn!("[{}] Applying change failed: {}", self.context, e);
                        }
                    }
                    None => notices_open = false,
                },
            }
        }
        Ok(())
    }
}
