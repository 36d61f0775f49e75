//! Debounced recursive directory watcher.
//!
//! The watcher keeps an in-memory mirror of a directory tree. Each mirrored
//! directory owns one watch handle from a `WatchBackend`. A notification for
//! an entry triggers a targeted re-stat of that entry only, and the mirror is
//! patched accordingly. Changes accumulate in a batch that is flushed once no
//! further change arrives within the quiescence window.
//!
//! The mirror is owned by a single actor task; `DirectoryWatcher` is the
//! handle used to query and stop it.

use crate::fs::{FileSystem, FsError};
use crate::tree::{FileLeaf, FileTree, TreeNode};
use futures::FutureExt;
use futures::future::BoxFuture;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// Quiescence window after the last change before a batch is flushed.
pub const QUIESCENCE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("watcher stopped")]
    Stopped,
}

/// Channel on which backends report the entry paths that changed.
pub type WatchSignal = mpsc::UnboundedSender<String>;

/// A native watch on one directory. Dropping it closes the watch.
pub trait WatchHandle: Send + Sync {}

/// Source of per-directory watch handles.
///
/// Paths are `/`-prefixed and relative to the watched root (`""` is the root).
/// A handle reports the path of every direct child that changed.
pub trait WatchBackend: Send + Sync {
    fn watch(&self, dir: &str, signal: WatchSignal) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// Backend using the platform's native notification API.
///
/// All handles share one native watcher, created on the first `watch`. Each
/// handle adds a non-recursive watch on its directory and removes it on drop.
pub struct NotifyBackend {
    root: PathBuf,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
    signal: Arc<Mutex<Option<WatchSignal>>>,
}

impl NotifyBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // FSEvents reports canonical paths (/private/var/... on macOS)
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            watcher: Arc::new(Mutex::new(None)),
            signal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn native_watcher(&self) -> Result<RecommendedWatcher, WatchError> {
        let root = self.root.clone();
        let signal = Arc::clone(&self.signal);
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    // Reads of our own mirror must not look like changes
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let signal = signal.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(signal) = signal.as_ref() else {
                        return;
                    };
                    for path in &event.paths {
                        if let Some(relative) = relative_to(&root, path) {
                            let _ = signal.send(relative);
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            }
        })?;
        Ok(watcher)
    }
}

struct NotifyHandle {
    dir: PathBuf,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl WatchHandle for NotifyHandle {}

impl Drop for NotifyHandle {
    fn drop(&mut self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(watcher) = watcher.as_mut() {
            // Fails when the directory is already gone, which also ends the watch
            if let Err(e) = watcher.unwatch(&self.dir) {
                trace!("Unwatch {}: {}", self.dir.display(), e);
            }
        }
    }
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        out.push('/');
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

impl WatchBackend for NotifyBackend {
    fn watch(&self, dir: &str, signal: WatchSignal) -> Result<Box<dyn WatchHandle>, WatchError> {
        *self.signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(signal);

        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.is_none() {
            *watcher = Some(self.native_watcher()?);
        }
        let full_path = self.root.join(dir.trim_start_matches('/'));
        if let Some(watcher) = watcher.as_mut() {
            watcher.watch(&full_path, RecursiveMode::NonRecursive)?;
        }

        Ok(Box::new(NotifyHandle {
            dir: full_path,
            watcher: Arc::clone(&self.watcher),
        }))
    }
}

#[derive(Default)]
struct ManualState {
    open: HashMap<String, WatchSignal>,
    closed: Vec<String>,
}

/// Backend driven by hand. Records every handle it opens and closes.
#[derive(Clone, Default)]
pub struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

struct ManualHandle {
    dir: String,
    state: Arc<Mutex<ManualState>>,
}

impl WatchHandle for ManualHandle {}

impl Drop for ManualHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open.remove(&self.dir);
        state.closed.push(self.dir.clone());
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories with an open handle, sorted.
    pub fn open_handles(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut dirs: Vec<String> = state.open.keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Directories whose handle was closed, in closing order.
    pub fn closed_handles(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
            .clone()
    }

    /// Report a change of `path` through its parent directory's handle.
    ///
    /// Returns false when the parent has no open handle.
    pub fn notify(&self, path: &str) -> bool {
        let parent = match path.rfind('/') {
            Some(index) => &path[..index],
            None => "",
        };
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.open.get(parent) {
            Some(signal) => signal.send(path.to_string()).is_ok(),
            None => false,
        }
    }
}

impl WatchBackend for ManualBackend {
    fn watch(&self, dir: &str, signal: WatchSignal) -> Result<Box<dyn WatchHandle>, WatchError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open
            .insert(dir.to_string(), signal);
        Ok(Box::new(ManualHandle {
            dir: dir.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Coalesced changes, paths relative to the watched root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub new_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub new_directories: Vec<String>,
    pub removed_directories: Vec<String>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.removed_files.is_empty()
            && self.new_directories.is_empty()
            && self.removed_directories.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    CreatedFile,
    RemovedFile,
    CreatedDirectory,
    RemovedDirectory,
}

/// Pending changes keyed by path; the last change for a path wins.
#[derive(Default)]
struct Pending {
    changes: BTreeMap<String, Change>,
}

impl Pending {
    fn record(&mut self, path: &str, change: Change) {
        trace!("{:?} {}", change, path);
        self.changes.insert(path.to_string(), change);
    }

    fn take(&mut self) -> ChangeBatch {
        let mut batch = ChangeBatch::default();
        for (path, change) in std::mem::take(&mut self.changes) {
            match change {
                Change::CreatedFile => batch.new_files.push(path),
                Change::RemovedFile => batch.removed_files.push(path),
                Change::CreatedDirectory => batch.new_directories.push(path),
                Change::RemovedDirectory => batch.removed_directories.push(path),
            }
        }
        batch
    }
}

enum Node {
    File(FileLeaf),
    Dir(DirNode),
}

struct DirNode {
    children: BTreeMap<String, Node>,
    handle: Option<Box<dyn WatchHandle>>,
}

impl DirNode {
    fn manifest(&self) -> FileTree {
        self.children
            .iter()
            .map(|(name, node)| {
                let node = match node {
                    Node::File(leaf) => TreeNode::File(*leaf),
                    Node::Dir(dir) => TreeNode::Directory(dir.manifest()),
                };
                (name.clone(), node)
            })
            .collect()
    }

    /// Close nested handles, then this one, recording every removal.
    fn teardown(mut self, path: &str, mut pending: Option<&mut Pending>) {
        for (name, child) in std::mem::take(&mut self.children) {
            let child_path = format!("{}/{}", path, name);
            match child {
                Node::File(_) => {
                    if let Some(pending) = pending.as_deref_mut() {
                        pending.record(&child_path, Change::RemovedFile);
                    }
                }
                Node::Dir(dir) => dir.teardown(&child_path, pending.as_deref_mut()),
            }
        }
        drop(self.handle.take());
        if let Some(pending) = pending {
            if !path.is_empty() {
                pending.record(path, Change::RemovedDirectory);
            }
        }
    }
}

struct Mirror {
    fs: Arc<dyn FileSystem>,
    backend: Arc<dyn WatchBackend>,
    signal: WatchSignal,
    root: DirNode,
}

impl Mirror {
    /// Open a handle on `path` and mirror its contents recursively.
    ///
    /// The handle is opened before listing so no change is missed.
    fn scan<'a>(
        &'a self,
        path: String,
        mut pending: Option<&'a mut Pending>,
    ) -> BoxFuture<'a, Result<DirNode, WatchError>> {
        async move {
            let handle = self.backend.watch(&path, self.signal.clone())?;
            let mut node = DirNode {
                children: BTreeMap::new(),
                handle: Some(handle),
            };

            for entry in self.fs.list(&path).await? {
                let child_path = format!("{}/{}", path, entry.name);
                let Ok(stat) = self.fs.stat(&child_path).await else {
                    continue;
                };
                if stat.is_dir {
                    let dir = match self.scan(child_path.clone(), pending.as_deref_mut()).await {
                        Ok(dir) => dir,
                        Err(WatchError::Fs(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    if let Some(pending) = pending.as_deref_mut() {
                        pending.record(&child_path, Change::CreatedDirectory);
                    }
                    node.children.insert(entry.name, Node::Dir(dir));
                } else {
                    if let Some(pending) = pending.as_deref_mut() {
                        pending.record(&child_path, Change::CreatedFile);
                    }
                    node.children.insert(
                        entry.name,
                        Node::File(FileLeaf::from_millis(stat.mtime_millis, stat.size)),
                    );
                }
            }
            Ok(node)
        }
        .boxed()
    }

    fn parent_mut(&mut self, segments: &[&str]) -> Option<&mut DirNode> {
        let mut node = &mut self.root;
        for segment in segments {
            match node.children.get_mut(*segment) {
                Some(Node::Dir(dir)) => node = dir,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Re-stat one entry and patch the mirror. Returns whether anything changed.
    async fn refresh(&mut self, path: &str, pending: &mut Pending) -> Result<bool, WatchError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((name, parents)) = segments.split_last() else {
            return Ok(false);
        };
        let name = name.to_string();
        if self.parent_mut(parents).is_none() {
            return Ok(false);
        }

        let stat = self.fs.stat(path).await;

        let Some(parent) = self.parent_mut(parents) else {
            return Ok(false);
        };

        match stat {
            Err(_) => match parent.children.remove(&name) {
                Some(Node::File(_)) => {
                    pending.record(path, Change::RemovedFile);
                    Ok(true)
                }
                Some(Node::Dir(dir)) => {
                    dir.teardown(path, Some(&mut *pending));
                    Ok(true)
                }
                None => Ok(false),
            },
            Ok(stat) if stat.is_dir => {
                if matches!(parent.children.get(&name), Some(Node::Dir(_))) {
                    return Ok(false);
                }
                if parent.children.remove(&name).is_some() {
                    pending.record(path, Change::RemovedFile);
                }
                let dir = match self.scan(path.to_string(), Some(&mut *pending)).await {
                    Ok(dir) => dir,
                    // Vanished while scanning
                    Err(WatchError::Fs(_)) => return Ok(false),
                    Err(e) => return Err(e),
                };
                pending.record(path, Change::CreatedDirectory);
                if let Some(parent) = self.parent_mut(parents) {
                    parent.children.insert(name, Node::Dir(dir));
                }
                Ok(true)
            }
            Ok(stat) => {
                let leaf = FileLeaf::from_millis(stat.mtime_millis, stat.size);
                match parent.children.insert(name, Node::File(leaf)) {
                    // Unchanged descriptor: spurious notification
                    Some(Node::File(previous)) if previous == leaf => Ok(false),
                    Some(Node::Dir(dir)) => {
                        dir.teardown(path, Some(&mut *pending));
                        pending.record(path, Change::CreatedFile);
                        Ok(true)
                    }
                    _ => {
                        pending.record(path, Change::CreatedFile);
                        Ok(true)
                    }
                }
            }
        }
    }
}

enum Command {
    Manifest(oneshot::Sender<FileTree>),
    Stop,
}

/// Handle to a running watcher.
pub struct DirectoryWatcher {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Scan the root, open a handle per directory, and start watching.
    ///
    /// The initial scan emits no batch. Returns the handle and the receiver of
    /// flushed batches.
    pub async fn start(
        fs: Arc<dyn FileSystem>,
        backend: Arc<dyn WatchBackend>,
        quiescence: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChangeBatch>), WatchError> {
        let (signal, signals) = mpsc::unbounded_channel();
        let mut mirror = Mirror {
            fs,
            backend,
            signal,
            root: DirNode {
                children: BTreeMap::new(),
                handle: None,
            },
        };
        let root = mirror.scan(String::new(), None).await?;
        mirror.root = root;

        let (batches_tx, batches) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(mirror, signals, commands_rx, batches_tx, quiescence));

        Ok((
            Self {
                commands,
                task: Some(task),
            },
            batches,
        ))
    }

    /// Snapshot of the mirror tree.
    pub async fn manifest(&self) -> Result<FileTree, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Manifest(tx))
            .map_err(|_| WatchError::Stopped)?;
        rx.await.map_err(|_| WatchError::Stopped)
    }

    /// Stop watching and wait until every handle is closed.
    pub async fn stop(mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    mut mirror: Mirror,
    mut signals: mpsc::UnboundedReceiver<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    batches: mpsc::UnboundedSender<ChangeBatch>,
    quiescence: Duration,
) {
    let mut pending = Pending::default();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            Some(path) = signals.recv() => {
                match mirror.refresh(&path, &mut pending).await {
                    Ok(true) => deadline = Some(Instant::now() + quiescence),
                    Ok(false) => {}
                    Err(e) => error!("Failed to refresh {}: {}", path, e),
                }
            }
            command = commands.recv() => match command {
                Some(Command::Manifest(reply)) => {
                    let _ = reply.send(mirror.root.manifest());
                }
                Some(Command::Stop) | None => break,
            },
            _ = async {
                if let Some(deadline) = deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            }, if deadline.is_some() => {
                deadline = None;
                let batch = pending.take();
                if !batch.is_empty() {
                    debug!(
                        "Flushing batch: {} new, {} removed files",
                        batch.new_files.len(),
                        batch.removed_files.len()
                    );
                    if batches.send(batch).is_err() {
                        debug!("Batch receiver dropped");
                    }
                }
            }
        }
    }

    let root = std::mem::replace(
        &mut mirror.root,
        DirNode {
            children: BTreeMap::new(),
            handle: None,
        },
    );
    root.teardown("", None);
}
