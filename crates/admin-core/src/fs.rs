//! FileSystem trait abstraction for platform-independent file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` - Uses tokio::fs, rooted at a base directory
//!
//! Paths are relative to the filesystem root. A leading `/` is accepted and
//! ignored, so protocol paths such as `/docs/a.txt` can be passed straight through.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Invalid path '{0}': must not contain '..' nor '//'")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Validate a content path coming from a peer and normalise it to a leading `/`.
///
/// Rejects parent-directory segments and empty segments so a peer can never
/// escape the context root.
pub fn content_path(path: &str) -> Result<String> {
    if path.starts_with("../") || path.contains("/../") || path.ends_with("/..") || path == ".."
    {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    if path.contains("//") {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Native filesystem rooted at a base directory.
#[derive(Debug, Clone)]
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn io_error(path: &str, e: std::io::Error) -> FsError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound(path.to_string())
    } else {
        FsError::Io(e.to_string())
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        tokio::fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            // A vanished entry is skipped rather than failing the whole listing
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        } else {
            tokio::fs::remove_file(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        tokio::fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = tokio::fs::metadata(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;

        let mtime_millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime for testing timestamp comparisons
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        self.mtimes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, mtime);
    }

    fn current_time_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn child_name<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
        let rest = if prefix.is_empty() {
            path
        } else {
            path.strip_prefix(prefix)?.strip_prefix('/')?
        };
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest)
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.get(&path).cloned().ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone(), content.to_vec());
        self.mtimes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        for file_path in files.keys() {
            if let Some(name) = Self::child_name(&path, file_path) {
                entries.push(FileEntry {
                    name: name.to_string(),
                    is_dir: false,
                });
            }
        }
        for dir_path in dirs.iter() {
            if let Some(name) = Self::child_name(&path, dir_path) {
                entries.push(FileEntry {
                    name: name.to_string(),
                    is_dir: true,
                });
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if self
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
            .is_some()
        {
            self.mtimes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);
            return Ok(());
        }

        if !path.is_empty()
            && self
                .dirs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path)
        {
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
        {
            let mtime = self
                .mtimes
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&path)
                .copied()
                .unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
        Ok(())
    }
}

// Allows sharing one filesystem between the sync engine, the watcher and tests
#[async_trait]
impl<T: FileSystem> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("/test.txt", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("/test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("a/b/c.txt", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("/a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.txt");
        assert!(!entries[0].is_dir);

        let root = fs.list("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "a");
    }

    #[tokio::test]
    async fn test_native_fs_write_then_read_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        let content: Vec<u8> = (0..=255u8).collect();

        fs.write("/nested/dir/blob.bin", &content).await.unwrap();

        assert_eq!(fs.read("/nested/dir/blob.bin").await.unwrap(), content);
        let stat = fs.stat("nested/dir/blob.bin").await.unwrap();
        assert_eq!(stat.size, 256);
        assert!(!stat.is_dir);
        assert!(fs.stat("nested").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_native_fs_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        assert!(matches!(fs.stat("/nope").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("/nope").await.unwrap());
    }

    #[test]
    fn test_content_path_normalises_and_rejects_escapes() {
        assert_eq!(content_path("a.txt").unwrap(), "/a.txt");
        assert_eq!(content_path("/dir/a.txt").unwrap(), "/dir/a.txt");
        assert!(content_path("../etc/passwd").is_err());
        assert!(content_path("/dir/../../x").is_err());
        assert!(content_path("/dir//x").is_err());
    }
}
