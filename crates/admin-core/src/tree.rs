//! Manifest trees: the recursive file/directory listing of a context.
//!
//! Wire format is a JSON object whose values are either nested objects
//! (directories) or `"<rfc3339 mtime>|<size>"` strings (files):
//!
//! ```json
//! {"a.txt": "2024-01-01T00:00:00.000Z|5", "docs": {"b.md": "2024-01-02T10:00:00.000Z|12"}}
//! ```

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeafParseError {
    #[error("leaf descriptor '{0}' is missing the '|' separator")]
    MissingSeparator(String),
    #[error("invalid timestamp in leaf descriptor '{0}'")]
    InvalidTimestamp(String),
    #[error("invalid size in leaf descriptor '{0}'")]
    InvalidSize(String),
}

/// Descriptor of a single file: modification time and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLeaf {
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl FileLeaf {
    pub fn new(modified: DateTime<Utc>, size: u64) -> Self {
        Self { modified, size }
    }

    /// Build a leaf from a millisecond mtime as reported by `FileSystem::stat`.
    pub fn from_millis(mtime_millis: u64, size: u64) -> Self {
        let modified = Utc
            .timestamp_millis_opt(mtime_millis as i64)
            .single()
            .unwrap_or_default();
        Self { modified, size }
    }

    pub fn modified_millis(&self) -> i64 {
        self.modified.timestamp_millis()
    }
}

impl fmt::Display for FileLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.size
        )
    }
}

impl FromStr for FileLeaf {
    type Err = LeafParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (modified, size) = s
            .split_once('|')
            .ok_or_else(|| LeafParseError::MissingSeparator(s.to_string()))?;
        let modified = DateTime::parse_from_rfc3339(modified)
            .map_err(|_| LeafParseError::InvalidTimestamp(s.to_string()))?
            .with_timezone(&Utc);
        let size = size
            .parse()
            .map_err(|_| LeafParseError::InvalidSize(s.to_string()))?;
        Ok(Self { modified, size })
    }
}

impl Serialize for FileLeaf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FileLeaf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// A node in a manifest tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Directory(FileTree),
    File(FileLeaf),
}

/// Recursive mapping from entry name to node. Names are unique per level.
pub type FileTree = BTreeMap<String, TreeNode>;

/// Visit every node depth-first, parents before children.
///
/// The callback receives the `/`-prefixed path relative to the tree root.
pub fn walk<F>(tree: &FileTree, mut visit: F)
where
    F: FnMut(&str, &TreeNode),
{
    fn inner<F: FnMut(&str, &TreeNode)>(prefix: &str, tree: &FileTree, visit: &mut F) {
        for (name, node) in tree {
            let path = format!("{}/{}", prefix, name);
            visit(&path, node);
            if let TreeNode::Directory(children) = node {
                inner(&path, children, visit);
            }
        }
    }
    inner("", tree, &mut visit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_wire_format() {
        let leaf: FileLeaf = "2024-01-01T00:00:00.000Z|5".parse().unwrap();
        assert_eq!(leaf.size, 5);
        assert_eq!(leaf.modified_millis(), 1_704_067_200_000);
        assert_eq!(leaf.to_string(), "2024-01-01T00:00:00.000Z|5");
    }

    #[test]
    fn test_leaf_rejects_garbage() {
        assert!(matches!(
            "no-separator".parse::<FileLeaf>(),
            Err(LeafParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "yesterday|5".parse::<FileLeaf>(),
            Err(LeafParseError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            "2024-01-01T00:00:00.000Z|big".parse::<FileLeaf>(),
            Err(LeafParseError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_tree_deserializes_nested_directories() {
        let json = r#"{"a.txt":"2024-01-01T00:00:00.000Z|5","docs":{"b.md":"2024-01-02T10:00:00.000Z|12"}}"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();

        assert!(matches!(tree.get("a.txt"), Some(TreeNode::File(l)) if l.size == 5));
        let Some(TreeNode::Directory(docs)) = tree.get("docs") else {
            panic!("docs should be a directory");
        };
        assert!(matches!(docs.get("b.md"), Some(TreeNode::File(l)) if l.size == 12));

        assert_eq!(serde_json::to_string(&tree).unwrap(), json);
    }

    #[test]
    fn test_walk_visits_parents_first() {
        let json = r#"{"docs":{"b.md":"2024-01-02T10:00:00.000Z|12"},"a.txt":"2024-01-01T00:00:00.000Z|5"}"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();

        let mut seen = Vec::new();
        walk(&tree, |path, _| seen.push(path.to_string()));

        assert_eq!(seen, vec!["/a.txt", "/docs", "/docs/b.md"]);
    }
}
