//! Typed payloads for the message catalog.
//!
//! Field names follow the camelCase wire convention.

use crate::tree::FileTree;
use serde::{Deserialize, Serialize};

/// Message names.
pub mod names {
    pub const AUTH: &str = "AUTH";
    pub const USR: &str = "USR";
    pub const AUTH_USR: &str = "AUTH_USR";
    pub const ERR: &str = "ERR";
    pub const CONTEXTS: &str = "contexts";
    pub const FILES_IN_CONTEXT: &str = "filesInContext";
    pub const GET_FILE_CONTENT: &str = "getFileContent";
    pub const FILE_CONTENT: &str = "fileContent";
    pub const SET_FILE_CONTEXT: &str = "setFileContext";
    pub const FILE_NOT_STORED: &str = "fileNotStored";
    pub const CHANGE: &str = "change";
    pub const LOG: &str = "log";
    pub const PTY: &str = "pty";
    pub const NEW_TERM: &str = "newTerm";
    pub const TERM: &str = "term";
    pub const SESSIONS: &str = "sessions";
    pub const SESSION: &str = "session";
    pub const CLOSE_SESSION: &str = "closeSession";
    pub const SESSION_REMOVED: &str = "sessionRemoved";
    pub const USERS: &str = "users";
    pub const USERNAMES: &str = "usernames";
    pub const USER: &str = "user";
}

/// Reason carried by `ERR` when authentication fails or is required.
pub const UNAUTHORIZED: &str = "401";

/// Initial challenge sent by the host: the session's own token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub token: String,
}

/// Signed answer to a challenge, optionally naming another session to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// One entry of a user's authentication history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    /// Milliseconds since epoch
    pub at: i64,
    #[serde(rename = "type")]
    pub kind: AuthAttemptKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthAttemptKind {
    Authenticated,
    Rejected,
}

/// User profile as returned to peers. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub logs: Vec<AuthAttempt>,
}

/// Answer to the approving session after a delegated authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedAuth {
    pub user: UserProfile,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFiles {
    pub id: String,
    pub files: FileTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub context_id: String,
    pub file_path: String,
}

/// Content of one file, base64 encoded, or the reason it could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub context_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Store (content present) or delete (content absent) a file in a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFile {
    pub context_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNotStored {
    pub context_id: String,
    pub file_path: String,
    pub message: String,
}

/// Files added or removed in a context since the previous notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub id: String,
    pub new_files: Vec<String>,
    pub removed_files: Vec<String>,
}

impl ChangeNotice {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.removed_files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// Interactive process control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyRequest {
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub resize: bool,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTerm {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    /// Milliseconds since epoch
    pub created_at: i64,
    pub timeout_ms: u64,
    pub authenticated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_file_without_content_is_a_delete() {
        let msg = StoreFile {
            context_id: "web".into(),
            file_path: "/b.txt".into(),
            content: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"contextId": "web", "filePath": "/b.txt"})
        );
    }

    #[test]
    fn test_auth_request_token_is_optional() {
        let parsed: AuthRequest =
            serde_json::from_value(json!({"username": "ann", "email": "a@x", "signature": "c2ln"}))
                .unwrap();
        assert!(parsed.token.is_none());
    }

    #[test]
    fn test_change_notice_wire_format() {
        let notice = ChangeNotice {
            id: "web".into(),
            new_files: vec!["/a.txt".into()],
            removed_files: vec![],
        };
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            json!({"id": "web", "newFiles": ["/a.txt"], "removedFiles": []})
        );
    }

    #[test]
    fn test_attempt_kind_wire_names() {
        let attempt = AuthAttempt {
            at: 1,
            kind: AuthAttemptKind::Rejected,
        };
        assert_eq!(
            serde_json::to_value(&attempt).unwrap(),
            json!({"at": 1, "type": "rejected"})
        );
    }
}
