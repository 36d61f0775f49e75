//! JSON file backed user directory.

use std::path::PathBuf;
use std::sync::RwLock;

use admin_core::auth::{AuthError, DirectoryOracle, NamedKey, UserRecord};
use admin_core::protocol::messages::{AuthAttempt, AuthAttemptKind, UserProfile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

/// User records kept in a single JSON array file.
pub struct JsonUserDirectory {
    path: PathBuf,
    users: RwLock<Vec<UserRecord>>,
}

impl JsonUserDirectory {
    /// Load the directory. A missing file yields an empty directory.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read users file: {:?}", path))?;
            let users: Vec<UserRecord> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse users file: {:?}", path))?;
            info!("Loaded {} users from {:?}", users.len(), path);
            users
        } else {
            warn!("No users file at {:?}; nobody can authenticate", path);
            Vec::new()
        };

        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    fn position(users: &[UserRecord], username: Option<&str>, email: Option<&str>) -> Option<usize> {
        username
            .and_then(|username| users.iter().position(|u| u.username == username))
            .or_else(|| {
                let email = email?;
                users
                    .iter()
                    .position(|u| u.emails.iter().any(|e| e.eq_ignore_ascii_case(email)))
            })
    }

    /// Usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = users.iter().map(|u| u.username.clone()).collect();
        names.sort();
        names
    }

    /// Look a user up by username, falling back to email.
    pub fn find(&self, username: Option<&str>, email: Option<&str>) -> Option<UserProfile> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        Self::position(&users, username, email).map(|i| users[i].profile())
    }

    async fn save(&self) -> Result<(), AuthError> {
        let content = {
            let users = self.users.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*users).map_err(|e| AuthError::Directory(e.to_string()))?
        };
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| AuthError::Directory(format!("{:?}: {}", self.path, e)))
    }
}

#[async_trait]
impl DirectoryOracle for JsonUserDirectory {
    async fn public_keys_by_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Vec<NamedKey>, AuthError> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        Ok(Self::position(&users, username, email)
            .map(|i| users[i].public_keys.clone())
            .unwrap_or_default())
    }

    async fn record_auth_attempt(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        success: bool,
    ) -> Result<Option<UserRecord>, AuthError> {
        let record = {
            let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
            let Some(i) = Self::position(&users, username, email) else {
                return Ok(None);
            };
            users[i].logs.push(AuthAttempt {
                at: Utc::now().timestamp_millis(),
                kind: if success {
                    AuthAttemptKind::Authenticated
                } else {
                    AuthAttemptKind::Rejected
                },
            });
            users[i].clone()
        };
        self.save().await?;
        Ok(success.then_some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_users(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("users.json");
        std::fs::write(
            &path,
            r#"[{"username": "ann", "name": "Ann", "emails": ["ann@example.com"],
                 "publicKeys": [{"name": "laptop", "publicKey": "AAAA"}]}]"#,
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_lookup_by_username_then_email() {
        let temp = TempDir::new().unwrap();
        let users = JsonUserDirectory::load(write_users(&temp)).unwrap();

        let by_name = users.public_keys_by_email(Some("ann"), None).await.unwrap();
        let by_email = users
            .public_keys_by_email(Some("nobody"), Some("ANN@example.com"))
            .await
            .unwrap();
        let missing = users.public_keys_by_email(Some("bob"), None).await.unwrap();

        assert_eq!(by_name[0].name, "laptop");
        assert_eq!(by_email, by_name);
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_are_persisted() {
        let temp = TempDir::new().unwrap();
        let path = write_users(&temp);
        let users = JsonUserDirectory::load(&path).unwrap();

        assert!(users.record_auth_attempt(Some("ann"), None, false).await.unwrap().is_none());
        let record = users
            .record_auth_attempt(Some("ann"), None, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.logs.len(), 2);

        let reloaded = JsonUserDirectory::load(&path).unwrap();
        let profile = reloaded.find(Some("ann"), None).unwrap();
        assert_eq!(profile.logs[0].kind, AuthAttemptKind::Rejected);
        assert_eq!(profile.logs[1].kind, AuthAttemptKind::Authenticated);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let users = JsonUserDirectory::load(temp.path().join("none.json")).unwrap();
        assert!(users.usernames().is_empty());
    }
}
