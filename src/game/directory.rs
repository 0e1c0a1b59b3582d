//! User Directory
//!
//! The account store the coordinator reports presence to. Accounts are owned
//! elsewhere; the coordinator only reads them and flips the online and
//! in-room flags.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Directory errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// No account for that username.
    #[error("user {0} not found")]
    NotFound(String),

    /// Username is empty or otherwise unusable.
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
}

/// An account as the directory reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Stable user id.
    pub id: String,
    /// Unique username.
    pub username: String,
    /// Whether a connection is registered.
    pub is_online: bool,
    /// Whether the user is in a session.
    pub is_in_room: bool,
}

impl UserRecord {
    /// Offline record with a fresh id.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            username: username.into(),
            is_online: false,
            is_in_room: false,
        }
    }
}

/// Account store interface.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up an account.
    async fn get_user(&self, username: &str) -> Option<UserRecord>;

    /// Set both presence flags.
    async fn update_online_status(
        &self,
        username: &str,
        is_online: bool,
        is_in_room: bool,
    ) -> Result<(), DirectoryError>;

    /// Set the in-room flag only.
    async fn update_room_status(&self, username: &str, is_in_room: bool) -> Result<(), DirectoryError>;

    /// Create an account, or return the existing one.
    async fn create_user(&self, username: &str) -> Result<UserRecord, DirectoryError>;
}

/// Directory held in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<BTreeMap<String, UserRecord>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Whether the directory is empty.
    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn get_user(&self, username: &str) -> Option<UserRecord> {
        self.users.read().await.get(username).cloned()
    }

    async fn update_online_status(
        &self,
        username: &str,
        is_online: bool,
        is_in_room: bool,
    ) -> Result<(), DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| DirectoryError::NotFound(username.to_string()))?;
        user.is_online = is_online;
        user.is_in_room = is_in_room;
        Ok(())
    }

    async fn update_room_status(&self, username: &str, is_in_room: bool) -> Result<(), DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| DirectoryError::NotFound(username.to_string()))?;
        user.is_in_room = is_in_room;
        Ok(())
    }

    async fn create_user(&self, username: &str) -> Result<UserRecord, DirectoryError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DirectoryError::InvalidUsername(username.to_string()));
        }

        let mut users = self.users.write().await;
        let record = users
            .entry(username.to_string())
            .or_insert_with(|| {
                debug!("Registered user {}", username);
                UserRecord::new(username)
            })
            .clone();
        Ok(record)
    }
}

/// Random 32-char hex identifier.
pub fn generate_id() -> String {
    hex::encode(uuid::Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    #[tokio::test]
    async fn test_create_user_is_idempotent() {
        let directory = InMemoryDirectory::new();

        let first = directory.create_user("alice").await.unwrap();
        let second = directory.create_user("alice").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(directory.len().await, 1);
        assert!(!first.is_online);
    }

    #[tokio::test]
    async fn test_create_user_rejects_blank() {
        let directory = InMemoryDirectory::new();
        let result = directory.create_user("   ").await;
        assert!(matches!(result, Err(DirectoryError::InvalidUsername(_))));
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_status_updates() {
        let directory = InMemoryDirectory::new();
        directory.create_user("alice").await.unwrap();

        directory.update_online_status("alice", true, false).await.unwrap();
        directory.update_room_status("alice", true).await.unwrap();

        let user = directory.get_user("alice").await.unwrap();
        assert!(user.is_online);
        assert!(user.is_in_room);

        let result = directory.update_room_status("bob", true).await;
        assert_eq!(result, Err(DirectoryError::NotFound("bob".into())));
    }
}
