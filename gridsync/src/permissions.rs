//! Server-side write authorization.
//!
//! Editors send an `isWritePermitted` flag with every mutation. The server
//! requires the flag and also asks a [`WritePolicy`] before applying it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[async_trait]
pub trait WritePolicy: Send + Sync {
    /// Whether `user_id` may mutate `file_id`. `user_id` is `None` for a
    /// connection that never identified itself.
    async fn can_write(&self, user_id: Option<&str>, file_id: &str) -> bool;
}

/// Accepts every write the client flags as permitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustClient;

#[async_trait]
impl WritePolicy for TrustClient {
    async fn can_write(&self, _user_id: Option<&str>, _file_id: &str) -> bool {
        true
    }
}

/// Explicit per-file allow list. Owners always have write access.
#[derive(Debug, Default)]
pub struct StaticAcl {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, file_id: &str, user_id: &str) {
        self.grants
            .write()
            .await
            .entry(file_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub async fn revoke(&self, file_id: &str, user_id: &str) -> bool {
        self.grants
            .write()
            .await
            .get_mut(file_id)
            .is_some_and(|users| users.remove(user_id))
    }
}

#[async_trait]
impl WritePolicy for StaticAcl {
    async fn can_write(&self, user_id: Option<&str>, file_id: &str) -> bool {
        let Some(user_id) = user_id else {
            return false;
        };
        if crate::store::owner_of(file_id) == user_id {
            return true;
        }
        self.grants
            .read()
            .await
            .get(file_id)
            .is_some_and(|users| users.contains(user_id))
    }
}
