//! the view of the hosting application on the identities it knows

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

/// what the hosting application knows about users and groups from all of
/// its backends
#[async_trait]
pub trait IdentityHost: Send + Sync + std::fmt::Debug {
    /// a user with the internal name exists in any backend
    async fn user_exists(&self, name: &str) -> bool;
    /// a group with the internal name exists in any backend
    async fn group_exists(&self, name: &str) -> bool;
    /// a directory user was mapped to an internal name for the first time
    async fn announce_user_mapped(&self, name: &str, dn: &str);
}

/// an [IdentityHost] with fixed sets of names, it records announcements
#[derive(Debug, Default)]
pub struct MemoryIdentityHost {
    /// names of existing users
    users: Mutex<HashSet<String>>,
    /// names of existing groups
    groups: Mutex<HashSet<String>>,
    /// announced `(name, dn)` pairs
    announced: Mutex<Vec<(String, String)>>,
}

impl MemoryIdentityHost {
    /// add a user name which exists in another backend
    pub fn add_user(&self, name: &str) {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }

    /// add a group name which exists in another backend
    pub fn add_group(&self, name: &str) {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }

    /// the announcements made so far
    pub fn announced(&self) -> Vec<(String, String)> {
        self.announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl IdentityHost for MemoryIdentityHost {
    async fn user_exists(&self, name: &str) -> bool {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    async fn group_exists(&self, name: &str) -> bool {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    async fn announce_user_mapped(&self, name: &str, dn: &str) {
        tracing::debug!("New user {} mapped to {}", name, dn);
        self.announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), dn.to_string()));
    }
}
