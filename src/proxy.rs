//! fan out of the backend operations over all configured directories
//!
//! the directory an identity was last found on is remembered in the cache
//! and asked first the next time

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::instrument;

use crate::access::{Access, SharedAccess};
use crate::cache::Cache;
use crate::error::AccessError;
use crate::group_backend::GroupLdap;
use crate::user_backend::UserLdap;

/// prefix of the cache keys written by the proxies
pub const PROXY_CACHE_PREFIX: &str = "ldap-proxy-";

/// the accesses of all configured directories by configuration prefix,
/// in the order they were registered
#[derive(Debug, Default, Clone)]
pub struct AccessRegistry {
    /// prefix and access
    accesses: Vec<(String, SharedAccess)>,
}

impl AccessRegistry {
    /// create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register the access under its configuration prefix, replacing an
    /// access registered for the same prefix before
    pub fn register(&mut self, access: Access) -> SharedAccess {
        let prefix = access.connection().config_prefix().to_string();
        let shared = access.into_shared();
        match self.accesses.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, existing)) => *existing = Arc::clone(&shared),
            None => self.accesses.push((prefix, Arc::clone(&shared))),
        }
        shared
    }

    /// the access for a configuration prefix
    pub fn get(&self, prefix: &str) -> Option<SharedAccess> {
        self.accesses
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, access)| Arc::clone(access))
    }

    /// the registered configuration prefixes
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.accesses.iter().map(|(prefix, _)| prefix.as_str())
    }

    /// number of registered accesses
    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    /// no access is registered
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }
}

/// a backend the proxy can route identities to
#[async_trait]
pub trait ProxyBackend: Clone + Send + Sync + std::fmt::Debug {
    /// the kind of identity in the last seen cache keys
    const KIND: &'static str;

    /// build the backend on an access
    fn on_access(access: SharedAccess) -> Self;

    /// the identity still exists on this backend
    async fn identity_exists(&self, id: &str) -> Result<bool, AccessError>;
}

#[async_trait]
impl ProxyBackend for UserLdap {
    const KIND: &'static str = "user";

    fn on_access(access: SharedAccess) -> Self {
        UserLdap::new(access)
    }

    async fn identity_exists(&self, id: &str) -> Result<bool, AccessError> {
        self.user_exists(id).await
    }
}

#[async_trait]
impl ProxyBackend for GroupLdap {
    const KIND: &'static str = "group";

    fn on_access(access: SharedAccess) -> Self {
        GroupLdap::new(access)
    }

    async fn identity_exists(&self, id: &str) -> Result<bool, AccessError> {
        self.group_exists(id).await
    }
}

/// routes requests for an identity to the backend which knows it
#[derive(Debug, Clone)]
pub struct ProxyRouter<B> {
    /// prefix and backend of every configured directory
    backends: Vec<(String, B)>,
    /// the cache remembering where identities were seen last
    cache: Arc<dyn Cache>,
}

impl<B: ProxyBackend> ProxyRouter<B> {
    /// a backend for every access of the registry
    pub fn new(registry: &AccessRegistry, cache: Arc<dyn Cache>) -> Self {
        let backends = registry
            .accesses
            .iter()
            .map(|(prefix, access)| (prefix.clone(), B::on_access(Arc::clone(access))))
            .collect();
        Self { backends, cache }
    }

    /// the backends in registration order
    pub fn backends(&self) -> impl Iterator<Item = &B> {
        self.backends.iter().map(|(_, backend)| backend)
    }

    /// the cache key remembering the prefix an identity was seen on
    fn last_seen_key(id: &str) -> String {
        format!("{}{}-{}-lastSeenOn", PROXY_CACHE_PREFIX, B::KIND, id)
    }

    /// the configuration prefix the identity was found on last
    pub fn last_seen_on(&self, id: &str) -> Option<String> {
        self.cache.get(&Self::last_seen_key(id))
    }

    /// run an operation for an identity
    ///
    /// the backend the identity was seen on last is asked first. If it does
    /// not answer and the identity is gone there the cache entry is dropped.
    /// Then every backend is asked in order and the first answering one is
    /// remembered.
    pub async fn handle_request<T, F, Fut>(&self, id: &str, operation: F) -> Result<Option<T>, AccessError>
    where
        F: Fn(B) -> Fut,
        Fut: Future<Output = Result<Option<T>, AccessError>>,
    {
        let cache_key = Self::last_seen_key(id);
        if let Some(prefix) = self.cache.get(&cache_key) {
            if let Some((_, backend)) = self.backends.iter().find(|(p, _)| *p == prefix) {
                if let Some(answer) = operation(backend.clone()).await? {
                    return Ok(Some(answer));
                }
                if !backend.identity_exists(id).await? {
                    tracing::debug!("{} {} vanished from {}", B::KIND, id, prefix);
                    self.cache.remove(&cache_key);
                }
            }
        }
        for (prefix, backend) in &self.backends {
            if let Some(answer) = operation(backend.clone()).await? {
                self.cache.set(&cache_key, prefix.clone(), None);
                return Ok(Some(answer));
            }
        }
        Ok(None)
    }

    /// run an operation on every backend and collect the answers
    pub async fn on_all<T, F, Fut>(&self, operation: F) -> Result<Vec<T>, AccessError>
    where
        F: Fn(B) -> Fut,
        Fut: Future<Output = Result<T, AccessError>>,
    {
        let mut answers = Vec::with_capacity(self.backends.len());
        for (_, backend) in &self.backends {
            answers.push(operation(backend.clone()).await?);
        }
        Ok(answers)
    }
}

/// users of all configured directories
#[derive(Debug, Clone)]
pub struct UserProxy {
    /// the router over the user backends
    router: ProxyRouter<UserLdap>,
}

impl UserProxy {
    /// a user backend for every access of the registry
    pub fn new(registry: &AccessRegistry, cache: Arc<dyn Cache>) -> Self {
        Self {
            router: ProxyRouter::new(registry, cache),
        }
    }

    /// the router, e.g. to look up where a user was seen
    pub fn router(&self) -> &ProxyRouter<UserLdap> {
        &self.router
    }

    /// check the password on the directory knowing the login name
    #[instrument(skip(self, password))]
    pub async fn check_password(&self, login_name: &str, password: &str) -> Result<Option<String>, AccessError> {
        self.router
            .handle_request(login_name, |backend| async move {
                backend.check_password(login_name, password).await
            })
            .await
    }

    /// the user exists on any directory
    pub async fn user_exists(&self, uid: &str) -> Result<bool, AccessError> {
        let found = self
            .router
            .handle_request(uid, |backend| async move {
                Ok::<_, AccessError>(backend.user_exists(uid).await?.then_some(()))
            })
            .await?;
        Ok(found.is_some())
    }

    /// the display name of a user
    pub async fn get_display_name(&self, uid: &str) -> Result<Option<String>, AccessError> {
        self.router
            .handle_request(uid, |backend| async move { backend.get_display_name(uid).await })
            .await
    }

    /// the home folder of a user
    pub async fn get_home(&self, uid: &str) -> Result<Option<String>, AccessError> {
        self.router
            .handle_request(uid, |backend| async move { backend.get_home(uid).await })
            .await
    }

    /// the access of the directory the user lives on
    pub async fn access_for(&self, uid: &str) -> Result<Option<SharedAccess>, AccessError> {
        self.router
            .handle_request(uid, |backend| async move {
                let exists = backend.user_exists(uid).await?;
                Ok::<_, AccessError>(exists.then(|| Arc::clone(backend.access())))
            })
            .await
    }

    /// the users of all directories matching the search
    ///
    /// limit and offset apply per directory
    #[instrument(skip(self))]
    pub async fn get_users(&self, search: &str, limit: Option<usize>, offset: usize) -> Result<Vec<String>, AccessError> {
        let answers = self
            .router
            .on_all(|backend| async move { backend.get_users(search, limit, offset).await })
            .await?;
        Ok(answers.into_iter().flatten().unique().collect())
    }

    /// the number of users of all directories, `None` if no directory could
    /// count
    pub async fn count_users(&self) -> Result<Option<usize>, AccessError> {
        let answers = self
            .router
            .on_all(|backend| async move { backend.count_users().await })
            .await?;
        Ok(answers.into_iter().flatten().reduce(|a, b| a + b))
    }
}

/// groups of all configured directories
#[derive(Debug, Clone)]
pub struct GroupProxy {
    /// the router over the group backends
    router: ProxyRouter<GroupLdap>,
}

impl GroupProxy {
    /// a group backend for every access of the registry
    pub fn new(registry: &AccessRegistry, cache: Arc<dyn Cache>) -> Self {
        Self {
            router: ProxyRouter::new(registry, cache),
        }
    }

    /// the router, e.g. to look up where a group was seen
    pub fn router(&self) -> &ProxyRouter<GroupLdap> {
        &self.router
    }

    /// the user is member of the group on the directory of the group
    pub async fn in_group(&self, uid: &str, gid: &str) -> Result<bool, AccessError> {
        let found = self
            .router
            .handle_request(gid, |backend| async move {
                Ok::<_, AccessError>(backend.in_group(uid, gid).await?.then_some(()))
            })
            .await?;
        Ok(found.is_some())
    }

    /// the members of the group on all directories
    pub async fn users_in_group(
        &self,
        gid: &str,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<String>, AccessError> {
        let answers = self
            .router
            .on_all(|backend| async move { backend.users_in_group(gid, search, limit, offset).await })
            .await?;
        Ok(answers.into_iter().flatten().unique().collect())
    }

    /// the number of members of the group
    pub async fn count_users_in_group(&self, gid: &str, search: &str) -> Result<Option<usize>, AccessError> {
        self.router
            .handle_request(gid, |backend| async move {
                backend.count_users_in_group(gid, search).await
            })
            .await
    }

    /// the groups of the user on all directories
    pub async fn get_user_groups(&self, uid: &str) -> Result<Vec<String>, AccessError> {
        let answers = self
            .router
            .on_all(|backend| async move { backend.get_user_groups(uid).await })
            .await?;
        Ok(answers.into_iter().flatten().unique().collect())
    }

    /// the groups of all directories matching the search
    ///
    /// limit and offset apply per directory
    #[instrument(skip(self))]
    pub async fn get_groups(&self, search: &str, limit: Option<usize>, offset: usize) -> Result<Vec<String>, AccessError> {
        let answers = self
            .router
            .on_all(|backend| async move { backend.get_groups(search, limit, offset).await })
            .await?;
        Ok(answers.into_iter().flatten().unique().collect())
    }

    /// the group exists on any directory
    pub async fn group_exists(&self, gid: &str) -> Result<bool, AccessError> {
        let found = self
            .router
            .handle_request(gid, |backend| async move {
                Ok::<_, AccessError>(backend.group_exists(gid).await?.then_some(()))
            })
            .await?;
        Ok(found.is_some())
    }

    /// the display name of a group
    pub async fn get_display_name(&self, gid: &str) -> Result<Option<String>, AccessError> {
        self.router
            .handle_request(gid, |backend| async move { backend.get_display_name(gid).await })
            .await
    }
}
