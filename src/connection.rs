//! a lazily established, validated connection for one server configuration

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::cache::Cache;
use crate::configuration::{ConfigKey, Configuration, UUID_ATTRIBUTES, UUID_AUTO};
use crate::error::DirectoryError;
use crate::wrapper::{ConnectSettingsBuilder, LdapSession, LdapWrapper};

/// cache key remembering that the primary server was unreachable
const OVERRIDE_MAIN_SERVER_KEY: &str = "overrideMainServer";

/// settings which require a new session when they change
const CONNECTION_KEYS: &[ConfigKey] = &[
    ConfigKey::Host,
    ConfigKey::Port,
    ConfigKey::BackupHost,
    ConfigKey::BackupPort,
    ConfigKey::OverrideMainServer,
    ConfigKey::AgentName,
    ConfigKey::AgentPassword,
    ConfigKey::Tls,
    ConfigKey::TurnOffCertCheck,
    ConfigKey::CaCertPath,
    ConfigKey::NetworkTimeout,
    ConfigKey::ConfigurationActive,
];

/// the connection to the server of one configuration, the session is
/// established on first use
#[derive(Debug)]
pub struct Connection {
    /// prefix of the configuration, also scopes the cache keys
    config_prefix: String,
    /// the settings
    configuration: Configuration,
    /// opens sessions
    wrapper: Arc<dyn LdapWrapper>,
    /// shared cache
    cache: Arc<dyn Cache>,
    /// the bound session, if established
    session: Option<Box<dyn LdapSession>>,
    /// the configuration passed the critical validation
    configured: bool,
    /// the server honors the paged results control
    has_paged_result_support: bool,
}

impl Connection {
    /// create a connection, the configuration is validated immediately
    pub fn new(
        config_prefix: &str,
        configuration: Configuration,
        wrapper: Arc<dyn LdapWrapper>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        let mut connection = Self {
            config_prefix: config_prefix.to_string(),
            configuration,
            wrapper,
            cache,
            session: None,
            configured: false,
            has_paged_result_support: true,
        };
        connection.validate_configuration();
        connection
    }

    /// the configuration prefix
    pub fn config_prefix(&self) -> &str {
        &self.config_prefix
    }

    /// the current settings
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// mutable access to the settings for temporary changes which do not
    /// affect the session (e.g. disabling the cache)
    pub(crate) fn configuration_mut(&mut self) -> &mut Configuration {
        &mut self.configuration
    }

    /// change settings by their persisted names, returns the keys which were
    /// applied; the configuration is validated again and the session is
    /// dropped if a connection relevant setting changed
    #[instrument(skip(self, changes))]
    pub async fn set_configuration(&mut self, changes: &[(&str, &str)]) -> Vec<ConfigKey> {
        let applied = self.configuration.apply_changes(changes);
        if applied.is_empty() {
            return applied;
        }
        self.validate_configuration();
        if applied.iter().any(|key| CONNECTION_KEYS.contains(key)) {
            self.reset_connection().await;
        }
        applied
    }

    /// the configuration passed the critical validation
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// the server supports paged searches
    pub fn has_paged_result_support(&self) -> bool {
        self.has_paged_result_support
    }

    /// mark the server as not supporting paged searches
    pub fn set_paged_result_support(&mut self, supported: bool) {
        self.has_paged_result_support = supported;
    }

    /// a bound session, established if necessary
    ///
    /// `Ok(None)` if the configuration is invalid or inactive or the bind
    /// was rejected
    pub async fn resource(&mut self) -> Result<Option<&mut Box<dyn LdapSession>>, DirectoryError> {
        if self.session.is_none() && !self.establish_connection().await? {
            return Ok(None);
        }
        Ok(self.session.as_mut())
    }

    /// the current session without trying to establish one
    pub(crate) fn session_mut(&mut self) -> Option<&mut Box<dyn LdapSession>> {
        self.session.as_mut()
    }

    /// establish the session if needed, true if there is a bound session
    pub async fn bind(&mut self) -> Result<bool, DirectoryError> {
        Ok(self.resource().await?.is_some())
    }

    /// close the session, the next use establishes a new one
    pub async fn reset_connection(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.unbind().await;
            tracing::debug!("Connection for {} reset", self.config_prefix);
        }
    }

    /// a new connection with the same settings except for the bind
    /// credentials, used to verify a user's password
    pub fn with_credentials(&self, dn: &str, password: &str) -> Connection {
        let mut configuration = self.configuration.clone();
        configuration.agent_name = dn.to_string();
        configuration.agent_password = password.to_string();
        let mut connection = Connection::new(
            &self.config_prefix,
            configuration,
            Arc::clone(&self.wrapper),
            Arc::clone(&self.cache),
        );
        connection.has_paged_result_support = self.has_paged_result_support;
        connection
    }

    /// the URL for a host setting, which may or may not contain a scheme
    fn ldap_url(host: &str, port: u16) -> String {
        if host.contains("://") {
            format!("{}:{}", host.trim_end_matches('/'), port)
        } else {
            format!("ldap://{}:{}", host, port)
        }
    }

    /// connect to the host and bind with the configured agent
    ///
    /// `Ok(None)` if the bind was rejected or the connection failed for a
    /// reason other than the server being unavailable
    async fn connect_and_bind(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Option<Box<dyn LdapSession>>, DirectoryError> {
        let ca_cert_path = Some(self.configuration.ca_cert_path.clone()).filter(|p| !p.is_empty());
        let settings = match ConnectSettingsBuilder::default()
            .timeout(Duration::from_secs(self.configuration.network_timeout))
            .starttls(self.configuration.tls)
            .no_tls_verify(self.configuration.turn_off_cert_check)
            .ca_cert_path(ca_cert_path)
            .build()
        {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!("Could not build connect settings: {}", err);
                return Ok(None);
            }
        };
        let url = Self::ldap_url(host, port);
        let mut session = match self.wrapper.connect(&url, &settings).await {
            Ok(session) => session,
            Err(err @ DirectoryError::ServerUnavailable(_)) => return Err(err),
            Err(err) => {
                tracing::error!("Could not connect to {}: {}", url, err);
                return Ok(None);
            }
        };
        match session
            .bind(&self.configuration.agent_name, &self.configuration.agent_password)
            .await
        {
            Ok(true) => Ok(Some(session)),
            Ok(false) => {
                tracing::warn!(
                    "Bind failed for {} on {} (prefix {})",
                    self.configuration.agent_name,
                    url,
                    self.config_prefix
                );
                Ok(None)
            }
            Err(err @ DirectoryError::ServerUnavailable(_)) => Err(err),
            Err(err) => {
                tracing::error!("Bind on {} failed: {}", url, err);
                Ok(None)
            }
        }
    }

    /// establish the session on the primary or the backup server
    #[instrument(skip(self), fields(prefix = %self.config_prefix))]
    async fn establish_connection(&mut self) -> Result<bool, DirectoryError> {
        if !self.configuration.configuration_active {
            tracing::debug!("Configuration {} is not active", self.config_prefix);
            return Ok(false);
        }
        if !self.configured {
            tracing::warn!(
                "Configuration {} is invalid, cannot connect",
                self.config_prefix
            );
            return Ok(false);
        }
        let has_backup = !self.configuration.backup_host.is_empty();
        let skip_primary = has_backup
            && (self.configuration.override_main_server
                || self.get_from_cache::<bool>(OVERRIDE_MAIN_SERVER_KEY) == Some(true));
        if !skip_primary {
            let host = self.configuration.host.clone();
            match self.connect_and_bind(&host, self.configuration.port).await {
                Ok(Some(session)) => {
                    self.session = Some(session);
                    return Ok(true);
                }
                Ok(None) if has_backup => {
                    tracing::warn!("Could not bind on primary server {}, trying backup", host);
                }
                Ok(None) => {
                    self.session = None;
                    return Ok(false);
                }
                Err(err) if has_backup => {
                    tracing::warn!("Primary server {} unavailable, trying backup: {}", host, err);
                }
                Err(err) => return Err(err),
            }
        }
        let backup_host = self.configuration.backup_host.clone();
        let session = self
            .connect_and_bind(&backup_host, self.configuration.backup_port)
            .await?;
        if session.is_some() && !self.configuration.override_main_server {
            // skip the primary until the cache entry expires
            self.write_to_cache(OVERRIDE_MAIN_SERVER_KEY, &true);
        }
        let established = session.is_some();
        self.session = session;
        Ok(established)
    }

    /// fill in defaults and correct settings which can be corrected
    fn do_soft_validation(&mut self) {
        let prefix = self.config_prefix.clone();
        let configuration = &mut self.configuration;
        if configuration.base_users.is_empty() && !configuration.base.is_empty() {
            tracing::info!("Base tree for Users is empty, using Base DN (prefix {})", prefix);
            configuration.base_users = configuration.base.clone();
        }
        if configuration.base_groups.is_empty() && !configuration.base.is_empty() {
            tracing::info!("Base tree for Groups is empty, using Base DN (prefix {})", prefix);
            configuration.base_groups = configuration.base.clone();
        }
        for (name, attribute) in [
            ("user", &mut configuration.uuid_user_attribute),
            ("group", &mut configuration.uuid_group_attribute),
        ] {
            let lowered = attribute.to_lowercase();
            if lowered != UUID_AUTO && !UUID_ATTRIBUTES.contains(&lowered.as_str()) {
                tracing::info!(
                    "Illegal value for the {} UUID attribute ({}), reset to autodetect (prefix {})",
                    name,
                    attribute,
                    prefix
                );
                *attribute = UUID_AUTO.to_string();
            } else {
                *attribute = lowered;
            }
        }
        if configuration.backup_host.is_empty() {
            if configuration.override_main_server {
                tracing::info!("No backup server configured, not overriding the main server (prefix {})", prefix);
                configuration.override_main_server = false;
            }
        } else if configuration.backup_port == 0 {
            configuration.backup_port = configuration.port;
        }
        if configuration.tls && configuration.host.to_lowercase().starts_with("ldaps://") {
            tracing::info!(
                "LDAPS (already using secure connection) and TLS do not work together. Switched off TLS (prefix {})",
                prefix
            );
            configuration.tls = false;
        }
        if configuration.use_member_of_to_detect_membership
            && !configuration.has_member_of_filter_support
        {
            tracing::debug!(
                "memberOf detection requested but the server lacks memberOf filter support (prefix {})",
                prefix
            );
        }
    }

    /// check the settings without which no connection is possible
    fn do_critical_validation(&self) -> bool {
        let configuration = &self.configuration;
        let mut problems = Vec::new();
        if configuration.host.is_empty() {
            problems.push("No LDAP server host given, won't connect.");
        }
        if configuration.port == 0 {
            problems.push("No LDAP Port given, won't connect.");
        }
        if configuration.agent_name.is_empty() != configuration.agent_password.is_empty() {
            problems.push("Either no password is given for the user agent or a password is given, but not an LDAP agent.");
        }
        if configuration.base.is_empty()
            && configuration.base_users.is_empty()
            && configuration.base_groups.is_empty()
        {
            problems.push("Not a single Base DN given.");
        }
        if !configuration.login_filter.is_empty() && !configuration.login_filter.contains("%uid") {
            problems.push("Login filter does not contain %uid place holder.");
        }
        if configuration.user_display_name.is_empty() {
            problems.push("No display name attribute for users given.");
        }
        if !configuration.group_filter.is_empty() && configuration.group_display_name.is_empty() {
            problems.push("No display name attribute for groups given.");
        }
        for problem in &problems {
            tracing::warn!("Configuration Error (prefix {}): {}", self.config_prefix, problem);
        }
        problems.is_empty()
    }

    /// run both validation stages, the result is available through
    /// [Connection::is_configured]
    fn validate_configuration(&mut self) -> bool {
        self.do_soft_validation();
        self.configured = self.do_critical_validation();
        self.configured
    }

    /// the cache is used
    pub fn is_cache_enabled(&self) -> bool {
        self.configuration.cache_ttl > 0 && self.configuration.configuration_active
    }

    /// the cache key for a key of this configuration
    fn cache_key(&self, key: &str) -> String {
        format!(
            "LDAP-{}-{}",
            self.config_prefix,
            hex::encode(Sha256::digest(key.as_bytes()))
        )
    }

    /// read a cached value, `None` on a miss or if the cache is disabled
    pub fn get_from_cache<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.is_cache_enabled() {
            return None;
        }
        let raw = self.cache.get(&self.cache_key(key))?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!("Discarding undecodable cache entry for {}: {}", key, err);
                None
            }
        }
    }

    /// write a value for the configured TTL, does nothing if the cache is disabled
    pub fn write_to_cache<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if !self.is_cache_enabled() {
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => self.cache.set(
                &self.cache_key(key),
                raw,
                Some(Duration::from_secs(self.configuration.cache_ttl)),
            ),
            Err(err) => tracing::debug!("Could not serialize cache value for {}: {}", key, err),
        }
    }

    /// remove all cached values of this configuration
    pub fn clear_cache(&self) {
        self.cache.clear(&format!("LDAP-{}-", self.config_prefix));
    }
}
