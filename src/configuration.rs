//! the settings of one LDAP server configuration and their persistence

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::instrument;

use crate::error::ConfigurationError;

/// the value used for the UUID attributes when they should be detected
pub const UUID_AUTO: &str = "auto";

/// the attributes which are tried in order when detecting the UUID attribute
pub const UUID_ATTRIBUTES: &[&str] = &["entryuuid", "nsuniqueid", "objectguid", "guid", "ipauniqueid"];

/// the settings of one LDAP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// host name or URI (`ldaps://...`) of the primary server
    pub host: std::string::String,
    /// port of the primary server
    pub port: u16,
    /// host name or URI of the backup server, may be empty
    pub backup_host: std::string::String,
    /// port of the backup server, defaults to `port`
    pub backup_port: u16,
    /// always use the backup server
    pub override_main_server: bool,
    /// DN to bind as, empty for an anonymous bind
    pub agent_name: std::string::String,
    /// password for the agent DN
    pub agent_password: std::string::String,
    /// general base DNs
    pub base: Vec<std::string::String>,
    /// base DNs for users, defaults to `base`
    pub base_users: Vec<std::string::String>,
    /// base DNs for groups, defaults to `base`
    pub base_groups: Vec<std::string::String>,
    /// filter for user entries
    pub user_filter: std::string::String,
    /// filter for the login, `%uid` is replaced by the login name
    pub login_filter: std::string::String,
    /// filter for group entries
    pub group_filter: std::string::String,
    /// attribute holding a user's display name
    pub user_display_name: std::string::String,
    /// optional second attribute appended to the display name in parentheses
    pub user_display_name_2: std::string::String,
    /// attribute holding a group's display name
    pub group_display_name: std::string::String,
    /// attribute of a group listing its members (`member`, `uniqueMember`, `memberUid`)
    pub group_member_assoc_attribute: std::string::String,
    /// use StartTLS
    pub tls: bool,
    /// do not verify the server certificate
    pub turn_off_cert_check: bool,
    /// path to a PEM CA certificate to trust, may be empty
    pub ca_cert_path: std::string::String,
    /// lifetime of cached values in seconds, 0 disables the cache
    pub cache_ttl: u64,
    /// page size for paged searches, 0 disables paging
    pub paging_size: u32,
    /// network timeout in seconds
    pub network_timeout: u64,
    /// UUID attribute for users or `auto`
    pub uuid_user_attribute: std::string::String,
    /// UUID attribute for groups or `auto`
    pub uuid_group_attribute: std::string::String,
    /// expert override for the user UUID attribute
    pub expert_uuid_user_attr: std::string::String,
    /// expert override for the group UUID attribute
    pub expert_uuid_group_attr: std::string::String,
    /// attribute whose value is used as internal user name instead of the UUID
    pub expert_username_attr: std::string::String,
    /// attributes searched for user search terms
    pub attributes_for_user_search: Vec<std::string::String>,
    /// attributes searched for group search terms
    pub attributes_for_group_search: Vec<std::string::String>,
    /// `attr:<name>` to read the home folder from an attribute
    pub home_folder_naming_rule: std::string::String,
    /// directory relative home folders are placed in
    pub data_directory: std::string::String,
    /// follow groups which are members of groups
    pub nested_groups: bool,
    /// the server supports filtering on `memberOf`
    pub has_member_of_filter_support: bool,
    /// use `memberOf` of the user to determine group memberships
    pub use_member_of_to_detect_membership: bool,
    /// attribute holding the URL of dynamic groups (e.g. `memberURL`)
    pub dynamic_group_member_url: std::string::String,
    /// use the raw name without transliteration or restrictions
    pub ignore_naming_rules: bool,
    /// append a wildcard to search terms
    pub allow_user_enumeration: bool,
    /// the configuration is in use
    pub configuration_active: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            host: std::string::String::new(),
            port: 389,
            backup_host: std::string::String::new(),
            backup_port: 0,
            override_main_server: false,
            agent_name: std::string::String::new(),
            agent_password: std::string::String::new(),
            base: Vec::new(),
            base_users: Vec::new(),
            base_groups: Vec::new(),
            user_filter: std::string::String::new(),
            login_filter: std::string::String::new(),
            group_filter: std::string::String::new(),
            user_display_name: "displayname".to_string(),
            user_display_name_2: std::string::String::new(),
            group_display_name: "cn".to_string(),
            group_member_assoc_attribute: "uniqueMember".to_string(),
            tls: false,
            turn_off_cert_check: false,
            ca_cert_path: std::string::String::new(),
            cache_ttl: 600,
            paging_size: 500,
            network_timeout: 15,
            uuid_user_attribute: UUID_AUTO.to_string(),
            uuid_group_attribute: UUID_AUTO.to_string(),
            expert_uuid_user_attr: std::string::String::new(),
            expert_uuid_group_attr: std::string::String::new(),
            expert_username_attr: std::string::String::new(),
            attributes_for_user_search: Vec::new(),
            attributes_for_group_search: Vec::new(),
            home_folder_naming_rule: std::string::String::new(),
            data_directory: std::string::String::new(),
            nested_groups: false,
            has_member_of_filter_support: false,
            use_member_of_to_detect_membership: true,
            dynamic_group_member_url: std::string::String::new(),
            ignore_naming_rules: false,
            allow_user_enumeration: true,
            configuration_active: false,
        }
    }
}

/// conversion between field values and the strings kept in a [ConfigStore]
trait StoredValue: Sized {
    /// parse a stored value
    fn parse_stored(raw: &str) -> Option<Self>;
    /// render the value for storage
    fn render_stored(&self) -> std::string::String;
}

impl StoredValue for std::string::String {
    fn parse_stored(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }

    fn render_stored(&self) -> std::string::String {
        self.clone()
    }
}

impl StoredValue for Vec<std::string::String> {
    /// multi line values are separated by newlines or semicolons
    fn parse_stored(raw: &str) -> Option<Self> {
        Some(
            raw.split(['\n', ';'])
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    fn render_stored(&self) -> std::string::String {
        self.join("\n")
    }
}

impl StoredValue for bool {
    fn parse_stored(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        }
    }

    fn render_stored(&self) -> std::string::String {
        let rendered = if *self { "1" } else { "0" };
        rendered.to_string()
    }
}

/// implement [StoredValue] for unsigned numbers, empty means 0
macro_rules! stored_number {
    ($($t:ty),+) => {
        $(
            impl StoredValue for $t {
                fn parse_stored(raw: &str) -> Option<Self> {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        return Some(0);
                    }
                    raw.parse().ok()
                }

                fn render_stored(&self) -> std::string::String {
                    self.to_string()
                }
            }
        )+
    };
}

stored_number!(u16, u32, u64);

/// declares [ConfigKey] together with the translation between the persisted
/// key names and the fields of [Configuration]
macro_rules! config_keys {
    ($($variant:ident => $field:ident, $stored:literal, persist = $persist:literal;)+) => {
        /// a key of a [Configuration] as it is persisted
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ConfigKey {
            $(
                #[doc = concat!("the `", $stored, "` setting")]
                $variant,
            )+
        }

        impl ConfigKey {
            /// all keys in declaration order
            pub const ALL: &'static [ConfigKey] = &[$(ConfigKey::$variant,)+];

            /// the name used in the configuration store
            pub fn stored_name(self) -> &'static str {
                match self {
                    $(ConfigKey::$variant => $stored,)+
                }
            }

            /// the key is written when a configuration is saved
            pub fn is_persisted(self) -> bool {
                match self {
                    $(ConfigKey::$variant => $persist,)+
                }
            }

            /// look up a key by its name in the configuration store
            pub fn from_stored_name(name: &str) -> Option<ConfigKey> {
                match name {
                    $($stored => Some(ConfigKey::$variant),)+
                    _ => None,
                }
            }
        }

        impl Configuration {
            /// the value of a setting as it would be persisted
            pub fn value(&self, key: ConfigKey) -> std::string::String {
                match key {
                    $(ConfigKey::$variant => self.$field.render_stored(),)+
                }
            }

            /// change a setting from its persisted string form
            pub fn set_value(&mut self, key: ConfigKey, raw: &str) -> Result<(), ConfigurationError> {
                match key {
                    $(ConfigKey::$variant => {
                        self.$field = StoredValue::parse_stored(raw).ok_or_else(|| {
                            ConfigurationError::InvalidValue {
                                key: $stored,
                                value: raw.to_string(),
                            }
                        })?;
                    })+
                }
                Ok(())
            }
        }
    };
}

config_keys! {
    Host => host, "ldap_host", persist = true;
    Port => port, "ldap_port", persist = true;
    BackupHost => backup_host, "ldap_backup_host", persist = true;
    BackupPort => backup_port, "ldap_backup_port", persist = true;
    OverrideMainServer => override_main_server, "ldap_override_main_server", persist = true;
    AgentName => agent_name, "ldap_dn", persist = true;
    AgentPassword => agent_password, "ldap_agent_password", persist = true;
    Base => base, "ldap_base", persist = true;
    BaseUsers => base_users, "ldap_base_users", persist = true;
    BaseGroups => base_groups, "ldap_base_groups", persist = true;
    UserFilter => user_filter, "ldap_userlist_filter", persist = true;
    LoginFilter => login_filter, "ldap_login_filter", persist = true;
    GroupFilter => group_filter, "ldap_group_filter", persist = true;
    UserDisplayName => user_display_name, "ldap_display_name", persist = true;
    UserDisplayName2 => user_display_name_2, "ldap_user_display_name_2", persist = true;
    GroupDisplayName => group_display_name, "ldap_group_display_name", persist = true;
    GroupMemberAssocAttribute => group_member_assoc_attribute, "ldap_group_member_assoc_attribute", persist = true;
    Tls => tls, "ldap_tls", persist = true;
    TurnOffCertCheck => turn_off_cert_check, "ldap_turn_off_cert_check", persist = true;
    CaCertPath => ca_cert_path, "ldap_ca_cert_path", persist = true;
    CacheTtl => cache_ttl, "ldap_cache_ttl", persist = true;
    PagingSize => paging_size, "ldap_paging_size", persist = true;
    NetworkTimeout => network_timeout, "ldap_network_timeout", persist = true;
    UuidUserAttribute => uuid_user_attribute, "ldap_uuid_user_attribute", persist = true;
    UuidGroupAttribute => uuid_group_attribute, "ldap_uuid_group_attribute", persist = true;
    ExpertUuidUserAttr => expert_uuid_user_attr, "ldap_expert_uuid_user_attr", persist = true;
    ExpertUuidGroupAttr => expert_uuid_group_attr, "ldap_expert_uuid_group_attr", persist = true;
    ExpertUsernameAttr => expert_username_attr, "ldap_expert_username_attr", persist = true;
    AttributesForUserSearch => attributes_for_user_search, "ldap_attributes_for_user_search", persist = true;
    AttributesForGroupSearch => attributes_for_group_search, "ldap_attributes_for_group_search", persist = true;
    HomeFolderNamingRule => home_folder_naming_rule, "home_folder_naming_rule", persist = true;
    DataDirectory => data_directory, "data_directory", persist = false;
    NestedGroups => nested_groups, "ldap_nested_groups", persist = true;
    HasMemberOfFilterSupport => has_member_of_filter_support, "has_memberof_filter_support", persist = true;
    UseMemberOfToDetectMembership => use_member_of_to_detect_membership, "use_memberof_to_detect_membership", persist = true;
    DynamicGroupMemberUrl => dynamic_group_member_url, "ldap_dynamic_group_member_url", persist = true;
    IgnoreNamingRules => ignore_naming_rules, "ldap_ignore_naming_rules", persist = false;
    AllowUserEnumeration => allow_user_enumeration, "allow_user_enumeration", persist = false;
    ConfigurationActive => configuration_active, "ldap_configuration_active", persist = true;
}

/// name of the key touched on every save
pub const LAST_CHANGE_KEY: &str = "_lastChange";

/// a prefixed key/value store the configurations are persisted in
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    /// read a value
    fn get(&self, key: &str) -> Option<std::string::String>;
    /// write a value
    fn set(&self, key: &str, value: &str);
}

/// a [ConfigStore] in memory
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    /// the stored values
    values: Mutex<HashMap<std::string::String, std::string::String>>,
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<std::string::String> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

impl Configuration {
    /// read a configuration with the given prefix from the store, missing
    /// keys keep their defaults
    #[instrument(skip(store))]
    pub fn read_configuration(
        store: &dyn ConfigStore,
        prefix: &str,
    ) -> Result<Configuration, ConfigurationError> {
        let mut configuration = Configuration::default();
        for key in ConfigKey::ALL {
            if let Some(raw) = store.get(&format!("{}{}", prefix, key.stored_name())) {
                configuration.set_value(*key, &raw)?;
            }
        }
        Ok(configuration)
    }

    /// write all persisted keys to the store and touch the last change key
    #[instrument(skip(self, store))]
    pub fn save_configuration(&self, store: &dyn ConfigStore, prefix: &str) {
        for key in ConfigKey::ALL.iter().filter(|key| key.is_persisted()) {
            store.set(&format!("{}{}", prefix, key.stored_name()), &self.value(*key));
        }
        store.set(
            &format!("{}{}", prefix, LAST_CHANGE_KEY),
            &chrono::Utc::now().timestamp().to_string(),
        );
        tracing::debug!("Saved configuration with prefix {:?}", prefix);
    }

    /// set a value by its persisted key name
    pub fn set_stored_value(&mut self, name: &str, raw: &str) -> Result<ConfigKey, ConfigurationError> {
        let key = ConfigKey::from_stored_name(name)
            .ok_or_else(|| ConfigurationError::UnknownKey(name.to_string()))?;
        self.set_value(key, raw)?;
        Ok(key)
    }

    /// apply a set of changes given by persisted key names, returns the keys
    /// which were applied
    pub fn apply_changes(&mut self, changes: &[(&str, &str)]) -> Vec<ConfigKey> {
        let mut applied = Vec::new();
        for (name, raw) in changes {
            match self.set_stored_value(name, raw) {
                Ok(key) => applied.push(key),
                Err(err) => tracing::info!("Not applying configuration change: {}", err),
            }
        }
        applied
    }

    /// load a configuration from a toml file
    #[instrument]
    pub fn from_toml_file(filename: std::path::PathBuf) -> Result<Configuration, ConfigurationError> {
        let config = std::fs::read_to_string(filename)?;
        let result: Configuration = toml::from_str(&config)?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_line_values_accept_newlines_and_semicolons() {
        let mut configuration = Configuration::default();
        configuration
            .set_value(ConfigKey::Base, "dc=example,dc=com\n ou=extra,dc=example,dc=com ;dc=other")
            .unwrap();
        assert_eq!(
            configuration.base,
            vec!["dc=example,dc=com", "ou=extra,dc=example,dc=com", "dc=other"]
        );
        assert_eq!(
            configuration.value(ConfigKey::Base),
            "dc=example,dc=com\nou=extra,dc=example,dc=com\ndc=other"
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut configuration = Configuration::default();
        assert!(matches!(
            configuration.set_value(ConfigKey::Port, "ldap"),
            Err(ConfigurationError::InvalidValue { key: "ldap_port", .. })
        ));
        assert_eq!(configuration.port, 389);
    }

    #[test]
    fn save_and_read_round_trip_through_the_store() {
        let store = MemoryConfigStore::default();
        let mut configuration = Configuration {
            host: "ldap.example.com".to_string(),
            base: vec!["dc=example,dc=com".to_string()],
            tls: true,
            cache_ttl: 30,
            ..Default::default()
        };
        configuration.ignore_naming_rules = true;
        configuration.save_configuration(&store, "s01");

        assert_eq!(store.get("s01ldap_tls").as_deref(), Some("1"));
        assert!(store.get("s01_lastChange").is_some());
        assert_eq!(store.get("s01ldap_ignore_naming_rules"), None);

        let read = Configuration::read_configuration(&store, "s01").unwrap();
        assert_eq!(read.host, "ldap.example.com");
        assert_eq!(read.cache_ttl, 30);
        assert!(read.tls);
        assert!(!read.ignore_naming_rules);
    }

    #[test]
    fn changes_report_applied_keys() {
        let mut configuration = Configuration::default();
        let applied = configuration.apply_changes(&[
            ("ldap_host", "ldap.example.com"),
            ("no_such_key", "x"),
            ("ldap_paging_size", "abc"),
        ]);
        assert_eq!(applied, vec![ConfigKey::Host]);
        assert_eq!(configuration.paging_size, 500);
        assert!(matches!(
            configuration.set_stored_value("no_such_key", "x"),
            Err(ConfigurationError::UnknownKey(name)) if name == "no_such_key"
        ));
        assert_eq!(
            configuration.set_stored_value("ldap_cache_ttl", "0").unwrap(),
            ConfigKey::CacheTtl
        );
        assert_eq!(configuration.cache_ttl, 0);
    }

    #[test]
    fn toml_files_are_loaded_with_defaults() {
        let filename = std::env::temp_dir().join(format!("ldap-identity-{}.toml", std::process::id()));
        std::fs::write(
            &filename,
            r#"
            host = "ldap.example.com"
            base = ["dc=example,dc=com"]
            paging_size = 100
            "#,
        )
        .unwrap();
        let configuration = Configuration::from_toml_file(filename.clone());
        std::fs::remove_file(&filename).unwrap();
        let configuration = configuration.unwrap();
        assert_eq!(configuration.host, "ldap.example.com");
        assert_eq!(configuration.paging_size, 100);
        assert_eq!(configuration.uuid_user_attribute, UUID_AUTO);

        assert!(matches!(
            Configuration::from_toml_file(filename),
            Err(ConfigurationError::IOError(_))
        ));
    }
}
