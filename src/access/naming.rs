//! resolution of directory entries to stable internal names and UUID
//! detection

use std::sync::Arc;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::instrument;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::{post_process_values, Access};
use crate::codec::format_guid_for_filter;
use crate::configuration::{UUID_ATTRIBUTES, UUID_AUTO};
use crate::dn::{is_dn_part_of_base, sanitize_dn};
use crate::error::AccessError;
use crate::filter::{combine_filter_with_and, escape_filter_part};
use crate::mapping::IdentityMapper;
use crate::record::DirectoryRecord;

/// names longer than this are replaced by their SHA-256 hash
const MAX_NAME_LENGTH: usize = 64;

/// number of alternative names tried before giving up
const ALT_NAME_ATTEMPTS: u32 = 20;

lazy_static! {
    /// characters not allowed in internal names
    static ref DISALLOWED_NAME_CHARACTERS_RE: Regex = Regex::new(r"[^a-zA-Z0-9_.@-]").unwrap();
}

/// the internal name a DN resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameResolution {
    /// the internal name
    pub name: String,
    /// the mapping was created by this resolution
    pub newly_mapped: bool,
}

/// letters which do not decompose into a base letter and combining marks
fn transliterate_ligature(c: char) -> Option<&'static str> {
    Some(match c {
        'ß' => "ss",
        'æ' => "ae",
        'Æ' => "AE",
        'œ' => "oe",
        'Œ' => "OE",
        'ø' => "o",
        'Ø' => "O",
        'đ' => "d",
        'Đ' => "D",
        'ł' => "l",
        'Ł' => "L",
        'þ' => "th",
        'Þ' => "TH",
        'ð' => "d",
        'Ð' => "D",
        'ı' => "i",
        _ => return None,
    })
}

/// replace accented letters and ligatures by their ASCII base letters
fn transliterate(name: &str) -> String {
    let mut transliterated = String::with_capacity(name.len());
    for c in name.nfkd().filter(|c| !is_combining_mark(*c)) {
        match transliterate_ligature(c) {
            Some(replacement) => transliterated.push_str(replacement),
            None => transliterated.push(c),
        }
    }
    transliterated
}

/// the highest numeric suffix of names of the form `<name>_<number>`, 1 if
/// there is none
fn highest_suffix(name: &str, used: &[String]) -> u64 {
    let prefix = format!("{}_", name);
    used.iter()
        .filter_map(|used| used.strip_prefix(&prefix)?.parse::<u64>().ok())
        .max()
        .unwrap_or(1)
}

impl Access {
    /// turn a candidate into a valid internal name
    ///
    /// returns `None` if nothing is left of the candidate
    pub fn sanitize_username(&self, name: &str) -> Option<String> {
        let name = name.trim();
        if self.connection.configuration().ignore_naming_rules {
            return Some(name.to_string()).filter(|n| !n.is_empty());
        }
        let name = transliterate(name).replace(' ', "_");
        let name = DISALLOWED_NAME_CHARACTERS_RE.replace_all(&name, "").into_owned();
        let name = if name.len() > MAX_NAME_LENGTH {
            hex::encode(Sha256::digest(name.as_bytes()))
        } else {
            name
        };
        Some(name).filter(|n| !n.is_empty())
    }

    /// the mapper for users or groups
    fn mapper(&self, is_user: bool) -> Arc<dyn IdentityMapper> {
        if is_user {
            Arc::clone(&self.user_mapper)
        } else {
            Arc::clone(&self.group_mapper)
        }
    }

    /// the name is neither used by any backend of the host nor mapped
    ///
    /// a cached answer of the backends is used while the cache is enabled
    async fn name_is_free(&self, mapper: &dyn IdentityMapper, name: &str, is_user: bool) -> bool {
        let cache_key = if is_user {
            format!("userExists{}", name)
        } else {
            format!("groupExists{}", name)
        };
        let exists = match self.connection.get_from_cache::<bool>(&cache_key) {
            Some(exists) => exists,
            None if is_user => self.host.user_exists(name).await,
            None => self.host.group_exists(name).await,
        };
        !exists && mapper.dn_by_name(name).await.is_none()
    }

    /// try names of the form `<name>_<four random digits>`
    async fn alt_internal_name_for_user(
        &self,
        mapper: &dyn IdentityMapper,
        name: &str,
        dn: &str,
        uuid: &str,
    ) -> Option<String> {
        for _ in 0..ALT_NAME_ATTEMPTS {
            let number: u32 = rand::thread_rng().gen_range(1000..=9999);
            let alt_name = format!("{}_{}", name, number);
            if self.name_is_free(mapper, &alt_name, true).await && mapper.map(dn, &alt_name, uuid).await {
                return Some(alt_name);
            }
        }
        None
    }

    /// try names of the form `<name>_<number>` following the highest number
    /// already in use
    async fn alt_internal_name_for_group(
        &self,
        mapper: &dyn IdentityMapper,
        name: &str,
        dn: &str,
        uuid: &str,
    ) -> Option<String> {
        let used = mapper.names_by_search(&format!("{}_%", name)).await;
        let last = highest_suffix(name, &used);
        for step in 1..=u64::from(ALT_NAME_ATTEMPTS) {
            let alt_name = format!("{}_{}", name, last + step);
            if self.name_is_free(mapper, &alt_name, false).await && mapper.map(dn, &alt_name, uuid).await {
                return Some(alt_name);
            }
        }
        None
    }

    /// claim the candidate or an alternative name for the DN
    async fn claim_internal_name(
        &self,
        mapper: &dyn IdentityMapper,
        candidate: &str,
        dn: &str,
        uuid: &str,
        is_user: bool,
    ) -> Option<String> {
        if self.name_is_free(mapper, candidate, is_user).await && mapper.map(dn, candidate, uuid).await {
            return Some(candidate.to_string());
        }
        if is_user {
            self.alt_internal_name_for_user(mapper, candidate, dn, uuid).await
        } else {
            self.alt_internal_name_for_group(mapper, candidate, dn, uuid).await
        }
    }

    /// resolve a DN to its internal name, mapping it if it is new
    ///
    /// a known UUID under a different DN is a renamed entry, its mapping is
    /// moved to the new DN and keeps its name. `None` if the UUID or display
    /// name can not be determined or no free name was found.
    #[instrument(skip(self, record))]
    pub async fn dn_to_internal_name(
        &mut self,
        dn: &str,
        display_name: Option<&str>,
        is_user: bool,
        record: Option<&DirectoryRecord>,
    ) -> Result<Option<NameResolution>, AccessError> {
        let dn = sanitize_dn(dn);
        let mapper = self.mapper(is_user);
        if let Some(name) = mapper.name_by_dn(&dn).await {
            return Ok(Some(NameResolution {
                name,
                newly_mapped: false,
            }));
        }

        let Some(uuid) = self.uuid(&dn, is_user, record).await? else {
            tracing::info!("Cannot determine UUID for {}, skipping", dn);
            return Ok(None);
        };
        if let Some(name) = mapper.name_by_uuid(&uuid).await {
            tracing::debug!("Entry {} with known UUID {} was renamed to {}", name, uuid, dn);
            if !mapper.set_dn_by_uuid(&dn, &uuid).await {
                tracing::warn!("Could not update the DN of {} to {}", name, dn);
            }
            return Ok(Some(NameResolution {
                name,
                newly_mapped: false,
            }));
        }

        let configuration = self.connection.configuration();
        let display_attribute = if is_user {
            configuration.user_display_name.clone()
        } else {
            configuration.group_display_name.clone()
        };
        let username_attribute = configuration.expert_username_attr.clone();
        let display_name = match display_name.filter(|d| !d.is_empty()) {
            Some(display_name) => Some(display_name.to_string()),
            None => match record.and_then(|r| r.first_string(&display_attribute)) {
                Some(display_name) => Some(display_name),
                None => self.read_first_string(&dn, &display_attribute).await?,
            },
        };
        let Some(display_name) = display_name else {
            tracing::info!("No or empty name for {}, skipping", dn);
            return Ok(None);
        };

        let candidate = if !is_user {
            display_name
        } else if username_attribute.is_empty() {
            uuid.clone()
        } else {
            match record.and_then(|r| r.first_string(&username_attribute)) {
                Some(username) => username,
                None => match self.read_first_string(&dn, &username_attribute).await? {
                    Some(username) => username,
                    None => {
                        tracing::info!("No {} for {}, skipping", username_attribute, dn);
                        return Ok(None);
                    }
                },
            }
        };
        let Some(candidate) = self.sanitize_username(&candidate) else {
            tracing::info!("Name for {} is empty after sanitizing, skipping", dn);
            return Ok(None);
        };

        // a cached "exists" must not decide whether the name is free
        let cache_ttl = self.connection.configuration().cache_ttl;
        self.connection.configuration_mut().cache_ttl = 0;
        let claimed = self
            .claim_internal_name(mapper.as_ref(), &candidate, &dn, &uuid, is_user)
            .await;
        self.connection.configuration_mut().cache_ttl = cache_ttl;

        let Some(name) = claimed else {
            tracing::info!("Could not create unique name for {}.", dn);
            return Ok(None);
        };
        if is_user {
            self.host.announce_user_mapped(&name, &dn).await;
        }
        Ok(Some(NameResolution {
            name,
            newly_mapped: true,
        }))
    }

    /// the internal name of a user entry, `None` if the DN is not within the
    /// user bases
    pub async fn dn_to_username(
        &mut self,
        dn: &str,
        display_name: Option<&str>,
        record: Option<&DirectoryRecord>,
    ) -> Result<Option<String>, AccessError> {
        if !is_dn_part_of_base(dn, &self.connection.configuration().base_users) {
            tracing::debug!("DN {} outside user bases", dn);
            return Ok(None);
        }
        Ok(self
            .dn_to_internal_name(dn, display_name, true, record)
            .await?
            .map(|resolution| resolution.name))
    }

    /// the internal name of a group entry, `None` if the DN is not within the
    /// group bases
    pub async fn dn_to_groupname(
        &mut self,
        dn: &str,
        display_name: Option<&str>,
        record: Option<&DirectoryRecord>,
    ) -> Result<Option<String>, AccessError> {
        if !is_dn_part_of_base(dn, &self.connection.configuration().base_groups) {
            tracing::debug!("DN {} outside group bases", dn);
            return Ok(None);
        }
        Ok(self
            .dn_to_internal_name(dn, display_name, false, record)
            .await?
            .map(|resolution| resolution.name))
    }

    /// the DN of a mapped user, `None` if it is not within the user bases
    pub async fn username_to_dn(&self, name: &str) -> Option<String> {
        let dn = self.user_mapper.dn_by_name(name).await?;
        is_dn_part_of_base(&dn, &self.connection.configuration().base_users).then_some(dn)
    }

    /// the DN of a mapped group
    pub async fn groupname_to_dn(&self, name: &str) -> Option<String> {
        self.group_mapper.dn_by_name(name).await
    }

    /// the display name of a user record, with the second display name in
    /// parentheses if configured
    pub(crate) fn compose_display_name(&self, record: &DirectoryRecord) -> Option<String> {
        let configuration = self.connection.configuration();
        let display_name = record.first_string(&configuration.user_display_name)?;
        if configuration.user_display_name_2.is_empty() {
            return Some(display_name);
        }
        Some(match record.first_string(&configuration.user_display_name_2) {
            Some(second) => format!("{} ({})", display_name, second),
            None => display_name,
        })
    }

    /// the internal names of user records, mapping new ones; the display
    /// names are cached along the way
    pub async fn internal_user_names(
        &mut self,
        records: &[DirectoryRecord],
    ) -> Result<Vec<String>, AccessError> {
        let display_attribute = self.connection.configuration().user_display_name.clone();
        let mut names = Vec::new();
        for record in records {
            let display_name = record.first_string(&display_attribute);
            let Some(resolution) = self
                .dn_to_internal_name(record.dn(), display_name.as_deref(), true, Some(record))
                .await?
            else {
                continue;
            };
            if let Some(display_name) = self.compose_display_name(record) {
                self.connection
                    .write_to_cache(&format!("getDisplayName{}", resolution.name), &display_name);
            }
            names.push(resolution.name);
        }
        Ok(names)
    }

    /// the internal names of group records, mapping new ones
    pub async fn internal_group_names(
        &mut self,
        records: &[DirectoryRecord],
    ) -> Result<Vec<String>, AccessError> {
        let display_attribute = self.connection.configuration().group_display_name.clone();
        let mut names = Vec::new();
        for record in records {
            let display_name = record.first_string(&display_attribute);
            if let Some(resolution) = self
                .dn_to_internal_name(record.dn(), display_name.as_deref(), false, Some(record))
                .await?
            {
                names.push(resolution.name);
            }
        }
        Ok(names)
    }

    /// the UUID attribute currently in use for users or groups
    pub fn uuid_attribute(&self, is_user: bool) -> &str {
        let configuration = self.connection.configuration();
        if is_user {
            &configuration.uuid_user_attribute
        } else {
            &configuration.uuid_group_attribute
        }
    }

    /// remember the UUID attribute on this instance
    fn set_uuid_attribute(&mut self, is_user: bool, attribute: &str) {
        let configuration = self.connection.configuration_mut();
        let target = if is_user {
            &mut configuration.uuid_user_attribute
        } else {
            &mut configuration.uuid_group_attribute
        };
        *target = attribute.to_lowercase();
    }

    /// the first value of an attribute, from the record if it carries it,
    /// otherwise read from the directory
    async fn record_or_read_first(
        &mut self,
        dn: &str,
        attribute: &str,
        record: Option<&DirectoryRecord>,
    ) -> Result<Option<String>, AccessError> {
        if let Some(values) = record.and_then(|r| r.get(attribute)) {
            let value = post_process_values(attribute, values.to_vec())
                .into_iter()
                .next()
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .filter(|v| !v.is_empty());
            if value.is_some() {
                return Ok(value);
            }
        }
        self.read_first_string(dn, attribute).await
    }

    /// find the attribute holding the UUID of entries
    ///
    /// a configured attribute, the expert override or a cached detection
    /// result win unless `force` is given; otherwise the known UUID
    /// attributes are tried on the entry. Returns false if none is present.
    #[instrument(skip(self, record))]
    pub async fn detect_uuid_attribute(
        &mut self,
        dn: &str,
        is_user: bool,
        force: bool,
        record: Option<&DirectoryRecord>,
    ) -> Result<bool, AccessError> {
        let (expert_override, cache_key) = {
            let configuration = self.connection.configuration();
            if is_user {
                (configuration.expert_uuid_user_attr.clone(), "uuidAttribute-user")
            } else {
                (configuration.expert_uuid_group_attr.clone(), "uuidAttribute-group")
            }
        };
        if !force {
            if self.uuid_attribute(is_user) != UUID_AUTO {
                return Ok(true);
            }
            if !expert_override.is_empty() {
                self.set_uuid_attribute(is_user, &expert_override);
                return Ok(true);
            }
            if let Some(cached) = self.connection.get_from_cache::<String>(cache_key) {
                self.set_uuid_attribute(is_user, &cached);
                return Ok(true);
            }
        }
        for attribute in UUID_ATTRIBUTES {
            if self.record_or_read_first(dn, attribute, record).await?.is_some() {
                tracing::debug!("Setting {} as UUID attribute", attribute);
                self.set_uuid_attribute(is_user, attribute);
                self.connection.write_to_cache(cache_key, *attribute);
                return Ok(true);
            }
        }
        tracing::error!("Could not autodetect the UUID attribute for {}", dn);
        Ok(false)
    }

    /// the UUID of an entry
    pub async fn uuid(
        &mut self,
        dn: &str,
        is_user: bool,
        record: Option<&DirectoryRecord>,
    ) -> Result<Option<String>, AccessError> {
        if !self.detect_uuid_attribute(dn, is_user, false, record).await? {
            return Ok(None);
        }
        let attribute = self.uuid_attribute(is_user).to_string();
        let uuid = self.record_or_read_first(dn, &attribute, record).await?;
        if uuid.is_some() {
            return Ok(uuid);
        }
        let has_override = {
            let configuration = self.connection.configuration();
            if is_user {
                !configuration.expert_uuid_user_attr.is_empty()
            } else {
                !configuration.expert_uuid_group_attr.is_empty()
            }
        };
        if !has_override || !self.detect_uuid_attribute(dn, is_user, true, record).await? {
            return Ok(None);
        }
        let attribute = self.uuid_attribute(is_user).to_string();
        self.record_or_read_first(dn, &attribute, record).await
    }

    /// the DN of the user entry with the UUID
    ///
    /// `None` if no or more than one entry carries it
    pub async fn user_dn_by_uuid(&mut self, uuid: &str) -> Result<Option<String>, AccessError> {
        if self.uuid_attribute(true) == UUID_AUTO {
            let user_filter = self.connection.configuration().user_filter.clone();
            let any = self
                .search_users(&user_filter, &["dn".to_string()], Some(1), 0)
                .await?;
            let Some(any) = any.first() else {
                return Err(AccessError::UuidAttributeUndetectable);
            };
            if !self.detect_uuid_attribute(any.dn(), true, false, None).await? {
                return Err(AccessError::UuidAttributeUndetectable);
            }
        }
        let attribute = self.uuid_attribute(true).to_string();
        let value = if attribute == "objectguid" || attribute == "guid" {
            format_guid_for_filter(uuid)
        } else {
            escape_filter_part(uuid, false)
        };
        let user_filter = self.connection.configuration().user_filter.clone();
        let filter = combine_filter_with_and(&[user_filter, format!("{}={}", attribute, value)]);
        let found = self
            .search_users(&filter, &["dn".to_string()], None, 0)
            .await?;
        if found.len() != 1 {
            tracing::debug!("{} user entries carry the UUID {}", found.len(), uuid);
            return Ok(None);
        }
        Ok(found.into_iter().next().map(|record| record.dn().to_string()))
    }
}
