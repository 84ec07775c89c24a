//! the core of the directory access: attribute reads, searches and counting
//! on top of a [Connection], name resolution against the identity mappers

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::instrument;

use crate::codec::{convert_object_guid_to_str, convert_sid_to_str};
use crate::connection::Connection;
use crate::dn::{attribute_resembles_dn, dn_as_base_parameter, domain_dn_from_dn, is_dn_part_of_base, sanitize_dn};
use crate::error::{AccessError, DirectoryError};
use crate::filter::{combine_filter_with_and, escape_filter_part, filter_part_for_search, parenthesize};
use crate::host::IdentityHost;
use crate::mapping::IdentityMapper;
use crate::record::DirectoryRecord;
use crate::wrapper::{SearchResponse, SearchScope};

mod naming;
mod paging;

pub use naming::NameResolution;
use paging::{PagedSearchState, DEFAULT_PAGE_SIZE};

/// an [Access] shared by the backends and the proxy, the lock serializes
/// the paged searches on it
pub type SharedAccess = Arc<tokio::sync::Mutex<Access>>;

/// filter used when reading an attribute without a filter
pub const DEFAULT_READ_FILTER: &str = "objectclass=*";

/// attributes holding a binary GUID which is decoded on read
const GUID_ATTRIBUTES: &[&str] = &["objectguid", "guid"];

lazy_static! {
    /// an attribute name of a ranged reply, e.g. `member;range=0-1499`
    static ref RANGE_ATTRIBUTE_RE: Regex =
        Regex::new(r"^([^;]+);range=(\d+)-(\d+|\*)$").unwrap();
}

/// one range of a multi valued attribute the server sent in parts
#[derive(Debug)]
struct AttributeRange {
    /// the values of this range
    values: Vec<Vec<u8>>,
    /// the index of the last value, `None` for the final range
    high: Option<u64>,
}

impl AttributeRange {
    /// find the ranged variant of the attribute in the entry
    fn find(entry: &DirectoryRecord, attribute: &str) -> Option<AttributeRange> {
        entry.iter().find_map(|(name, values)| {
            let captures = RANGE_ATTRIBUTE_RE.captures(name)?;
            if !captures[1].eq_ignore_ascii_case(attribute) {
                return None;
            }
            let high = match &captures[3] {
                "*" => None,
                high => Some(high.parse().ok()?),
            };
            Some(AttributeRange {
                values: values.to_vec(),
                high,
            })
        })
    }
}

/// sanitize DN values and decode GUID values of an attribute
fn post_process_values(attribute: &str, values: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    if attribute_resembles_dn(attribute) {
        values
            .into_iter()
            .map(|v| sanitize_dn(&String::from_utf8_lossy(&v)).into_bytes())
            .collect()
    } else if GUID_ATTRIBUTES.iter().any(|a| a.eq_ignore_ascii_case(attribute)) {
        values
            .into_iter()
            .map(|v| convert_object_guid_to_str(&v).map(String::into_bytes).unwrap_or(v))
            .collect()
    } else {
        values
    }
}

/// keep the requested attributes of a search result with lower case names,
/// sanitized DNs and decoded GUIDs
fn process_record(record: &DirectoryRecord, attributes: &[String]) -> DirectoryRecord {
    let mut processed = DirectoryRecord::new(sanitize_dn(record.dn()));
    for (name, values) in record.iter() {
        if name.eq_ignore_ascii_case("dn") {
            continue;
        }
        if !attributes.is_empty() && !attributes.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            continue;
        }
        let name = name.to_lowercase();
        let values = post_process_values(&name, values.to_vec());
        processed.insert(&name, values);
    }
    processed
}

/// the attributes to request from the server, `dn` is always returned and
/// a list of only `dn` asks for no attributes at all
fn wire_attributes(attributes: &[String]) -> Vec<String> {
    if attributes.is_empty() {
        return Vec::new();
    }
    let wire: Vec<String> = attributes
        .iter()
        .filter(|a| !a.eq_ignore_ascii_case("dn"))
        .cloned()
        .collect();
    if wire.is_empty() {
        vec!["1.1".to_string()]
    } else {
        wire
    }
}

/// directory access for one server configuration
#[derive(Debug)]
pub struct Access {
    /// the connection to the server
    connection: Connection,
    /// mapping of user entries to internal names
    user_mapper: Arc<dyn IdentityMapper>,
    /// mapping of group entries to internal names
    group_mapper: Arc<dyn IdentityMapper>,
    /// the hosting application's view on existing names
    host: Arc<dyn IdentityHost>,
    /// state of the paged search in flight
    paging: PagedSearchState,
}

impl Access {
    /// create the access for a connection
    pub fn new(
        connection: Connection,
        user_mapper: Arc<dyn IdentityMapper>,
        group_mapper: Arc<dyn IdentityMapper>,
        host: Arc<dyn IdentityHost>,
    ) -> Self {
        Self {
            connection,
            user_mapper,
            group_mapper,
            host,
            paging: PagedSearchState::default(),
        }
    }

    /// the connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// the connection, e.g. to change its configuration
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// the user mapping
    pub fn user_mapper(&self) -> &Arc<dyn IdentityMapper> {
        &self.user_mapper
    }

    /// the group mapping
    pub fn group_mapper(&self) -> &Arc<dyn IdentityMapper> {
        &self.group_mapper
    }

    /// wrap the access for sharing between backends
    pub fn into_shared(self) -> SharedAccess {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// run a search on the session, reconnecting once if the server went away
    pub(crate) async fn invoke_search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Option<SearchResponse>, AccessError> {
        let mut reconnected = false;
        loop {
            let Some(session) = self.connection.resource().await? else {
                tracing::debug!("No LDAP resource available for a search on {}", base);
                return Ok(None);
            };
            match session.search(base, scope, filter, attributes).await {
                Ok(response) => return Ok(response),
                Err(DirectoryError::ServerUnavailable(message)) if !reconnected => {
                    tracing::warn!(
                        "Connection lost during search on {} ({}), reconnecting",
                        base,
                        message
                    );
                    self.connection.reset_connection().await;
                    reconnected = true;
                }
                Err(DirectoryError::ConstraintViolation(message)) => {
                    return Err(AccessError::ConstraintViolation(message));
                }
                Err(err @ DirectoryError::ServerUnavailable(_)) => return Err(err.into()),
                Err(err) => {
                    tracing::error!("Search on {} with filter {} failed: {}", base, filter, err);
                    return Ok(None);
                }
            }
        }
    }

    /// set the paged results control for the next search
    ///
    /// returns false if paging is not available
    pub(crate) async fn set_paged_control(
        &mut self,
        page_size: usize,
        cookie: &[u8],
    ) -> Result<bool, AccessError> {
        if !self.connection.has_paged_result_support() {
            return Ok(false);
        }
        let Some(session) = self.connection.resource().await? else {
            return Ok(false);
        };
        let size = i32::try_from(page_size).unwrap_or(i32::MAX);
        let supported = session.control_paged_result(size, false, cookie);
        if !supported {
            tracing::info!("Server does not support paged results, disabling paging");
            self.connection.set_paged_result_support(false);
        }
        Ok(supported)
    }

    /// read the values of an attribute of a single entry
    ///
    /// `Some(vec![])` for an empty attribute name if the entry exists (and
    /// matches the filter), `None` if the entry or attribute can not be read
    #[instrument(skip(self))]
    pub async fn read_attribute(
        &mut self,
        dn: &str,
        attribute: &str,
        filter: Option<&str>,
    ) -> Result<Option<Vec<Vec<u8>>>, AccessError> {
        if self.connection.resource().await?.is_none() {
            tracing::debug!("No LDAP resource available, cannot read {} of {}", attribute, dn);
            return Ok(None);
        }
        self.abandon_paged_search();
        let paging_size = self.connection.configuration().paging_size as usize;
        let page_size = if paging_size > 20 { paging_size } else { DEFAULT_PAGE_SIZE };
        self.set_paged_control(page_size, &[]).await?;

        let attribute = attribute.to_lowercase();
        let base = dn_as_base_parameter(dn);
        let filter = parenthesize(filter.unwrap_or(DEFAULT_READ_FILTER));
        let requested = if attribute.is_empty() {
            vec!["1.1".to_string()]
        } else {
            vec![attribute.clone()]
        };
        let Some(response) = self
            .invoke_search(&base, SearchScope::Base, &filter, &requested)
            .await?
        else {
            tracing::debug!("readAttribute failed for DN {}", dn);
            return Ok(None);
        };
        let Some(entry) = response.entries.into_iter().next() else {
            tracing::debug!("readAttribute: no entry {} matching {}", dn, filter);
            return Ok(None);
        };
        if attribute.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let mut values = entry.get(&attribute).map(<[_]>::to_vec).unwrap_or_default();
        let mut range = AttributeRange::find(&entry, &attribute);
        while let Some(current) = range.take() {
            values.extend(current.values);
            let Some(high) = current.high else {
                break;
            };
            let request = vec![format!("{};range={}-*", attribute, high + 1)];
            tracing::trace!("Reading next range {} of {}", request[0], dn);
            range = self
                .invoke_search(&base, SearchScope::Base, &filter, &request)
                .await?
                .and_then(|response| {
                    response
                        .entries
                        .first()
                        .and_then(|e| AttributeRange::find(e, &attribute))
                });
        }
        if values.is_empty() {
            tracing::debug!("Requested attribute {} not found for {}", attribute, dn);
            return Ok(None);
        }
        Ok(Some(post_process_values(&attribute, values)))
    }

    /// [Access::read_attribute] with the values decoded as strings
    pub async fn read_attribute_strings(
        &mut self,
        dn: &str,
        attribute: &str,
        filter: Option<&str>,
    ) -> Result<Option<Vec<String>>, AccessError> {
        Ok(self.read_attribute(dn, attribute, filter).await?.map(|values| {
            values
                .into_iter()
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .collect()
        }))
    }

    /// the first non-empty value of an attribute
    pub(crate) async fn read_first_string(
        &mut self,
        dn: &str,
        attribute: &str,
    ) -> Result<Option<String>, AccessError> {
        Ok(self
            .read_attribute_strings(dn, attribute, None)
            .await?
            .and_then(|values| values.into_iter().next())
            .filter(|value| !value.is_empty()))
    }

    /// search for users in the user bases
    pub async fn search_users(
        &mut self,
        filter: &str,
        attributes: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let bases = self.connection.configuration().base_users.clone();
        self.search(filter, &bases, attributes, limit, offset).await
    }

    /// search for groups in the group bases
    pub async fn search_groups(
        &mut self,
        filter: &str,
        attributes: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let bases = self.connection.configuration().base_groups.clone();
        self.search(filter, &bases, attributes, limit, offset).await
    }

    /// count users in the user bases
    pub async fn count_users(
        &mut self,
        filter: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<usize>, AccessError> {
        let bases = self.connection.configuration().base_users.clone();
        self.count(filter, &bases, limit, offset).await
    }

    /// count groups in the group bases
    pub async fn count_groups(
        &mut self,
        filter: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<usize>, AccessError> {
        let bases = self.connection.configuration().base_groups.clone();
        self.count(filter, &bases, limit, offset).await
    }

    /// count all entries in the general bases
    pub async fn count_objects(
        &mut self,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<usize>, AccessError> {
        let bases = self.connection.configuration().base.clone();
        self.count(DEFAULT_READ_FILTER, &bases, limit, offset).await
    }

    /// search users and remember the ones found as existing
    pub async fn fetch_list_of_users(
        &mut self,
        filter: &str,
        attributes: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let records = self.search_users(filter, attributes, limit, offset).await?;
        self.batch_apply_user_attributes(&records).await?;
        Ok(records)
    }

    /// search groups
    pub async fn fetch_list_of_groups(
        &mut self,
        filter: &str,
        attributes: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        self.search_groups(filter, attributes, limit, offset).await
    }

    /// the login filter for a login name
    fn login_filter_for(&self, login_name: &str) -> String {
        let login_name = escape_filter_part(login_name, false);
        self.connection
            .configuration()
            .login_filter
            .replace("%uid", &login_name)
    }

    /// the user entries matching a login name
    pub async fn fetch_users_by_login_name(
        &mut self,
        login_name: &str,
        attributes: &[String],
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let filter = self.login_filter_for(login_name);
        self.fetch_list_of_users(&filter, attributes, None, 0).await
    }

    /// the number of user entries matching a login name
    pub async fn count_users_by_login_name(
        &mut self,
        login_name: &str,
    ) -> Result<Option<usize>, AccessError> {
        let filter = self.login_filter_for(login_name);
        self.count_users(&filter, None, 0).await
    }

    /// filter part to search users for a term
    pub fn filter_part_for_user_search(&self, search: &str) -> String {
        let configuration = self.connection.configuration();
        filter_part_for_search(
            search,
            &configuration.attributes_for_user_search,
            &configuration.user_display_name,
            configuration.allow_user_enumeration,
        )
    }

    /// filter part to search groups for a term
    pub fn filter_part_for_group_search(&self, search: &str) -> String {
        let configuration = self.connection.configuration();
        filter_part_for_search(
            search,
            &configuration.attributes_for_group_search,
            &configuration.group_display_name,
            configuration.allow_user_enumeration,
        )
    }

    /// filter matching all users which have a display name
    pub fn filter_for_user_count(&self) -> String {
        let configuration = self.connection.configuration();
        combine_filter_with_and(&[
            configuration.user_filter.clone(),
            format!("{}=*", configuration.user_display_name),
        ])
    }

    /// check a password by binding as the DN on a separate connection
    #[instrument(skip(self, password))]
    pub async fn are_credentials_valid(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<bool, AccessError> {
        if password.is_empty() {
            return Ok(false);
        }
        let dn = dn_as_base_parameter(dn);
        let mut scratch = self.connection.with_credentials(&dn, password);
        if !scratch.is_configured() {
            tracing::debug!("Scratch connection for {} is not configured", dn);
            return Ok(false);
        }
        let valid = scratch.bind().await;
        scratch.reset_connection().await;
        Ok(valid?)
    }

    /// the SID of the domain the DN belongs to
    pub async fn sid(&mut self, dn: &str) -> Result<Option<String>, AccessError> {
        let domain = domain_dn_from_dn(dn);
        if domain.is_empty() {
            return Ok(None);
        }
        let cache_key = format!("getSID-{}", domain);
        if let Some(cached) = self.connection.get_from_cache::<Option<String>>(&cache_key) {
            return Ok(cached);
        }
        let sid = self
            .read_attribute(&domain, "objectsid", None)
            .await?
            .and_then(|values| values.into_iter().next())
            .map(|value| convert_sid_to_str(&value))
            .filter(|sid| !sid.is_empty());
        self.connection.write_to_cache(&cache_key, &sid);
        Ok(sid)
    }

    /// the DNs which are groups in the group bases matching the group filter
    pub async fn groups_match_filter(&mut self, dns: &[String]) -> Result<Vec<String>, AccessError> {
        let group_filter = self.connection.configuration().group_filter.clone();
        let bases = self.connection.configuration().base_groups.clone();
        let mut matching = Vec::new();
        for dn in dns {
            let cache_key = format!("groupsMatchFilter-{}", dn);
            if let Some(cached) = self.connection.get_from_cache::<bool>(&cache_key) {
                if cached {
                    matching.push(dn.clone());
                }
                continue;
            }
            let matches = is_dn_part_of_base(dn, &bases)
                && self
                    .read_attribute(dn, "", Some(group_filter.as_str()))
                    .await?
                    .is_some();
            self.connection.write_to_cache(&cache_key, &matches);
            if matches {
                matching.push(dn.clone());
            }
        }
        Ok(matching)
    }

    /// map the users of search results and remember them as existing
    pub async fn batch_apply_user_attributes(
        &mut self,
        records: &[DirectoryRecord],
    ) -> Result<(), AccessError> {
        let display_attribute = self.connection.configuration().user_display_name.clone();
        for record in records {
            let Some(display_name) = record.first_string(&display_attribute) else {
                continue;
            };
            if let Some(name) = self
                .dn_to_username(record.dn(), Some(&display_name), Some(record))
                .await?
            {
                self.connection
                    .write_to_cache(&format!("userExists{}", name), &true);
            }
        }
        Ok(())
    }
}
