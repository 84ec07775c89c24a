//! the group backend on top of an [Access]
//!
//! memberships are resolved from the member association attribute of the
//! groups, from `memberOf` on the users if the server supports it, from the
//! Active Directory primary group and from dynamic groups with a member URL

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use tracing::instrument;

use crate::access::{Access, SharedAccess};
use crate::error::AccessError;
use crate::filter::{combine_filter_with_and, combine_filter_with_or, escape_filter_part};
use crate::record::DirectoryRecord;
use crate::user_backend::user_attributes;

/// upper bound of the groups listed at once
const MAX_GROUPS: usize = 100_000;

/// upper bound of the length of a single filter when translating member uids
const MAX_FILTER_LENGTH: usize = 9_000_000;

/// the member association attribute holding login names instead of DNs
const MEMBER_UID: &str = "memberuid";

/// lookups kept for the lifetime of the backend
#[derive(Debug)]
struct GroupCaches {
    /// member DNs by group name
    members: HashMap<String, Vec<String>>,
    /// group names by member DN or member uid
    groups_by_member: HashMap<String, Vec<String>>,
    /// `memberOf` values by group DN
    nested_groups: HashMap<String, Vec<String>>,
    /// unset once a user without a primary group was seen
    has_primary_groups: bool,
}

impl Default for GroupCaches {
    fn default() -> Self {
        Self {
            members: HashMap::new(),
            groups_by_member: HashMap::new(),
            nested_groups: HashMap::new(),
            has_primary_groups: true,
        }
    }
}

/// groups of one directory configuration
#[derive(Debug, Clone)]
pub struct GroupLdap {
    /// the access to the directory
    access: SharedAccess,
    /// lookups shared by the clones of the backend
    caches: Arc<Mutex<GroupCaches>>,
}

/// the group support is configured
fn is_enabled(access: &Access) -> bool {
    let configuration = access.connection().configuration();
    !configuration.group_filter.is_empty() && !configuration.group_member_assoc_attribute.is_empty()
}

/// the member association attribute, lower case
fn member_assoc_attribute(access: &Access) -> String {
    access
        .connection()
        .configuration()
        .group_member_assoc_attribute
        .to_lowercase()
}

/// the search filter of a dynamic group member URL like
/// `ldap:///ou=users,dc=example,dc=com??sub?(objectclass=person)`
fn member_url_filter(url: &str) -> Option<&str> {
    url.find('(').map(|position| &url[position..])
}

/// one chunk of a name for the natural sort order
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalChunk {
    /// a run of digits
    Number(u64),
    /// anything else
    Text(String),
}

/// split a name into text and number chunks
fn natural_chunks(name: &str) -> Vec<NaturalChunk> {
    let mut chunks = Vec::new();
    let mut rest = name;
    while let Some(first) = rest.chars().next() {
        let is_digit = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != is_digit)
            .unwrap_or(rest.len());
        let (chunk, remaining) = rest.split_at(end);
        match chunk.parse() {
            Ok(number) if is_digit => chunks.push(NaturalChunk::Number(number)),
            _ => chunks.push(NaturalChunk::Text(chunk.to_string())),
        }
        rest = remaining;
    }
    chunks
}

/// compare names with embedded numbers by their value, `user2` before `user10`
fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_chunks(a).cmp(&natural_chunks(b))
}

/// group filters into chunks whose total length stays below the limit
fn chunk_filters(filters: Vec<String>, max_length: usize) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut length = 0;
    for filter in filters {
        if !current.is_empty() && length + filter.len() >= max_length {
            chunks.push(std::mem::take(&mut current));
            length = 0;
        }
        length += filter.len();
        current.push(filter);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl GroupLdap {
    /// create the backend
    pub fn new(access: SharedAccess) -> Self {
        Self {
            access,
            caches: Arc::new(Mutex::new(GroupCaches::default())),
        }
    }

    /// the access this backend works on
    pub fn access(&self) -> &SharedAccess {
        &self.access
    }

    /// lock the instance lookups, never held across an await
    fn caches(&self) -> MutexGuard<'_, GroupCaches> {
        self.caches.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// the user is member of the group, directly, nested, dynamically or by
    /// its primary group
    #[instrument(skip(self))]
    pub async fn in_group(&self, uid: &str, gid: &str) -> Result<bool, AccessError> {
        let mut access = self.access.lock().await;
        if !is_enabled(&access) {
            return Ok(false);
        }
        let cache_key = format!("inGroup{}:{}", uid, gid);
        if let Some(is_in) = access.connection().get_from_cache::<bool>(&cache_key) {
            return Ok(is_in);
        }
        let user_dn = access.username_to_dn(uid).await;

        let known_members = self.caches().members.get(gid).cloned();
        if let Some(members) = known_members {
            let is_in = user_dn.is_some_and(|dn| members.contains(&dn));
            access.connection().write_to_cache(&cache_key, &is_in);
            return Ok(is_in);
        }
        let members_key = format!("inGroup-members:{}", gid);
        if let Some(members) = access.connection().get_from_cache::<Vec<String>>(&members_key) {
            let is_in = user_dn.is_some_and(|dn| members.contains(&dn));
            self.caches().members.insert(gid.to_string(), members);
            access.connection().write_to_cache(&cache_key, &is_in);
            return Ok(is_in);
        }

        let group_dn = access.groupname_to_dn(gid).await;
        let (Some(user_dn), Some(group_dn)) = (user_dn, group_dn) else {
            access.connection().write_to_cache(&cache_key, &false);
            return Ok(false);
        };
        if self.user_primary_group(&mut access, &user_dn).await?.as_deref() == Some(gid) {
            access.connection().write_to_cache(&cache_key, &true);
            return Ok(true);
        }

        let mut members = self.group_members(&mut access, &group_dn).await?;
        if members.is_empty() {
            access.connection().write_to_cache(&cache_key, &false);
            return Ok(false);
        }
        if member_assoc_attribute(&access) == MEMBER_UID {
            members = Self::member_uids_to_dns(&mut access, &members).await?;
        }
        let is_in = members.contains(&user_dn);
        access.connection().write_to_cache(&cache_key, &is_in);
        access.connection().write_to_cache(&members_key, &members);
        self.caches().members.insert(gid.to_string(), members);
        Ok(is_in)
    }

    /// translate member uids to the DNs of the users with these login names
    async fn member_uids_to_dns(
        access: &mut Access,
        uids: &[String],
    ) -> Result<Vec<String>, AccessError> {
        let login_filter = access.connection().configuration().login_filter.clone();
        let attributes = vec!["dn".to_string()];
        let mut dns = Vec::new();
        let filters: Vec<String> = uids
            .iter()
            .map(|uid| login_filter.replace("%uid", &escape_filter_part(uid.trim(), false)))
            .collect();
        for chunk in chunk_filters(filters, MAX_FILTER_LENGTH) {
            let filter = combine_filter_with_or(&chunk);
            let records = access.fetch_list_of_users(&filter, &attributes, None, 0).await?;
            dns.extend(records.iter().map(|record| record.dn().to_string()));
        }
        Ok(dns)
    }

    /// the members of a group, nested members and dynamic members included
    /// if configured
    async fn group_members(
        &self,
        access: &mut Access,
        group_dn: &str,
    ) -> Result<Vec<String>, AccessError> {
        let cache_key = format!("_groupMembers{}", group_dn);
        if let Some(members) = access.connection().get_from_cache::<Vec<String>>(&cache_key) {
            return Ok(members);
        }
        let assoc = member_assoc_attribute(access);
        let nested = access.connection().configuration().nested_groups && assoc != MEMBER_UID;
        let direct = access
            .read_attribute_strings(group_dn, &assoc, None)
            .await?
            .unwrap_or_default();

        let mut members = if nested {
            let mut seen = HashSet::new();
            let mut members = Vec::new();
            let mut queue = direct;
            queue.reverse();
            while let Some(member) = queue.pop() {
                if member == group_dn || !seen.insert(member.clone()) {
                    continue;
                }
                let mut nested_members = access
                    .read_attribute_strings(&member, &assoc, None)
                    .await?
                    .unwrap_or_default();
                nested_members.reverse();
                queue.extend(nested_members);
                members.push(member);
            }
            members
        } else {
            direct
        };

        for member in Self::dynamic_group_members(access, group_dn).await? {
            if !members.contains(&member) {
                members.push(member);
            }
        }
        access.connection().write_to_cache(&cache_key, &members);
        Ok(members)
    }

    /// the users matching the member URL filter of a dynamic group
    async fn dynamic_group_members(
        access: &mut Access,
        group_dn: &str,
    ) -> Result<Vec<String>, AccessError> {
        let (url_attribute, group_filter) = {
            let configuration = access.connection().configuration();
            (
                configuration.dynamic_group_member_url.to_lowercase(),
                configuration.group_filter.clone(),
            )
        };
        if url_attribute.is_empty() {
            return Ok(Vec::new());
        }
        let Some(urls) = access
            .read_attribute_strings(group_dn, &url_attribute, Some(group_filter.as_str()))
            .await?
        else {
            return Ok(Vec::new());
        };
        let Some(filter) = urls.first().and_then(|url| member_url_filter(url)) else {
            tracing::debug!("No search filter found on member url of group {}", group_dn);
            return Ok(Vec::new());
        };
        let records = access
            .search_users(filter, &["dn".to_string()], None, 0)
            .await?;
        Ok(records.iter().map(|record| record.dn().to_string()).collect())
    }

    /// the groups a DN is member of according to its `memberOf` attribute
    async fn group_dns_from_member_of(
        &self,
        access: &mut Access,
        dn: &str,
    ) -> Result<Vec<String>, AccessError> {
        let Some(groups) = access.read_attribute_strings(dn, "memberof", None).await? else {
            return Ok(Vec::new());
        };
        let groups = if access.connection().configuration().nested_groups {
            let mut seen = HashSet::new();
            let mut all = Vec::new();
            let mut queue = groups;
            queue.reverse();
            while let Some(group) = queue.pop() {
                if group == dn || !seen.insert(group.clone()) {
                    continue;
                }
                let known = self.caches().nested_groups.get(&group).cloned();
                let mut parents = match known {
                    Some(parents) => parents,
                    None => {
                        let parents = access
                            .read_attribute_strings(&group, "memberof", None)
                            .await?
                            .unwrap_or_default();
                        self.caches()
                            .nested_groups
                            .insert(group.clone(), parents.clone());
                        parents
                    }
                };
                parents.reverse();
                queue.extend(parents);
                all.push(group);
            }
            all
        } else {
            groups
        };
        access.groups_match_filter(&groups).await
    }

    /// the group entries listing the member in their member association
    /// attribute, nested groups included if configured
    async fn groups_by_member(
        access: &mut Access,
        member: &str,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let assoc = member_assoc_attribute(access);
        let attributes = vec![
            access.connection().configuration().group_display_name.to_lowercase(),
            "dn".to_string(),
        ];
        let nested = access.connection().configuration().nested_groups && assoc != MEMBER_UID;
        let filter = format!("({}={})", assoc, escape_filter_part(member, false));
        let direct = access.fetch_list_of_groups(&filter, &attributes, None, 0).await?;

        let mut groups = if nested {
            let mut seen = HashSet::new();
            let mut all = Vec::new();
            let mut queue = direct;
            queue.reverse();
            while let Some(group) = queue.pop() {
                if group.dn() == member || !seen.insert(group.dn().to_string()) {
                    continue;
                }
                let filter = format!("({}={})", assoc, escape_filter_part(group.dn(), false));
                let mut parents = access.fetch_list_of_groups(&filter, &attributes, None, 0).await?;
                parents.reverse();
                queue.extend(parents);
                all.push(group);
            }
            all
        } else {
            direct
                .into_iter()
                .filter(|group| group.dn() != member)
                .collect()
        };

        let dns: Vec<String> = groups.iter().map(|group| group.dn().to_string()).collect();
        let visible = access.groups_match_filter(&dns).await?;
        groups.retain(|group| visible.iter().any(|dn| dn == group.dn()));
        Ok(groups)
    }

    /// the name of the primary group of a user, Active Directory only
    async fn user_primary_group(
        &self,
        access: &mut Access,
        user_dn: &str,
    ) -> Result<Option<String>, AccessError> {
        let has_primary_groups = self.caches().has_primary_groups;
        if !has_primary_groups {
            return Ok(None);
        }
        let Some(group_id) = access.read_first_string(user_dn, "primaryGroupID").await? else {
            tracing::debug!("{} has no primary group, not looking for others", user_dn);
            self.caches().has_primary_groups = false;
            return Ok(None);
        };
        Self::primary_group_id_to_name(access, &group_id, user_dn).await
    }

    /// the name of the group with the relative id within the domain of the DN
    async fn primary_group_id_to_name(
        access: &mut Access,
        group_id: &str,
        dn: &str,
    ) -> Result<Option<String>, AccessError> {
        let cache_key = format!("primaryGroupIDtoName{}", group_id);
        if let Some(name) = access.connection().get_from_cache::<String>(&cache_key) {
            return Ok(Some(name));
        }
        let Some(domain_sid) = access.sid(dn).await? else {
            return Ok(None);
        };
        let group_filter = access.connection().configuration().group_filter.clone();
        let filter = combine_filter_with_and(&[
            group_filter,
            format!("objectsid={}-{}", domain_sid, group_id),
        ]);
        let records = access
            .search_groups(&filter, &["dn".to_string()], Some(1), 0)
            .await?;
        let Some(group) = records.first() else {
            return Ok(None);
        };
        let name = access.dn_to_groupname(group.dn(), None, None).await?;
        if let Some(name) = &name {
            access.connection().write_to_cache(&cache_key, name);
        }
        Ok(name)
    }

    /// filter matching the users which have the group as primary group
    async fn primary_group_users_filter(
        access: &mut Access,
        group_dn: &str,
        search: &str,
    ) -> Result<Option<String>, AccessError> {
        let Some(token) = access.read_first_string(group_dn, "primaryGroupToken").await? else {
            return Ok(None);
        };
        let mut parts = vec![access.filter_for_user_count()];
        if !search.is_empty() {
            parts.push(access.filter_part_for_user_search(search));
        }
        parts.push(format!("primaryGroupID={}", token));
        Ok(Some(combine_filter_with_and(&parts)))
    }

    /// the internal names of the users having the group as primary group
    async fn users_in_primary_group(
        access: &mut Access,
        group_dn: &str,
        search: &str,
    ) -> Result<Vec<String>, AccessError> {
        let Some(filter) = Self::primary_group_users_filter(access, group_dn, search).await? else {
            return Ok(Vec::new());
        };
        let attributes = user_attributes(access);
        let records = access.fetch_list_of_users(&filter, &attributes, None, 0).await?;
        access.internal_user_names(&records).await
    }

    /// the number of users having the group as primary group
    async fn count_users_in_primary_group(
        access: &mut Access,
        group_dn: &str,
        search: &str,
    ) -> Result<usize, AccessError> {
        let Some(filter) = Self::primary_group_users_filter(access, group_dn, search).await? else {
            return Ok(0);
        };
        Ok(access.count_users(&filter, None, 0).await?.unwrap_or(0))
    }

    /// the internal name of a member which matches the search, `None` for
    /// members which are no (visible) users
    async fn member_user_name(
        access: &mut Access,
        member: &str,
        search: &str,
    ) -> Result<Option<String>, AccessError> {
        if member_assoc_attribute(access) == MEMBER_UID {
            let login_filter = access.connection().configuration().login_filter.clone();
            let mut parts = vec![login_filter.replace("%uid", &escape_filter_part(member.trim(), false))];
            if !search.is_empty() {
                parts.push(access.filter_part_for_user_search(search));
            }
            let filter = combine_filter_with_and(&parts);
            let attributes = user_attributes(access);
            let records = access.fetch_list_of_users(&filter, &attributes, Some(1), 0).await?;
            let Some(record) = records.first() else {
                return Ok(None);
            };
            return access.dn_to_username(record.dn(), None, Some(record)).await;
        }
        if !search.is_empty() {
            let display_attribute = access.connection().configuration().user_display_name.clone();
            let filter = access.filter_part_for_user_search(search);
            if access
                .read_attribute(member, &display_attribute, Some(filter.as_str()))
                .await?
                .is_none()
            {
                return Ok(None);
            }
        }
        access.dn_to_username(member, None, None).await
    }

    /// the internal names of the members of a group matching the search,
    /// sorted naturally
    #[instrument(skip(self))]
    pub async fn users_in_group(
        &self,
        gid: &str,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<String>, AccessError> {
        let mut access = self.access.lock().await;
        if !is_enabled(&access) || !Self::group_exists_with(&mut access, gid).await? {
            return Ok(Vec::new());
        }
        let search = escape_filter_part(search, true);
        let exact_key = format!("usersInGroup-{}-{}-{:?}-{}", gid, search, limit, offset);
        if let Some(names) = access.connection().get_from_cache::<Vec<String>>(&exact_key) {
            return Ok(names);
        }
        let window = |names: Vec<String>| -> Vec<String> {
            names
                .into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .collect()
        };
        let full_key = format!("usersInGroup-{}-{}", gid, search);
        if let Some(names) = access.connection().get_from_cache::<Vec<String>>(&full_key) {
            let names = window(names);
            access.connection().write_to_cache(&exact_key, &names);
            return Ok(names);
        }

        let Some(group_dn) = access.groupname_to_dn(gid).await else {
            access.connection().write_to_cache(&exact_key, &Vec::<String>::new());
            return Ok(Vec::new());
        };
        let primary_users = Self::users_in_primary_group(&mut access, &group_dn, &search).await?;
        let members = self.group_members(&mut access, &group_dn).await?;
        if members.is_empty() && primary_users.is_empty() {
            access.connection().write_to_cache(&exact_key, &Vec::<String>::new());
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for member in &members {
            if let Some(name) = Self::member_user_name(&mut access, member, &search).await? {
                names.push(name);
            }
        }
        names.extend(primary_users);
        names.sort_by(|a, b| natural_cmp(a, b));
        names.dedup();
        access.connection().write_to_cache(&full_key, &names);
        let names = window(names);
        access.connection().write_to_cache(&exact_key, &names);
        Ok(names)
    }

    /// the number of members of a group matching the search, `None` if the
    /// group does not exist or has no members
    #[instrument(skip(self))]
    pub async fn count_users_in_group(
        &self,
        gid: &str,
        search: &str,
    ) -> Result<Option<usize>, AccessError> {
        let mut access = self.access.lock().await;
        if !is_enabled(&access) || !Self::group_exists_with(&mut access, gid).await? {
            return Ok(None);
        }
        let search = escape_filter_part(search, true);
        let cache_key = format!("countUsersInGroup-{}-{}", gid, search);
        if let Some(count) = access.connection().get_from_cache::<Option<usize>>(&cache_key) {
            return Ok(count);
        }
        let Some(group_dn) = access.groupname_to_dn(gid).await else {
            access.connection().write_to_cache(&cache_key, &None::<usize>);
            return Ok(None);
        };
        let members = self.group_members(&mut access, &group_dn).await?;
        let primary_users = Self::count_users_in_primary_group(&mut access, &group_dn, "").await?;
        if members.is_empty() && primary_users == 0 {
            access.connection().write_to_cache(&cache_key, &None::<usize>);
            return Ok(None);
        }
        if search.is_empty() {
            let count = members.len() + primary_users;
            access.connection().write_to_cache(&cache_key, &Some(count));
            return Ok(Some(count));
        }

        let mut count = 0;
        for member in &members {
            if Self::member_user_name(&mut access, member, &search).await?.is_some() {
                count += 1;
            }
        }
        count += Self::count_users_in_primary_group(&mut access, &group_dn, &search).await?;
        Ok(Some(count))
    }

    /// the names of the groups the user is member of
    #[instrument(skip(self))]
    pub async fn get_user_groups(&self, uid: &str) -> Result<Vec<String>, AccessError> {
        let mut access = self.access.lock().await;
        if !is_enabled(&access) {
            return Ok(Vec::new());
        }
        let cache_key = format!("getUserGroups{}", uid);
        if let Some(groups) = access.connection().get_from_cache::<Vec<String>>(&cache_key) {
            return Ok(groups);
        }
        let Some(user_dn) = access.username_to_dn(uid).await else {
            access.connection().write_to_cache(&cache_key, &Vec::<String>::new());
            return Ok(Vec::new());
        };

        let mut groups = Vec::new();
        let primary_group = self.user_primary_group(&mut access, &user_dn).await?;
        groups.extend(Self::dynamic_groups_of(&mut access, &user_dn).await?);

        let (assoc, use_member_of) = {
            let configuration = access.connection().configuration();
            (
                member_assoc_attribute(&access),
                configuration.has_member_of_filter_support
                    && configuration.use_member_of_to_detect_membership,
            )
        };
        if use_member_of && assoc != MEMBER_UID {
            let group_dns = self.group_dns_from_member_of(&mut access, &user_dn).await?;
            for group_dn in group_dns {
                if let Some(name) = access.dn_to_groupname(&group_dn, None, None).await? {
                    groups.push(name);
                }
            }
        } else {
            let member_id = if assoc == MEMBER_UID {
                access.read_first_string(&user_dn, "uid").await?
            } else {
                Some(user_dn.clone())
            };
            match member_id {
                Some(member_id) => {
                    let known = self.caches().groups_by_member.get(&member_id).cloned();
                    let names = match known {
                        Some(names) => names,
                        None => {
                            let records = Self::groups_by_member(&mut access, &member_id).await?;
                            let names = access.internal_group_names(&records).await?;
                            self.caches()
                                .groups_by_member
                                .insert(member_id, names.clone());
                            names
                        }
                    };
                    groups.extend(names);
                }
                None => tracing::debug!("No uid found for {}, skipping member lookup", user_dn),
            }
        }
        groups.extend(primary_group);

        let groups: Vec<String> = groups.into_iter().unique().collect();
        access.connection().write_to_cache(&cache_key, &groups);
        Ok(groups)
    }

    /// the names of the dynamic groups whose member URL matches the user
    async fn dynamic_groups_of(
        access: &mut Access,
        user_dn: &str,
    ) -> Result<Vec<String>, AccessError> {
        let (url_attribute, group_filter, display_attribute) = {
            let configuration = access.connection().configuration();
            (
                configuration.dynamic_group_member_url.to_lowercase(),
                configuration.group_filter.clone(),
                configuration.user_display_name.clone(),
            )
        };
        if url_attribute.is_empty() {
            return Ok(Vec::new());
        }
        let attributes = vec!["dn".to_string(), url_attribute.clone()];
        let dynamic_groups = access
            .fetch_list_of_groups(&group_filter, &attributes, None, 0)
            .await?;
        let mut names = Vec::new();
        for group in &dynamic_groups {
            let Some(url) = group.first_string(&url_attribute) else {
                continue;
            };
            let Some(filter) = member_url_filter(&url) else {
                tracing::debug!("No search filter found on member url of group {}", group.dn());
                continue;
            };
            if access
                .read_attribute(user_dn, &display_attribute, Some(filter))
                .await?
                .is_none()
            {
                continue;
            }
            if let Some(name) = access.dn_to_groupname(group.dn(), None, None).await? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// the names of the groups matching the search
    #[instrument(skip(self))]
    pub async fn get_groups(
        &self,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<String>, AccessError> {
        let mut access = self.access.lock().await;
        if !is_enabled(&access) {
            return Ok(Vec::new());
        }
        let search = escape_filter_part(search, true);
        let paging_size = access.connection().configuration().paging_size as usize;
        if paging_size == 0 {
            return Self::groups_chunk(&mut access, &search, limit, offset).await;
        }
        let overall_limit = limit.map_or(MAX_GROUPS, |limit| (limit + offset).min(MAX_GROUPS));
        let mut chunk_offset = offset;
        let mut groups = Vec::new();
        while chunk_offset < overall_limit {
            let chunk_limit = paging_size.min(overall_limit - chunk_offset);
            let chunk = Self::groups_chunk(&mut access, &search, Some(chunk_limit), chunk_offset).await?;
            let found = chunk.len();
            tracing::debug!("{} groups in chunk at offset {}", found, chunk_offset);
            groups.extend(chunk);
            chunk_offset += found;
            if found < chunk_limit {
                break;
            }
        }
        Ok(groups)
    }

    /// one page of [GroupLdap::get_groups]
    async fn groups_chunk(
        access: &mut Access,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<String>, AccessError> {
        let cache_key = format!("getGroups-{}-{:?}-{}", search, limit, offset);
        if let Some(names) = access.connection().get_from_cache::<Vec<String>>(&cache_key) {
            return Ok(names);
        }
        let (group_filter, display_attribute) = {
            let configuration = access.connection().configuration();
            (
                configuration.group_filter.clone(),
                configuration.group_display_name.to_lowercase(),
            )
        };
        let filter = combine_filter_with_and(&[group_filter, access.filter_part_for_group_search(search)]);
        tracing::debug!("getGroups filter {}", filter);
        let attributes = vec![display_attribute, "dn".to_string()];
        let records = access
            .fetch_list_of_groups(&filter, &attributes, limit, offset)
            .await?;
        let names = access.internal_group_names(&records).await?;
        access.connection().write_to_cache(&cache_key, &names);
        Ok(names)
    }

    /// the group is mapped and its entry still exists
    #[instrument(skip(self))]
    pub async fn group_exists(&self, gid: &str) -> Result<bool, AccessError> {
        let mut access = self.access.lock().await;
        Self::group_exists_with(&mut access, gid).await
    }

    /// [GroupLdap::group_exists] on an already locked access
    async fn group_exists_with(access: &mut Access, gid: &str) -> Result<bool, AccessError> {
        let cache_key = format!("groupExists{}", gid);
        if let Some(exists) = access.connection().get_from_cache::<bool>(&cache_key) {
            return Ok(exists);
        }
        let Some(dn) = access.groupname_to_dn(gid).await else {
            access.connection().write_to_cache(&cache_key, &false);
            return Ok(false);
        };
        let exists = access.read_attribute(&dn, "", None).await?.is_some();
        access.connection().write_to_cache(&cache_key, &exists);
        Ok(exists)
    }

    /// the display name of a group
    pub async fn get_display_name(&self, gid: &str) -> Result<Option<String>, AccessError> {
        let mut access = self.access.lock().await;
        let cache_key = format!("group_getDisplayName{}", gid);
        if let Some(display_name) = access.connection().get_from_cache::<String>(&cache_key) {
            return Ok(Some(display_name));
        }
        let Some(dn) = access.groupname_to_dn(gid).await else {
            return Ok(None);
        };
        let display_attribute = access.connection().configuration().group_display_name.clone();
        let display_name = access.read_first_string(&dn, &display_attribute).await?;
        if let Some(display_name) = &display_name {
            access.connection().write_to_cache(&cache_key, display_name);
        }
        Ok(display_name)
    }
}
