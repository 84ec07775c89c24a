//! an in-memory directory server with a scriptable behaviour for the tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::access::Access;
use crate::cache::MemoryCache;
use crate::configuration::Configuration;
use crate::connection::Connection;
use crate::error::DirectoryError;
use crate::host::MemoryIdentityHost;
use crate::mapping::MemoryMapping;
use crate::record::DirectoryRecord;
use crate::wrapper::{ConnectSettings, LdapSession, LdapWrapper, SearchResponse, SearchScope};

/// base DN of the test directory
pub const BASE: &str = "dc=example,dc=com";
/// base DN of the users
pub const USERS: &str = "ou=users,dc=example,dc=com";
/// base DN of the groups
pub const GROUPS: &str = "ou=groups,dc=example,dc=com";
/// the agent the test configuration binds as
pub const AGENT: &str = "cn=admin,dc=example,dc=com";

/// a search as the server received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// search base
    pub base: String,
    /// scope
    pub scope: SearchScope,
    /// filter
    pub filter: String,
    /// requested attributes
    pub attributes: Vec<String>,
    /// page size of the paged results control, if one was sent
    pub page_size: Option<i32>,
    /// cookie of the paged results control
    pub cookie: Vec<u8>,
}

/// the shared server state
#[derive(Debug, Default)]
struct FakeState {
    /// the entries
    entries: Vec<DirectoryRecord>,
    /// passwords by lower case DN
    passwords: HashMap<String, String>,
    /// hosts which refuse connections
    down_hosts: HashSet<String>,
    /// hosts which accept connections but fail to set them up
    broken_hosts: HashSet<String>,
    /// every URL a connection was attempted to
    connected_urls: Vec<String>,
    /// every search received
    searches: Vec<SearchRequest>,
    /// number of upcoming searches failing as if the server went away
    fail_searches: usize,
    /// answer paged searches with all entries and no cookie
    ignore_paging: bool,
    /// number of values per range of multi valued attributes
    range_chunk: Option<usize>,
    /// responses returned instead of evaluating searches
    scripted_pages: VecDeque<SearchResponse>,
}

/// an in-memory directory server, clones share the same state
#[derive(Debug, Clone)]
pub struct FakeDirectory {
    /// the state shared with all sessions
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        let directory = Self {
            state: Arc::new(Mutex::new(FakeState::default())),
        };
        directory.set_password(AGENT, "secret");
        directory
    }
}

impl FakeDirectory {
    /// lock the state
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// add an entry
    pub fn add_entry(&self, record: DirectoryRecord) {
        self.state().entries.push(record);
    }

    /// remove an entry
    pub fn remove_entry(&self, dn: &str) {
        self.state().entries.retain(|e| !e.dn().eq_ignore_ascii_case(dn));
    }

    /// move an entry to a new DN keeping its attributes
    pub fn rename_entry(&self, dn: &str, new_dn: &str) {
        let mut state = self.state();
        for entry in state.entries.iter_mut() {
            if entry.dn().eq_ignore_ascii_case(dn) {
                let mut renamed = DirectoryRecord::new(new_dn);
                for (name, values) in entry.iter() {
                    renamed.insert(name, values.to_vec());
                }
                *entry = renamed;
            }
        }
    }

    /// set the password of a DN
    pub fn set_password(&self, dn: &str, password: &str) {
        self.state()
            .passwords
            .insert(dn.to_lowercase(), password.to_string());
    }

    /// make a host refuse or accept connections
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut state = self.state();
        if down {
            state.down_hosts.insert(host.to_string());
        } else {
            state.down_hosts.remove(host);
        }
    }

    /// make a host fail connections with an error other than being unavailable
    pub fn set_host_broken(&self, host: &str, broken: bool) {
        let mut state = self.state();
        if broken {
            state.broken_hosts.insert(host.to_string());
        } else {
            state.broken_hosts.remove(host);
        }
    }

    /// URLs connections were attempted to
    pub fn connected_urls(&self) -> Vec<String> {
        self.state().connected_urls.clone()
    }

    /// number of connection attempts
    pub fn connect_count(&self) -> usize {
        self.state().connected_urls.len()
    }

    /// the searches received so far
    pub fn searches(&self) -> Vec<SearchRequest> {
        self.state().searches.clone()
    }

    /// forget the searches received so far
    pub fn clear_searches(&self) {
        self.state().searches.clear();
    }

    /// let the next searches fail as if the connection was lost
    pub fn fail_next_searches(&self, count: usize) {
        self.state().fail_searches = count;
    }

    /// behave like a server without paged results support
    pub fn set_ignore_paging(&self, ignore: bool) {
        self.state().ignore_paging = ignore;
    }

    /// return multi valued attributes in ranges of this size
    pub fn set_range_chunk(&self, chunk: Option<usize>) {
        self.state().range_chunk = chunk;
    }

    /// answer the next searches with these responses
    pub fn script_pages(&self, pages: Vec<SearchResponse>) {
        self.state().scripted_pages.extend(pages);
    }
}

#[async_trait]
impl LdapWrapper for FakeDirectory {
    async fn connect(
        &self,
        url: &str,
        _settings: &ConnectSettings,
    ) -> Result<Box<dyn LdapSession>, DirectoryError> {
        let mut state = self.state();
        state.connected_urls.push(url.to_string());
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.rsplit_once(':').map(|(host, _)| host))
            .unwrap_or(url);
        if state.down_hosts.contains(host) {
            return Err(DirectoryError::ServerUnavailable(format!(
                "can't contact {}",
                host
            )));
        }
        if state.broken_hosts.contains(host) {
            return Err(DirectoryError::IOError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("TLS handshake with {} failed", host),
            )));
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            paged: None,
        }))
    }
}

/// a session of the [FakeDirectory]
#[derive(Debug)]
struct FakeSession {
    /// the server state
    state: Arc<Mutex<FakeState>>,
    /// page size and cookie for the next search
    paged: Option<(i32, Vec<u8>)>,
}

#[async_trait]
impl LdapSession for FakeSession {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, DirectoryError> {
        if dn.is_empty() && password.is_empty() {
            return Ok(true);
        }
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(!password.is_empty()
            && state.passwords.get(&dn.to_lowercase()).map(String::as_str) == Some(password))
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Option<SearchResponse>, DirectoryError> {
        let paged = self.paged.take();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.searches.push(SearchRequest {
            base: base.to_string(),
            scope,
            filter: filter.to_string(),
            attributes: attributes.to_vec(),
            page_size: paged.as_ref().map(|(size, _)| *size),
            cookie: paged.as_ref().map(|(_, c)| c.clone()).unwrap_or_default(),
        });
        if state.fail_searches > 0 {
            state.fail_searches -= 1;
            return Err(DirectoryError::ServerUnavailable("connection lost".to_string()));
        }
        if let Some(page) = state.scripted_pages.pop_front() {
            return Ok(Some(page));
        }
        let Some(filter) = FilterNode::parse(filter) else {
            return Ok(None);
        };
        let base = base.to_lowercase();
        let matching: Vec<DirectoryRecord> = state
            .entries
            .iter()
            .filter(|entry| {
                let dn = entry.dn().to_lowercase();
                match scope {
                    SearchScope::Base => dn == base,
                    SearchScope::OneLevel => dn
                        .split_once(',')
                        .is_some_and(|(_, parent)| parent == base),
                    SearchScope::Subtree => dn == base || dn.ends_with(&format!(",{}", base)),
                }
            })
            .filter(|entry| filter.matches(entry))
            .map(|entry| project(entry, attributes, state.range_chunk))
            .collect();
        match paged {
            Some((size, cookie)) if size > 0 && !state.ignore_paging => {
                let start = std::str::from_utf8(&cookie)
                    .ok()
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(matching.len());
                let end = (start + size as usize).min(matching.len());
                let next = if end < matching.len() {
                    end.to_string().into_bytes()
                } else {
                    Vec::new()
                };
                Ok(Some(SearchResponse {
                    entries: matching[start..end].to_vec(),
                    cookie: Some(next),
                }))
            }
            _ => Ok(Some(SearchResponse {
                entries: matching,
                cookie: None,
            })),
        }
    }

    fn control_paged_result(&mut self, page_size: i32, _critical: bool, cookie: &[u8]) -> bool {
        self.paged = if page_size > 0 {
            Some((page_size, cookie.to_vec()))
        } else {
            None
        };
        true
    }

    async fn unbind(&mut self) {}
}

/// the requested attributes of an entry, multi valued attributes split into
/// ranges if configured
fn project(entry: &DirectoryRecord, attributes: &[String], range_chunk: Option<usize>) -> DirectoryRecord {
    let mut projected = DirectoryRecord::new(entry.dn());
    if attributes.is_empty() || attributes.iter().any(|a| a == "*") {
        for (name, values) in entry.iter() {
            projected.insert(name, values.to_vec());
        }
        return projected;
    }
    let chunk = range_chunk.unwrap_or(usize::MAX);
    for attribute in attributes {
        if attribute == "1.1" {
            continue;
        }
        if let Some((name, range)) = attribute.split_once(";range=") {
            let start: usize = range
                .split('-')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let Some(values) = entry.get(name) else { continue };
            let start = start.min(values.len());
            let end = start.saturating_add(chunk).min(values.len());
            let key = if end >= values.len() {
                format!("{};range={}-*", name, start)
            } else {
                format!("{};range={}-{}", name, start, end - 1)
            };
            projected.insert(&key, values[start..end].to_vec());
            continue;
        }
        let Some(values) = entry.get(attribute) else { continue };
        if values.len() > chunk {
            projected.insert(
                &format!("{};range=0-{}", attribute, chunk - 1),
                values[..chunk].to_vec(),
            );
        } else {
            projected.insert(attribute, values.to_vec());
        }
    }
    projected
}

/// a parsed search filter
#[derive(Debug)]
enum FilterNode {
    /// all children match
    And(Vec<FilterNode>),
    /// any child matches
    Or(Vec<FilterNode>),
    /// the child does not match
    Not(Box<FilterNode>),
    /// the attribute is present
    Present(String),
    /// equality or substring match, the parts are separated by wildcards
    Value(String, Vec<Vec<u8>>),
}

impl FilterNode {
    /// parse a complete filter
    fn parse(filter: &str) -> Option<FilterNode> {
        let chars: Vec<char> = filter.trim().chars().collect();
        let (node, rest) = Self::parse_node(&chars)?;
        rest.is_empty().then_some(node)
    }

    /// parse one parenthesized filter, returns the remaining input
    fn parse_node(input: &[char]) -> Option<(FilterNode, &[char])> {
        let (first, mut rest) = input.split_first()?;
        if *first != '(' {
            return None;
        }
        match rest.first()? {
            '&' | '|' => {
                let operator = rest[0];
                rest = &rest[1..];
                let mut children = Vec::new();
                while rest.first() == Some(&'(') {
                    let (child, remaining) = Self::parse_node(rest)?;
                    children.push(child);
                    rest = remaining;
                }
                let (closing, rest) = rest.split_first()?;
                if *closing != ')' {
                    return None;
                }
                let node = if operator == '&' {
                    FilterNode::And(children)
                } else {
                    FilterNode::Or(children)
                };
                Some((node, rest))
            }
            '!' => {
                let (child, rest) = Self::parse_node(&rest[1..])?;
                let (closing, rest) = rest.split_first()?;
                if *closing != ')' {
                    return None;
                }
                Some((FilterNode::Not(Box::new(child)), rest))
            }
            _ => {
                let mut item = String::new();
                let mut index = 0;
                while index < rest.len() && rest[index] != ')' {
                    if rest[index] == '\\' && index + 1 < rest.len() {
                        item.push(rest[index]);
                        index += 1;
                    }
                    item.push(rest[index]);
                    index += 1;
                }
                if index >= rest.len() {
                    return None;
                }
                let (attribute, value) = item.split_once('=')?;
                let node = if value == "*" {
                    FilterNode::Present(attribute.to_lowercase())
                } else {
                    FilterNode::Value(attribute.to_lowercase(), split_value(value))
                };
                Some((node, &rest[index + 1..]))
            }
        }
    }

    /// evaluate the filter against an entry
    fn matches(&self, entry: &DirectoryRecord) -> bool {
        match self {
            FilterNode::And(children) => children.iter().all(|c| c.matches(entry)),
            FilterNode::Or(children) => children.iter().any(|c| c.matches(entry)),
            FilterNode::Not(child) => !child.matches(entry),
            FilterNode::Present(attribute) if attribute == "objectclass" => true,
            FilterNode::Present(attribute) => entry.contains(attribute),
            FilterNode::Value(attribute, parts) => entry
                .get(attribute)
                .is_some_and(|values| values.iter().any(|v| value_matches(&v.to_ascii_lowercase(), parts))),
        }
    }
}

/// unescape a filter value and split it at unescaped wildcards
fn split_value(value: &str) -> Vec<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut parts = vec![Vec::new()];
    let mut index = 0;
    while index < bytes.len() {
        let current = parts.len() - 1;
        match bytes[index] {
            b'*' => parts.push(Vec::new()),
            b'\\' if bytes
                .get(index + 1..index + 3)
                .is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit)) =>
            {
                let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).unwrap_or("00");
                parts[current].push(u8::from_str_radix(hex, 16).unwrap_or(0));
                index += 2;
            }
            b'\\' if index + 1 < bytes.len() => {
                parts[current].push(bytes[index + 1]);
                index += 1;
            }
            byte => parts[current].push(byte),
        }
        index += 1;
    }
    parts
        .into_iter()
        .map(|p| p.to_ascii_lowercase())
        .collect()
}

/// match a lower case value against the parts of an equality or substring filter
fn value_matches(value: &[u8], parts: &[Vec<u8>]) -> bool {
    if parts.len() == 1 {
        return value == parts[0].as_slice();
    }
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };
    let Some(mut remaining) = value.strip_prefix(first.as_slice()) else {
        return false;
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return true,
    };
    for part in middle {
        if part.is_empty() {
            continue;
        }
        match remaining.windows(part.len()).position(|w| w == part.as_slice()) {
            Some(position) => remaining = &remaining[position + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// a configuration matching the test directory
pub fn test_configuration() -> Configuration {
    Configuration {
        host: "ldap.example.com".to_string(),
        port: 389,
        agent_name: AGENT.to_string(),
        agent_password: "secret".to_string(),
        base: vec![BASE.to_string()],
        base_users: vec![USERS.to_string()],
        base_groups: vec![GROUPS.to_string()],
        user_filter: "(objectclass=inetorgperson)".to_string(),
        login_filter: "(&(objectclass=inetorgperson)(uid=%uid))".to_string(),
        group_filter: "(objectclass=groupofnames)".to_string(),
        user_display_name: "displayname".to_string(),
        group_display_name: "cn".to_string(),
        group_member_assoc_attribute: "member".to_string(),
        cache_ttl: 600,
        paging_size: 500,
        configuration_active: true,
        ..Default::default()
    }
}

/// the DN of a test user
pub fn user_dn(uid: &str) -> String {
    format!("uid={},{}", uid, USERS)
}

/// the DN of a test group
pub fn group_dn(cn: &str) -> String {
    format!("cn={},{}", cn, GROUPS)
}

/// a user entry
pub fn user_record(uid: &str, display_name: &str, uuid: &str) -> DirectoryRecord {
    DirectoryRecord::new(user_dn(uid))
        .with_attribute("objectClass", ["top", "inetOrgPerson"])
        .with_attribute("uid", [uid])
        .with_attribute("cn", [display_name])
        .with_attribute("displayName", [display_name])
        .with_attribute("entryUUID", [uuid])
}

/// a group entry with the given member DNs
pub fn group_record(cn: &str, members: &[String], uuid: &str) -> DirectoryRecord {
    DirectoryRecord::new(group_dn(cn))
        .with_attribute("objectClass", ["top", "groupOfNames"])
        .with_attribute("cn", [cn])
        .with_attribute("member", members)
        .with_attribute("entryUUID", [uuid])
}

/// an [Access] on the fake directory and the collaborators it was built from
#[derive(Debug)]
pub struct TestBed {
    /// the access under test
    pub access: Access,
    /// the user mapping
    pub users: Arc<MemoryMapping>,
    /// the group mapping
    pub groups: Arc<MemoryMapping>,
    /// the host
    pub host: Arc<MemoryIdentityHost>,
    /// the cache
    pub cache: Arc<MemoryCache>,
}

/// build an [Access] for the configuration on the fake directory
pub fn test_bed_with(directory: &FakeDirectory, configuration: Configuration) -> TestBed {
    test_bed_for_prefix(directory, "s01", configuration, Arc::new(MemoryCache::default()))
}

/// build an [Access] with its own configuration prefix on a given cache
pub fn test_bed_for_prefix(
    directory: &FakeDirectory,
    prefix: &str,
    configuration: Configuration,
    cache: Arc<MemoryCache>,
) -> TestBed {
    let users = Arc::new(MemoryMapping::default());
    let groups = Arc::new(MemoryMapping::default());
    let host = Arc::new(MemoryIdentityHost::default());
    let connection = Connection::new(prefix, configuration, Arc::new(directory.clone()), cache.clone());
    let access = Access::new(connection, users.clone(), groups.clone(), host.clone());
    TestBed {
        access,
        users,
        groups,
        host,
        cache,
    }
}

/// build an [Access] with the test configuration on the fake directory
pub fn test_bed(directory: &FakeDirectory) -> TestBed {
    test_bed_with(directory, test_configuration())
}
