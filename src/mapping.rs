//! the persistent table mapping directory entries to internal names

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// one row of the mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// the sanitized DN of the entry
    pub dn: String,
    /// the internal name, unique
    pub name: String,
    /// the UUID of the entry
    pub uuid: String,
}

/// storage of the mapping between DNs, UUIDs and internal names
///
/// names and DNs are unique, [IdentityMapper::map] is the place where that
/// is enforced and returns false if either is already taken
#[async_trait]
pub trait IdentityMapper: Send + Sync + std::fmt::Debug {
    /// the internal name mapped to the DN
    async fn name_by_dn(&self, dn: &str) -> Option<String>;
    /// the internal name mapped to the UUID
    async fn name_by_uuid(&self, uuid: &str) -> Option<String>;
    /// the DN mapped to the internal name
    async fn dn_by_name(&self, name: &str) -> Option<String>;
    /// the UUID mapped to the DN
    async fn uuid_by_dn(&self, dn: &str) -> Option<String>;
    /// update the DN of the entry with the UUID, e.g. after a rename in the
    /// directory
    async fn set_dn_by_uuid(&self, dn: &str, uuid: &str) -> bool;
    /// add a new mapping
    async fn map(&self, dn: &str, name: &str, uuid: &str) -> bool;
    /// the names mapped to any of the DNs, by DN
    async fn list_of_ids_by_dn(&self, dns: &[String]) -> HashMap<String, String>;
    /// names matching a pattern where `%` matches any number of characters
    /// and `_` exactly one
    async fn names_by_search(&self, pattern: &str) -> Vec<String>;
    /// number of mappings
    async fn count(&self) -> usize;
}

/// an [IdentityMapper] in memory
#[derive(Debug, Default)]
pub struct MemoryMapping {
    /// the mapping rows
    entries: Mutex<Vec<MappingEntry>>,
}

impl MemoryMapping {
    /// lock the rows
    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<MappingEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// all rows
    pub fn all(&self) -> Vec<MappingEntry> {
        self.entries().clone()
    }
}

/// match a string against a `LIKE` pattern
fn like(pattern: &[char], value: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => (0..=value.len()).any(|skip| like(rest, &value[skip..])),
        Some(('_', rest)) => !value.is_empty() && like(rest, &value[1..]),
        Some((c, rest)) => value.first() == Some(c) && like(rest, &value[1..]),
    }
}

#[async_trait]
impl IdentityMapper for MemoryMapping {
    async fn name_by_dn(&self, dn: &str) -> Option<String> {
        self.entries()
            .iter()
            .find(|e| e.dn == dn)
            .map(|e| e.name.clone())
    }

    async fn name_by_uuid(&self, uuid: &str) -> Option<String> {
        self.entries()
            .iter()
            .find(|e| e.uuid == uuid)
            .map(|e| e.name.clone())
    }

    async fn dn_by_name(&self, name: &str) -> Option<String> {
        self.entries()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.dn.clone())
    }

    async fn uuid_by_dn(&self, dn: &str) -> Option<String> {
        self.entries()
            .iter()
            .find(|e| e.dn == dn)
            .map(|e| e.uuid.clone())
    }

    async fn set_dn_by_uuid(&self, dn: &str, uuid: &str) -> bool {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.dn == dn && e.uuid != uuid) {
            return false;
        }
        match entries.iter_mut().find(|e| e.uuid == uuid) {
            Some(entry) => {
                entry.dn = dn.to_string();
                true
            }
            None => false,
        }
    }

    async fn map(&self, dn: &str, name: &str, uuid: &str) -> bool {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.name == name || e.dn == dn) {
            return false;
        }
        entries.push(MappingEntry {
            dn: dn.to_string(),
            name: name.to_string(),
            uuid: uuid.to_string(),
        });
        true
    }

    async fn list_of_ids_by_dn(&self, dns: &[String]) -> HashMap<String, String> {
        self.entries()
            .iter()
            .filter(|e| dns.contains(&e.dn))
            .map(|e| (e.dn.clone(), e.name.clone()))
            .collect()
    }

    async fn names_by_search(&self, pattern: &str) -> Vec<String> {
        let pattern: Vec<char> = pattern.chars().collect();
        self.entries()
            .iter()
            .filter(|e| like(&pattern, &e.name.chars().collect::<Vec<_>>()))
            .map(|e| e.name.clone())
            .collect()
    }

    async fn count(&self) -> usize {
        self.entries().len()
    }
}
