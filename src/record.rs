//! the directory entry as returned from a search or read

use std::collections::BTreeMap;

use unicase::UniCase;

/// a single directory entry, attribute names are compared case-insensitively
///
/// the `dn` attribute is always present as a list of exactly one value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// the distinguished name of the entry
    dn: String,
    /// the attribute values, text and binary attributes alike
    attributes: BTreeMap<UniCase<String>, Vec<Vec<u8>>>,
}

impl DirectoryRecord {
    /// create a record with no attributes except for the `dn`
    pub fn new(dn: impl Into<String>) -> Self {
        let dn = dn.into();
        let mut attributes = BTreeMap::new();
        attributes.insert(UniCase::new("dn".to_string()), vec![dn.as_bytes().to_vec()]);
        Self { dn, attributes }
    }

    /// builder style helper to add an attribute with text values
    pub fn with_attribute<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(
            name,
            values
                .into_iter()
                .map(|v| v.as_ref().as_bytes().to_vec())
                .collect(),
        );
        self
    }

    /// builder style helper to add an attribute with binary values
    pub fn with_binary_attribute(mut self, name: &str, values: Vec<Vec<u8>>) -> Self {
        self.insert(name, values);
        self
    }

    /// set the values of an attribute, replacing any previous values
    ///
    /// the `dn` can not be replaced this way
    pub fn insert(&mut self, name: &str, values: Vec<Vec<u8>>) {
        if name.eq_ignore_ascii_case("dn") {
            return;
        }
        self.attributes.insert(UniCase::new(name.to_string()), values);
    }

    /// the distinguished name
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// raw values of the attribute
    pub fn get(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .get(&UniCase::new(name.to_string()))
            .map(|v| v.as_slice())
    }

    /// values of the attribute, decoded lossily as UTF-8
    pub fn strings(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
    }

    /// the first value of the attribute as a string, if it is not empty
    pub fn first_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|values| values.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .filter(|v| !v.is_empty())
    }

    /// check if the record has the attribute
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(&UniCase::new(name.to_string()))
    }

    /// names of all attributes, including `dn`
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|k| k.as_str())
    }

    /// iterate over all attributes and their values
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl From<ldap3::SearchEntry> for DirectoryRecord {
    fn from(entry: ldap3::SearchEntry) -> Self {
        let mut record = DirectoryRecord::new(entry.dn);
        for (name, values) in entry.attrs {
            record.insert(
                &name,
                values.into_iter().map(|v| v.into_bytes()).collect(),
            );
        }
        for (name, values) in entry.bin_attrs {
            let merged = match record.get(&name) {
                Some(existing) => existing.iter().cloned().chain(values).collect(),
                None => values,
            };
            record.insert(&name, merged);
        }
        record
    }
}
