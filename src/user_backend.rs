//! the user backend on top of an [Access]

use std::path::Path;

use tracing::instrument;

use crate::access::{Access, SharedAccess};
use crate::configuration::{UUID_ATTRIBUTES, UUID_AUTO};
use crate::error::AccessError;
use crate::filter::{combine_filter_with_and, escape_filter_part};

/// prefix of a home folder naming rule reading the folder from an attribute
const HOME_ATTRIBUTE_RULE_PREFIX: &str = "attr:";

/// users of one directory configuration
#[derive(Debug, Clone)]
pub struct UserLdap {
    /// the access to the directory
    access: SharedAccess,
}

/// the attributes fetched for user entries, everything the name resolution
/// and the display name need
pub(crate) fn user_attributes(access: &Access) -> Vec<String> {
    let configuration = access.connection().configuration();
    let mut attributes = vec!["dn".to_string(), configuration.user_display_name.to_lowercase()];
    for optional in [
        &configuration.user_display_name_2,
        &configuration.expert_username_attr,
        &configuration.expert_uuid_user_attr,
    ] {
        if !optional.is_empty() {
            attributes.push(optional.to_lowercase());
        }
    }
    let uuid_attribute = access.uuid_attribute(true);
    if uuid_attribute == UUID_AUTO {
        attributes.extend(UUID_ATTRIBUTES.iter().map(|a| a.to_string()));
    } else {
        attributes.push(uuid_attribute.to_string());
    }
    attributes.sort();
    attributes.dedup();
    attributes
}

impl UserLdap {
    /// create the backend
    pub fn new(access: SharedAccess) -> Self {
        Self { access }
    }

    /// the access this backend works on
    pub fn access(&self) -> &SharedAccess {
        &self.access
    }

    /// check a login name and password
    ///
    /// returns the internal name of the user if exactly one entry matches
    /// the login name and the password binds as it
    #[instrument(skip(self, password))]
    pub async fn check_password(
        &self,
        login_name: &str,
        password: &str,
    ) -> Result<Option<String>, AccessError> {
        let mut access = self.access.lock().await;
        let attributes = user_attributes(&access);
        let records = access.fetch_users_by_login_name(login_name, &attributes).await?;
        let [record] = records.as_slice() else {
            tracing::debug!("{} entries match the login name {}", records.len(), login_name);
            return Ok(None);
        };
        let Some(name) = access.dn_to_username(record.dn(), None, Some(record)).await? else {
            return Ok(None);
        };
        if !access.are_credentials_valid(record.dn(), password).await? {
            return Ok(None);
        }
        access
            .connection()
            .write_to_cache(&format!("userExists{}", name), &true);
        Ok(Some(name))
    }

    /// the user is mapped and its entry still exists
    ///
    /// an entry which was moved is found again by its UUID and the mapping
    /// follows it
    #[instrument(skip(self))]
    pub async fn user_exists(&self, name: &str) -> Result<bool, AccessError> {
        let mut access = self.access.lock().await;
        let cache_key = format!("userExists{}", name);
        if let Some(exists) = access.connection().get_from_cache::<bool>(&cache_key) {
            return Ok(exists);
        }
        let Some(dn) = access.username_to_dn(name).await else {
            access.connection().write_to_cache(&cache_key, &false);
            return Ok(false);
        };
        let exists = if access.read_attribute(&dn, "", None).await?.is_some() {
            true
        } else {
            Self::follow_moved_entry(&mut access, &dn).await?
        };
        access.connection().write_to_cache(&cache_key, &exists);
        Ok(exists)
    }

    /// look for the entry formerly at the DN by its UUID and update the
    /// mapping if it is found
    async fn follow_moved_entry(access: &mut Access, dn: &str) -> Result<bool, AccessError> {
        let Some(uuid) = access.user_mapper().uuid_by_dn(dn).await else {
            return Ok(false);
        };
        let new_dn = match access.user_dn_by_uuid(&uuid).await {
            Ok(new_dn) => new_dn,
            Err(AccessError::UuidAttributeUndetectable) => None,
            Err(err) => return Err(err),
        };
        let Some(new_dn) = new_dn else {
            tracing::debug!("Entry {} with UUID {} is gone", dn, uuid);
            return Ok(false);
        };
        tracing::info!("User {} moved to {}", dn, new_dn);
        Ok(access.user_mapper().set_dn_by_uuid(&new_dn, &uuid).await)
    }

    /// the internal names of the users matching the search term
    #[instrument(skip(self))]
    pub async fn get_users(
        &self,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<String>, AccessError> {
        let mut access = self.access.lock().await;
        let search = escape_filter_part(search, true);
        let cache_key = format!("getUsers-{}-{:?}-{}", search, limit, offset);
        if let Some(names) = access.connection().get_from_cache::<Vec<String>>(&cache_key) {
            return Ok(names);
        }
        let filter = {
            let configuration = access.connection().configuration();
            combine_filter_with_and(&[
                configuration.user_filter.clone(),
                format!("{}=*", configuration.user_display_name),
                access.filter_part_for_user_search(&search),
            ])
        };
        tracing::debug!("getUsers filter {}", filter);
        let attributes = user_attributes(&access);
        let records = access
            .fetch_list_of_users(&filter, &attributes, limit, offset)
            .await?;
        let names = access.internal_user_names(&records).await?;
        access.connection().write_to_cache(&cache_key, &names);
        Ok(names)
    }

    /// the display name of a user, with the second display name in
    /// parentheses if configured
    pub async fn get_display_name(&self, name: &str) -> Result<Option<String>, AccessError> {
        let mut access = self.access.lock().await;
        let cache_key = format!("getDisplayName{}", name);
        if let Some(display_name) = access.connection().get_from_cache::<String>(&cache_key) {
            return Ok(Some(display_name));
        }
        let Some(dn) = access.username_to_dn(name).await else {
            return Ok(None);
        };
        let (first, second) = {
            let configuration = access.connection().configuration();
            (
                configuration.user_display_name.clone(),
                configuration.user_display_name_2.clone(),
            )
        };
        let Some(display_name) = access.read_first_string(&dn, &first).await? else {
            return Ok(None);
        };
        let display_name = if second.is_empty() {
            display_name
        } else {
            match access.read_first_string(&dn, &second).await? {
                Some(second) => format!("{} ({})", display_name, second),
                None => display_name,
            }
        };
        access.connection().write_to_cache(&cache_key, &display_name);
        Ok(Some(display_name))
    }

    /// the home folder of a user if the naming rule reads it from an
    /// attribute; relative folders are placed in the data directory
    pub async fn get_home(&self, name: &str) -> Result<Option<String>, AccessError> {
        let mut access = self.access.lock().await;
        let (rule, data_directory) = {
            let configuration = access.connection().configuration();
            (
                configuration.home_folder_naming_rule.clone(),
                configuration.data_directory.clone(),
            )
        };
        let Some(attribute) = rule.strip_prefix(HOME_ATTRIBUTE_RULE_PREFIX) else {
            return Ok(None);
        };
        let cache_key = format!("getHome{}", name);
        if let Some(home) = access.connection().get_from_cache::<String>(&cache_key) {
            return Ok(Some(home));
        }
        let Some(dn) = access.username_to_dn(name).await else {
            return Ok(None);
        };
        let Some(path) = access.read_first_string(&dn, attribute).await? else {
            tracing::warn!("Home folder attribute {} of {} is empty", attribute, dn);
            return Ok(None);
        };
        let home = if Path::new(&path).is_absolute() {
            path
        } else {
            format!("{}/{}", data_directory.trim_end_matches('/'), path)
        };
        access.connection().write_to_cache(&cache_key, &home);
        Ok(Some(home))
    }

    /// number of users which have a display name
    pub async fn count_users(&self) -> Result<Option<usize>, AccessError> {
        let mut access = self.access.lock().await;
        let filter = access.filter_for_user_count();
        let cache_key = format!("countUsers-{}", filter);
        if let Some(count) = access.connection().get_from_cache::<usize>(&cache_key) {
            return Ok(Some(count));
        }
        let count = access.count_users(&filter, None, 0).await?;
        if let Some(count) = count {
            access.connection().write_to_cache(&cache_key, &count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::IdentityMapper;
    use crate::record::DirectoryRecord;
    use crate::test_directory::{test_bed_with, test_configuration, user_dn, user_record, FakeDirectory};

    /// a backend on a directory with two users, `roland` with a password
    fn backend(directory: &FakeDirectory) -> UserLdap {
        directory.add_entry(
            user_record("roland", "Roland Deschain", "uuid-roland")
                .with_attribute("mail", ["roland@example.com"])
                .with_attribute("homeDirectory", ["/home/roland"])
                .with_attribute("description", ["roland/"]),
        );
        directory.add_entry(user_record("eddie", "Eddie Dean", "uuid-eddie"));
        directory.set_password(&user_dn("roland"), "gunslinger");
        let mut configuration = test_configuration();
        configuration.expert_username_attr = "uid".to_string();
        configuration.data_directory = "/srv/data/".to_string();
        UserLdap::new(test_bed_with(directory, configuration).access.into_shared())
    }

    #[tokio::test]
    async fn password_is_checked_for_a_unique_login() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        assert_eq!(
            users.check_password("roland", "gunslinger").await.unwrap(),
            Some("roland".to_string())
        );
        assert_eq!(users.check_password("roland", "wrong").await.unwrap(), None);
        assert_eq!(users.check_password("nobody", "gunslinger").await.unwrap(), None);
        assert!(users.user_exists("roland").await.unwrap());
    }

    #[tokio::test]
    async fn ambiguous_logins_are_rejected() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        directory.add_entry(
            DirectoryRecord::new("uid=roland,ou=twins,ou=users,dc=example,dc=com")
                .with_attribute("objectClass", ["inetOrgPerson"])
                .with_attribute("uid", ["roland"]),
        );
        assert_eq!(users.check_password("roland", "gunslinger").await.unwrap(), None);
    }

    #[tokio::test]
    async fn users_are_listed_and_searched() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        let mut all = users.get_users("", None, 0).await.unwrap();
        all.sort();
        assert_eq!(all, vec!["eddie", "roland"]);
        assert_eq!(users.get_users("Rol", None, 0).await.unwrap(), vec!["roland"]);
        assert!(users.get_users("nix", None, 0).await.unwrap().is_empty());
        assert_eq!(users.get_users("", Some(1), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn moved_users_still_exist() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        assert_eq!(users.get_users("", None, 0).await.unwrap().len(), 2);
        directory.rename_entry(&user_dn("roland"), "uid=roland,ou=staff,ou=users,dc=example,dc=com");
        {
            let access = users.access().lock().await;
            access.connection().clear_cache();
        }
        assert!(users.user_exists("roland").await.unwrap());
        let access = users.access().lock().await;
        assert_eq!(
            access.user_mapper().dn_by_name("roland").await,
            Some("uid=roland,ou=staff,ou=users,dc=example,dc=com".to_string())
        );
    }

    #[tokio::test]
    async fn deleted_and_unknown_users_do_not_exist() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        assert_eq!(users.get_users("", None, 0).await.unwrap().len(), 2);
        directory.remove_entry(&user_dn("eddie"));
        users.access().lock().await.connection().clear_cache();
        assert!(!users.user_exists("eddie").await.unwrap());
        assert!(!users.user_exists("susannah").await.unwrap());
    }

    #[tokio::test]
    async fn display_names_are_composed() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        users.get_users("", None, 0).await.unwrap();
        assert_eq!(
            users.get_display_name("roland").await.unwrap(),
            Some("Roland Deschain".to_string())
        );
        {
            let mut access = users.access().lock().await;
            access.connection().clear_cache();
            access.connection_mut().configuration_mut().user_display_name_2 = "mail".to_string();
        }
        assert_eq!(
            users.get_display_name("roland").await.unwrap(),
            Some("Roland Deschain (roland@example.com)".to_string())
        );
        assert_eq!(users.get_display_name("susannah").await.unwrap(), None);
    }

    #[tokio::test]
    async fn home_folders_follow_the_naming_rule() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        users.get_users("", None, 0).await.unwrap();
        assert_eq!(users.get_home("roland").await.unwrap(), None);
        {
            let mut access = users.access().lock().await;
            access.connection_mut().configuration_mut().home_folder_naming_rule =
                "attr:homeDirectory".to_string();
        }
        assert_eq!(
            users.get_home("roland").await.unwrap(),
            Some("/home/roland".to_string())
        );
        {
            let mut access = users.access().lock().await;
            access.connection().clear_cache();
            access.connection_mut().configuration_mut().home_folder_naming_rule =
                "attr:description".to_string();
        }
        assert_eq!(
            users.get_home("roland").await.unwrap(),
            Some("/srv/data/roland/".to_string())
        );
        assert_eq!(users.get_home("eddie").await.unwrap(), None);
    }

    #[tokio::test]
    async fn users_with_display_name_are_counted() {
        let directory = FakeDirectory::default();
        let users = backend(&directory);
        assert_eq!(users.count_users().await.unwrap(), Some(2));
    }
}
