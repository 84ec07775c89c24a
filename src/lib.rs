#![deny(unknown_lints)]
#![deny(renamed_and_removed_lints)]
#![forbid(unsafe_code)]
#![deny(deprecated)]
#![forbid(non_fmt_panics)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![forbid(unused_doc_comments)]
#![forbid(unused_must_use)]
#![deny(while_true)]
#![deny(unused_parens)]
#![deny(redundant_semicolons)]
#![deny(non_ascii_idents)]
#![deny(confusable_idents)]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::cargo_common_metadata)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![deny(clippy::mod_module_files)]
#![doc = include_str!("../README.md")]

pub mod access;
pub mod cache;
pub mod codec;
pub mod configuration;
pub mod connection;
pub mod dn;
pub mod error;
pub mod filter;
pub mod group_backend;
pub mod host;
pub mod mapping;
pub mod proxy;
pub mod record;
pub mod user_backend;
pub mod wrapper;

#[cfg(test)]
mod test_directory;

pub use access::{Access, NameResolution, SharedAccess};
pub use cache::{Cache, MemoryCache};
pub use configuration::{ConfigKey, ConfigStore, Configuration, MemoryConfigStore};
pub use connection::Connection;
pub use error::{AccessError, ConfigurationError, DirectoryError};
pub use group_backend::GroupLdap;
pub use host::{IdentityHost, MemoryIdentityHost};
pub use mapping::{IdentityMapper, MappingEntry, MemoryMapping};
pub use proxy::{AccessRegistry, GroupProxy, UserProxy};
pub use record::DirectoryRecord;
pub use user_backend::UserLdap;
pub use wrapper::{Ldap3Wrapper, LdapSession, LdapWrapper};
