//! error types for the directory wrapper, the access layer and the configuration

use thiserror::Error;

/// errors reported by the directory wrapper
///
/// only the first two variants are distinguished conditions callers are expected
/// to react to, everything else is logged and usually treated as an empty result
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// the server could not be reached, went away or is shutting down;
    /// retrying after a reconnect may succeed
    #[error("LDAP server unavailable: {0}")]
    ServerUnavailable(String),
    /// the server refused an operation because of a constraint
    /// (e.g. a password policy), carries the server's message
    #[error("LDAP constraint violation: {0}")]
    ConstraintViolation(String),
    /// an error in the ldap3 library
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
    /// an error in the native_tls crate while setting up the TLS connector
    #[error("Native TLS error: {0}")]
    NativeTLSError(#[from] native_tls::Error),
    /// an I/O error, e.g. while reading a CA certificate
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
}

/// LDAP result code for a constraint violation
pub const RC_CONSTRAINT_VIOLATION: u32 = 19;
/// LDAP result code returned when the server is busy
pub const RC_BUSY: u32 = 51;
/// LDAP result code returned when the server is unavailable (e.g. shutting down)
pub const RC_UNAVAILABLE: u32 = 52;
/// client side result code for a lost connection
pub const RC_SERVER_DOWN: u32 = 81;
/// client side result code for a failed connect
pub const RC_CONNECT_ERROR: u32 = 91;

/// sort an LDAP result code into the three categories the access layer cares about
///
/// `Ok(true)` means the result is usable (success or a partial result because
/// a size limit was hit), `Ok(false)` means the operation failed in a way which
/// should be treated as "nothing found", `Err` carries one of the distinguished
/// conditions
pub fn classify_result_code(rc: u32, text: &str) -> Result<bool, DirectoryError> {
    match rc {
        // success, sizeLimitExceeded (partial results)
        0 | 4 => Ok(true),
        RC_BUSY | RC_UNAVAILABLE | RC_SERVER_DOWN | RC_CONNECT_ERROR => {
            Err(DirectoryError::ServerUnavailable(format!("code {}: {}", rc, text)))
        }
        RC_CONSTRAINT_VIOLATION => Err(DirectoryError::ConstraintViolation(text.to_string())),
        32 => {
            tracing::debug!("No such object (code 32): {}", text);
            Ok(false)
        }
        rc => {
            tracing::error!("LDAP operation failed with code {}: {}", rc, text);
            Ok(false)
        }
    }
}

/// translate an error of the ldap3 library, lost connections become
/// [DirectoryError::ServerUnavailable]
pub fn classify_ldap3_error(err: ldap3::LdapError) -> DirectoryError {
    match err {
        ldap3::LdapError::LdapResult { result } => {
            match classify_result_code(result.rc, &result.text) {
                Err(distinguished) => distinguished,
                Ok(_) => DirectoryError::LdapError(ldap3::LdapError::LdapResult { result }),
            }
        }
        err @ (ldap3::LdapError::Io { .. }
        | ldap3::LdapError::EndOfStream
        | ldap3::LdapError::OpSend { .. }
        | ldap3::LdapError::ResultRecv { .. }
        | ldap3::LdapError::Timeout { .. }) => DirectoryError::ServerUnavailable(err.to_string()),
        err => DirectoryError::LdapError(err),
    }
}

/// errors which can surface from the access layer
///
/// "not found" is never an error, it is reported as `None`, `false` or an
/// empty list
#[derive(Debug, Error)]
pub enum AccessError {
    /// the server stayed unavailable even after a reconnect
    #[error("LDAP server unavailable: {0}")]
    ServerUnavailable(String),
    /// the server rejected the operation because of a constraint
    #[error("LDAP constraint violation: {0}")]
    ConstraintViolation(String),
    /// the UUID attribute could not be determined for a reverse lookup
    #[error("Cannot determine UUID attribute")]
    UuidAttributeUndetectable,
    /// any other directory error in an explicit (non-lookup) flow
    #[error("Directory error: {0}")]
    Directory(DirectoryError),
}

impl AccessError {
    /// a message which can be shown to an end user, if there is one
    pub fn user_hint(&self) -> Option<String> {
        match self {
            AccessError::ConstraintViolation(message) if message.is_empty() => Some(
                "The change was rejected by the directory server, please check the password policy."
                    .to_string(),
            ),
            AccessError::ConstraintViolation(message) => Some(format!(
                "The change was rejected by the directory server: {}",
                message
            )),
            AccessError::ServerUnavailable(_) => {
                Some("The directory server is currently unavailable.".to_string())
            }
            _ => None,
        }
    }
}

impl From<DirectoryError> for AccessError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::ServerUnavailable(message) => AccessError::ServerUnavailable(message),
            DirectoryError::ConstraintViolation(message) => {
                AccessError::ConstraintViolation(message)
            }
            err => AccessError::Directory(err),
        }
    }
}

/// errors which can happen while reading or changing a configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error deserializing the TOML file
    #[error("Toml deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
    /// a persisted key which does not belong to any configuration field
    #[error("Unknown configuration key {0}")]
    UnknownKey(String),
    /// a value which could not be parsed for the given key
    #[error("Invalid value {value:?} for configuration key {key}")]
    InvalidValue {
        /// the persisted key
        key: &'static str,
        /// the raw value
        value: String,
    },
}
