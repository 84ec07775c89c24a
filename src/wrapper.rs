//! the thin layer over the LDAP client library, everything above it only
//! talks to these traits

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use derive_builder::Builder;
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, SearchEntry, SearchResult};
use native_tls::{Certificate, TlsConnector};
use tracing::instrument;

use crate::error::{classify_ldap3_error, classify_result_code, DirectoryError};
use crate::record::DirectoryRecord;

/// the scope of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// only the base entry itself
    Base,
    /// the direct children of the base
    OneLevel,
    /// the base and everything below it
    Subtree,
}

impl From<SearchScope> for ldap3::Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::OneLevel => ldap3::Scope::OneLevel,
            SearchScope::Subtree => ldap3::Scope::Subtree,
        }
    }
}

/// the entries of a search and the paged results cookie the server sent back
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    /// the entries found
    pub entries: Vec<DirectoryRecord>,
    /// the cookie of the paged results response control, if there was one
    pub cookie: Option<Vec<u8>>,
}

/// parameters for establishing a connection
#[derive(Debug, Clone, Builder)]
pub struct ConnectSettings {
    /// timeout for connecting and for each operation
    #[builder(default = "Duration::from_secs(15)")]
    pub timeout: Duration,
    /// use StartTLS on a plain connection
    #[builder(default)]
    pub starttls: bool,
    /// do not verify the server certificate
    #[builder(default)]
    pub no_tls_verify: bool,
    /// PEM file with an additional CA certificate to trust
    #[builder(default)]
    pub ca_cert_path: Option<std::string::String>,
}

/// opens sessions to a directory server
#[async_trait]
pub trait LdapWrapper: Send + Sync + std::fmt::Debug {
    /// connect to the server at the given URL (`ldap://host:port` or `ldaps://host:port`)
    async fn connect(
        &self,
        url: &str,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn LdapSession>, DirectoryError>;
}

/// an open connection to a directory server
#[async_trait]
pub trait LdapSession: Send + Sync + std::fmt::Debug {
    /// simple bind, `Ok(false)` if the credentials were rejected
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, DirectoryError>;

    /// search the directory, `Ok(None)` if the server reported an error
    /// which is not one of the distinguished conditions
    ///
    /// an empty list of attributes returns all user attributes
    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[std::string::String],
    ) -> Result<Option<SearchResponse>, DirectoryError>;

    /// read a single entry
    async fn read(
        &mut self,
        dn: &str,
        filter: &str,
        attributes: &[std::string::String],
    ) -> Result<Option<SearchResponse>, DirectoryError> {
        self.search(dn, SearchScope::Base, filter, attributes).await
    }

    /// set the paged results control for the next search, a page size of 0
    /// ends a paged search on the server
    ///
    /// returns false if paging is not supported
    fn control_paged_result(&mut self, page_size: i32, critical: bool, cookie: &[u8]) -> bool;

    /// the paged results cookie of a response
    fn control_paged_result_response(&self, response: &SearchResponse) -> Option<Vec<u8>> {
        response.cookie.clone()
    }

    /// close the connection
    async fn unbind(&mut self);
}

/// the [LdapWrapper] implementation using the ldap3 crate
#[derive(Debug, Clone, Default)]
pub struct Ldap3Wrapper;

#[async_trait]
impl LdapWrapper for Ldap3Wrapper {
    #[instrument(skip(self, settings))]
    async fn connect(
        &self,
        url: &str,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn LdapSession>, DirectoryError> {
        let mut ldap_settings = LdapConnSettings::new()
            .set_conn_timeout(settings.timeout)
            .set_starttls(settings.starttls)
            .set_no_tls_verify(settings.no_tls_verify);
        if let Some(ca_cert_path) = &settings.ca_cert_path {
            let mut ca_cert_contents = Vec::new();
            {
                let mut file = File::open(ca_cert_path)?;
                file.read_to_end(&mut ca_cert_contents)?;
            }
            let ca_certificate = Certificate::from_pem(&ca_cert_contents)?;
            let connector = TlsConnector::builder()
                .add_root_certificate(ca_certificate)
                .danger_accept_invalid_certs(settings.no_tls_verify)
                .build()?;
            ldap_settings = ldap_settings.set_connector(connector);
        }
        let (ldap_conn_async, ldap) = LdapConnAsync::with_settings(ldap_settings, url)
            .await
            .map_err(classify_ldap3_error)?;
        ldap3::drive!(ldap_conn_async);
        tracing::debug!("Connected to {}", url);
        Ok(Box::new(Ldap3Session {
            ldap,
            timeout: settings.timeout,
            paged_control: None,
        }))
    }
}

/// a session opened by [Ldap3Wrapper]
pub struct Ldap3Session {
    /// the ldap3 handle
    ldap: Ldap,
    /// timeout applied to every operation
    timeout: Duration,
    /// the paged results control to send with the next search
    paged_control: Option<RawControl>,
}

impl std::fmt::Debug for Ldap3Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ldap3Session")
            .field("timeout", &self.timeout)
            .field("paged_control", &self.paged_control.is_some())
            .finish()
    }
}

#[async_trait]
impl LdapSession for Ldap3Session {
    #[instrument(skip(self, password))]
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, DirectoryError> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await
            .map_err(classify_ldap3_error)?;
        match result.rc {
            0 => Ok(true),
            49 => {
                tracing::debug!("Invalid credentials for {}", dn);
                Ok(false)
            }
            rc => {
                classify_result_code(rc, &result.text)?;
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, attributes))]
    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[std::string::String],
    ) -> Result<Option<SearchResponse>, DirectoryError> {
        let paged_control = self.paged_control.take();
        let ldap = self.ldap.with_timeout(self.timeout);
        if let Some(control) = paged_control {
            ldap.with_controls(vec![control]);
        }
        let SearchResult(result_entries, result) = ldap
            .search(base, scope.into(), filter, attributes.to_vec())
            .await
            .map_err(classify_ldap3_error)?;
        if !classify_result_code(result.rc, &result.text)? {
            return Ok(None);
        }
        let mut cookie = None;
        for control in &result.ctrls {
            if let Control(Some(ControlType::PagedResults), ref raw) = control {
                let paged: PagedResults = raw.parse();
                cookie = Some(paged.cookie);
            }
        }
        let entries = result_entries
            .into_iter()
            .map(|entry| DirectoryRecord::from(SearchEntry::construct(entry)))
            .collect();
        Ok(Some(SearchResponse { entries, cookie }))
    }

    fn control_paged_result(&mut self, page_size: i32, critical: bool, cookie: &[u8]) -> bool {
        if page_size <= 0 {
            // the server drops a paged run which is not continued
            self.paged_control = None;
            return true;
        }
        let mut control: RawControl = PagedResults {
            size: page_size,
            cookie: cookie.to_vec(),
        }
        .into();
        control.crit = critical;
        self.paged_control = Some(control);
        true
    }

    async fn unbind(&mut self) {
        if let Err(err) = self.ldap.unbind().await {
            tracing::debug!("Error during unbind: {}", err);
        }
    }
}
