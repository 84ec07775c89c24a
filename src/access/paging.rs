//! paged searches (RFC 2696) and counting on top of them

use std::collections::HashMap;

use tracing::instrument;

use super::{process_record, wire_attributes, Access};
use crate::dn::dn_as_base_parameter;
use crate::error::AccessError;
use crate::filter::parenthesize;
use crate::record::DirectoryRecord;
use crate::wrapper::{SearchResponse, SearchScope};

/// page size used if none is configured but paging has to continue
pub(crate) const DEFAULT_PAGE_SIZE: usize = 500;

/// the cookies are remembered per base, filter, page size and offset
type CookieKey = (String, String, usize, usize);

/// a cookie which asks for another page
///
/// some servers send `"0"` on pages which are not the last one, that is a
/// continuation just like any other non-empty cookie
fn cookie_continues(cookie: &[u8]) -> bool {
    cookie == b"0" || !cookie.is_empty()
}

/// the paged search in flight on an [Access]
#[derive(Debug, Default)]
pub(crate) struct PagedSearchState {
    /// the cookie of the last page, empty if there is no paged search or it
    /// is exhausted
    last_cookie: Vec<u8>,
    /// the cookies to continue from, by the offset of the page they were
    /// returned with
    cookies: HashMap<CookieKey, Vec<u8>>,
    /// the server honored the paging of the last page, reset on every read
    paged_searched_successful: Option<bool>,
}

impl PagedSearchState {
    /// the cookie to request the page at the offset with, an empty cookie
    /// starts a new paged search
    fn cookie_for(&self, base: &str, filter: &str, limit: usize, offset: usize) -> Option<Vec<u8>> {
        if offset == 0 {
            return Some(Vec::new());
        }
        let previous = offset.checked_sub(limit)?;
        self.cookies
            .get(&(base.to_string(), filter.to_string(), limit, previous))
            .cloned()
    }

    /// remember the cookie returned with the page at the offset
    fn store_cookie(&mut self, base: &str, filter: &str, limit: usize, offset: usize, cookie: Vec<u8>) {
        if cookie_continues(&cookie) {
            self.cookies.insert(
                (base.to_string(), filter.to_string(), limit, offset),
                cookie.clone(),
            );
        }
        self.last_cookie = cookie;
    }

    /// forget the page in flight, the cookies of earlier pages stay usable
    fn abandon(&mut self) {
        self.last_cookie.clear();
    }
}

/// how the next page is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagingDecision {
    /// without paging control
    Unpaged,
    /// paged with the page size
    Paged(usize),
    /// the requested offset is a page start beyond the last page
    NoMoreResults,
}

/// the responses of one page over all bases
#[derive(Debug)]
struct SearchRun {
    /// the responses by base
    responses: Vec<(String, SearchResponse)>,
    /// the page was requested with the paged results control
    paged: bool,
    /// the page size used
    page_size: usize,
}

impl SearchRun {
    /// number of entries in all responses
    fn entry_count(&self) -> usize {
        self.responses.iter().map(|(_, r)| r.entries.len()).sum()
    }
}

impl Access {
    /// end the paged search in flight
    pub fn abandon_paged_search(&mut self) {
        if !self.connection.has_paged_result_support() {
            return;
        }
        if let Some(session) = self.connection.session_mut() {
            session.control_paged_result(0, false, &self.paging.last_cookie);
        }
        self.paging.abandon();
    }

    /// the last paged search left a cookie to continue from
    pub fn has_more_results(&self) -> bool {
        self.connection.has_paged_result_support() && cookie_continues(&self.paging.last_cookie)
    }

    /// whether the server honored the paging of the last page, reading the
    /// state resets it
    pub fn paged_search_result_state(&mut self) -> Option<bool> {
        self.paging.paged_searched_successful.take()
    }

    /// walk the pages from offset 0 to the offset to learn the cookie for it,
    /// the entries are discarded
    ///
    /// returns false if the server did not honor the paging
    async fn walk_to_offset(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<bool, AccessError> {
        let wire = wire_attributes(attributes);
        let mut walk_offset = 0;
        while walk_offset < offset {
            let Some(cookie) = self.paging.cookie_for(base, filter, limit, walk_offset) else {
                break;
            };
            self.abandon_paged_search();
            if !self.set_paged_control(limit, &cookie).await? {
                return Ok(false);
            }
            let Some(response) = self
                .invoke_search(&dn_as_base_parameter(base), SearchScope::Subtree, &parenthesize(filter), &wire)
                .await?
            else {
                break;
            };
            if response.entries.len() > limit {
                return Ok(false);
            }
            let cookie = response.cookie.unwrap_or_default();
            let exhausted = !cookie_continues(&cookie);
            self.paging.store_cookie(base, filter, limit, walk_offset, cookie);
            if exhausted {
                break;
            }
            walk_offset += limit;
        }
        Ok(true)
    }

    /// prepare a paged search for the page at the offset
    async fn init_paged_search(
        &mut self,
        filter: &str,
        bases: &[String],
        attributes: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<PagingDecision, AccessError> {
        if !self.connection.has_paged_result_support() {
            return Ok(PagingDecision::Unpaged);
        }
        if limit == 0 {
            // once paging started on a session it has to go on
            if self.paging.last_cookie.is_empty() {
                return Ok(PagingDecision::Unpaged);
            }
            self.abandon_paged_search();
            let configured = self.connection.configuration().paging_size as usize;
            let page_size = if configured > 0 { configured } else { DEFAULT_PAGE_SIZE };
            return Ok(PagingDecision::Paged(page_size));
        }
        tracing::debug!(
            "initializing paged search for filter {} bases {:?} limit {} offset {}",
            filter,
            bases,
            limit,
            offset
        );
        if offset % limit != 0 {
            // no page starts at the offset, the window is cut on the client
            tracing::info!("Offset {} is not a multiple of limit {}, continuing without paging", offset, limit);
            self.abandon_paged_search();
            return Ok(PagingDecision::Unpaged);
        }
        for base in bases {
            if offset == 0 || self.paging.cookie_for(base, filter, limit, offset).is_some() {
                continue;
            }
            tracing::info!("Looking for cookie L/O {}/{}", limit, offset - limit.min(offset));
            if !self.walk_to_offset(base, filter, attributes, limit, offset).await? {
                tracing::info!("Server does not honor paging, continuing without");
                return Ok(PagingDecision::Unpaged);
            }
            if self.paging.cookie_for(base, filter, limit, offset).is_none() {
                tracing::info!("No paged search for us, Limit {} Offset {}", limit, offset);
                return Ok(PagingDecision::NoMoreResults);
            }
        }
        tracing::debug!("Ready for a paged search");
        Ok(PagingDecision::Paged(limit))
    }

    /// fetch one page on all bases, `None` if a search failed
    async fn execute_search(
        &mut self,
        filter: &str,
        bases: &[String],
        attributes: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<Option<SearchRun>, AccessError> {
        if self.connection.resource().await?.is_none() {
            tracing::debug!("Could not search, because resource is missing.");
            return Ok(None);
        }
        let (mut paged, page_size) = match self
            .init_paged_search(filter, bases, attributes, limit, offset)
            .await?
        {
            PagingDecision::NoMoreResults => {
                return Ok(Some(SearchRun {
                    responses: Vec::new(),
                    paged: true,
                    page_size: limit,
                }))
            }
            PagingDecision::Unpaged => (false, limit),
            PagingDecision::Paged(page_size) => (true, page_size),
        };
        let cookies: Vec<Option<Vec<u8>>> = bases
            .iter()
            .map(|base| self.paging.cookie_for(base, filter, page_size, offset))
            .collect();
        if paged {
            self.abandon_paged_search();
        }
        let wire = wire_attributes(attributes);
        let filter = parenthesize(filter);
        let mut responses = Vec::new();
        for (base, cookie) in bases.iter().zip(cookies) {
            if paged {
                let Some(cookie) = cookie else {
                    tracing::debug!("No cookie for {} at offset {}, skipping base", base, offset);
                    continue;
                };
                paged = self.set_paged_control(page_size, &cookie).await?;
            }
            match self
                .invoke_search(&dn_as_base_parameter(base), SearchScope::Subtree, &filter, &wire)
                .await?
            {
                Some(response) => responses.push((base.clone(), response)),
                None => {
                    tracing::error!("Error when searching: base {} filter {}", base, filter);
                    return Ok(None);
                }
            }
        }
        Ok(Some(SearchRun {
            responses,
            paged,
            page_size,
        }))
    }

    /// remember the cookies of the page, returns true if there are more pages
    fn process_paged_search_status(
        &mut self,
        run: &SearchRun,
        filter: &str,
        found: usize,
        offset: usize,
    ) -> bool {
        if !run.paged {
            if run.page_size > 0 {
                tracing::debug!("Paged search was not available");
            }
            return false;
        }
        let mut has_more = false;
        for (base, response) in &run.responses {
            let cookie = match self.connection.session_mut() {
                Some(session) => session.control_paged_result_response(response),
                None => response.cookie.clone(),
            }
            .unwrap_or_default();
            has_more |= cookie_continues(&cookie);
            self.paging
                .store_cookie(base, filter, run.page_size, offset, cookie);
        }
        if found <= run.page_size {
            self.paging.paged_searched_successful = Some(true);
        }
        has_more
    }

    /// search entries in the bases
    ///
    /// without a limit all pages are fetched with the configured page size;
    /// with a limit the page at the offset is fetched, continuing while the
    /// server sends fewer entries than requested. If the server did not honor
    /// the paging, the window is cut from the results.
    #[instrument(skip(self, bases, attributes))]
    pub async fn search(
        &mut self,
        filter: &str,
        bases: &[String],
        attributes: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<DirectoryRecord>, AccessError> {
        let limit = limit.filter(|limit| *limit > 0);
        let (mut page_size, mut page_offset, skip_when_honored) = match limit {
            Some(limit) => (limit, offset, 0),
            None => (self.connection.configuration().paging_size as usize, 0, offset),
        };
        let mut findings: Vec<DirectoryRecord> = Vec::new();
        let mut paged;
        loop {
            let Some(run) = self
                .execute_search(filter, bases, attributes, page_size, page_offset)
                .await?
            else {
                return Ok(Vec::new());
            };
            paged = run.paged;
            page_size = run.page_size;
            let found = run.entry_count();
            let has_more = self.process_paged_search_status(&run, filter, found, page_offset);
            findings.extend(
                run.responses
                    .into_iter()
                    .flat_map(|(_, response)| response.entries),
            );
            page_offset += page_size;
            let below_limit = limit.map_or(true, |limit| findings.len() < limit);
            if !(has_more && paged && below_limit) || page_size == 0 {
                break;
            }
            tracing::trace!("Fetching next page at offset {}", page_offset);
        }
        let honored = paged && self.paged_search_result_state() == Some(true);
        let skip = if honored { skip_when_honored } else { offset };
        Ok(findings
            .iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .map(|record| process_record(record, attributes))
            .collect())
    }

    /// count the entries in the bases matching the filter
    ///
    /// `None` if the first search already failed
    #[instrument(skip(self, bases))]
    pub async fn count(
        &mut self,
        filter: &str,
        bases: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<usize>, AccessError> {
        let limit = limit.filter(|limit| *limit > 0);
        let mut limit_per_page = self.connection.configuration().paging_size as usize;
        if let Some(limit) = limit {
            if limit < limit_per_page {
                limit_per_page = limit;
            }
        }
        let attributes = vec!["dn".to_string()];
        let mut counter = 0;
        let mut page_offset = offset;
        let mut paged;
        let mut searched = false;
        loop {
            let Some(run) = self
                .execute_search(filter, bases, &attributes, limit_per_page, page_offset)
                .await?
            else {
                return Ok(searched.then_some(counter));
            };
            searched = true;
            paged = run.paged;
            limit_per_page = run.page_size;
            let found = run.entry_count();
            counter += found;
            let has_more = self.process_paged_search_status(&run, filter, found, page_offset);
            page_offset += limit_per_page;
            let below_limit = limit.map_or(true, |limit| limit > counter);
            if !(paged && has_more && below_limit) || limit_per_page == 0 {
                break;
            }
        }
        let honored = paged && self.paged_search_result_state() == Some(true);
        if !honored {
            counter = counter.saturating_sub(offset);
        }
        if let Some(limit) = limit {
            counter = counter.min(limit);
        }
        Ok(Some(counter))
    }
}
