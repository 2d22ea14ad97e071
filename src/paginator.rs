//! Page-by-page fetching of a remote list endpoint.
//!
//! The paginator owns the request loop around a [`PageCursor`]: build the
//! page query, call the API, classify the response, parse the envelope, and
//! advance the cursor. Rate limiting (429) is absorbed here with a fixed
//! backoff; other non-success statuses surface as non-fatal page failures
//! so the caller can record them without aborting the whole run.

use crate::cursor::{PageCursor, PageInfo, PagingConfig};
use crate::error::{Error, Result};
use crate::http::{ApiClient, RequestTemplate};
use crate::normalize::RawDocument;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one page request.
#[derive(Debug)]
pub enum PageFetch {
    /// A page of raw documents.
    Page(Vec<RawDocument>),
    /// No more pages; the run for this endpoint is complete.
    Exhausted,
    /// The page could not be fetched. Non-fatal: the caller records it and
    /// stops paginating this endpoint (later pages cannot be trusted once
    /// one is missing).
    Failed {
        /// HTTP status, or 0 for transport-level failures
        status: u16,
        /// Failure detail
        reason: String,
    },
}

/// Request loop for one paginated endpoint.
pub struct Paginator<'a> {
    client: &'a dyn ApiClient,
    request: &'a RequestTemplate,
    paging: &'a PagingConfig,
    rate_limit_backoff: Duration,
    max_rate_limit_retries: u32,
    max_pages: u64,
    rate_limit_waits: u64,
}

impl<'a> Paginator<'a> {
    /// Create a paginator with the default 30s rate-limit backoff.
    pub fn new(
        client: &'a dyn ApiClient,
        request: &'a RequestTemplate,
        paging: &'a PagingConfig,
    ) -> Self {
        Self {
            client,
            request,
            paging,
            rate_limit_backoff: Duration::from_secs(30),
            max_rate_limit_retries: 3,
            max_pages: 0,
            rate_limit_waits: 0,
        }
    }

    /// Set the fixed wait applied after a 429 response.
    pub fn rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    /// Set how many consecutive 429 responses to absorb per page.
    pub fn max_rate_limit_retries(mut self, retries: u32) -> Self {
        self.max_rate_limit_retries = retries;
        self
    }

    /// Cap the number of pages fetched per run (0 = unlimited).
    pub fn max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// How many times this paginator waited on a 429 so far.
    pub fn rate_limit_waits(&self) -> u64 {
        self.rate_limit_waits
    }

    /// Fetch the next page and advance the cursor.
    ///
    /// Returns `Err` only for failures that end the entity run (auth
    /// rejection); everything else is an `Ok` variant.
    pub async fn next_page(&mut self, cursor: &mut PageCursor) -> Result<PageFetch> {
        if !cursor.has_more {
            return Ok(PageFetch::Exhausted);
        }
        if self.max_pages > 0 && cursor.pages_fetched >= self.max_pages {
            info!(
                max_pages = self.max_pages,
                "Page cap reached; stopping pagination early"
            );
            return Ok(PageFetch::Exhausted);
        }

        let query = self.request.page_query(&cursor.query_params(self.paging));

        let mut attempt = 0;
        let response = loop {
            let result = self
                .client
                .call(self.request.method, &self.request.path, &query)
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    // Transport failure: non-fatal, same as a bad status.
                    warn!(error = %e, "Page request failed");
                    return Ok(PageFetch::Failed {
                        status: 0,
                        reason: e.to_string(),
                    });
                }
            };

            if response.is_rate_limited() {
                if attempt >= self.max_rate_limit_retries {
                    return Ok(PageFetch::Failed {
                        status: response.status,
                        reason: format!(
                            "rate limited; gave up after {} retries",
                            self.max_rate_limit_retries
                        ),
                    });
                }
                attempt += 1;
                self.rate_limit_waits += 1;
                warn!(
                    attempt,
                    backoff_secs = self.rate_limit_backoff.as_secs(),
                    "Rate limited (429); backing off"
                );
                tokio::time::sleep(self.rate_limit_backoff).await;
                continue;
            }

            break response;
        };

        if response.is_auth_failure() {
            return Err(Error::Auth {
                path: self.request.path.clone(),
                status: response.status,
            });
        }
        if !response.is_success() {
            return Ok(PageFetch::Failed {
                status: response.status,
                reason: format!("unexpected status {}", response.status),
            });
        }

        let Some(items) = response
            .body
            .pointer(&self.paging.items_pointer)
            .and_then(JsonValue::as_array)
        else {
            return Ok(PageFetch::Failed {
                status: response.status,
                reason: format!(
                    "response envelope has no array at '{}'",
                    self.paging.items_pointer
                ),
            });
        };
        let items: Vec<RawDocument> = items.clone();

        let info = PageInfo {
            items_returned: items.len() as u64,
            reported_total: self
                .paging
                .total_pointer
                .as_deref()
                .and_then(|p| response.body.pointer(p))
                .and_then(JsonValue::as_u64),
            more_flag: self
                .paging
                .more_pointer
                .as_deref()
                .and_then(|p| response.body.pointer(p))
                .and_then(JsonValue::as_bool),
            next_token: self.next_token(&response.body, &items),
        };
        cursor.advance(&info);
        debug!(
            page = cursor.pages_fetched,
            items = info.items_returned,
            has_more = cursor.has_more,
            "Fetched page"
        );

        if items.is_empty() {
            return Ok(PageFetch::Exhausted);
        }
        Ok(PageFetch::Page(items))
    }

    /// Drain the endpoint into one vector. Stops on exhaustion or on the
    /// first failed page.
    pub async fn fetch_all(&mut self, cursor: &mut PageCursor) -> Result<Vec<RawDocument>> {
        let mut documents = Vec::new();
        loop {
            match self.next_page(cursor).await? {
                PageFetch::Page(items) => documents.extend(items),
                PageFetch::Exhausted => break,
                PageFetch::Failed { status, reason } => {
                    warn!(status, reason = %reason, "Stopping pagination after failed page");
                    break;
                }
            }
        }
        Ok(documents)
    }

    /// Continuation token for the next page: the envelope field when
    /// declared, otherwise a key lifted from the last item of this page.
    fn next_token(&self, body: &JsonValue, items: &[RawDocument]) -> Option<String> {
        if let Some(pointer) = self.paging.next_token_pointer.as_deref() {
            if let Some(token) = body.pointer(pointer).and_then(value_as_token) {
                return Some(token);
            }
        }
        if let Some(pointer) = self.paging.last_item_key_pointer.as_deref() {
            return items.last()?.pointer(pointer).and_then(value_as_token);
        }
        None
    }
}

fn value_as_token(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
