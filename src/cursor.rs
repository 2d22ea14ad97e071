//! Pagination state for marketsync.
//!
//! Remote marketplace APIs page their list endpoints either with
//! `(limit, offset)` pairs or with `(limit, continuation_token)` pairs. Both
//! styles are normalized into the [`PageCursor`] value object so the
//! pagination loop, its termination condition, and its tests are independent
//! of the HTTP layer.

use serde::{Deserialize, Serialize};

/// Paging style of the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PagingStyle {
    /// Numeric offset paging: `offset += page_size`
    #[default]
    Offset,
    /// Opaque continuation token taken from the response envelope or the
    /// last item of the previous page
    Token,
}

/// Per-API paging declaration: query parameter names and the JSON pointers
/// into the response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    /// Paging style
    #[serde(default)]
    pub style: PagingStyle,

    /// Query parameter carrying the page size
    #[serde(default = "default_limit_param")]
    pub limit_param: String,

    /// Query parameter carrying the offset (offset style)
    #[serde(default = "default_offset_param")]
    pub offset_param: String,

    /// Query parameter carrying the continuation token (token style)
    #[serde(default = "default_token_param")]
    pub token_param: String,

    /// JSON pointer to the item array in the response body. An empty pointer
    /// means the body itself is the array.
    #[serde(default = "default_items_pointer")]
    pub items_pointer: String,

    /// JSON pointer to the declared total count, if the API reports one
    #[serde(default)]
    pub total_pointer: Option<String>,

    /// JSON pointer to the explicit "more results" flag, if any
    #[serde(default)]
    pub more_pointer: Option<String>,

    /// JSON pointer to the next continuation token in the envelope
    #[serde(default)]
    pub next_token_pointer: Option<String>,

    /// JSON pointer applied to the last item of a page to derive the next
    /// continuation token ("continue from last seen key" APIs)
    #[serde(default)]
    pub last_item_key_pointer: Option<String>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            style: PagingStyle::Offset,
            limit_param: default_limit_param(),
            offset_param: default_offset_param(),
            token_param: default_token_param(),
            items_pointer: default_items_pointer(),
            total_pointer: None,
            more_pointer: None,
            next_token_pointer: None,
            last_item_key_pointer: None,
        }
    }
}

/// Cursor position, by paging style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorPosition {
    /// Numeric offset of the next page
    Offset(u64),
    /// Continuation token for the next page; `None` before the first page
    Token(Option<String>),
}

/// What one fetched page reported, used to advance the cursor.
#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    /// Items returned on this page
    pub items_returned: u64,
    /// Total count declared by the API, if present
    pub reported_total: Option<u64>,
    /// Explicit more-results flag, if present
    pub more_flag: Option<bool>,
    /// Continuation token for the next page, if present
    pub next_token: Option<String>,
}

/// Immutable-per-page pagination state.
///
/// Created at sync start, advanced after each page, discarded at sync end;
/// never persisted across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Position of the next page
    pub position: CursorPosition,
    /// Requested page size
    pub page_size: u64,
    /// Items seen so far in this run
    pub items_seen: u64,
    /// Declared total count, once known
    pub total_count: Option<u64>,
    /// Whether another page should be requested
    pub has_more: bool,
    /// Pages fetched so far
    pub pages_fetched: u64,
}

impl PageCursor {
    /// Fresh offset-style cursor starting at zero.
    pub fn offset(page_size: u64) -> Self {
        Self {
            position: CursorPosition::Offset(0),
            page_size,
            items_seen: 0,
            total_count: None,
            has_more: true,
            pages_fetched: 0,
        }
    }

    /// Fresh token-style cursor with no continuation token.
    pub fn token(page_size: u64) -> Self {
        Self {
            position: CursorPosition::Token(None),
            page_size,
            items_seen: 0,
            total_count: None,
            has_more: true,
            pages_fetched: 0,
        }
    }

    /// Fresh cursor for a paging style.
    pub fn for_style(style: PagingStyle, page_size: u64) -> Self {
        match style {
            PagingStyle::Offset => Self::offset(page_size),
            PagingStyle::Token => Self::token(page_size),
        }
    }

    /// Query parameters for the next page request.
    pub fn query_params(&self, paging: &PagingConfig) -> Vec<(String, String)> {
        let mut params = vec![(paging.limit_param.clone(), self.page_size.to_string())];
        match &self.position {
            CursorPosition::Offset(offset) => {
                params.push((paging.offset_param.clone(), offset.to_string()));
            }
            CursorPosition::Token(Some(token)) => {
                params.push((paging.token_param.clone(), token.clone()));
            }
            CursorPosition::Token(None) => {}
        }
        params
    }

    /// Advance past one fetched page.
    ///
    /// The termination condition is evaluated the same way for both paging
    /// styles: stop when no items were returned, when fewer items than
    /// `page_size` came back, when the declared total has been reached, or
    /// when the explicit more-results flag is false.
    pub fn advance(&mut self, page: &PageInfo) {
        self.pages_fetched += 1;
        self.items_seen += page.items_returned;
        if page.reported_total.is_some() {
            self.total_count = page.reported_total;
        }

        match &mut self.position {
            CursorPosition::Offset(offset) => {
                *offset += page.items_returned;
            }
            CursorPosition::Token(token) => {
                *token = page.next_token.clone();
            }
        }

        self.has_more = self.more_allows_continuing(page)
            && page.items_returned > 0
            && page.items_returned >= self.page_size
            && !self.total_reached();

        // A token-style page that yields no continuation token cannot name a
        // distinct next page; re-requesting from the start would loop forever,
        // so the sequence is exhausted even if the envelope claims more
        // results.
        if let CursorPosition::Token(None) = self.position {
            self.has_more = false;
        }
    }

    fn more_allows_continuing(&self, page: &PageInfo) -> bool {
        page.more_flag != Some(false)
    }

    fn total_reached(&self) -> bool {
        matches!(self.total_count, Some(total) if self.items_seen >= total)
    }

    /// Pages a full run will take for a declared total, `ceil(total / page_size)`.
    pub fn expected_pages(total: u64, page_size: u64) -> u64 {
        if page_size == 0 {
            return 0;
        }
        total.div_ceil(page_size)
    }
}

fn default_limit_param() -> String {
    "limit".into()
}
fn default_offset_param() -> String {
    "offset".into()
}
fn default_token_param() -> String {
    "cursor".into()
}
fn default_items_pointer() -> String {
    "/items".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn full_page(n: u64, total: Option<u64>) -> PageInfo {
        PageInfo {
            items_returned: n,
            reported_total: total,
            more_flag: None,
            next_token: None,
        }
    }

    #[test]
    fn test_three_page_run_with_declared_total() {
        // TotalCount=250, page size 100: pages of 100, 100, 50.
        let mut cursor = PageCursor::offset(100);

        cursor.advance(&full_page(100, Some(250)));
        assert!(cursor.has_more);
        assert_eq!(cursor.position, CursorPosition::Offset(100));

        cursor.advance(&full_page(100, Some(250)));
        assert!(cursor.has_more);
        assert_eq!(cursor.position, CursorPosition::Offset(200));

        cursor.advance(&full_page(50, Some(250)));
        assert!(!cursor.has_more);
        assert_eq!(cursor.items_seen, 250);
        assert_eq!(cursor.pages_fetched, 3);
        assert_eq!(PageCursor::expected_pages(250, 100), 3);
    }

    #[test]
    fn test_short_page_terminates_without_total() {
        let mut cursor = PageCursor::offset(100);
        cursor.advance(&full_page(100, None));
        assert!(cursor.has_more);
        cursor.advance(&full_page(37, None));
        assert!(!cursor.has_more);
    }

    #[test]
    fn test_empty_first_page_terminates() {
        let mut cursor = PageCursor::offset(100);
        cursor.advance(&full_page(0, None));
        assert!(!cursor.has_more);
        assert_eq!(cursor.items_seen, 0);
    }

    #[test]
    fn test_explicit_more_flag_false_wins() {
        let mut cursor = PageCursor::offset(100);
        cursor.advance(&PageInfo {
            items_returned: 100,
            reported_total: None,
            more_flag: Some(false),
            next_token: None,
        });
        assert!(!cursor.has_more);
    }

    #[test]
    fn test_token_style_advances_by_token() {
        let mut cursor = PageCursor::token(2);
        cursor.advance(&PageInfo {
            items_returned: 2,
            reported_total: None,
            more_flag: None,
            next_token: Some("abc".into()),
        });
        assert!(cursor.has_more);
        assert_eq!(cursor.position, CursorPosition::Token(Some("abc".into())));

        let params = cursor.query_params(&PagingConfig {
            style: PagingStyle::Token,
            ..PagingConfig::default()
        });
        assert!(params.contains(&("cursor".to_string(), "abc".to_string())));

        // Full page but no further token: exhausted.
        cursor.advance(&PageInfo {
            items_returned: 2,
            reported_total: None,
            more_flag: None,
            next_token: None,
        });
        assert!(!cursor.has_more);
    }

    #[test]
    fn test_missing_token_terminates_despite_more_flag() {
        // A broken API claiming more results without ever handing out a
        // token must not make the same first page repeat forever.
        let mut cursor = PageCursor::token(2);
        cursor.advance(&PageInfo {
            items_returned: 2,
            reported_total: None,
            more_flag: Some(true),
            next_token: None,
        });
        assert!(!cursor.has_more);
        assert_eq!(cursor.position, CursorPosition::Token(None));
    }

    #[test]
    fn test_first_request_params() {
        let cursor = PageCursor::offset(100);
        let params = cursor.query_params(&PagingConfig::default());
        assert_eq!(
            params,
            vec![
                ("limit".to_string(), "100".to_string()),
                ("offset".to_string(), "0".to_string())
            ]
        );

        // Token style sends no token parameter before the first page.
        let cursor = PageCursor::token(50);
        let params = cursor.query_params(&PagingConfig::default());
        assert_eq!(params, vec![("limit".to_string(), "50".to_string())]);
    }

    proptest! {
        // Simulated server with a fixed item count always terminates in
        // exactly ceil(total / page_size) pages (min. one for the empty case).
        #[test]
        fn prop_pagination_terminates(total in 0u64..5_000, page_size in 1u64..512) {
            let mut cursor = PageCursor::offset(page_size);
            let mut pages = 0u64;
            while cursor.has_more {
                let offset = match cursor.position {
                    CursorPosition::Offset(o) => o,
                    _ => unreachable!(),
                };
                let remaining = total.saturating_sub(offset);
                let returned = remaining.min(page_size);
                cursor.advance(&full_page(returned, Some(total)));
                pages += 1;
                prop_assert!(pages <= PageCursor::expected_pages(total, page_size) + 1);
            }
            let expected = PageCursor::expected_pages(total, page_size).max(1);
            prop_assert_eq!(pages, expected);
            prop_assert_eq!(cursor.items_seen, total);
        }
    }
}
