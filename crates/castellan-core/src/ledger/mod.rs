//! # Ledger Store
//!
//! Abstraction over a paginated, eventually-consistent attribute store.
//!
//! The store holds named *domains*; each domain holds *items* identified
//! by name, and each item carries string attributes. Three operations are
//! available:
//!
//! - `select`: predicate query returning one page plus an opaque
//!   continuation token
//! - `conditional_assign`: single-attribute compare-and-swap, the only
//!   atomicity primitive (there are no multi-item transactions)
//! - `get_consistent`: strongly consistent read of one item, used to
//!   confirm a conditional write actually stuck
//!
//! A missing attribute is indistinguishable from an empty one.
//!
//! ## Implementations
//!
//! - `InMemoryLedger`: linearizable in-process store for tests and local runs

mod memory;
pub use memory::InMemoryLedger;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::deadline;

/// One item returned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerItem {
    /// Item name, unique within its domain.
    pub name: String,
    /// Attribute values keyed by attribute name.
    pub attributes: BTreeMap<String, String>,
}

impl LedgerItem {
    /// Create an item with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// Value of `field`, or `""` when the attribute is absent.
    #[must_use]
    pub fn attribute(&self, field: &str) -> &str {
        self.attributes.get(field).map_or("", String::as_str)
    }
}

/// Equality predicate over one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    /// Domain to select from.
    pub domain: String,
    /// `(attribute, value)` pairs that must all match.
    pub conditions: Vec<(String, String)>,
    /// Request a strongly consistent read.
    pub consistent: bool,
}

impl LedgerQuery {
    /// Select every item in `domain`.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            conditions: Vec::new(),
            consistent: false,
        }
    }

    /// Add an equality condition. An empty `value` also matches a
    /// missing attribute.
    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    /// Set the consistency flag.
    #[must_use]
    pub fn consistent(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }

    /// Returns `true` if `item` satisfies every condition.
    #[must_use]
    pub fn matches(&self, item: &LedgerItem) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| item.attribute(field) == value)
    }
}

/// One page of a select.
#[derive(Debug, Clone, Default)]
pub struct LedgerPage {
    /// Items in store order.
    pub items: Vec<LedgerItem>,
    /// Continuation token; `None` ends the scan.
    pub next_token: Option<String>,
}

/// Result of a conditional write.
///
/// A precondition mismatch is an ordinary outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected value matched and the new value was written.
    Applied,
    /// The current value differed from the expected one; nothing changed.
    PreconditionFailed,
}

impl CasOutcome {
    /// Returns `true` for [`CasOutcome::Applied`].
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Network or service failure. Safe to retry from the caller.
    #[error("transient ledger failure: {0}")]
    Transient(String),

    /// The call did not complete within the configured deadline.
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected a continuation token.
    #[error("invalid continuation token: {0}")]
    InvalidToken(String),
}

impl LedgerError {
    /// Returns `true` if an outer retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// A paginated attribute store with single-field compare-and-swap.
///
/// Implementations perform no internal retries: every network or
/// service failure surfaces as [`LedgerError::Transient`].
pub trait LedgerStore: Send + Sync {
    /// Fetch one page of items matching `query`, starting after `token`.
    fn select(
        &self,
        query: &LedgerQuery,
        token: Option<&str>,
    ) -> impl Future<Output = Result<LedgerPage, LedgerError>> + Send;

    /// Set `field` on `item` to `value` only if its current value equals
    /// `expected` (a missing attribute counts as `""`).
    ///
    /// A missing item never matches.
    fn conditional_assign(
        &self,
        domain: &str,
        item: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> impl Future<Output = Result<CasOutcome, LedgerError>> + Send;

    /// Strongly consistent read of a single item.
    fn get_consistent(
        &self,
        domain: &str,
        item: &str,
    ) -> impl Future<Output = Result<Option<LedgerItem>, LedgerError>> + Send;
}

impl<S: LedgerStore> LedgerStore for Arc<S> {
    fn select(
        &self,
        query: &LedgerQuery,
        token: Option<&str>,
    ) -> impl Future<Output = Result<LedgerPage, LedgerError>> + Send {
        (**self).select(query, token)
    }

    fn conditional_assign(
        &self,
        domain: &str,
        item: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> impl Future<Output = Result<CasOutcome, LedgerError>> + Send {
        (**self).conditional_assign(domain, item, field, expected, value)
    }

    fn get_consistent(
        &self,
        domain: &str,
        item: &str,
    ) -> impl Future<Output = Result<Option<LedgerItem>, LedgerError>> + Send {
        (**self).get_consistent(domain, item)
    }
}

/// Forward-only cursor over every page of a query.
///
/// A scan always starts from the beginning and cannot be resumed from a
/// saved token. Once the store returns no token, or any page fetch fails,
/// the scan is finished; start a new one to retry.
#[derive(Debug)]
pub struct LedgerScan<'a, S> {
    store: &'a S,
    query: LedgerQuery,
    token: Option<String>,
    finished: bool,
    pages: usize,
    call_timeout: Option<Duration>,
}

impl<'a, S: LedgerStore> LedgerScan<'a, S> {
    /// Create a scan positioned before the first page.
    #[must_use]
    pub fn new(store: &'a S, query: LedgerQuery) -> Self {
        Self {
            store,
            query,
            token: None,
            finished: false,
            pages: 0,
            call_timeout: None,
        }
    }

    /// Bound each page fetch by `limit`.
    #[must_use]
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Fetch the next page, or `None` once the scan is complete.
    ///
    /// # Errors
    ///
    /// Propagates the store's error (or [`LedgerError::Timeout`]) and
    /// finishes the scan.
    pub async fn next_page(&mut self) -> Result<Option<Vec<LedgerItem>>, LedgerError> {
        if self.finished {
            return Ok(None);
        }

        let fetched = deadline::bounded(
            self.call_timeout,
            self.store.select(&self.query, self.token.as_deref()),
            LedgerError::Timeout,
        )
        .await;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        self.pages += 1;
        // Some stores send an empty token on the last page.
        self.token = page.next_token.filter(|t| !t.is_empty());
        if self.token.is_none() {
            self.finished = true;
        }
        tracing::trace!(
            domain = %self.query.domain,
            page = self.pages,
            items = page.items.len(),
            more = !self.finished,
            "ledger page fetched"
        );
        Ok(Some(page.items))
    }

    /// Drain every remaining page into one vector.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn collect_all(mut self) -> Result<Vec<LedgerItem>, LedgerError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        Ok(items)
    }

    /// Number of pages fetched so far.
    #[must_use]
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Returns `true` once no further pages will be fetched.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
