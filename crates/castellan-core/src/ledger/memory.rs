//! In-process ledger with linearizable compare-and-swap.
//!
//! Items are returned in name order. Continuation tokens are opaque to
//! callers; internally they encode the last item name of the page.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{CasOutcome, LedgerError, LedgerItem, LedgerPage, LedgerQuery, LedgerStore};

const TOKEN_PREFIX: &str = "after:";

type Domain = BTreeMap<String, BTreeMap<String, String>>;

/// Linearizable in-memory [`LedgerStore`].
#[derive(Debug)]
pub struct InMemoryLedger {
    domains: RwLock<BTreeMap<String, Domain>>,
    page_size: usize,
    selects: AtomicU64,
    conditional_writes: AtomicU64,
    failing_selects: AtomicU32,
    failing_writes: AtomicU32,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Default number of items per page.
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    /// Create an empty ledger with the default page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    /// Create an empty ledger returning at most `page_size` items per page.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            domains: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            selects: AtomicU64::new(0),
            conditional_writes: AtomicU64::new(0),
            failing_selects: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Insert or replace an item (out-of-band provisioning).
    pub fn put_item(&self, domain: &str, item: LedgerItem) {
        self.domains
            .write()
            .entry(domain.to_string())
            .or_default()
            .insert(item.name, item.attributes);
    }

    /// Read an item without going through the store API.
    #[must_use]
    pub fn item(&self, domain: &str, name: &str) -> Option<LedgerItem> {
        let domains = self.domains.read();
        domains
            .get(domain)
            .and_then(|d| d.get(name))
            .map(|attributes| LedgerItem {
                name: name.to_string(),
                attributes: attributes.clone(),
            })
    }

    /// All items of a domain in name order.
    #[must_use]
    pub fn items(&self, domain: &str) -> Vec<LedgerItem> {
        let domains = self.domains.read();
        domains
            .get(domain)
            .map(|d| {
                d.iter()
                    .map(|(name, attributes)| LedgerItem {
                        name: name.clone(),
                        attributes: attributes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make the next `n` selects fail with a transient error.
    pub fn fail_next_selects(&self, n: u32) {
        self.failing_selects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` conditional writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of `select` calls served.
    #[must_use]
    pub fn select_count(&self) -> u64 {
        self.selects.load(Ordering::Relaxed)
    }

    /// Number of `conditional_assign` calls served, applied or not.
    #[must_use]
    pub fn conditional_write_count(&self) -> u64 {
        self.conditional_writes.load(Ordering::Relaxed)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn select_now(&self, query: &LedgerQuery, token: Option<&str>) -> Result<LedgerPage, LedgerError> {
        let after = match token {
            None => None,
            Some(t) => Some(
                t.strip_prefix(TOKEN_PREFIX)
                    .ok_or_else(|| LedgerError::InvalidToken(t.to_string()))?,
            ),
        };

        let domains = self.domains.read();
        let Some(domain) = domains.get(&query.domain) else {
            return Ok(LedgerPage::default());
        };

        let mut matching = domain
            .iter()
            .filter(|(name, _)| after.map_or(true, |a| name.as_str() > a))
            .map(|(name, attributes)| LedgerItem {
                name: name.clone(),
                attributes: attributes.clone(),
            })
            .filter(|item| query.matches(item));

        let items: Vec<LedgerItem> = matching.by_ref().take(self.page_size).collect();
        let next_token = match (matching.next(), items.last()) {
            (Some(_), Some(last)) => Some(format!("{TOKEN_PREFIX}{}", last.name)),
            _ => None,
        };
        Ok(LedgerPage { items, next_token })
    }
}

impl LedgerStore for InMemoryLedger {
    async fn select(&self, query: &LedgerQuery, token: Option<&str>) -> Result<LedgerPage, LedgerError> {
        self.selects.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.failing_selects) {
            return Err(LedgerError::Transient("injected select failure".into()));
        }
        self.select_now(query, token)
    }

    async fn conditional_assign(
        &self,
        domain: &str,
        item: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<CasOutcome, LedgerError> {
        self.conditional_writes.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.failing_writes) {
            return Err(LedgerError::Transient("injected write failure".into()));
        }

        let mut domains = self.domains.write();
        let Some(attributes) = domains.get_mut(domain).and_then(|d| d.get_mut(item)) else {
            return Ok(CasOutcome::PreconditionFailed);
        };
        let current = attributes.get(field).map_or("", String::as_str);
        if current != expected {
            return Ok(CasOutcome::PreconditionFailed);
        }
        attributes.insert(field.to_string(), value.to_string());
        Ok(CasOutcome::Applied)
    }

    async fn get_consistent(&self, domain: &str, item: &str) -> Result<Option<LedgerItem>, LedgerError> {
        Ok(self.item(domain, item))
    }
}
