//! # Credential Claims
//!
//! Gives the calling instance exclusive ownership of one pre-provisioned
//! credential row from a shared pool.
//!
//! ## Protocol
//!
//! 1. Fast path: a consistent lookup for a row already owned by this
//!    instance with both references present. Repeated claims are no-ops.
//! 2. Scan-and-claim: page through unclaimed rows of the application in
//!    store order. For each candidate, compare-and-swap the owner from
//!    `""` to the instance id, then re-read the row consistently and
//!    confirm the owner stuck. The first verified row wins.
//! 3. A complete scan without a verified claim is [`ClaimError::Exhausted`].
//!
//! Exclusivity rests entirely on the store's conditional write plus the
//! post-write verification; no local locking is involved.

mod schema;
pub use schema::{ClaimSchema, CredentialRecord, CredentialRefs};

use std::time::Duration;

use crate::deadline;
use crate::ledger::{CasOutcome, LedgerError, LedgerQuery, LedgerScan, LedgerStore};

/// Errors from the claim protocol.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// Every candidate row was taken or failed verification.
    #[error("no credential row could be claimed for app '{app_id}' ({candidates} candidates tried)")]
    Exhausted {
        /// Application whose pool was scanned.
        app_id: String,
        /// Number of unclaimed rows attempted.
        candidates: usize,
    },

    /// The request cannot be served (e.g. empty instance id).
    #[error("invalid claim request: {0}")]
    InvalidRequest(String),

    /// Underlying ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Runs the claim protocol against a [`LedgerStore`].
#[derive(Debug)]
pub struct CredentialClaimCoordinator<S> {
    store: S,
    schema: ClaimSchema,
    call_timeout: Option<Duration>,
}

impl<S: LedgerStore> CredentialClaimCoordinator<S> {
    /// Create a coordinator over `store` using `schema`.
    #[must_use]
    pub fn new(store: S, schema: ClaimSchema) -> Self {
        Self {
            store,
            schema,
            call_timeout: None,
        }
    }

    /// Bound every remote call by `limit`.
    #[must_use]
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// The pool schema in use.
    #[must_use]
    pub fn schema(&self) -> &ClaimSchema {
        &self.schema
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim one credential row for `instance_id` within `app_id`'s pool.
    ///
    /// # Errors
    ///
    /// - [`ClaimError::InvalidRequest`] if `instance_id` is empty
    /// - [`ClaimError::Ledger`] on any store failure (not retried here)
    /// - [`ClaimError::Exhausted`] if no row could be claimed
    pub async fn claim(&self, instance_id: &str, app_id: &str) -> Result<CredentialRefs, ClaimError> {
        if instance_id.is_empty() {
            return Err(ClaimError::InvalidRequest("instance id is empty".into()));
        }

        if let Some(refs) = self.find_owned(instance_id).await? {
            tracing::info!(
                instance_id,
                app_id,
                row = %refs.row_id,
                "instance already owns a credential row"
            );
            return Ok(refs);
        }

        let query = LedgerQuery::new(&self.schema.domain)
            .where_eq(&self.schema.app_field, app_id)
            .where_eq(&self.schema.owner_field, "")
            .consistent(self.schema.consistent_scan);
        let mut scan = LedgerScan::new(&self.store, query).with_call_timeout(self.call_timeout);

        let mut candidates = 0usize;
        while let Some(page) = scan.next_page().await? {
            for item in &page {
                let record = CredentialRecord::from_item(item, &self.schema);
                if record.is_claimed() {
                    // Stale listing; the row is already gone.
                    continue;
                }
                if !record.has_refs() {
                    tracing::warn!(row = %record.row_id, app_id, "skipping pool row without store references");
                    continue;
                }

                candidates += 1;
                if let Some(refs) = self.try_claim(&record, instance_id).await? {
                    tracing::info!(
                        instance_id,
                        app_id,
                        row = %refs.row_id,
                        candidates,
                        "claimed credential row"
                    );
                    return Ok(refs);
                }
            }
        }

        tracing::error!(
            instance_id,
            app_id,
            candidates,
            pages = scan.pages_fetched(),
            "credential pool exhausted"
        );
        Err(ClaimError::Exhausted {
            app_id: app_id.to_string(),
            candidates,
        })
    }

    /// Consistent lookup of a row already owned by `instance_id`.
    async fn find_owned(&self, instance_id: &str) -> Result<Option<CredentialRefs>, LedgerError> {
        let query = LedgerQuery::new(&self.schema.domain)
            .where_eq(&self.schema.owner_field, instance_id)
            .consistent(true);
        let mut scan = LedgerScan::new(&self.store, query).with_call_timeout(self.call_timeout);

        while let Some(page) = scan.next_page().await? {
            let owned = page
                .iter()
                .map(|item| CredentialRecord::from_item(item, &self.schema))
                .find(|record| record.owner_instance_id == instance_id && record.has_refs());
            if let Some(record) = owned {
                return Ok(Some(record.refs()));
            }
        }
        Ok(None)
    }

    /// Attempt one row: conditional write, then consistent verification.
    async fn try_claim(
        &self,
        record: &CredentialRecord,
        instance_id: &str,
    ) -> Result<Option<CredentialRefs>, LedgerError> {
        let outcome = deadline::bounded(
            self.call_timeout,
            self.store.conditional_assign(
                &self.schema.domain,
                &record.row_id,
                &self.schema.owner_field,
                "",
                instance_id,
            ),
            LedgerError::Timeout,
        )
        .await?;

        if outcome == CasOutcome::PreconditionFailed {
            tracing::debug!(row = %record.row_id, instance_id, "lost claim race");
            return Ok(None);
        }

        let confirmed = deadline::bounded(
            self.call_timeout,
            self.store.get_consistent(&self.schema.domain, &record.row_id),
            LedgerError::Timeout,
        )
        .await?;

        match confirmed.map(|item| CredentialRecord::from_item(&item, &self.schema)) {
            Some(row) if row.owner_instance_id == instance_id => Ok(Some(row.refs())),
            Some(row) => {
                tracing::warn!(
                    row = %record.row_id,
                    instance_id,
                    observed_owner = %row.owner_instance_id,
                    "claim did not survive verification"
                );
                Ok(None)
            }
            None => {
                tracing::warn!(row = %record.row_id, instance_id, "claimed row vanished before verification");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerItem, LedgerPage};

    const APP: &str = "cass";

    fn pool(rows: usize) -> InMemoryLedger {
        let ledger = InMemoryLedger::with_page_size(2);
        for i in 0..rows {
            ledger.put_item(
                "InstanceSecurity",
                LedgerItem::new(format!("row-{i}"))
                    .with_attribute("appId", APP)
                    .with_attribute("instanceId", "")
                    .with_attribute("keystore", format!("ks-{i}"))
                    .with_attribute("truststore", format!("ts-{i}")),
            );
        }
        ledger
    }

    fn coordinator<S: LedgerStore>(store: S) -> CredentialClaimCoordinator<S> {
        CredentialClaimCoordinator::new(store, ClaimSchema::default())
    }

    #[tokio::test]
    async fn test_claims_first_unclaimed_row() {
        let coord = coordinator(pool(3));
        let refs = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(refs.row_id, "row-0");
        assert_eq!(refs.keystore_ref, "ks-0");
        assert_eq!(refs.truststore_ref, "ts-0");
    }

    #[tokio::test]
    async fn test_repeat_claim_is_idempotent_without_writes() {
        let coord = coordinator(pool(3));
        let first = coord.claim("i-1", APP).await.unwrap();
        let writes = coord.store().conditional_write_count();

        let second = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(coord.store().conditional_write_count(), writes);
    }

    #[tokio::test]
    async fn test_skips_rows_owned_by_others() {
        let ledger = pool(3);
        ledger.put_item(
            "InstanceSecurity",
            LedgerItem::new("row-0")
                .with_attribute("appId", APP)
                .with_attribute("instanceId", "i-other")
                .with_attribute("keystore", "ks-0")
                .with_attribute("truststore", "ts-0"),
        );
        let coord = coordinator(ledger);
        let refs = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(refs.row_id, "row-1");
    }

    #[tokio::test]
    async fn test_ignores_other_apps() {
        let ledger = pool(0);
        ledger.put_item(
            "InstanceSecurity",
            LedgerItem::new("row-x")
                .with_attribute("appId", "other")
                .with_attribute("keystore", "ks")
                .with_attribute("truststore", "ts"),
        );
        let coord = coordinator(ledger);
        let err = coord.claim("i-1", APP).await.unwrap_err();
        assert!(matches!(err, ClaimError::Exhausted { candidates: 0, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_when_pool_is_spent() {
        let coord = coordinator(pool(2));
        coord.claim("i-1", APP).await.unwrap();
        coord.claim("i-2", APP).await.unwrap();
        let err = coord.claim("i-3", APP).await.unwrap_err();
        match err {
            ClaimError::Exhausted { app_id, candidates } => {
                assert_eq!(app_id, APP);
                assert_eq!(candidates, 0);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_instance_id_rejected() {
        let coord = coordinator(pool(1));
        let err = coord.claim("", APP).await.unwrap_err();
        assert!(matches!(err, ClaimError::InvalidRequest(_)));
        assert_eq!(coord.store().conditional_write_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_propagates() {
        let ledger = pool(2);
        ledger.fail_next_writes(1);
        let coord = coordinator(ledger);
        let err = coord.claim("i-1", APP).await.unwrap_err();
        assert!(matches!(err, ClaimError::Ledger(LedgerError::Transient(_))));
    }

    #[tokio::test]
    async fn test_row_without_refs_is_not_a_candidate() {
        let ledger = pool(0);
        ledger.put_item(
            "InstanceSecurity",
            LedgerItem::new("row-a")
                .with_attribute("appId", APP)
                .with_attribute("keystore", "ks"),
        );
        let coord = coordinator(ledger);
        assert!(matches!(
            coord.claim("i-1", APP).await,
            Err(ClaimError::Exhausted { candidates: 0, .. })
        ));
        assert_eq!(coord.store().conditional_write_count(), 0);
    }

    #[tokio::test]
    async fn test_owned_row_without_refs_falls_through_to_scan() {
        let ledger = pool(1);
        ledger.put_item(
            "InstanceSecurity",
            LedgerItem::new("row-broken")
                .with_attribute("appId", APP)
                .with_attribute("instanceId", "i-1"),
        );
        let coord = coordinator(ledger);
        let refs = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(refs.row_id, "row-0");
    }

    #[tokio::test]
    async fn test_custom_schema() {
        let ledger = InMemoryLedger::new();
        ledger.put_item(
            "Pool",
            LedgerItem::new("r")
                .with_attribute("app", APP)
                .with_attribute("ks", "k")
                .with_attribute("ts", "t"),
        );
        let schema = ClaimSchema {
            domain: "Pool".into(),
            app_field: "app".into(),
            owner_field: "owner".into(),
            keystore_field: "ks".into(),
            truststore_field: "ts".into(),
            updated_field: "ts_updated".into(),
            consistent_scan: false,
        };
        let coord = CredentialClaimCoordinator::new(ledger, schema);
        let refs = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(refs.keystore_ref, "k");
        assert_eq!(coord.store().item("Pool", "r").unwrap().attribute("owner"), "i-1");
    }

    /// Store whose conditional writes always report success but whose
    /// first rows are silently overwritten by a competing instance.
    struct ClobberedStore {
        inner: InMemoryLedger,
        clobbered: Mutex<HashSet<String>>,
    }

    impl LedgerStore for ClobberedStore {
        fn select(
            &self,
            query: &LedgerQuery,
            token: Option<&str>,
        ) -> impl Future<Output = Result<LedgerPage, LedgerError>> + Send {
            self.inner.select(query, token)
        }

        async fn conditional_assign(
            &self,
            domain: &str,
            item: &str,
            field: &str,
            expected: &str,
            value: &str,
        ) -> Result<CasOutcome, LedgerError> {
            let outcome = self
                .inner
                .conditional_assign(domain, item, field, expected, value)
                .await?;
            if self.clobbered.lock().contains(item) {
                self.inner.put_item(
                    domain,
                    LedgerItem {
                        attributes: self
                            .inner
                            .item(domain, item)
                            .map(|i| i.attributes)
                            .unwrap_or_default(),
                        name: item.to_string(),
                    }
                    .with_attribute(field, "i-rival"),
                );
            }
            Ok(outcome)
        }

        fn get_consistent(
            &self,
            domain: &str,
            item: &str,
        ) -> impl Future<Output = Result<Option<LedgerItem>, LedgerError>> + Send {
            self.inner.get_consistent(domain, item)
        }
    }

    #[tokio::test]
    async fn test_failed_verification_moves_to_next_row() {
        let store = ClobberedStore {
            inner: pool(3),
            clobbered: Mutex::new(["row-0".to_string(), "row-1".to_string()].into()),
        };
        let coord = coordinator(store);
        let refs = coord.claim("i-1", APP).await.unwrap();
        assert_eq!(refs.row_id, "row-2");
    }

    #[tokio::test]
    async fn test_all_rows_clobbered_is_exhausted() {
        let store = ClobberedStore {
            inner: pool(2),
            clobbered: Mutex::new(["row-0".to_string(), "row-1".to_string()].into()),
        };
        let coord = coordinator(store);
        let err = coord.claim("i-1", APP).await.unwrap_err();
        assert!(matches!(err, ClaimError::Exhausted { candidates: 2, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let ledger = Arc::new(pool(8));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let coord = coordinator(Arc::clone(&ledger));
            tasks.spawn(async move { coord.claim(&format!("i-{i}"), APP).await });
        }

        let mut rows = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let refs = joined.unwrap().unwrap();
            assert!(rows.insert(refs.row_id), "row handed out twice");
        }
        assert_eq!(rows.len(), 8);
    }
}
