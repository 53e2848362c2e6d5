//! Membership read from an instance-identity domain in the ledger.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{InstanceRecord, MembershipDirectory, MembershipError};
use crate::ledger::{LedgerError, LedgerQuery, LedgerScan, LedgerStore};

/// Field layout of the instance-identity domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSchema {
    /// Ledger domain holding one row per registered instance.
    pub domain: String,
    /// Attribute naming the application.
    pub app_field: String,
    /// Attribute holding the cloud instance id.
    pub instance_field: String,
    /// Attribute holding the host address.
    pub host_field: String,
    /// Attribute holding the availability zone.
    pub zone_field: String,
    /// Attribute flagging seeds (`"true"`, case-insensitive).
    pub seed_field: String,
}

impl Default for InstanceSchema {
    fn default() -> Self {
        Self {
            domain: "InstanceIdentity".into(),
            app_field: "appId".into(),
            instance_field: "instanceId".into(),
            host_field: "hostIP".into(),
            zone_field: "rack".into(),
            seed_field: "seed".into(),
        }
    }
}

/// [`MembershipDirectory`] backed by a full scan of the identity domain.
#[derive(Debug)]
pub struct LedgerDirectory<S> {
    store: S,
    schema: InstanceSchema,
    call_timeout: Option<Duration>,
}

impl<S: LedgerStore> LedgerDirectory<S> {
    /// Create a directory over `store`.
    #[must_use]
    pub fn new(store: S, schema: InstanceSchema) -> Self {
        Self {
            store,
            schema,
            call_timeout: None,
        }
    }

    /// Bound each page fetch by `limit`.
    #[must_use]
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }
}

impl<S: LedgerStore> MembershipDirectory for LedgerDirectory<S> {
    async fn list(&self, app_id: &str) -> Result<Vec<InstanceRecord>, MembershipError> {
        let query = LedgerQuery::new(&self.schema.domain).where_eq(&self.schema.app_field, app_id);
        let items = LedgerScan::new(&self.store, query)
            .with_call_timeout(self.call_timeout)
            .collect_all()
            .await
            .map_err(|e| match e {
                LedgerError::Timeout(d) => MembershipError::Timeout(d),
                other => MembershipError::Ledger(other),
            })?;

        let mut instances = Vec::with_capacity(items.len());
        for item in items {
            let host = item.attribute(&self.schema.host_field);
            if host.trim().is_empty() {
                tracing::warn!(item = %item.name, app_id, "identity row has no host address, skipping");
                continue;
            }
            instances.push(InstanceRecord {
                instance_id: item.attribute(&self.schema.instance_field).to_string(),
                host_address: host.trim().to_string(),
                availability_zone: item.attribute(&self.schema.zone_field).to_string(),
                is_seed: item.attribute(&self.schema.seed_field).eq_ignore_ascii_case("true"),
            });
        }
        tracing::debug!(app_id, members = instances.len(), "listed members from ledger");
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerItem};

    fn identity(name: &str, app: &str, host: &str, seed: &str) -> LedgerItem {
        LedgerItem::new(name)
            .with_attribute("appId", app)
            .with_attribute("instanceId", format!("i-{name}"))
            .with_attribute("hostIP", host)
            .with_attribute("rack", "us-east-1a")
            .with_attribute("seed", seed)
    }

    #[tokio::test]
    async fn test_lists_members_across_pages() {
        let ledger = InMemoryLedger::with_page_size(1);
        ledger.put_item("InstanceIdentity", identity("a", "cass", "10.0.0.1", "TRUE"));
        ledger.put_item("InstanceIdentity", identity("b", "cass", "10.0.0.2", ""));
        ledger.put_item("InstanceIdentity", identity("c", "other", "10.0.0.3", ""));

        let dir = LedgerDirectory::new(ledger, InstanceSchema::default());
        let members = dir.list("cass").await.unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].instance_id, "i-a");
        assert!(members[0].is_seed);
        assert!(!members[1].is_seed);
        assert_eq!(members[1].host_address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_skips_rows_without_host() {
        let ledger = InMemoryLedger::new();
        ledger.put_item("InstanceIdentity", identity("a", "cass", "  ", ""));
        let dir = LedgerDirectory::new(ledger, InstanceSchema::default());
        assert!(dir.list("cass").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_maps_to_membership_error() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next_selects(1);
        let dir = LedgerDirectory::new(ledger, InstanceSchema::default());
        let err = dir.list("cass").await.unwrap_err();
        assert!(matches!(err, MembershipError::Ledger(LedgerError::Transient(_))));
    }
}
