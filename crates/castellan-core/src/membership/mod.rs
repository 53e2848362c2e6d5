//! # Membership Directory
//!
//! Sources of the live instance set for an application.
//!
//! ## Implementations
//!
//! - `StaticDirectory`: fixed, externally updated instance lists
//! - `LedgerDirectory`: instance-identity rows read from a [`LedgerStore`]
//!
//! [`LedgerStore`]: crate::ledger::LedgerStore

mod ledger_directory;
pub use ledger_directory::{InstanceSchema, LedgerDirectory};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerError;

/// One live cluster instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Cloud instance identifier.
    pub instance_id: String,
    /// Address other members reach this instance on.
    pub host_address: String,
    /// Availability zone (rack) of the instance.
    pub availability_zone: String,
    /// Whether this instance is a seed of its topology unit.
    pub is_seed: bool,
}

impl InstanceRecord {
    /// Create a non-seed instance record.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        host_address: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            host_address: host_address.into(),
            availability_zone: availability_zone.into(),
            is_seed: false,
        }
    }

    /// Mark the record as a seed.
    #[must_use]
    pub fn seed(mut self) -> Self {
        self.is_seed = true;
        self
    }

    /// Single-host CIDR for this instance, or `None` without an address.
    #[must_use]
    pub fn host_cidr(&self) -> Option<String> {
        let host = self.host_address.trim();
        (!host.is_empty()).then(|| format!("{host}/32"))
    }
}

impl fmt::Display for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.instance_id, self.host_address, self.availability_zone)
    }
}

/// Errors from membership lookups.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MembershipError {
    /// Network or service failure.
    #[error("transient membership failure: {0}")]
    Transient(String),

    /// The lookup did not finish within the configured deadline.
    #[error("membership lookup timed out after {0:?}")]
    Timeout(Duration),

    /// The backing ledger failed.
    #[error("membership ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Returns the live instances of an application.
pub trait MembershipDirectory: Send + Sync {
    /// List instances for `app_id` in directory order.
    fn list(&self, app_id: &str) -> impl Future<Output = Result<Vec<InstanceRecord>, MembershipError>> + Send;
}

impl<D: MembershipDirectory> MembershipDirectory for Arc<D> {
    fn list(&self, app_id: &str) -> impl Future<Output = Result<Vec<InstanceRecord>, MembershipError>> + Send {
        (**self).list(app_id)
    }
}

/// Directory serving instance lists held in memory.
///
/// Lists are replaced wholesale with [`StaticDirectory::set_members`], so a
/// reconciliation pass always sees a complete snapshot.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    members: RwLock<HashMap<String, Vec<InstanceRecord>>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the member list of `app_id`.
    pub fn set_members(&self, app_id: &str, members: Vec<InstanceRecord>) {
        self.members.write().insert(app_id.to_string(), members);
    }
}

impl MembershipDirectory for StaticDirectory {
    async fn list(&self, app_id: &str) -> Result<Vec<InstanceRecord>, MembershipError> {
        Ok(self.members.read().get(app_id).cloned().unwrap_or_default())
    }
}
