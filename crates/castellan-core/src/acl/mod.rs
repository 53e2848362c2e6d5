//! # Network Access Rules
//!
//! Keeps firewall (security group) ranges equal to the live membership
//! set. Each managed port pair is reconciled independently:
//!
//! ```text
//! desired = { host/32 | member }      current = provider.list(pair)
//! to_add  = desired − current         to_remove = current − desired
//! ```
//!
//! ## Modules
//!
//! - `memory`: `InMemoryAclProvider` for tests and local runs
//! - `reconciler`: `AclReconciler` and the schedulable `ReconcileTask`

mod memory;
mod reconciler;

pub use memory::InMemoryAclProvider;
pub use reconciler::{
    AclReconciler, PortPairFailure, PortPairOutcome, ReconcileError, ReconcileReport,
    ReconcileStage, ReconcileTask,
};

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inclusive port range a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortPair {
    /// First port.
    pub from: u16,
    /// Last port.
    pub to: u16,
}

impl PortPair {
    /// Pair covering exactly one port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

/// One permitted source range on a port pair. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclRange {
    /// Source CIDR, e.g. `10.0.0.1/32`.
    pub cidr: String,
    /// Ports the range is allowed on.
    pub ports: PortPair,
}

/// Ranges to add and remove for one port pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclDiff {
    /// `desired − current`.
    pub to_add: BTreeSet<String>,
    /// `current − desired`.
    pub to_remove: BTreeSet<String>,
}

impl AclDiff {
    /// Returns `true` when the current set already equals the desired one.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute the set difference in both directions.
#[must_use]
pub fn diff_ranges(desired: &BTreeSet<String>, current: &BTreeSet<String>) -> AclDiff {
    AclDiff {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
    }
}

/// Errors from the firewall API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    /// Network or service failure.
    #[error("transient ACL provider failure: {0}")]
    Transient(String),

    /// The call did not complete within the configured deadline.
    #[error("ACL call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider refused the change (quota, malformed range, ...).
    #[error("ACL change rejected on ports {ports}: {reason}")]
    Rejected {
        /// Port pair of the rejected change.
        ports: PortPair,
        /// Provider-supplied reason.
        reason: String,
    },
}

/// Firewall or security-group API.
///
/// `add` and `remove` are idempotent per range: adding a present range
/// or removing an absent one is a no-op, not an error.
pub trait AclProvider: Send + Sync {
    /// Source ranges currently permitted on `ports`.
    fn list(&self, ports: PortPair) -> impl Future<Output = Result<BTreeSet<String>, AclError>> + Send;

    /// Permit `ranges` on `ports`.
    fn add(
        &self,
        ranges: &BTreeSet<String>,
        ports: PortPair,
    ) -> impl Future<Output = Result<(), AclError>> + Send;

    /// Revoke `ranges` on `ports`.
    fn remove(
        &self,
        ranges: &BTreeSet<String>,
        ports: PortPair,
    ) -> impl Future<Output = Result<(), AclError>> + Send;
}

impl<P: AclProvider> AclProvider for Arc<P> {
    fn list(&self, ports: PortPair) -> impl Future<Output = Result<BTreeSet<String>, AclError>> + Send {
        (**self).list(ports)
    }

    fn add(
        &self,
        ranges: &BTreeSet<String>,
        ports: PortPair,
    ) -> impl Future<Output = Result<(), AclError>> + Send {
        (**self).add(ranges, ports)
    }

    fn remove(
        &self,
        ranges: &BTreeSet<String>,
        ports: PortPair,
    ) -> impl Future<Output = Result<(), AclError>> + Send {
        (**self).remove(ranges, ports)
    }
}

/// Process-wide "network access established" flag.
///
/// Opens the first time any ACL add or remove succeeds and never closes.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct AccessLatch(Arc<AtomicBool>);

impl AccessLatch {
    /// Create a closed latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once access has been applied at least once.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Open the latch. Returns `true` if this call opened it.
    pub fn open(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}
