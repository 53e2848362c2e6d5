//! # `Castellan` Core
//!
//! Coordination primitives for a per-node database sidecar.
//!
//! This crate provides:
//! - A ledger abstraction over an eventually-consistent attribute store
//!   with a single-field compare-and-swap write
//! - The credential claim protocol that hands each instance exactly one
//!   pre-provisioned TLS bundle from a shared pool
//! - Membership directories and the ACL reconciler that keeps firewall
//!   ranges equal to the live membership set
//! - Region-aware property loading from the same ledger
//! - A single-task scheduler with seed (periodic, jittered) and
//!   non-seed (run-once) timers
//!
//! ## Startup flow
//!
//! ```text
//! CredentialClaimCoordinator::claim ──► CredentialInstaller::install
//!                                              │
//!              TaskTimer::for_role ──► spawn_task(ReconcileTask)
//!                                              │
//!                     MembershipDirectory ──► AclReconciler ──► AclProvider
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow missing errors doc for internal functions
#![allow(clippy::missing_errors_doc)]

pub mod acl;
pub mod claim;
pub mod credentials;
pub mod ledger;
pub mod membership;
pub mod properties;
pub mod schedule;

mod deadline;

pub use acl::{
    AccessLatch, AclError, AclProvider, AclRange, AclReconciler, PortPair, ReconcileError,
    ReconcileReport, ReconcileTask,
};
pub use claim::{ClaimError, ClaimSchema, CredentialClaimCoordinator, CredentialRecord, CredentialRefs};
pub use credentials::{CredentialInstaller, InstallError};
pub use ledger::{CasOutcome, InMemoryLedger, LedgerError, LedgerItem, LedgerQuery, LedgerScan, LedgerStore};
pub use membership::{InstanceRecord, MembershipDirectory, MembershipError};
pub use properties::{load_properties, PropertyMap, PropertySchema};
pub use schedule::{spawn_task, ScheduledTask, TaskHandle, TaskMetrics, TaskTimer};
