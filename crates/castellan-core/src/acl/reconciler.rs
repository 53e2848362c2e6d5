//! Desired-vs-actual reconciliation of ACL ranges.
//!
//! One pass lists the membership once, then diffs and applies every
//! managed port pair. A failing pair is recorded and the remaining pairs
//! are still processed; pairs that already succeeded are never rolled
//! back.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{diff_ranges, AccessLatch, AclError, AclProvider, PortPair};
use crate::deadline;
use crate::membership::{MembershipDirectory, MembershipError};
use crate::schedule::ScheduledTask;

/// Step of a port-pair reconciliation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStage {
    /// Listing current ranges.
    List,
    /// Adding missing ranges.
    Add,
    /// Removing stale ranges.
    Remove,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Changes applied to one port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPairOutcome {
    /// The port pair.
    pub ports: PortPair,
    /// Ranges successfully added.
    pub added: BTreeSet<String>,
    /// Ranges successfully removed.
    pub removed: BTreeSet<String>,
}

/// A port pair whose reconciliation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPairFailure {
    /// The port pair.
    pub ports: PortPair,
    /// Step that failed.
    pub stage: ReconcileStage,
    /// Provider error.
    pub error: AclError,
}

impl fmt::Display for PortPairFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.ports, self.stage, self.error)
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Application reconciled.
    pub app_id: String,
    /// Number of distinct member ranges desired.
    pub desired: usize,
    /// Per-pair applied changes, in processing order.
    pub outcomes: Vec<PortPairOutcome>,
}

impl ReconcileReport {
    /// Outcome for `ports`, if it was processed.
    #[must_use]
    pub fn outcome(&self, ports: PortPair) -> Option<&PortPairOutcome> {
        self.outcomes.iter().find(|o| o.ports == ports)
    }

    /// Returns `true` if any range was added or removed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| !o.added.is_empty() || !o.removed.is_empty())
    }
}

/// Errors from a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The membership lookup failed; no port pair was touched.
    #[error("membership lookup failed: {0}")]
    Membership(#[from] MembershipError),

    /// One or more port pairs failed; the others were applied.
    #[error("reconciliation failed for port pair(s): {}", describe(.failures))]
    Partial {
        /// Failed pairs.
        failures: Vec<PortPairFailure>,
        /// Changes that were applied during the pass.
        report: ReconcileReport,
    },
}

impl ReconcileError {
    /// Port pairs that failed in this pass.
    #[must_use]
    pub fn failed_ports(&self) -> Vec<PortPair> {
        match self {
            Self::Membership(_) => Vec::new(),
            Self::Partial { failures, .. } => {
                let mut ports: Vec<PortPair> = failures.iter().map(|f| f.ports).collect();
                ports.dedup();
                ports
            }
        }
    }
}

fn describe(failures: &[PortPairFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Aligns provider ranges with the membership of an application.
#[derive(Debug)]
pub struct AclReconciler<D, P> {
    directory: D,
    provider: P,
    latch: AccessLatch,
    call_timeout: Option<Duration>,
}

impl<D: MembershipDirectory, P: AclProvider> AclReconciler<D, P> {
    /// Create a reconciler opening `latch` on the first applied change.
    #[must_use]
    pub fn new(directory: D, provider: P, latch: AccessLatch) -> Self {
        Self {
            directory,
            provider,
            latch,
            call_timeout: None,
        }
    }

    /// Bound every remote call by `limit`.
    #[must_use]
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// The latch opened by this reconciler.
    #[must_use]
    pub fn latch(&self) -> &AccessLatch {
        &self.latch
    }

    /// Run one reconciliation pass over `port_pairs`.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Membership`] if the member list is unavailable
    /// - [`ReconcileError::Partial`] if any port pair failed
    pub async fn reconcile(
        &self,
        app_id: &str,
        port_pairs: &[PortPair],
    ) -> Result<ReconcileReport, ReconcileError> {
        let members = deadline::bounded(
            self.call_timeout,
            self.directory.list(app_id),
            MembershipError::Timeout,
        )
        .await?;

        let mut desired = BTreeSet::new();
        for member in &members {
            match member.host_cidr() {
                Some(cidr) => {
                    desired.insert(cidr);
                }
                None => {
                    tracing::warn!(app_id, instance = %member.instance_id, "member has no host address");
                }
            }
        }

        let mut report = ReconcileReport {
            app_id: app_id.to_string(),
            desired: desired.len(),
            outcomes: Vec::with_capacity(port_pairs.len()),
        };
        let mut failures = Vec::new();

        for &ports in port_pairs {
            let outcome = self.reconcile_pair(app_id, ports, &desired, &mut failures).await;
            report.outcomes.push(outcome);
        }

        if failures.is_empty() {
            tracing::debug!(app_id, pairs = port_pairs.len(), changed = report.changed(), "ACL pass complete");
            Ok(report)
        } else {
            Err(ReconcileError::Partial { failures, report })
        }
    }

    async fn reconcile_pair(
        &self,
        app_id: &str,
        ports: PortPair,
        desired: &BTreeSet<String>,
        failures: &mut Vec<PortPairFailure>,
    ) -> PortPairOutcome {
        let mut outcome = PortPairOutcome {
            ports,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        };

        let current = match deadline::bounded(self.call_timeout, self.provider.list(ports), AclError::Timeout).await {
            Ok(current) => current,
            Err(error) => {
                tracing::warn!(app_id, %ports, %error, "listing ACL ranges failed");
                failures.push(PortPairFailure {
                    ports,
                    stage: ReconcileStage::List,
                    error,
                });
                return outcome;
            }
        };

        let diff = diff_ranges(desired, &current);

        if !diff.to_add.is_empty() {
            match deadline::bounded(self.call_timeout, self.provider.add(&diff.to_add, ports), AclError::Timeout).await {
                Ok(()) => {
                    tracing::info!(app_id, %ports, ranges = ?diff.to_add, "added ACL ranges");
                    self.mark_applied();
                    outcome.added = diff.to_add;
                }
                Err(error) => {
                    tracing::warn!(app_id, %ports, %error, "adding ACL ranges failed");
                    failures.push(PortPairFailure {
                        ports,
                        stage: ReconcileStage::Add,
                        error,
                    });
                }
            }
        }

        if !diff.to_remove.is_empty() {
            match deadline::bounded(
                self.call_timeout,
                self.provider.remove(&diff.to_remove, ports),
                AclError::Timeout,
            )
            .await
            {
                Ok(()) => {
                    tracing::info!(app_id, %ports, ranges = ?diff.to_remove, "removed ACL ranges");
                    self.mark_applied();
                    outcome.removed = diff.to_remove;
                }
                Err(error) => {
                    tracing::warn!(app_id, %ports, %error, "removing ACL ranges failed");
                    failures.push(PortPairFailure {
                        ports,
                        stage: ReconcileStage::Remove,
                        error,
                    });
                }
            }
        }

        outcome
    }

    fn mark_applied(&self) {
        if self.latch.open() {
            tracing::info!("network access established");
        }
    }
}

/// Schedulable wrapper running one pass per firing.
#[derive(Debug)]
pub struct ReconcileTask<D, P> {
    reconciler: Arc<AclReconciler<D, P>>,
    app_id: String,
    port_pairs: Vec<PortPair>,
}

impl<D, P> ReconcileTask<D, P> {
    /// Task name used in logs.
    pub const NAME: &'static str = "update-acl";

    /// Create a task reconciling `port_pairs` for `app_id`.
    #[must_use]
    pub fn new(reconciler: Arc<AclReconciler<D, P>>, app_id: impl Into<String>, port_pairs: Vec<PortPair>) -> Self {
        Self {
            reconciler,
            app_id: app_id.into(),
            port_pairs,
        }
    }
}

impl<D: MembershipDirectory, P: AclProvider> ScheduledTask for ReconcileTask<D, P> {
    type Error = ReconcileError;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), ReconcileError> {
        self.reconciler
            .reconcile(&self.app_id, &self.port_pairs)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::InMemoryAclProvider;
    use crate::membership::{InstanceRecord, StaticDirectory};

    const STORAGE: PortPair = PortPair::single(7000);
    const MANAGEMENT: PortPair = PortPair::single(7199);
    const MONITORING: PortPair = PortPair::single(61620);

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn directory(hosts: &[&str]) -> Arc<StaticDirectory> {
        let dir = Arc::new(StaticDirectory::new());
        dir.set_members(
            "cass",
            hosts
                .iter()
                .enumerate()
                .map(|(i, h)| InstanceRecord::new(format!("i-{i}"), *h, "us-east-1a"))
                .collect(),
        );
        dir
    }

    fn reconciler(
        dir: Arc<StaticDirectory>,
        acl: Arc<InMemoryAclProvider>,
    ) -> AclReconciler<Arc<StaticDirectory>, Arc<InMemoryAclProvider>> {
        AclReconciler::new(dir, acl, AccessLatch::new())
    }

    #[tokio::test]
    async fn test_pass_applies_diff_per_pair() {
        let acl = Arc::new(InMemoryAclProvider::new());
        acl.insert(STORAGE, ["10.0.0.1/32".to_string(), "10.0.0.3/32".to_string()]);
        let rec = reconciler(directory(&["10.0.0.1", "10.0.0.2"]), Arc::clone(&acl));

        let report = rec.reconcile("cass", &[STORAGE, MANAGEMENT]).await.unwrap();

        let storage = report.outcome(STORAGE).unwrap();
        assert_eq!(storage.added, set(&["10.0.0.2/32"]));
        assert_eq!(storage.removed, set(&["10.0.0.3/32"]));
        let management = report.outcome(MANAGEMENT).unwrap();
        assert_eq!(management.added, set(&["10.0.0.1/32", "10.0.0.2/32"]));
        assert!(management.removed.is_empty());

        let desired = set(&["10.0.0.1/32", "10.0.0.2/32"]);
        assert_eq!(acl.ranges_for(STORAGE), desired);
        assert_eq!(acl.ranges_for(MANAGEMENT), desired);
        assert!(rec.latch().is_open());
    }

    #[tokio::test]
    async fn test_converged_pass_makes_no_calls() {
        let acl = Arc::new(InMemoryAclProvider::new());
        acl.insert(STORAGE, ["10.0.0.1/32".to_string()]);
        let rec = reconciler(directory(&["10.0.0.1"]), Arc::clone(&acl));

        let report = rec.reconcile("cass", &[STORAGE]).await.unwrap();
        assert!(!report.changed());
        assert!(acl.mutations().is_empty());
        assert!(!rec.latch().is_open());
    }

    #[tokio::test]
    async fn test_add_failure_is_isolated_to_its_pair() {
        let acl = Arc::new(InMemoryAclProvider::new());
        acl.fail_add(STORAGE, AclError::Transient("throttled".into()));
        let rec = reconciler(directory(&["10.0.0.1", "10.0.0.2"]), Arc::clone(&acl));

        let err = rec
            .reconcile("cass", &[STORAGE, MANAGEMENT, MONITORING])
            .await
            .unwrap_err();

        assert_eq!(err.failed_ports(), vec![STORAGE]);
        let ReconcileError::Partial { failures, report } = err else {
            panic!("expected partial failure");
        };
        assert_eq!(failures[0].stage, ReconcileStage::Add);
        assert!(report.outcome(STORAGE).unwrap().added.is_empty());
        assert_eq!(report.outcome(MANAGEMENT).unwrap().added.len(), 2);

        let desired = set(&["10.0.0.1/32", "10.0.0.2/32"]);
        assert!(acl.ranges_for(STORAGE).is_empty());
        assert_eq!(acl.ranges_for(MANAGEMENT), desired);
        assert_eq!(acl.ranges_for(MONITORING), desired);
        assert!(rec.latch().is_open());
    }

    #[tokio::test]
    async fn test_remove_still_attempted_after_add_failure() {
        let acl = Arc::new(InMemoryAclProvider::new());
        acl.insert(STORAGE, ["10.9.9.9/32".to_string()]);
        acl.fail_add(STORAGE, AclError::Transient("throttled".into()));
        let rec = reconciler(directory(&["10.0.0.1"]), Arc::clone(&acl));

        let err = rec.reconcile("cass", &[STORAGE]).await.unwrap_err();
        let ReconcileError::Partial { report, .. } = err else {
            panic!("expected partial failure");
        };
        assert_eq!(report.outcome(STORAGE).unwrap().removed, set(&["10.9.9.9/32"]));
        assert!(acl.ranges_for(STORAGE).is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_skips_pair() {
        let acl = Arc::new(InMemoryAclProvider::new());
        acl.fail_list(MANAGEMENT, AclError::Timeout(Duration::from_secs(5)));
        let rec = reconciler(directory(&["10.0.0.1"]), Arc::clone(&acl));

        let err = rec.reconcile("cass", &[MANAGEMENT, STORAGE]).await.unwrap_err();
        assert_eq!(err.failed_ports(), vec![MANAGEMENT]);
        assert!(err.to_string().contains("7199 (list"));
        assert_eq!(acl.ranges_for(STORAGE), set(&["10.0.0.1/32"]));
        assert_eq!(acl.mutations(), vec![("add", STORAGE)]);
    }

    #[tokio::test]
    async fn test_removed_member_is_revoked() {
        let acl = Arc::new(InMemoryAclProvider::new());
        let dir = directory(&["10.0.0.1", "10.0.0.2"]);
        let rec = reconciler(Arc::clone(&dir), Arc::clone(&acl));
        rec.reconcile("cass", &[STORAGE]).await.unwrap();

        dir.set_members("cass", vec![InstanceRecord::new("i-0", "10.0.0.1", "us-east-1a")]);
        let report = rec.reconcile("cass", &[STORAGE]).await.unwrap();
        assert_eq!(report.outcome(STORAGE).unwrap().removed, set(&["10.0.0.2/32"]));
        assert_eq!(acl.ranges_for(STORAGE), set(&["10.0.0.1/32"]));
    }

    #[tokio::test]
    async fn test_duplicate_hosts_collapse() {
        let acl = Arc::new(InMemoryAclProvider::new());
        let rec = reconciler(directory(&["10.0.0.1", "10.0.0.1", ""]), Arc::clone(&acl));
        let report = rec.reconcile("cass", &[STORAGE]).await.unwrap();
        assert_eq!(report.desired, 1);
        assert_eq!(acl.ranges_for(STORAGE), set(&["10.0.0.1/32"]));
    }

    #[tokio::test]
    async fn test_task_runs_a_pass() {
        let acl = Arc::new(InMemoryAclProvider::new());
        let rec = Arc::new(reconciler(directory(&["10.0.0.1"]), Arc::clone(&acl)));
        let task = ReconcileTask::new(rec, "cass", vec![STORAGE]);
        assert_eq!(task.name(), "update-acl");
        task.run().await.unwrap();
        assert_eq!(acl.ranges_for(STORAGE), set(&["10.0.0.1/32"]));
    }
}
