//! Startup sequencing: claim, install, then schedule reconciliation.

use std::sync::Arc;

use castellan_core::properties::{load_properties, PropertyMap};
use castellan_core::schedule::{spawn_task_seeded, TaskMetricsSnapshot};
use castellan_core::{
    spawn_task, AccessLatch, AclProvider, AclReconciler, CredentialClaimCoordinator,
    CredentialInstaller, CredentialRefs, LedgerStore, MembershipDirectory, ReconcileTask,
    TaskHandle, TaskTimer,
};

use crate::config::SidecarConfig;
use crate::error::SidecarError;

/// Fluent builder for a [`Sidecar`].
///
/// # Example
///
/// ```rust,ignore
/// let handle = Sidecar::builder()
///     .config(config)
///     .ledger(ledger)
///     .directory(directory)
///     .provider(provider)
///     .build()?
///     .start()
///     .await?;
/// ```
pub struct SidecarBuilder<L, D, P> {
    config: SidecarConfig,
    ledger: Option<L>,
    directory: Option<D>,
    provider: Option<P>,
    installer: Option<Arc<dyn CredentialInstaller>>,
    jitter_seed: Option<u64>,
}

impl<L, D, P> SidecarBuilder<L, D, P>
where
    L: LedgerStore + 'static,
    D: MembershipDirectory + 'static,
    P: AclProvider + 'static,
{
    fn new() -> Self {
        Self {
            config: SidecarConfig::default(),
            ledger: None,
            directory: None,
            provider: None,
            installer: None,
            jitter_seed: None,
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: SidecarConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the ledger holding the credential pool (and properties).
    #[must_use]
    pub fn ledger(mut self, ledger: L) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the membership source.
    #[must_use]
    pub fn directory(mut self, directory: D) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the firewall API.
    #[must_use]
    pub fn provider(mut self, provider: P) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Install claimed credentials with `installer`.
    #[must_use]
    pub fn installer(mut self, installer: Arc<dyn CredentialInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Use a fixed jitter sequence for the reconciliation timer.
    #[must_use]
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Validate the configuration and assemble the sidecar.
    ///
    /// # Errors
    ///
    /// - [`SidecarError::Config`] if the configuration is invalid
    /// - [`SidecarError::Missing`] if a collaborator was not supplied
    pub fn build(self) -> Result<Sidecar<L, D, P>, SidecarError> {
        self.config.validate()?;
        Ok(Sidecar {
            ledger: self.ledger.ok_or(SidecarError::Missing("a ledger"))?,
            directory: self.directory.ok_or(SidecarError::Missing("a membership directory"))?,
            provider: self.provider.ok_or(SidecarError::Missing("an ACL provider"))?,
            installer: self.installer,
            jitter_seed: self.jitter_seed,
            config: self.config,
        })
    }
}

/// A configured but not yet started sidecar.
pub struct Sidecar<L, D, P> {
    config: SidecarConfig,
    ledger: L,
    directory: D,
    provider: P,
    installer: Option<Arc<dyn CredentialInstaller>>,
    jitter_seed: Option<u64>,
}

impl<L, D, P> Sidecar<L, D, P>
where
    L: LedgerStore + 'static,
    D: MembershipDirectory + 'static,
    P: AclProvider + 'static,
{
    /// Create a builder.
    #[must_use]
    pub fn builder() -> SidecarBuilder<L, D, P> {
        SidecarBuilder::new()
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Claim credentials, install them, load properties if configured,
    /// and spawn the reconciliation task for this node's role.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SidecarError::Claim`] if the pool is exhausted or the ledger fails
    /// - [`SidecarError::Install`] if the installer rejects the bundle
    /// - [`SidecarError::Properties`] if property loading fails
    pub async fn start(self) -> Result<SidecarHandle, SidecarError> {
        let Self {
            config,
            ledger,
            directory,
            provider,
            installer,
            jitter_seed,
        } = self;
        let app_id = config.effective_app_id().to_string();
        let call_timeout = config.call_timeout();

        tracing::info!(
            app_id = %app_id,
            instance_id = %config.instance_id,
            is_seed = config.is_seed,
            "starting sidecar"
        );

        let coordinator =
            CredentialClaimCoordinator::new(ledger, config.claim.clone()).with_call_timeout(call_timeout);
        let credentials = match coordinator.claim(&config.instance_id, &app_id).await {
            Ok(refs) => refs,
            Err(e) => {
                tracing::error!(app_id = %app_id, error = %e, "could not acquire credentials");
                return Err(e.into());
            }
        };

        if let Some(installer) = &installer {
            installer.install(&credentials).await?;
            tracing::info!(row = %credentials.row_id, "credentials installed");
        }

        let properties = match &config.properties {
            Some(schema) => {
                load_properties(coordinator.store(), schema, &app_id, &config.region, call_timeout).await?
            }
            None => PropertyMap::new(),
        };

        let latch = AccessLatch::new();
        let reconciler = Arc::new(
            AclReconciler::new(directory, provider, latch.clone()).with_call_timeout(call_timeout),
        );
        let port_pairs = config.port_pairs();
        let task = ReconcileTask::new(reconciler, app_id.clone(), port_pairs);
        let timer = TaskTimer::for_role(config.is_seed, config.reconcile.base_interval());
        let reconcile = match jitter_seed {
            Some(seed) => spawn_task_seeded(task, timer, seed),
            None => spawn_task(task, timer),
        };
        tracing::info!(app_id = %app_id, ?timer, "reconciliation scheduled");

        Ok(SidecarHandle {
            app_id,
            credentials,
            properties,
            latch,
            reconcile,
        })
    }
}

/// A running sidecar.
#[derive(Debug)]
pub struct SidecarHandle {
    app_id: String,
    credentials: CredentialRefs,
    properties: PropertyMap,
    latch: AccessLatch,
    reconcile: TaskHandle,
}

impl SidecarHandle {
    /// Application this sidecar serves.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Credential references claimed at startup.
    #[must_use]
    pub fn credentials(&self) -> &CredentialRefs {
        &self.credentials
    }

    /// Properties loaded at startup (empty when loading is disabled).
    #[must_use]
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Latch that opens once any ACL change has been applied.
    #[must_use]
    pub fn access_latch(&self) -> &AccessLatch {
        &self.latch
    }

    /// Reconciliation run counters.
    #[must_use]
    pub fn reconcile_metrics(&self) -> TaskMetricsSnapshot {
        self.reconcile.metrics().snapshot()
    }

    /// Returns `true` once the reconciliation loop has exited.
    #[must_use]
    pub fn reconcile_finished(&self) -> bool {
        self.reconcile.is_finished()
    }

    /// Stop reconciliation after any in-flight run and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`SidecarError::Task`] if the task panicked.
    pub async fn shutdown(self) -> Result<(), SidecarError> {
        tracing::info!(app_id = %self.app_id, "stopping sidecar");
        self.reconcile.shutdown().await?;
        Ok(())
    }
}
