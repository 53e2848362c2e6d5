//! Error types for the sidecar facade.

use castellan_core::{ClaimError, InstallError, LedgerError};

use crate::config::ConfigError;

/// Errors from starting or stopping the sidecar.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    /// Configuration is missing or invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A required collaborator was not supplied to the builder.
    #[error("sidecar builder is missing {0}")]
    Missing(&'static str),

    /// No credential could be claimed. Fatal for this start attempt.
    #[error("credential claim failed: {0}")]
    Claim(#[from] ClaimError),

    /// The claimed credentials could not be installed.
    #[error("credential install failed: {0}")]
    Install(#[from] InstallError),

    /// Properties could not be loaded.
    #[error("property load failed: {0}")]
    Properties(#[from] LedgerError),

    /// The reconciliation task panicked.
    #[error("reconciliation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SidecarError {
    /// Returns `true` if a later start attempt may succeed unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Claim(ClaimError::Ledger(e)) | Self::Properties(e) => e.is_transient(),
            _ => false,
        }
    }
}
