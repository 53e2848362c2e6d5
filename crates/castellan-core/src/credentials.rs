//! Hook for materializing claimed credentials on the local node.
//!
//! Fetching and unpacking the keystore and truststore content lives
//! outside this crate; the sidecar only hands the claimed references to
//! an installer once the claim succeeds.

use std::sync::Arc;

use async_trait::async_trait;

use crate::claim::CredentialRefs;

/// Errors from installing a credential bundle.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The bundle could not be retrieved.
    #[error("failed to fetch credential bundle: {0}")]
    Fetch(String),

    /// Writing the bundle locally failed.
    #[error("failed to write credential bundle: {0}")]
    Io(#[from] std::io::Error),
}

/// Places a claimed keystore/truststore pair where the database reads it.
#[async_trait]
pub trait CredentialInstaller: Send + Sync {
    /// Install the bundle referenced by `refs`.
    async fn install(&self, refs: &CredentialRefs) -> Result<(), InstallError>;
}

#[async_trait]
impl<I: CredentialInstaller + ?Sized> CredentialInstaller for Arc<I> {
    async fn install(&self, refs: &CredentialRefs) -> Result<(), InstallError> {
        (**self).install(refs).await
    }
}
