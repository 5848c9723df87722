use crate::types::{Credential, DistributorRecord};
use async_trait::async_trait;
use thiserror::Error;

/// Admin-tunable settings the dispatcher polls at runtime.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Kill switch checked before every batch submission. While false the
    /// worker parks without consuming retry budgets.
    async fn sending_enabled(&self) -> bool;

    /// Credential allowed to mint issued assets, if one is configured.
    async fn issuer_credential(&self) -> Option<Credential>;

    /// Wallet used to top up distributor gas, if one is configured.
    async fn refill_credential(&self) -> Option<Credential>;
}

/// Failure reading the upstream distributor directory.
#[derive(Debug, Error)]
#[error("distributor directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Upstream source of truth for the distributor fleet, polled periodically.
#[async_trait]
pub trait DistributorSource: Send + Sync + 'static {
    async fn active_distributors(&self) -> Result<Vec<DistributorRecord>, DirectoryError>;
}
