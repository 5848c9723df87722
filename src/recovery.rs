//! Executes the side effects a recovery plan calls for: gas refills, trust
//! lines and supply refills. Nothing here propagates an error; each action
//! reports success or failure as a boolean and logs what happened, and the
//! batch sender decides what that means for the operation.

use crate::config::DispatcherConfig;
use crate::gateway::{with_deadline, BlockchainGateway};
use crate::settings::SettingsStore;
use crate::types::{Asset, Credential, Operation, OperationKind};
use std::sync::Arc;

pub struct RecoveryActuator<G, S> {
    gateway: Arc<G>,
    settings: Arc<S>,
    cfg: Arc<DispatcherConfig>,
}

impl<G, S> RecoveryActuator<G, S>
where
    G: BlockchainGateway,
    S: SettingsStore,
{
    pub fn new(gateway: Arc<G>, settings: Arc<S>, cfg: Arc<DispatcherConfig>) -> Self {
        Self {
            gateway,
            settings,
            cfg,
        }
    }

    /// Best-effort top-up of the distributor's gas from the configured
    /// refill wallet. Failure is logged and otherwise ignored; the batch
    /// retry that follows will surface persistent under-funding again.
    pub async fn refill_gas(&self, distributor: &Credential) {
        let Some(refill) = self.settings.refill_credential().await else {
            tracing::warn!(
                distributor = %distributor.public(),
                "gas refill skipped; no refill wallet configured"
            );
            return;
        };

        let amount = self.cfg.gas_refill_amount;
        match with_deadline(
            self.cfg.gateway_timeout,
            self.gateway
                .send_one(&refill, amount, &Asset::Native, distributor.public()),
        )
        .await
        {
            Ok(tx) => {
                tracing::info!(
                    distributor = %distributor.public(),
                    amount,
                    tx = %tx,
                    "topped up distributor gas"
                );
            }
            Err(err) => {
                tracing::warn!(
                    distributor = %distributor.public(),
                    amount,
                    error = %err,
                    "gas refill failed"
                );
            }
        }
    }

    /// Creates a trust line from the distributor to `asset`. On failure the
    /// affected operation cannot be sent from this wallet and is dropped by
    /// the caller.
    pub async fn establish_trust(&self, distributor: &Credential, asset: &Asset) -> bool {
        match with_deadline(
            self.cfg.gateway_timeout,
            self.gateway.establish_trust(distributor, asset),
        )
        .await
        {
            Ok(()) => {
                tracing::info!(
                    distributor = %distributor.public(),
                    asset = %asset,
                    "trust line established"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    distributor = %distributor.public(),
                    asset = %asset,
                    error = %err,
                    "trust line creation failed"
                );
                false
            }
        }
    }

    /// Refills the distributor's supply of an issued asset up to the
    /// configured limit. Fails when no matching issuer credential is held,
    /// when the balance cannot be read, or when the distributor is already
    /// at the limit (the shortage is then demand beyond one refill, not a
    /// top-up problem).
    ///
    /// The balance read does not see in-flight debits from other queues, so
    /// two queues can briefly refill the same wallet.
    pub async fn refill_asset(
        &self,
        distributor: &Credential,
        asset: &Asset,
        issuers: &[Credential],
    ) -> bool {
        let Asset::Issued { code, issuer } = asset else {
            tracing::warn!(
                distributor = %distributor.public(),
                "asset refill skipped; the native asset has no issuer"
            );
            return false;
        };

        let Some(issuer_cred) = issuers.iter().find(|c| c.public() == issuer) else {
            tracing::warn!(
                distributor = %distributor.public(),
                asset = %asset,
                "asset refill skipped; no credential for issuer"
            );
            return false;
        };

        let balance = match with_deadline(
            self.cfg.gateway_timeout,
            self.gateway.balance_of(distributor.public(), asset),
        )
        .await
        {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(
                    distributor = %distributor.public(),
                    asset = %asset,
                    error = %err,
                    "asset refill skipped; balance read failed"
                );
                return false;
            }
        };

        let refill = self.cfg.supply_refill_limit.saturating_sub(balance);
        if refill == 0 {
            tracing::info!(
                distributor = %distributor.public(),
                asset = %asset,
                balance,
                limit = self.cfg.supply_refill_limit,
                "distributor already at supply limit; not refilling"
            );
            return false;
        }

        match with_deadline(
            self.cfg.gateway_timeout,
            self.gateway
                .mint_and_transfer(code, refill, issuer_cred, distributor),
        )
        .await
        {
            Ok(()) => {
                tracing::info!(
                    distributor = %distributor.public(),
                    asset = %asset,
                    refill,
                    "refilled distributor supply"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    distributor = %distributor.public(),
                    asset = %asset,
                    refill,
                    error = %err,
                    "supply refill failed"
                );
                false
            }
        }
    }
}

/// Re-issues an operation as a deferred claim so a recipient without a trust
/// line can still be paid. Idempotent; the flag survives requeues.
pub fn convert_to_claim(op: &mut Operation) {
    op.kind = OperationKind::DeferredClaim;
}
