//! The central submission loop: slices the remaining work into bounded
//! batches, submits each one atomically, and works through the recovery plan
//! whenever the gateway pushes back.

use crate::classify::{classify, TxAction};
use crate::config::DispatcherConfig;
use crate::gateway::{with_deadline, BlockchainGateway, GatewayError};
use crate::queue::Shutdown;
use crate::recovery::{convert_to_claim, RecoveryActuator};
use crate::settings::SettingsStore;
use crate::types::{Credential, Operation};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Terminal outcome of one `send` call. Recoverable conditions never show up
/// here; they are resolved inside the loop.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport retry budget exhausted after {attempts} failures: {last}")]
    TransientExhausted { attempts: u32, last: GatewayError },
    #[error("unrecoverable gateway failure: {0}")]
    Fatal(GatewayError),
    #[error("dispatcher shut down while sending")]
    Cancelled,
}

/// Counters for one `send` call, logged when the call completes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendStats {
    pub batches_submitted: usize,
    pub ops_delivered: usize,
    pub oversize_splits: usize,
    pub invalid_dropped: usize,
    pub converted_to_claim: usize,
    pub moved_to_end: usize,
    /// Operations dropped because in-place corrections kept failing.
    pub abandoned: usize,
    pub gas_refills: usize,
    pub asset_refills: usize,
    pub trust_lines: usize,
    pub transient_retries: usize,
    pub corrected_retries: usize,
}

pub struct BatchSender<G, S> {
    gateway: Arc<G>,
    settings: Arc<S>,
    actuator: RecoveryActuator<G, S>,
    cfg: Arc<DispatcherConfig>,
}

impl<G, S> BatchSender<G, S>
where
    G: BlockchainGateway,
    S: SettingsStore,
{
    pub fn new(gateway: Arc<G>, settings: Arc<S>, cfg: Arc<DispatcherConfig>) -> Self {
        let actuator = RecoveryActuator::new(gateway.clone(), settings.clone(), cfg.clone());
        Self {
            gateway,
            settings,
            actuator,
            cfg,
        }
    }

    /// Drives `remaining` until every operation has landed on chain, been
    /// converted to a deferred claim that landed, or been individually ruled
    /// unsendable. The vec is drained as operations complete, so whatever is
    /// left after an error is exactly the undelivered work and a later call
    /// can pick it up again.
    ///
    /// The in-flight slice is always a contiguous prefix of `remaining`;
    /// gateway result codes index into that prefix directly.
    pub async fn send(
        &self,
        distributor: &Credential,
        remaining: &mut Vec<Operation>,
        memo: Option<&str>,
        issuers: &[Credential],
        tag: &str,
        shutdown: &Shutdown,
    ) -> Result<SendStats, SendError> {
        let mut stats = SendStats::default();

        // Largest first: oversize amounts surface at the head where the
        // split branch isolates them, and full batches pack densely.
        remaining.sort_by(|a, b| b.amount.cmp(&a.amount));

        while !remaining.is_empty() {
            let mut cur_len = remaining.len().min(self.cfg.max_ops_per_batch);
            let mut transient_retries: u32 = 0;
            let mut op_retries: u32 = 0;

            'slice: loop {
                debug_assert!(cur_len >= 1 && cur_len <= remaining.len());
                debug_assert!(cur_len <= self.cfg.max_ops_per_batch);

                // Kill switch: park without consuming any retry budget.
                while !self.settings.sending_enabled().await {
                    tracing::info!(tag = %tag, "sending disabled; parked");
                    if !shutdown.sleep(self.cfg.stop_sending_poll).await {
                        return Err(SendError::Cancelled);
                    }
                }

                // An oversize amount is submitted alone, clamped just under
                // the limit, so it cannot take a whole batch down with it.
                let mut oversize = false;
                if let Some(idx) = remaining[..cur_len]
                    .iter()
                    .position(|op| op.amount >= self.cfg.hard_amount_limit)
                {
                    if idx != 0 {
                        let op = remaining.remove(idx);
                        remaining.insert(0, op);
                    }
                    cur_len = 1;
                    oversize = true;
                }

                let result = if oversize {
                    let mut single = remaining[0].clone();
                    single.amount = self.cfg.hard_amount_limit - 1;
                    tracing::warn!(
                        tag = %tag,
                        destination = %single.destination,
                        amount = remaining[0].amount,
                        clamped = single.amount,
                        "amount exceeds single-batch limit; submitting alone"
                    );
                    with_deadline(
                        self.cfg.gateway_timeout,
                        self.gateway
                            .send_many(distributor, std::slice::from_ref(&single), memo),
                    )
                    .await
                } else {
                    with_deadline(
                        self.cfg.gateway_timeout,
                        self.gateway
                            .send_many(distributor, &remaining[..cur_len], memo),
                    )
                    .await
                };

                let err = match result {
                    Ok(tx) => {
                        stats.batches_submitted += 1;
                        stats.ops_delivered += cur_len;
                        if oversize {
                            stats.oversize_splits += 1;
                        }
                        tracing::info!(tag = %tag, tx = %tx, ops = cur_len, "batch landed");
                        remaining.drain(..cur_len);
                        break 'slice;
                    }
                    Err(err) => err,
                };

                let plan = classify(&err);
                match plan.tx_action {
                    TxAction::TransientRetry => {
                        if plan.refill_gas {
                            stats.gas_refills += 1;
                            self.actuator.refill_gas(distributor).await;
                        }
                        if transient_retries >= self.cfg.max_transient_retries {
                            tracing::warn!(
                                tag = %tag,
                                failures = transient_retries + 1,
                                error = %err,
                                "transport retry budget exhausted"
                            );
                            return Err(SendError::TransientExhausted {
                                attempts: transient_retries + 1,
                                last: err,
                            });
                        }
                        transient_retries += 1;
                        stats.transient_retries += 1;
                        let exp = (transient_retries - 1).min(20);
                        let pause = self.cfg.transient_backoff_base * 3u32.saturating_pow(exp);
                        tracing::warn!(
                            tag = %tag,
                            attempt = transient_retries,
                            pause_s = pause.as_secs(),
                            error = %err,
                            "transient gateway failure; backing off"
                        );
                        if !shutdown.sleep(pause).await {
                            return Err(SendError::Cancelled);
                        }
                        continue 'slice;
                    }
                    TxAction::Fatal => {
                        tracing::error!(tag = %tag, error = %err, "unrecoverable gateway failure");
                        return Err(SendError::Fatal(err));
                    }
                    TxAction::None => {}
                }

                // Per-operation recovery. Indices are positions in the
                // current prefix; a gateway that reports codes past the
                // submitted batch is misbehaving and those codes are
                // ignored.
                let oob = plan
                    .invalid
                    .iter()
                    .chain(&plan.convert_to_claim)
                    .chain(&plan.establish_trust)
                    .chain(&plan.refill_asset)
                    .filter(|&&i| i >= cur_len)
                    .count();
                if oob > 0 {
                    tracing::warn!(
                        tag = %tag,
                        oob,
                        ops = cur_len,
                        "gateway reported result codes past the submitted batch; ignoring them"
                    );
                }

                let mut invalid: BTreeSet<usize> = plan
                    .invalid
                    .iter()
                    .copied()
                    .filter(|&i| i < cur_len)
                    .collect();
                let mut requeue: BTreeSet<usize> = BTreeSet::new();

                for &idx in plan.establish_trust.iter().filter(|&&i| i < cur_len) {
                    let asset = remaining[idx].asset.clone();
                    if self.actuator.establish_trust(distributor, &asset).await {
                        stats.trust_lines += 1;
                    } else {
                        invalid.insert(idx);
                    }
                }

                for &idx in plan.refill_asset.iter().filter(|&&i| i < cur_len) {
                    let asset = remaining[idx].asset.clone();
                    if self.actuator.refill_asset(distributor, &asset, issuers).await {
                        stats.asset_refills += 1;
                    } else if remaining[idx].moved_to_end {
                        // Second shortfall for this operation; give up.
                        invalid.insert(idx);
                    } else {
                        requeue.insert(idx);
                    }
                }

                for &idx in plan.convert_to_claim.iter().filter(|&&i| i < cur_len) {
                    convert_to_claim(&mut remaining[idx]);
                    stats.converted_to_claim += 1;
                    tracing::info!(
                        tag = %tag,
                        destination = %remaining[idx].destination,
                        "destination has no trust line; converted to deferred claim"
                    );
                }

                if invalid.is_empty() && requeue.is_empty() {
                    // Every failure was corrected in place; resubmit the
                    // same slice.
                    op_retries += 1;
                    stats.corrected_retries += 1;
                    if op_retries >= self.cfg.max_op_retries {
                        tracing::warn!(
                            tag = %tag,
                            ops = cur_len,
                            retries = op_retries,
                            "slice keeps failing after in-place corrections; abandoning it"
                        );
                        stats.abandoned += cur_len;
                        remaining.drain(..cur_len);
                        break 'slice;
                    }
                    if !shutdown.sleep(self.cfg.corrected_retry_pause).await {
                        return Err(SendError::Cancelled);
                    }
                    continue 'slice;
                }

                // Remove affected indices from the prefix, highest first so
                // the lower ones stay valid, then append requeued operations
                // to the tail in their original order.
                let to_remove: Vec<usize> = invalid.union(&requeue).copied().collect();
                let mut requeued: Vec<Operation> = Vec::with_capacity(requeue.len());
                for &idx in to_remove.iter().rev() {
                    let mut op = remaining.remove(idx);
                    cur_len -= 1;
                    if requeue.contains(&idx) {
                        op.moved_to_end = true;
                        stats.moved_to_end += 1;
                        tracing::info!(
                            tag = %tag,
                            destination = %op.destination,
                            asset = %op.asset,
                            amount = op.amount,
                            "supply refill failed; moved operation to end of work"
                        );
                        requeued.push(op);
                    } else {
                        stats.invalid_dropped += 1;
                        tracing::warn!(
                            tag = %tag,
                            destination = %op.destination,
                            asset = %op.asset,
                            amount = op.amount,
                            "operation is unsendable; dropped"
                        );
                    }
                }
                requeued.reverse();
                remaining.extend(requeued);

                op_retries = 0;
                if cur_len == 0 {
                    break 'slice;
                }
            }
        }

        tracing::info!(tag = %tag, ?stats, "send complete");
        Ok(stats)
    }
}
