//! Maps gateway failures to recovery plans.
//!
//! Classification is a pure function of the error payload: the same failure
//! always yields the same plan. Side effects (refills, trust lines) are
//! executed separately by the recovery actuator.

use crate::gateway::{GatewayError, ResultCodes};

const TX_INSUFFICIENT_BALANCE: &str = "tx_insufficient_balance";
const OP_SUCCESS: &str = "op_success";
const OP_NO_TRUST: &str = "op_no_trust";
const OP_MALFORMED: &str = "op_malformed";
const OP_LINE_FULL: &str = "op_line_full";
const OP_SRC_NO_TRUST: &str = "op_src_no_trust";
const OP_UNDERFUNDED: &str = "op_underfunded";

/// Transaction-level verdict on a failed submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxAction {
    /// No whole-transaction action; the per-operation sets apply.
    #[default]
    None,
    /// Back off and resubmit unchanged.
    TransientRetry,
    /// Resubmitting the same request cannot succeed.
    Fatal,
}

/// What to do about one failed submission.
///
/// All index sets are positions in the submitted batch, in ascending order.
/// `establish_trust` and `refill_asset` name operations that are correctable
/// in place; when the correction itself fails, the actuator's caller
/// reclassifies the index as invalid (failed trust line) or moves the
/// operation to the end of the remaining work (failed refill).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub tx_action: TxAction,
    /// Top up the distributor's gas before retrying.
    pub refill_gas: bool,
    /// Permanently unsendable operations.
    pub invalid: Vec<usize>,
    /// Destination lacks a trust line; re-issue as a deferred claim.
    pub convert_to_claim: Vec<usize>,
    /// Distributor lacks a trust line for the asset it is sending.
    pub establish_trust: Vec<usize>,
    /// Distributor is out of the asset; refill from the issuer.
    pub refill_asset: Vec<usize>,
}

impl RecoveryPlan {
    fn transient() -> Self {
        Self {
            tx_action: TxAction::TransientRetry,
            ..Self::default()
        }
    }

    fn fatal() -> Self {
        Self {
            tx_action: TxAction::Fatal,
            ..Self::default()
        }
    }
}

/// Classifies a gateway failure. Total: every error shape yields a plan, and
/// unrecognized per-operation codes are treated as permanently invalid.
pub fn classify(err: &GatewayError) -> RecoveryPlan {
    match err {
        GatewayError::Timeout => RecoveryPlan::transient(),
        // A response we could not decode tells us nothing about the batch.
        GatewayError::Unparseable(_) => RecoveryPlan::transient(),
        GatewayError::Transport { status, .. } if *status >= 500 => RecoveryPlan::transient(),
        // 4xx transport: the request itself is broken, an identical
        // resubmission cannot succeed.
        GatewayError::Transport { .. } => RecoveryPlan::fatal(),
        GatewayError::Rejected { codes } => classify_codes(codes),
    }
}

fn classify_codes(codes: &ResultCodes) -> RecoveryPlan {
    if codes.transaction.as_deref() == Some(TX_INSUFFICIENT_BALANCE) {
        let mut plan = RecoveryPlan::transient();
        plan.refill_gas = true;
        return plan;
    }

    let ops = match &codes.operations {
        Some(ops) if !ops.is_empty() => ops,
        // Rejected but no usable codes.
        _ => return RecoveryPlan::transient(),
    };

    let mut plan = RecoveryPlan::default();
    for (idx, code) in ops.iter().enumerate() {
        match code.as_str() {
            OP_SUCCESS => {}
            OP_NO_TRUST => plan.convert_to_claim.push(idx),
            OP_MALFORMED | OP_LINE_FULL => plan.invalid.push(idx),
            OP_SRC_NO_TRUST => plan.establish_trust.push(idx),
            OP_UNDERFUNDED => plan.refill_asset.push(idx),
            _ => plan.invalid.push(idx),
        }
    }
    plan
}
