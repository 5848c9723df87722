use crate::types::{Asset, Credential, Operation, TxHash};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result codes attached to a rejected multi-operation submission.
///
/// The transaction-level code describes the envelope as a whole; the
/// per-operation codes, when present, line up with the submitted operations
/// and enable surgical recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResultCodes {
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub operations: Option<Vec<String>>,
}

/// A failed gateway request.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Transport-level failure with no decoded transaction result.
    #[error("transport error (status {status}): {message}")]
    Transport { status: u16, message: String },
    /// The gateway processed the submission and rejected it.
    #[error("submission rejected: {codes:?}")]
    Rejected { codes: ResultCodes },
    /// The request did not complete within the per-request deadline.
    #[error("gateway request timed out")]
    Timeout,
    /// The failure body could not be decoded.
    #[error("unparseable gateway response: {0}")]
    Unparseable(String),
}

impl GatewayError {
    /// Builds a `GatewayError` from an HTTP-ish failure status and body.
    ///
    /// Gateways differ in where they nest the codes, so be liberal: accept
    /// `result_codes` at the top level or under `extras`. A body with no
    /// usable codes degrades to a plain transport error.
    pub fn from_failure_body(status: u16, body: &str) -> Self {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => {
                return GatewayError::Transport {
                    status,
                    message: truncate(body),
                }
            }
        };

        let raw_codes = parsed
            .get("result_codes")
            .or_else(|| parsed.get("extras").and_then(|e| e.get("result_codes")));

        match raw_codes {
            Some(raw) => match serde_json::from_value::<ResultCodes>(raw.clone()) {
                Ok(codes) => GatewayError::Rejected { codes },
                Err(err) => GatewayError::Unparseable(format!("bad result_codes: {err}")),
            },
            None => GatewayError::Transport {
                status,
                message: truncate(body),
            },
        }
    }

    pub fn rejected(transaction: Option<&str>, operations: Option<&[&str]>) -> Self {
        GatewayError::Rejected {
            codes: ResultCodes {
                transaction: transaction.map(str::to_string),
                operations: operations.map(|ops| ops.iter().map(|s| s.to_string()).collect()),
            },
        }
    }
}

// Keep logged bodies small.
fn truncate(body: &str) -> String {
    const MAX: usize = 240;
    let mut out: String = body.chars().take(MAX).collect();
    if out.len() < body.len() {
        out.push_str("...");
    }
    out
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Blockchain access as consumed by the dispatcher. Signing, fee handling
/// and wire transport live behind this seam.
#[async_trait]
pub trait BlockchainGateway: Send + Sync + 'static {
    /// Submits `ops` atomically from the distributor wallet. All operations
    /// land or none do; a rejection carries per-operation result codes.
    async fn send_many(
        &self,
        distributor: &Credential,
        ops: &[Operation],
        memo: Option<&str>,
    ) -> GatewayResult<TxHash>;

    /// Single transfer from `from` to `to_address`.
    async fn send_one(
        &self,
        from: &Credential,
        amount: u64,
        asset: &Asset,
        to_address: &str,
    ) -> GatewayResult<TxHash>;

    /// Creates a trust line from the distributor wallet to the asset.
    async fn establish_trust(&self, distributor: &Credential, asset: &Asset) -> GatewayResult<()>;

    /// Mints `amount` of the asset at its issuer and moves it to the
    /// distributor wallet.
    async fn mint_and_transfer(
        &self,
        asset_code: &str,
        amount: u64,
        issuer: &Credential,
        distributor: &Credential,
    ) -> GatewayResult<()>;

    /// Balance of `address` in `asset`, in base units.
    async fn balance_of(&self, address: &str, asset: &Asset) -> GatewayResult<u64>;
}

/// Caps a gateway call at `deadline`; a hung transport degrades to
/// [`GatewayError::Timeout`] instead of wedging the worker.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(res) => res,
        Err(_) => Err(GatewayError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_result_codes_top_level() {
        let body = json!({
            "result_codes": { "transaction": "tx_failed", "operations": ["op_success", "op_no_trust"] }
        })
        .to_string();
        match GatewayError::from_failure_body(400, &body) {
            GatewayError::Rejected { codes } => {
                assert_eq!(codes.transaction.as_deref(), Some("tx_failed"));
                assert_eq!(
                    codes.operations,
                    Some(vec!["op_success".to_string(), "op_no_trust".to_string()])
                );
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn parse_result_codes_nested_under_extras() {
        let body = json!({
            "extras": { "result_codes": { "transaction": "tx_insufficient_balance" } }
        })
        .to_string();
        match GatewayError::from_failure_body(400, &body) {
            GatewayError::Rejected { codes } => {
                assert_eq!(
                    codes.transaction.as_deref(),
                    Some("tx_insufficient_balance")
                );
                assert_eq!(codes.operations, None);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn body_without_codes_is_transport() {
        let body = json!({ "detail": "upstream busy" }).to_string();
        match GatewayError::from_failure_body(503, &body) {
            GatewayError::Transport { status, .. } => assert_eq!(status, 503),
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn non_json_body_is_transport() {
        match GatewayError::from_failure_body(502, "<html>bad gateway</html>") {
            GatewayError::Transport { status, message } => {
                assert_eq!(status, 502);
                assert!(message.contains("bad gateway"));
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn malformed_codes_are_unparseable() {
        let body = json!({ "result_codes": { "operations": "not-a-list" } }).to_string();
        assert!(matches!(
            GatewayError::from_failure_body(400, &body),
            GatewayError::Unparseable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_converts_hang_to_timeout() {
        let res: GatewayResult<()> = with_deadline(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(GatewayError::Timeout)));
    }
}
