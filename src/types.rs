use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Hash of a transaction accepted by the gateway.
pub type TxHash = String;

/// An asset a transfer can carry: the native gas coin or an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Asset {
    Native,
    Issued { code: String, issuer: String },
}

impl Asset {
    pub fn issued(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Asset::Issued {
            code: code.into(),
            issuer: issuer.into(),
        }
    }

    /// Public key of the issuing account, if this is an issued asset.
    pub fn issuer(&self) -> Option<&str> {
        match self {
            Asset::Native => None,
            Asset::Issued { issuer, .. } => Some(issuer),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Issued { code, issuer } => write!(f, "{code}:{issuer}"),
        }
    }
}

/// How an operation reaches its recipient.
///
/// A direct payment requires the recipient to already trust the asset. When
/// the recipient has no trust line, the operation is re-issued as a deferred
/// claim: an on-chain artifact holding the funds until the recipient claims
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperationKind {
    #[default]
    DirectPayment,
    DeferredClaim,
}

/// A single token transfer awaiting submission.
///
/// Amounts are in gateway-defined base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub destination: String,
    pub asset: Asset,
    pub amount: u64,
    pub kind: OperationKind,
    /// Set at most once, when the operation is requeued to the tail of the
    /// remaining work after a failed supply refill. A second under-funding
    /// is treated as permanent.
    pub(crate) moved_to_end: bool,
}

impl Operation {
    pub fn new(destination: impl Into<String>, asset: Asset, amount: u64) -> Self {
        Self {
            destination: destination.into(),
            asset,
            amount,
            kind: OperationKind::default(),
            moved_to_end: false,
        }
    }

    pub fn moved_to_end(&self) -> bool {
        self.moved_to_end
    }
}

/// An envelope of up to `max_ops_per_batch` operations bound for one atomic
/// gateway submission.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ops: Vec<Operation>,
    pub memo: Option<String>,
    /// Issuer credentials usable for supply refills. Cloned at admission so
    /// a later issuer refresh cannot mutate an in-flight batch.
    pub issuers: Vec<Credential>,
    /// Caller-supplied logging correlator.
    pub tag: String,
    pub retry_count: u32,
}

/// Signing material for a wallet the dispatcher controls.
///
/// The upstream directory hands credentials over as `public:secret` pairs;
/// see [`Credential::decode`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    public: String,
    secret: String,
}

impl Credential {
    pub fn new(public: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            public: public.into(),
            secret: secret.into(),
        }
    }

    /// Decodes raw `public:secret` credential material.
    pub fn decode(material: &str) -> Result<Self, CredentialError> {
        let (public, secret) = material.split_once(':').ok_or(CredentialError::Malformed)?;
        if public.trim().is_empty() || secret.trim().is_empty() {
            return Err(CredentialError::Malformed);
        }
        Ok(Self::new(public.trim(), secret.trim()))
    }

    pub fn public(&self) -> &str {
        &self.public
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

// Never print the secret half, logs end up in shared sinks.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential material is not a public:secret pair")]
    Malformed,
}

/// One distributor wallet as reported by the upstream directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorRecord {
    pub id: u32,
    /// Raw credential material, decoded with [`Credential::decode`].
    pub material: String,
    pub active: bool,
}
