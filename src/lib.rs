//! Multi-distributor payout dispatcher.
//!
//! Accepts token-transfer operations, spreads them across a fleet of
//! sending wallets, submits bounded batches atomically through an injected
//! blockchain gateway, and recovers from gateway pushback: gas refills,
//! trust line creation, deferred-claim conversion and bounded requeueing.
//!
//! The chain, the settings backend and the distributor directory are
//! capabilities injected at construction ([`BlockchainGateway`],
//! [`SettingsStore`], [`DistributorSource`]); the one produced operation is
//! [`Dispatcher::submit`]. All state is in memory and rebuilt on restart.

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod queue;
pub mod recovery;
pub mod sender;
pub mod settings;
pub mod types;

#[cfg(test)]
mod testutil;

pub use classify::{classify, RecoveryPlan, TxAction};
pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{Dispatcher, SubmitError};
pub use gateway::{BlockchainGateway, GatewayError, GatewayResult, ResultCodes};
pub use queue::{DistributorQueue, QueueClosed, Shutdown};
pub use recovery::{convert_to_claim, RecoveryActuator};
pub use sender::{BatchSender, SendError, SendStats};
pub use settings::{DirectoryError, DistributorSource, SettingsStore};
pub use types::{
    Asset, Batch, Credential, CredentialError, DistributorRecord, Operation, OperationKind, TxHash,
};
