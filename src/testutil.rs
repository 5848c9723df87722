//! Scripted capability doubles shared by the unit tests.
//!
//! Each mock records every call and pops scripted results from a queue,
//! falling back to a benign default when the script runs dry.

use crate::gateway::{BlockchainGateway, GatewayResult};
use crate::settings::{DirectoryError, DistributorSource, SettingsStore};
use crate::types::{Asset, Credential, DistributorRecord, Operation, TxHash};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cred(label: &str) -> Credential {
    Credential::new(format!("G{label}"), format!("S{label}"))
}

pub fn material(label: &str) -> String {
    format!("G{label}:S{label}")
}

pub fn record(id: u32, label: &str) -> DistributorRecord {
    DistributorRecord {
        id,
        material: material(label),
        active: true,
    }
}

pub fn op(destination: &str, amount: u64) -> Operation {
    Operation::new(destination, Asset::Native, amount)
}

pub fn issued_op(destination: &str, code: &str, issuer: &str, amount: u64) -> Operation {
    Operation::new(destination, Asset::issued(code, issuer), amount)
}

#[derive(Default)]
pub struct MockGateway {
    send_many_script: Mutex<VecDeque<GatewayResult<TxHash>>>,
    send_one_script: Mutex<VecDeque<GatewayResult<TxHash>>>,
    trust_script: Mutex<VecDeque<GatewayResult<()>>>,
    mint_script: Mutex<VecDeque<GatewayResult<()>>>,
    balance_script: Mutex<VecDeque<GatewayResult<u64>>>,

    send_many_log: Mutex<Vec<(Credential, Vec<Operation>, Option<String>)>>,
    send_one_log: Mutex<Vec<(Credential, u64, Asset, String)>>,
    mint_log: Mutex<Vec<(String, u64, Credential, Credential)>>,
    balance_calls: AtomicUsize,
    trust_calls: AtomicUsize,
    hash_counter: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_hash(&self) -> TxHash {
        let n = self.hash_counter.fetch_add(1, Ordering::SeqCst);
        format!("hash-{n}")
    }

    pub fn script_send_many(&self, res: GatewayResult<TxHash>) {
        self.send_many_script.lock().unwrap().push_back(res);
    }

    pub fn script_send_many_err(&self, err: crate::gateway::GatewayError) {
        self.script_send_many(Err(err));
    }

    pub fn script_send_one(&self, res: GatewayResult<TxHash>) {
        self.send_one_script.lock().unwrap().push_back(res);
    }

    pub fn script_trust(&self, res: GatewayResult<()>) {
        self.trust_script.lock().unwrap().push_back(res);
    }

    pub fn script_mint(&self, res: GatewayResult<()>) {
        self.mint_script.lock().unwrap().push_back(res);
    }

    pub fn script_balance(&self, res: GatewayResult<u64>) {
        self.balance_script.lock().unwrap().push_back(res);
    }

    pub fn send_many_log(&self) -> Vec<(Credential, Vec<Operation>, Option<String>)> {
        self.send_many_log.lock().unwrap().clone()
    }

    pub fn send_many_calls(&self) -> usize {
        self.send_many_log.lock().unwrap().len()
    }

    pub fn send_one_calls(&self) -> usize {
        self.send_one_log.lock().unwrap().len()
    }

    pub fn last_send_one(&self) -> Option<(Credential, u64, Asset, String)> {
        self.send_one_log.lock().unwrap().last().cloned()
    }

    pub fn last_mint(&self) -> Option<(String, u64, Credential, Credential)> {
        self.mint_log.lock().unwrap().last().cloned()
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn trust_calls(&self) -> usize {
        self.trust_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockchainGateway for MockGateway {
    async fn send_many(
        &self,
        distributor: &Credential,
        ops: &[Operation],
        memo: Option<&str>,
    ) -> GatewayResult<TxHash> {
        self.send_many_log.lock().unwrap().push((
            distributor.clone(),
            ops.to_vec(),
            memo.map(str::to_string),
        ));
        match self.send_many_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => Ok(self.next_hash()),
        }
    }

    async fn send_one(
        &self,
        from: &Credential,
        amount: u64,
        asset: &Asset,
        to_address: &str,
    ) -> GatewayResult<TxHash> {
        self.send_one_log.lock().unwrap().push((
            from.clone(),
            amount,
            asset.clone(),
            to_address.to_string(),
        ));
        match self.send_one_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => Ok(self.next_hash()),
        }
    }

    async fn establish_trust(&self, _distributor: &Credential, _asset: &Asset) -> GatewayResult<()> {
        self.trust_calls.fetch_add(1, Ordering::SeqCst);
        match self.trust_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => Ok(()),
        }
    }

    async fn mint_and_transfer(
        &self,
        asset_code: &str,
        amount: u64,
        issuer: &Credential,
        distributor: &Credential,
    ) -> GatewayResult<()> {
        self.mint_log.lock().unwrap().push((
            asset_code.to_string(),
            amount,
            issuer.clone(),
            distributor.clone(),
        ));
        match self.mint_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => Ok(()),
        }
    }

    async fn balance_of(&self, _address: &str, _asset: &Asset) -> GatewayResult<u64> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        match self.balance_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => Ok(0),
        }
    }
}

pub struct MockSettings {
    enabled: AtomicBool,
    enabled_script: Mutex<VecDeque<bool>>,
    sending_polls: AtomicUsize,
    issuer: Mutex<Option<Credential>>,
    refill: Mutex<Option<Credential>>,
}

impl MockSettings {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            enabled_script: Mutex::new(VecDeque::new()),
            sending_polls: AtomicUsize::new(0),
            issuer: Mutex::new(Some(cred("ISS"))),
            refill: Mutex::new(Some(cred("REFILL"))),
        }
    }

    pub fn without_refill(self) -> Self {
        *self.refill.lock().unwrap() = None;
        self
    }

    pub fn set_issuer(&self, issuer: Option<Credential>) {
        *self.issuer.lock().unwrap() = issuer;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Scripts the next kill-switch polls; once drained, polls fall back to
    /// the `set_enabled` value.
    pub fn script_sending(&self, polls: impl IntoIterator<Item = bool>) {
        self.enabled_script.lock().unwrap().extend(polls);
    }

    pub fn sending_polls(&self) -> usize {
        self.sending_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettingsStore for MockSettings {
    async fn sending_enabled(&self) -> bool {
        self.sending_polls.fetch_add(1, Ordering::SeqCst);
        match self.enabled_script.lock().unwrap().pop_front() {
            Some(v) => v,
            None => self.enabled.load(Ordering::SeqCst),
        }
    }

    async fn issuer_credential(&self) -> Option<Credential> {
        self.issuer.lock().unwrap().clone()
    }

    async fn refill_credential(&self) -> Option<Credential> {
        self.refill.lock().unwrap().clone()
    }
}

pub struct MockDirectory {
    records: Mutex<Vec<DistributorRecord>>,
    fail: AtomicBool,
}

impl MockDirectory {
    pub fn new(records: Vec<DistributorRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_records(&self, records: Vec<DistributorRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DistributorSource for MockDirectory {
    async fn active_distributors(&self) -> Result<Vec<DistributorRecord>, DirectoryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DirectoryError("scripted outage".into()));
        }
        Ok(self.records.lock().unwrap().clone())
    }
}
