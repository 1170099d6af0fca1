//! Offline batch generator.
//!
//! No network is contacted. Every operation appends a transaction record to
//! the current batch of a [`BatchTemplate`], consuming a nonce from the
//! in-memory [`NonceState`]. The template is written to disk at the end of
//! each benchmark round for execution by external tooling.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use alloy_primitives::{hex::FromHexError, Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{BackendKind, Deployment, RoundWindow, TransactionBackend};
use crate::{
    account::{Account, AccountRef, AccountResolver, PrivateKey},
    contract::{ContractBinding, ContractHandle, DeployParams},
    error::{BackendError, Result},
    intent::{CallIntent, DeployIntent, TransferIntent},
    outcome::{QueuedRecord, TransactionOutcome},
};

/// Balance credited to every genesis account.
pub const GENESIS_BALANCE: &str = "1000000000000000000000000000";

/// Gas price of every queued transaction.
pub const GAS_PRICE: &str = "1000000000";

/// Gas limit of queued transfers.
pub const TRANSFER_GAS_LIMIT: u64 = 1_000_000_000;

/// Gas limit of queued deployments.
pub const DEPLOY_GAS_LIMIT: u64 = 10_000_000;

/// Gas limit of queued contract calls.
pub const CALL_GAS_LIMIT: u64 = 100_000;

/// File stem of the batch written after a script replay.
pub const REPLAY_STEM: &str = "replay";

/// Destination of a queued transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TxTarget {
    /// Value transfer to an address.
    Address(Address),
    /// Contract creation, serialized as `"deploy"`.
    Deploy,
    /// Call to the batch's contract, serialized as `"contract"`.
    Contract,
}

impl fmt::Display for TxTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Deploy => f.write_str("deploy"),
            Self::Contract => f.write_str("contract"),
        }
    }
}

impl From<TxTarget> for String {
    fn from(target: TxTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for TxTarget {
    type Error = FromHexError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "deploy" => Ok(Self::Deploy),
            "contract" => Ok(Self::Contract),
            other => Address::from_str(other).map(Self::Address),
        }
    }
}

/// A transaction record in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTransaction {
    /// Sender.
    pub from: Address,
    /// Destination.
    pub to: TxTarget,
    /// Sender nonce.
    pub nonce: u64,
    /// Value in wei, decimal.
    pub value: String,
    /// Contract deployed or called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_name: Option<String>,
    /// Function called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Constructor or call arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    /// Gas limit.
    pub gas_limit: u64,
    /// Gas price in wei, decimal.
    pub gas_price: String,
    /// Chain id.
    pub chain_id: u64,
}

/// A funded account in a batch genesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// Account address.
    pub address: Address,
    /// Starting nonce, decimal.
    pub nonce: String,
    /// Starting balance in wei, decimal.
    pub balance: String,
    /// Hex private key.
    #[serde(rename = "pvtKey")]
    pub pvt_key: String,
    /// Fields this tool does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenesisAccount {
    fn funded(account: &Account) -> Self {
        Self {
            address: account.address,
            nonce: "0".into(),
            balance: GENESIS_BALANCE.into(),
            pvt_key: account.private_key.to_hex(),
            extra: Map::new(),
        }
    }
}

/// A contract pre-deployed in a batch genesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisContract {
    /// Contract name.
    pub contract_name: String,
    /// Constructor parameters.
    pub params_deploy: DeployParams,
    /// Fields this tool does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Initial state of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Genesis {
    /// Funded accounts.
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
    /// Pre-deployed contracts.
    #[serde(default)]
    pub contracts: Vec<GenesisContract>,
    /// Fields this tool does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One batch: a genesis and the transactions to run on top of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    #[serde(default)]
    pub id: u64,
    /// Initial state.
    #[serde(default)]
    pub genesis: Genesis,
    /// Ordered transactions.
    #[serde(default)]
    pub txs: Vec<QueuedTransaction>,
    /// Fields this tool does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An ordered list of batches, the offline executor's input format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchTemplate {
    batches: Vec<Batch>,
}

impl BatchTemplate {
    /// A template with one empty batch.
    pub fn pristine() -> Self {
        Self { batches: vec![Batch::default()] }
    }

    /// Creates a template from batches.
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    /// Reads a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| BackendError::Read { path: path.to_path_buf(), source })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the template as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)
            .map_err(|source| BackendError::Write { path: path.to_path_buf(), source })
    }

    /// The batches in order.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }
}

/// Per-address nonce counters. Nonces only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceState {
    nonces: BTreeMap<Address, u64>,
}

impl NonceState {
    /// Starts tracking `address` at `nonce` unless it is already tracked.
    pub fn track(&mut self, address: Address, nonce: u64) {
        self.nonces.entry(address).or_insert(nonce);
    }

    /// The next nonce for `address`.
    pub fn current(&self, address: Address) -> Option<u64> {
        self.nonces.get(&address).copied()
    }

    /// Returns the next nonce for `address` and advances the counter.
    pub fn consume(&mut self, address: Address) -> Result<u64> {
        let nonce = self.nonces.get_mut(&address).ok_or_else(|| {
            BackendError::UnknownReference(format!("no nonce tracked for {address}"))
        })?;
        let current = *nonce;
        *nonce += 1;
        Ok(current)
    }
}

/// All mutable state of an offline run.
///
/// Owned by exactly one backend. Rounds snapshot it by cloning.
#[derive(Debug, Clone)]
pub struct BatchContext {
    sealed: Vec<Batch>,
    current: Batch,
    pristine: Batch,
    nonces: NonceState,
    accounts: AccountResolver,
}

impl BatchContext {
    /// Creates a context from a template, funding `accounts` in its last batch.
    pub fn new(template: BatchTemplate, accounts: &[Account]) -> Result<Self> {
        let mut batches = template.batches;
        let pristine = batches
            .first()
            .cloned()
            .ok_or(BackendError::InvalidTemplate("template contains no batches"))?;
        let current = batches.pop().ok_or(BackendError::InvalidTemplate("template contains no batches"))?;

        let mut context = Self {
            sealed: batches,
            current,
            pristine,
            nonces: NonceState::default(),
            accounts: AccountResolver::registry_only(),
        };
        for genesis in context.current.genesis.accounts.clone() {
            let nonce = genesis
                .nonce
                .parse()
                .map_err(|_| BackendError::InvalidTemplate("genesis nonce is not a decimal integer"))?;
            context.nonces.track(genesis.address, nonce);
            if let Ok(key) = genesis.pvt_key.parse::<PrivateKey>() {
                context.accounts.register_key(key, genesis.address);
            }
        }
        for account in accounts {
            context.add_account(account);
        }
        Ok(context)
    }

    /// Funds an account in the current batch genesis.
    pub fn add_account(&mut self, account: &Account) {
        if self.nonces.current(account.address).is_none() {
            self.current.genesis.accounts.push(GenesisAccount::funded(account));
            self.nonces.track(account.address, 0);
        }
        self.accounts.register_key(account.private_key.clone(), account.address);
    }

    /// The nonce counters.
    pub fn nonces(&self) -> &NonceState {
        &self.nonces
    }

    /// The batch currently receiving transactions.
    pub fn current_batch(&self) -> &Batch {
        &self.current
    }

    /// All batches, including the current one.
    pub fn template(&self) -> BatchTemplate {
        let mut batches = self.sealed.clone();
        batches.push(self.current.clone());
        BatchTemplate { batches }
    }

    fn resolve(&self, key: &PrivateKey) -> Result<Address> {
        self.accounts.resolve(AccountRef::Key(key))
    }

    /// Appends a transaction to the current batch.
    pub fn queue(&mut self, transaction: QueuedTransaction) -> QueuedRecord {
        let index = self.current.txs.len();
        self.current.txs.push(transaction.clone());
        QueuedRecord { batch: self.sealed.len(), index, transaction }
    }

    /// Seals the current batch and opens a new one bound to `binding`.
    ///
    /// The new genesis carries every known account at its current nonce, so
    /// transactions already queued are accounted for.
    pub fn set_new_batch(&mut self, binding: &ContractBinding) -> Result<()> {
        let mut batch = self.pristine.clone();
        batch.id = self.sealed.len() as u64 + 1;
        batch.txs.clear();
        batch.genesis.contracts.clear();
        batch.genesis.accounts = self
            .current
            .genesis
            .accounts
            .iter()
            .map(|account| {
                let nonce = self
                    .nonces
                    .current(account.address)
                    .map_or_else(|| account.nonce.clone(), |nonce| nonce.to_string());
                GenesisAccount { nonce, ..account.clone() }
            })
            .collect();

        let previous = std::mem::replace(&mut self.current, batch);
        self.sealed.push(previous);
        self.bind_contract(binding)
    }

    /// Associates a contract with the current batch.
    ///
    /// A batch holds at most one contract; a second binding is rejected.
    pub fn bind_contract(&mut self, binding: &ContractBinding) -> Result<()> {
        if !self.current.genesis.contracts.is_empty() {
            return Err(BackendError::Unsupported {
                backend: BackendKind::Offline,
                operation: "binding a second contract to one batch",
            });
        }
        self.current.genesis.contracts.push(GenesisContract {
            contract_name: binding.contract_name.clone(),
            params_deploy: binding.params.clone(),
            extra: Map::new(),
        });
        Ok(())
    }
}

/// Backend that writes batch files instead of talking to a network.
#[derive(Debug)]
pub struct OfflineBackend {
    chain_id: u64,
    context: BatchContext,
    round_start: Option<BatchContext>,
    output_dir: PathBuf,
}

impl OfflineBackend {
    /// Creates a backend funding `accounts` on top of `template`.
    pub fn new(
        chain_id: u64,
        template: BatchTemplate,
        accounts: &[Account],
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let context = BatchContext::new(template, accounts)?;
        let output_dir = output_dir.into();
        info!(chain_id, accounts = accounts.len(), output_dir = %output_dir.display(), "offline backend ready");
        Ok(Self { chain_id, context, round_start: None, output_dir })
    }

    /// The current batch state.
    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    /// Mutable batch state.
    pub fn context_mut(&mut self) -> &mut BatchContext {
        &mut self.context
    }

    /// Writes the template to `<output_dir>/<stem>.json`.
    pub fn persist(&self, stem: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|source| BackendError::Write { path: self.output_dir.clone(), source })?;
        let path = self.output_dir.join(format!("{stem}.json"));
        self.context.template().save(&path)?;
        info!(path = %path.display(), txs = self.context.current.txs.len(), "batch template written");
        Ok(path)
    }

    fn record(
        &mut self,
        key: &PrivateKey,
        to: TxTarget,
        value: U256,
        gas_limit: u64,
        details: (Option<String>, Option<String>, Option<Vec<Value>>),
    ) -> Result<TransactionOutcome> {
        let from = self.context.resolve(key)?;
        let nonce = self.context.nonces.consume(from)?;
        let (contract_name, function, params) = details;
        let transaction = QueuedTransaction {
            from,
            to,
            nonce,
            value: value.to_string(),
            contract_name,
            function,
            params,
            gas_limit,
            gas_price: GAS_PRICE.into(),
            chain_id: self.chain_id,
        };
        let record = self.context.queue(transaction);
        debug!(%from, nonce, to = %record.transaction.to, index = record.index, "transaction queued");
        Ok(record.into())
    }
}

impl TransactionBackend for OfflineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Offline
    }

    fn resolve_account(&self, account: AccountRef<'_>) -> Result<Address> {
        self.context.accounts.resolve(account)
    }

    fn register_account(&mut self, name: &str, address: Address) {
        self.context.accounts.register_name(name, address);
    }

    async fn balance(&self, _address: Address) -> Result<U256> {
        Err(BackendError::Unsupported { backend: BackendKind::Offline, operation: "balance queries" })
    }

    async fn transfer(&mut self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        self.record(
            &intent.from,
            TxTarget::Address(intent.to),
            intent.amount,
            TRANSFER_GAS_LIMIT,
            (None, None, None),
        )
    }

    async fn deploy(&mut self, intent: &DeployIntent) -> Result<Deployment> {
        let outcome = self.record(
            &intent.from,
            TxTarget::Deploy,
            U256::ZERO,
            DEPLOY_GAS_LIMIT,
            (Some(intent.contract_name.clone()), None, Some(intent.constructor_args.clone())),
        )?;
        Ok(Deployment { outcome, handle: Some(ContractHandle::symbolic(&intent.contract_name)) })
    }

    async fn execute(&mut self, intent: &CallIntent<'_>) -> Result<TransactionOutcome> {
        if intent.view {
            return Err(BackendError::Unsupported {
                backend: BackendKind::Offline,
                operation: "read-only calls",
            });
        }
        self.record(
            &intent.from,
            TxTarget::Contract,
            intent.amount,
            CALL_GAS_LIMIT,
            (Some(intent.target.to_string()), Some(intent.function.clone()), Some(intent.args.clone())),
        )
    }

    async fn begin_round(&mut self) -> Result<()> {
        self.round_start = Some(self.context.clone());
        Ok(())
    }

    async fn end_round(&mut self, window: &RoundWindow) -> Result<()> {
        self.persist(&window.label)?;
        if let Some(start) = self.round_start.take() {
            self.context = start;
        }
        Ok(())
    }

    async fn settle_setup(&mut self, binding: &ContractBinding, _grace: Duration) -> Result<()> {
        self.context.set_new_batch(binding)?;
        info!(contract = %binding.contract_name, batch = self.context.sealed.len(), "opened new batch");
        Ok(())
    }

    async fn finish_replay(&mut self) -> Result<()> {
        self.persist(REPLAY_STEM)?;
        Ok(())
    }
}
