//! Declarative transaction scripts.
//!
//! A script names accounts and contracts, then lists transfer, deploy and
//! execute steps. Steps run strictly in order against any
//! [`TransactionBackend`]. Later steps may reference what earlier ones
//! produced (a deployed contract's address or instance) through typed
//! [`Reference`]s.
//!
//! # Failure policy
//!
//! An error from the backend or an unresolvable reference aborts the
//! remaining steps. A reverted or timed out transaction is logged and the
//! script continues.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_primitives::{
    utils::{format_ether, parse_ether},
    Address, U256,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountRef, PrivateKey},
    backend::TransactionBackend,
    error::BackendError,
    intent::{CallIntent, DeployIntent, TransferIntent},
    outcome::{OutcomeStats, ReceiptStatus, TransactionOutcome},
};

mod reference;

pub use reference::{is_reference, ContractEntry, Reference, ScriptState};

/// Errors loading or replaying a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("failed to read script {path}: {source}")]
    Read {
        /// Script path.
        path: PathBuf,
        /// IO error.
        source: std::io::Error,
    },

    /// The script is not valid JSON or has the wrong shape.
    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    /// A reference string does not match any known path shape.
    #[error("malformed reference `{0}`")]
    MalformedReference(String),

    /// A reference resolves to the wrong kind of value.
    #[error("reference {reference} is not {expected}")]
    ReferenceKind {
        /// Offending reference.
        reference: String,
        /// What the step needed.
        expected: &'static str,
    },

    /// A step argument is missing or invalid.
    #[error("step `{step}`: {reason}")]
    InvalidArgument {
        /// Step label.
        step: String,
        /// What is wrong.
        reason: String,
    },

    /// The backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ScriptError {
    /// Returns true for a reference to something not (yet) registered.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_unknown_reference())
    }
}

#[derive(Debug, Default, Deserialize)]
struct AccountsSection {
    #[serde(default)]
    pv: BTreeMap<String, String>,
    #[serde(default)]
    address: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ContractSource {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StepKind {
    Transfer,
    DeployContract,
    Execute,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    kind: StepKind,
    #[serde(default)]
    id: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct ScriptDocument {
    #[serde(default)]
    accounts: AccountsSection,
    #[serde(default)]
    contracts: BTreeMap<String, ContractSource>,
    #[serde(default)]
    transactions: Vec<RawStep>,
}

/// Arguments of a `transfer` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferArgs {
    /// Sender key reference.
    #[serde(deserialize_with = "deserialize_reference")]
    pub from_priv_key: Reference,
    /// Receiver: a reference, a literal address or a registered account name.
    pub to_addr: String,
    /// Amount in ether.
    pub amount: Value,
    /// Gas limit hint.
    #[serde(default)]
    pub gas: Option<u64>,
}

/// Arguments of a `deploy_contract` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeployArgs {
    /// Declared contract name.
    pub contract_name: String,
    /// Deployer key reference.
    #[serde(deserialize_with = "deserialize_reference")]
    pub from_priv_key: Reference,
    /// Constructor arguments, possibly containing `data[...]` references.
    #[serde(default)]
    pub constructor_args: Vec<Value>,
}

/// Arguments of an `execute` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecuteArgs {
    /// Caller key reference.
    #[serde(deserialize_with = "deserialize_reference")]
    pub from_priv_key: Reference,
    /// Contract instance reference.
    #[serde(deserialize_with = "deserialize_reference")]
    pub contract_instance: Reference,
    /// Contract address reference.
    #[serde(deserialize_with = "deserialize_reference")]
    pub contract_address: Reference,
    /// Storage layout reference.
    #[serde(default, deserialize_with = "deserialize_optional_reference")]
    pub storage_layout: Option<Reference>,
    /// Contract name, informational.
    #[serde(default)]
    pub contract_name: String,
    /// Function to call.
    pub func_name: String,
    /// Function arguments, possibly containing `data[...]` references.
    #[serde(default)]
    pub func_args: Vec<Value>,
    /// Read-only call.
    #[serde(default)]
    pub call: bool,
    /// Attached value in ether.
    #[serde(default)]
    pub amount: Option<Value>,
}

fn deserialize_reference<'de, D>(deserializer: D) -> Result<Reference, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn deserialize_optional_reference<'de, D>(deserializer: D) -> Result<Option<Reference>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| raw.parse().map_err(serde::de::Error::custom))
        .transpose()
}

/// One script operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Native transfer.
    Transfer(TransferArgs),
    /// Contract deployment.
    Deploy(DeployArgs),
    /// Contract call.
    Execute(ExecuteArgs),
}

/// A labelled operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Label used in logs.
    pub id: String,
    /// The operation.
    pub operation: Operation,
}

/// A parsed script: its initial symbol table and ordered steps.
#[derive(Debug, Clone)]
pub struct Script {
    /// Declared accounts and contracts.
    pub state: ScriptState,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Script {
    /// Reads and parses a script file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ScriptError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&contents)
    }

    /// Parses a script document.
    pub fn from_json(json: &str) -> Result<Self, ScriptError> {
        let document: ScriptDocument = serde_json::from_str(json)?;
        let mut state = ScriptState::default();

        for (name, raw) in &document.accounts.pv {
            let key: PrivateKey = raw.parse().map_err(|_| ScriptError::InvalidArgument {
                step: format!("accounts.pv.{name}"),
                reason: "invalid private key".into(),
            })?;
            state.insert_key(name.clone(), key);
        }
        for (name, raw) in &document.accounts.address {
            let address: Address = raw.parse().map_err(|_| ScriptError::InvalidArgument {
                step: format!("accounts.address.{name}"),
                reason: format!("invalid address `{raw}`"),
            })?;
            state.insert_address(name.clone(), address);
        }
        for (name, source) in document.contracts {
            state.insert_contract(name, source.path);
        }

        let steps = document
            .transactions
            .into_iter()
            .map(|raw| {
                let invalid = |err: serde_json::Error| ScriptError::InvalidArgument {
                    step: raw.id.clone(),
                    reason: err.to_string(),
                };
                let operation = match raw.kind {
                    StepKind::Transfer => {
                        Operation::Transfer(serde_json::from_value(raw.args.clone()).map_err(invalid)?)
                    }
                    StepKind::DeployContract => {
                        Operation::Deploy(serde_json::from_value(raw.args.clone()).map_err(invalid)?)
                    }
                    StepKind::Execute => {
                        Operation::Execute(serde_json::from_value(raw.args.clone()).map_err(invalid)?)
                    }
                };
                Ok(Step { id: raw.id, operation })
            })
            .collect::<Result<_, ScriptError>>()?;

        Ok(Self { state, steps })
    }

    /// Accounts for every declared key, for seeding an offline backend.
    pub fn accounts(&self) -> Vec<Account> {
        self.state.keys().map(|(_, key)| Account::from_private_key(key.clone())).collect()
    }
}

/// Outcome of one replayed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Step label.
    pub id: String,
    /// Backend outcome.
    pub outcome: TransactionOutcome,
}

/// Summary of a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Per-step outcomes in order.
    pub steps: Vec<StepReport>,
    /// Tally over all steps.
    pub stats: OutcomeStats,
}

/// Parses an ether amount given as a JSON number or string.
fn parse_amount(step: &str, value: &Value) -> Result<U256, ScriptError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => {
            return Err(ScriptError::InvalidArgument {
                step: step.to_string(),
                reason: format!("amount must be a number, found {other}"),
            })
        }
    };
    parse_ether(&text).map_err(|err| ScriptError::InvalidArgument {
        step: step.to_string(),
        reason: format!("invalid amount `{text}`: {err}"),
    })
}

/// Drives a script through a backend.
#[derive(Debug)]
pub struct ScriptReplayer<'a, B> {
    backend: &'a mut B,
    state: ScriptState,
}

impl<'a, B: TransactionBackend> ScriptReplayer<'a, B> {
    /// Creates a replayer over `state`.
    pub fn new(backend: &'a mut B, state: ScriptState) -> Self {
        Self { backend, state }
    }

    /// The accumulated symbol table.
    pub fn state(&self) -> &ScriptState {
        &self.state
    }

    /// Resolves every declared key to an address and registers its name.
    pub async fn resolve_accounts(&mut self) -> Result<(), ScriptError> {
        let keys: Vec<(String, PrivateKey)> =
            self.state.keys().map(|(name, key)| (name.to_string(), key.clone())).collect();

        for (name, key) in keys {
            let address = match self.state.account_address(&name) {
                Some(address) => address,
                None => self.backend.resolve_account(AccountRef::Key(&key))?,
            };
            self.state.insert_address(name.clone(), address);
            self.backend.register_account(&name, address);

            match self.backend.balance(address).await {
                Ok(balance) => info!(account = %name, %address, balance = %format_ether(balance), "account"),
                Err(err) if err.is_unsupported() => debug!(account = %name, %address, "account"),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// A reference, a literal address, or an account name known to the
    /// script or the backend.
    fn resolve_receiver(&self, to: &str) -> Result<Address, ScriptError> {
        if to.starts_with('[') || is_reference(to) {
            return self.state.address(&to.parse()?);
        }
        if let Ok(address) = to.parse::<Address>() {
            return Ok(address);
        }
        match self.state.account_address(to) {
            Some(address) => Ok(address),
            None => Ok(self.backend.resolve_account(AccountRef::Name(to))?),
        }
    }

    /// Runs one step.
    pub async fn run_step(&mut self, step: &Step) -> Result<TransactionOutcome, ScriptError> {
        match &step.operation {
            Operation::Transfer(args) => {
                let from = self.state.key(&args.from_priv_key)?.clone();
                let to = self.resolve_receiver(&args.to_addr)?;
                let amount = parse_amount(&step.id, &args.amount)?;
                let intent = TransferIntent { from, to, amount, gas: args.gas };
                Ok(self.backend.transfer(&intent).await?)
            }
            Operation::Deploy(args) => {
                let source = self
                    .state
                    .contract(&args.contract_name)
                    .map(|entry| entry.path.clone())
                    .ok_or_else(|| {
                        BackendError::UnknownReference(format!("contract `{}`", args.contract_name))
                    })?;
                let from = self.state.key(&args.from_priv_key)?.clone();
                let constructor_args = self.state.resolve_args(&args.constructor_args)?;
                let intent = DeployIntent::new(source, &args.contract_name, from, constructor_args);

                let deployment = self.backend.deploy(&intent).await?;
                if let Some(handle) = deployment.handle {
                    info!(contract = %args.contract_name, location = %handle.location, "contract recorded");
                    self.state.record_deployment(&args.contract_name, handle)?;
                }
                Ok(deployment.outcome)
            }
            Operation::Execute(args) => {
                let from = self.state.key(&args.from_priv_key)?.clone();
                let contract = self.state.handle(&args.contract_instance)?;
                let target = self.state.location(&args.contract_address)?;
                if let Some(layout) = &args.storage_layout {
                    let layout = self.state.value(layout)?;
                    debug!(contract = %args.contract_name, has_layout = !layout.is_null(), "storage layout");
                }
                let call_args = self.state.resolve_args(&args.func_args)?;
                let amount = match &args.amount {
                    Some(amount) => parse_amount(&step.id, amount)?,
                    None => U256::ZERO,
                };
                let intent = CallIntent {
                    from,
                    contract,
                    target,
                    function: args.func_name.clone(),
                    args: call_args,
                    view: args.call,
                    amount,
                };
                Ok(self.backend.execute(&intent).await?)
            }
        }
    }

    /// Resolves accounts, then runs every step in order.
    pub async fn replay(&mut self, steps: &[Step]) -> Result<ReplayReport, ScriptError> {
        self.resolve_accounts().await?;

        let mut report = ReplayReport::default();
        for (index, step) in steps.iter().enumerate() {
            info!(step = index, id = %step.id, "executing step");
            let outcome = self.run_step(step).await?;
            match outcome.status() {
                Some(ReceiptStatus::Success) | None => info!(id = %step.id, %outcome, "step done"),
                Some(status) => warn!(id = %step.id, %status, %outcome, "step failed, continuing"),
            }
            report.stats.record(&outcome);
            report.steps.push(StepReport { id: step.id.clone(), outcome });
        }
        self.backend.finish_replay().await?;

        info!(
            succeeded = report.stats.successful,
            failed = report.stats.failed,
            queued = report.stats.queued,
            "script finished"
        );
        Ok(report)
    }
}

/// Replays a parsed script against `backend`.
pub async fn replay_script<B: TransactionBackend>(
    backend: &mut B,
    script: Script,
) -> Result<ReplayReport, ScriptError> {
    let Script { state, steps } = script;
    ScriptReplayer::new(backend, state).replay(&steps).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{offline::TxTarget, BatchTemplate, Deployment, OfflineBackend, RoundWindow},
        contract::ContractBinding,
        outcome::Receipt,
        BackendKind,
    };
    use serde_json::json;
    use std::time::Duration;

    fn script_json(transactions: Value) -> String {
        let alice = PrivateKey::from_seed(1).to_hex();
        let bob = PrivateKey::from_seed(2).to_hex();
        json!({
            "accounts": { "pv": { "alice": alice, "bob": bob }, "address": {} },
            "contracts": { "Greeter": { "path": "contracts/Greeter.sol" } },
            "transactions": transactions,
        })
        .to_string()
    }

    fn offline_for(script: &Script, output_dir: &std::path::Path) -> OfflineBackend {
        OfflineBackend::new(1000, BatchTemplate::pristine(), &script.accounts(), output_dir).unwrap()
    }

    #[tokio::test]
    async fn test_offline_replay_resolves_references() {
        let script = Script::from_json(&script_json(json!([
            { "type": "transfer", "id": "fund-bob", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "to_addr": r#"["accounts"]["address"]["bob"]"#,
                "amount": 1, "gas": 21000 } },
            { "type": "deploy_contract", "id": "deploy", "args": {
                "contract_name": "Greeter",
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "constructor_args": [10] } },
            { "type": "execute", "id": "greet-bob", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["bob"]"#,
                "contract_instance": r#"["contracts"]["Greeter"]["instance"]"#,
                "contract_address": r#"["contracts"]["Greeter"]["address"]"#,
                "storage_layout": r#"["contracts"]["Greeter"]["storage_layout"]"#,
                "contract_name": "Greeter",
                "func_name": "setOwner",
                "func_args": [r#"data["accounts"]["address"]["bob"]"#],
                "call": false } }
        ])))
        .unwrap();
        let bob = PrivateKey::from_seed(2).address();
        let dir = tempfile::tempdir().unwrap();
        let mut backend = offline_for(&script, dir.path());

        let report = replay_script(&mut backend, script).await.unwrap();
        assert_eq!(report.stats.queued, 3);

        let written = BatchTemplate::load(dir.path().join("replay.json")).unwrap();
        assert_eq!(written.batches()[0].txs.len(), 3);

        let txs = &backend.context().current_batch().txs;
        assert_eq!(txs[0].to, TxTarget::Address(bob));
        assert_eq!(txs[0].value, "1000000000000000000");
        assert_eq!(txs[1].to, TxTarget::Deploy);
        assert_eq!(txs[1].nonce, 1);
        assert_eq!(txs[2].contract_name.as_deref(), Some("Greeter"));
        assert_eq!(txs[2].params, Some(vec![json!(bob.to_string())]));
        assert_eq!(txs[2].nonce, 0);
    }

    #[tokio::test]
    async fn test_forward_reference_aborts_without_submitting() {
        let script = Script::from_json(&script_json(json!([
            { "type": "execute", "id": "too-early", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "contract_instance": r#"["contracts"]["Greeter"]["instance"]"#,
                "contract_address": r#"["contracts"]["Greeter"]["address"]"#,
                "func_name": "greet",
                "call": false } },
            { "type": "deploy_contract", "id": "deploy", "args": {
                "contract_name": "Greeter",
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "constructor_args": [] } }
        ])))
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut backend = offline_for(&script, dir.path());

        let err = replay_script(&mut backend, script).await.unwrap_err();
        assert!(err.is_unknown_reference());
        assert!(backend.context().current_batch().txs.is_empty());
        assert!(!dir.path().join("replay.json").exists());
    }

    #[test]
    fn test_malformed_reference_is_rejected_at_load() {
        let err = Script::from_json(&script_json(json!([
            { "type": "transfer", "id": "bad", "args": {
                "from_priv_key": "data.accounts.pv.alice",
                "to_addr": "0x0000000000000000000000000000000000000001",
                "amount": 1 } }
        ])))
        .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArgument { ref step, .. } if step == "bad"));
    }

    #[test]
    fn test_unknown_step_type() {
        let err = Script::from_json(&script_json(json!([
            { "type": "selfdestruct", "id": "x", "args": {} }
        ])))
        .unwrap_err();
        assert!(matches!(err, ScriptError::Parse(_)));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("s", &json!(1)).unwrap(), U256::from(10u128.pow(18)));
        assert_eq!(parse_amount("s", &json!("0.5")).unwrap(), U256::from(5 * 10u128.pow(17)));
        assert!(parse_amount("s", &json!(null)).is_err());
        assert!(parse_amount("s", &json!("lots")).is_err());
    }

    /// Backend whose every transaction reverts.
    #[derive(Default)]
    struct RevertingBackend {
        calls: usize,
        finished: usize,
    }

    impl TransactionBackend for RevertingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Live
        }

        fn resolve_account(&self, account: AccountRef<'_>) -> crate::Result<Address> {
            match account {
                AccountRef::Key(key) => Ok(key.address()),
                AccountRef::Name(name) => Err(BackendError::UnknownReference(name.to_string())),
            }
        }

        fn register_account(&mut self, _name: &str, _address: Address) {}

        async fn balance(&self, _address: Address) -> crate::Result<U256> {
            Ok(U256::ZERO)
        }

        async fn transfer(&mut self, _intent: &TransferIntent) -> crate::Result<TransactionOutcome> {
            self.calls += 1;
            Ok(Receipt::reverted_preflight().into())
        }

        async fn deploy(&mut self, _intent: &DeployIntent) -> crate::Result<Deployment> {
            self.calls += 1;
            Ok(Deployment { outcome: Receipt::reverted_preflight().into(), handle: None })
        }

        async fn execute(&mut self, _intent: &CallIntent<'_>) -> crate::Result<TransactionOutcome> {
            self.calls += 1;
            Ok(Receipt::reverted_preflight().into())
        }

        async fn end_round(&mut self, _window: &RoundWindow) -> crate::Result<()> {
            Ok(())
        }

        async fn settle_setup(
            &mut self,
            _binding: &ContractBinding,
            _grace: Duration,
        ) -> crate::Result<()> {
            Ok(())
        }

        async fn finish_replay(&mut self) -> crate::Result<()> {
            self.finished += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reverted_step_does_not_abort() {
        let script = Script::from_json(&script_json(json!([
            { "type": "transfer", "id": "one", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "to_addr": "bob", "amount": "1" } },
            { "type": "transfer", "id": "two", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["bob"]"#,
                "to_addr": "0x0000000000000000000000000000000000000001", "amount": 2 } },
            { "type": "deploy_contract", "id": "three", "args": {
                "contract_name": "Greeter",
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "constructor_args": [] } }
        ])))
        .unwrap();
        let mut backend = RevertingBackend::default();

        let mut replayer = ScriptReplayer::new(&mut backend, script.state.clone());
        let report = replayer.replay(&script.steps).await.unwrap();
        assert_eq!(report.stats, OutcomeStats::new(0, 3, 0));
        assert_eq!(report.steps.len(), 3);
        // A reverted deployment leaves nothing to reference.
        assert!(replayer.state().contract("Greeter").unwrap().handle.is_none());
        assert_eq!(backend.calls, 3);
        assert_eq!(backend.finished, 1);
    }

    #[tokio::test]
    async fn test_unknown_receiver_name_aborts() {
        let script = Script::from_json(&script_json(json!([
            { "type": "transfer", "id": "to-carol", "args": {
                "from_priv_key": r#"["accounts"]["pv"]["alice"]"#,
                "to_addr": "carol", "amount": 1 } }
        ])))
        .unwrap();
        let mut backend = RevertingBackend::default();

        let err = replay_script(&mut backend, script).await.unwrap_err();
        assert!(err.is_unknown_reference());
        assert_eq!(backend.calls, 0);
        assert_eq!(backend.finished, 0);
    }
}
