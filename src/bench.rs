//! Benchmark workloads.
//!
//! A [`BenchmarkKind`] expands into a fixed list of [`RoundShape`]s. The
//! [`BenchmarkDriver`] runs each round against a backend: it submits the
//! round's transactions, tallies outcomes, then hands the timing window to
//! [`TransactionBackend::end_round`]. Live backends sleep out the rest of the
//! window there; the offline backend writes the round's batch file and
//! resets to its pre-round state.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use alloy_primitives::{Address, U256};
use clap::ValueEnum;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    account::Account,
    backend::{ConcurrentSubmitter, RoundWindow, TransactionBackend},
    config::BenchConfig,
    contract::{ContractBinding, ContractHandle, DeployParams},
    error::{BackendError, Result},
    intent::{CallIntent, DeployIntent, TransferIntent},
    outcome::{OutcomeStats, ReceiptStatus, TransactionOutcome},
};

/// One ether in wei, the native transfer amount.
pub const TRANSFER_AMOUNT: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Gas hint for native transfers.
pub const TRANSFER_GAS: u64 = 21_000;

/// Tokens minted to every participant.
pub const TOKEN_MINT: u64 = 100_000;

/// Tokens moved per token transfer.
pub const TOKEN_TRANSFER: u64 = 10;

const TOKEN_CONTRACT: &str = "ERC20Template";
const TOKEN_SOURCE: &str = "erc20.sol";
const DEPLOY_CONTRACT: &str = "Greeter";
const DEPLOY_SOURCE: &str = "Greeter.sol";
const HASH_FUNCTION: &str = "random_hash_save";

/// Named benchmark workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum BenchmarkKind {
    /// Native transfers between the same pair and between distinct pairs.
    Transfers,
    /// Large concurrent rounds of native transfers between distinct pairs.
    MaxEthTransfers,
    /// Token transfers on a freshly deployed and minted ERC20 contract.
    Erc20,
    /// Repeated contract deployments.
    Deploy,
    /// Calls to a contract hashing in Solidity.
    Sha256,
    /// Calls to a contract hashing through the precompile.
    PrecompileSha256,
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transfers => "transfers",
            Self::MaxEthTransfers => "max-eth-transfers",
            Self::Erc20 => "erc20",
            Self::Deploy => "deploy",
            Self::Sha256 => "sha256",
            Self::PrecompileSha256 => "precompile-sha256",
        })
    }
}

impl BenchmarkKind {
    /// Source file and contract name of the hashing contract, if any.
    pub fn hash_contract(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Sha256 => Some(("SHA256.sol", "SHA256")),
            Self::PrecompileSha256 => Some(("KeccakPrecompile.sol", "KeccakPrecompile")),
            _ => None,
        }
    }

    /// The rounds this workload runs, in order.
    pub fn rounds(self) -> Vec<RoundShape> {
        use Dispatch::*;
        use Pattern::*;

        match self {
            Self::Transfers => [(1, Same), (10, Same), (100, Same), (200, Same)]
                .into_iter()
                .chain([(10, Distinct), (100, Distinct), (200, Distinct)])
                .map(|(count, pattern)| RoundShape::Transfers { count, pattern, dispatch: Sequential })
                .collect(),
            Self::MaxEthTransfers => [498, 996, 2490, 4980]
                .into_iter()
                .map(|count| RoundShape::Transfers { count, pattern: Distinct, dispatch: Concurrent })
                .collect(),
            Self::Erc20 => [(1, Same), (10, Same), (100, Same), (200, Same)]
                .into_iter()
                .chain([(10, Distinct), (100, Distinct), (200, Distinct)])
                .map(|(count, pattern)| RoundShape::TokenTransfers { count, pattern })
                .collect(),
            Self::Deploy => {
                [1, 10, 100, 200].into_iter().map(|count| RoundShape::Deployments { count }).collect()
            }
            Self::Sha256 | Self::PrecompileSha256 => {
                [1, 10, 30].into_iter().map(|count| RoundShape::Hashes { count }).collect()
            }
        }
    }
}

/// Sender/receiver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Every transaction goes from account 0 to account 1.
    Same,
    /// Transaction `i` goes from account `i` to account `i + 1`.
    Distinct,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Same => "same",
            Self::Distinct => "different",
        })
    }
}

impl Pattern {
    /// Accounts needed for `count` transactions.
    pub fn accounts_needed(self, count: usize) -> usize {
        match self {
            Self::Same => 2,
            Self::Distinct => count + 1,
        }
    }

    /// Indices of the sender and receiver of transaction `i`.
    pub fn pair(self, i: usize) -> (usize, usize) {
        match self {
            Self::Same => (0, 1),
            Self::Distinct => (i, i + 1),
        }
    }
}

/// How a round submits its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dispatch {
    /// One after another, each waiting for its outcome.
    #[default]
    Sequential,
    /// Grouped by sender; sender lanes run in parallel.
    Concurrent,
}

/// The work of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundShape {
    /// Native transfers.
    Transfers {
        /// Number of transfers.
        count: usize,
        /// Account selection.
        pattern: Pattern,
        /// Submission strategy.
        dispatch: Dispatch,
    },
    /// ERC20 `transfer` calls.
    TokenTransfers {
        /// Number of calls.
        count: usize,
        /// Account selection.
        pattern: Pattern,
    },
    /// Contract deployments, deployment `i` from account `i`.
    Deployments {
        /// Number of deployments.
        count: usize,
    },
    /// Hash-and-store calls from account 0.
    Hashes {
        /// Number of calls.
        count: usize,
    },
}

impl RoundShape {
    /// Accounts the round reads.
    pub fn accounts_needed(&self) -> usize {
        match *self {
            Self::Transfers { count, pattern, .. } | Self::TokenTransfers { count, pattern } => {
                pattern.accounts_needed(count)
            }
            Self::Deployments { count } => count,
            Self::Hashes { .. } => 1,
        }
    }

    /// Round label, also the offline output file stem.
    pub fn label(&self, contract: Option<&str>) -> String {
        match *self {
            Self::Transfers { count, pattern, .. } => format!("{count}_{pattern}_transfers"),
            Self::TokenTransfers { count, pattern } => format!("gen-{count}_{pattern}_erc20_transfers"),
            Self::Deployments { count } => format!("gen-deploy_{count}"),
            Self::Hashes { count } => format!("gen-{}_{count}", contract.unwrap_or("hash")),
        }
    }
}

/// Summary of a finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// Round label.
    pub label: String,
    /// Outcome tally.
    pub stats: OutcomeStats,
    /// Time spent submitting.
    pub elapsed: Duration,
}

/// Runs benchmark workloads against a backend.
#[derive(Debug)]
pub struct BenchmarkDriver<'a, B> {
    backend: &'a mut B,
    accounts: &'a [Account],
    config: BenchConfig,
}

impl<'a, B: TransactionBackend> BenchmarkDriver<'a, B> {
    /// Creates a driver over a participant list.
    pub fn new(backend: &'a mut B, accounts: &'a [Account], config: BenchConfig) -> Self {
        Self { backend, accounts, config }
    }

    /// The driver settings.
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    fn require_accounts(&self, workload: &str, needed: usize) -> Result<()> {
        if self.accounts.len() < needed {
            return Err(BackendError::InsufficientAccounts {
                workload: workload.to_string(),
                needed,
                available: self.accounts.len(),
            });
        }
        Ok(())
    }

    fn contract_source(&self, file: &str) -> PathBuf {
        self.config.contracts_dir.join(file)
    }

    /// Runs every round of `kind`, including its setup.
    pub async fn run(&mut self, kind: BenchmarkKind) -> Result<Vec<RoundReport>> {
        let rounds = kind.rounds();
        let needed = rounds.iter().map(RoundShape::accounts_needed).max().unwrap_or(1).max(1);
        self.require_accounts(&kind.to_string(), needed)?;
        info!(benchmark = %kind, rounds = rounds.len(), accounts = self.accounts.len(), "starting benchmark");

        let contract = self.prepare(kind).await?;
        let mut reports = Vec::with_capacity(rounds.len());
        for shape in &rounds {
            reports.push(self.run_round(shape, contract.as_ref()).await?);
        }

        let total = reports.iter().fold(OutcomeStats::default(), |mut total, report| {
            total.merge(report.stats);
            total
        });
        info!(
            benchmark = %kind,
            successful = total.successful,
            failed = total.failed,
            queued = total.queued,
            "benchmark finished"
        );
        Ok(reports)
    }

    /// Deploys and initializes the contract a workload calls, if any.
    pub async fn prepare(&mut self, kind: BenchmarkKind) -> Result<Option<ContractHandle>> {
        match kind {
            BenchmarkKind::Erc20 => self.prepare_token().await.map(Some),
            BenchmarkKind::Sha256 | BenchmarkKind::PrecompileSha256 => match kind.hash_contract() {
                Some((source, name)) => self.prepare_hash(source, name).await.map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn setup_grace(&self) -> Duration {
        self.config.round_timeout + self.config.setup_grace
    }

    async fn prepare_token(&mut self) -> Result<ContractHandle> {
        self.require_accounts(TOKEN_CONTRACT, 1)?;
        let accounts = self.accounts;
        let owner = &accounts[0];
        let owner_address = Value::String(owner.address.to_string());
        let constructor_args =
            vec![owner_address.clone(), owner_address, json!("WETH coin"), json!("WETH"), json!(18)];

        let intent = DeployIntent::new(
            self.contract_source(TOKEN_SOURCE),
            TOKEN_CONTRACT,
            owner.private_key.clone(),
            constructor_args.clone(),
        );
        let deployment = self.backend.deploy(&intent).await?;
        info!(contract = TOKEN_CONTRACT, outcome = %deployment.outcome, "token contract deployed");
        let handle = deployment.into_handle(TOKEN_CONTRACT)?;

        let mut minted = OutcomeStats::default();
        for (index, account) in accounts.iter().enumerate() {
            let call = CallIntent::transact(
                owner.private_key.clone(),
                &handle,
                "mint",
                vec![json!(account.address.to_string()), json!(TOKEN_MINT)],
            );
            let outcome = self.backend.execute(&call).await?;
            log_outcome("mint", index, &outcome);
            minted.record(&outcome);
        }
        info!(successful = minted.successful, failed = minted.failed, queued = minted.queued, "tokens minted");

        let params =
            DeployParams::new(["address", "address", "string", "string", "uint8"], constructor_args);
        let binding = ContractBinding::new(TOKEN_CONTRACT, params);
        self.backend.settle_setup(&binding, self.setup_grace()).await?;
        Ok(handle)
    }

    async fn prepare_hash(&mut self, source: &str, name: &str) -> Result<ContractHandle> {
        self.require_accounts(name, 1)?;
        let owner = &self.accounts[0];
        let intent =
            DeployIntent::new(self.contract_source(source), name, owner.private_key.clone(), vec![]);
        let deployment = self.backend.deploy(&intent).await?;
        info!(contract = name, outcome = %deployment.outcome, "hash contract deployed");
        let handle = deployment.into_handle(name)?;

        let binding = ContractBinding::new(name, DeployParams::new(Vec::<String>::new(), vec![]));
        self.backend.settle_setup(&binding, self.setup_grace()).await?;
        Ok(handle)
    }

    /// Runs one round and closes its timing window.
    ///
    /// Token and hash rounds need the handle returned by [`Self::prepare`].
    pub async fn run_round(
        &mut self,
        shape: &RoundShape,
        contract: Option<&ContractHandle>,
    ) -> Result<RoundReport> {
        let label = shape.label(contract.map(|handle| handle.name.as_str()));
        self.require_accounts(&label, shape.accounts_needed())?;
        if matches!(shape, RoundShape::TokenTransfers { .. } | RoundShape::Hashes { .. }) {
            require_contract(contract, &label)?;
        }
        info!(round = %label, "starting round");

        self.backend.begin_round().await?;
        let start = Instant::now();
        let stats = match *shape {
            RoundShape::Transfers { count, pattern, dispatch: Dispatch::Sequential } => {
                self.sequential_transfers(count, pattern).await?
            }
            RoundShape::Transfers { count, pattern, dispatch: Dispatch::Concurrent } => {
                self.concurrent_transfers(count, pattern).await?
            }
            RoundShape::TokenTransfers { count, pattern } => {
                let handle = require_contract(contract, &label)?;
                self.token_transfers(handle, count, pattern).await?
            }
            RoundShape::Deployments { count } => self.deployments(count).await?,
            RoundShape::Hashes { count } => {
                let handle = require_contract(contract, &label)?;
                self.hashes(handle, count).await?
            }
        };
        let elapsed = start.elapsed();
        info!(
            round = %label,
            successful = stats.successful,
            failed = stats.failed,
            queued = stats.queued,
            elapsed_secs = format!("{:.2}", elapsed.as_secs_f64()),
            "round submitted"
        );

        let window = RoundWindow { label: label.clone(), elapsed, timeout: self.config.round_timeout };
        self.backend.end_round(&window).await?;
        Ok(RoundReport { label, stats, elapsed })
    }

    fn transfer_intent(&self, pattern: Pattern, i: usize) -> TransferIntent {
        let (from, to) = pattern.pair(i);
        TransferIntent::new(
            self.accounts[from].private_key.clone(),
            self.accounts[to].address,
            TRANSFER_AMOUNT,
        )
        .with_gas(TRANSFER_GAS)
    }

    async fn sequential_transfers(&mut self, count: usize, pattern: Pattern) -> Result<OutcomeStats> {
        let mut stats = OutcomeStats::default();
        for i in 0..count {
            let intent = self.transfer_intent(pattern, i);
            let outcome = self.backend.transfer(&intent).await?;
            log_outcome("transfer", i, &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    async fn concurrent_transfers(&mut self, count: usize, pattern: Pattern) -> Result<OutcomeStats> {
        let Some(submitter) = self.backend.concurrent() else {
            warn!(backend = %self.backend.kind(), "backend has no concurrent submitter, dispatching sequentially");
            return self.sequential_transfers(count, pattern).await;
        };

        // Transfers from one sender share a lane so their nonces stay ordered.
        let mut lanes: BTreeMap<Address, Vec<TransferIntent>> = BTreeMap::new();
        for i in 0..count {
            let intent = self.transfer_intent(pattern, i);
            lanes.entry(intent.from.address()).or_default().push(intent);
        }
        debug!(transfers = count, lanes = lanes.len(), concurrency = self.config.concurrency, "dispatching lanes");

        let mut pending = lanes.into_values();
        let mut in_flight = FuturesUnordered::new();
        for lane in pending.by_ref().take(self.config.concurrency.max(1)) {
            in_flight.push(run_lane(submitter, lane));
        }

        // After the first infrastructure error no new lane starts; lanes in flight run out.
        let mut stats = OutcomeStats::default();
        let mut first_error = None;
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(lane_stats) => stats.merge(lane_stats),
                Err(err) => {
                    warn!(error = %err, "lane aborted");
                    first_error.get_or_insert(err);
                }
            }
            if first_error.is_none() {
                if let Some(lane) = pending.next() {
                    in_flight.push(run_lane(submitter, lane));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    async fn token_transfers(
        &mut self,
        handle: &ContractHandle,
        count: usize,
        pattern: Pattern,
    ) -> Result<OutcomeStats> {
        let mut stats = OutcomeStats::default();
        for i in 0..count {
            let (from, to) = pattern.pair(i);
            let call = CallIntent::transact(
                self.accounts[from].private_key.clone(),
                handle,
                "transfer",
                vec![json!(self.accounts[to].address.to_string()), json!(TOKEN_TRANSFER)],
            );
            let outcome = self.backend.execute(&call).await?;
            log_outcome("token transfer", i, &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    async fn deployments(&mut self, count: usize) -> Result<OutcomeStats> {
        let mut stats = OutcomeStats::default();
        for i in 0..count {
            let intent = DeployIntent::new(
                self.contract_source(DEPLOY_SOURCE),
                DEPLOY_CONTRACT,
                self.accounts[i].private_key.clone(),
                vec![json!(10)],
            );
            let deployment = self.backend.deploy(&intent).await?;
            log_outcome("deploy", i, &deployment.outcome);
            stats.record(&deployment.outcome);
        }
        Ok(stats)
    }

    async fn hashes(&mut self, handle: &ContractHandle, count: usize) -> Result<OutcomeStats> {
        let mut stats = OutcomeStats::default();
        let caller = self.accounts[0].private_key.clone();
        for i in 0..count {
            let call = CallIntent::transact(caller.clone(), handle, HASH_FUNCTION, vec![]);
            let outcome = self.backend.execute(&call).await?;
            log_outcome("hash", i, &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }
}

fn require_contract<'c>(contract: Option<&'c ContractHandle>, label: &str) -> Result<&'c ContractHandle> {
    contract.ok_or_else(|| BackendError::UnknownReference(format!("no contract prepared for round {label}")))
}

/// Submits one sender's transfers in order.
async fn run_lane(submitter: ConcurrentSubmitter<'_>, lane: Vec<TransferIntent>) -> Result<OutcomeStats> {
    let mut stats = OutcomeStats::default();
    for (i, intent) in lane.iter().enumerate() {
        let outcome = submitter.transfer(intent).await?;
        log_outcome("transfer", i, &outcome);
        stats.record(&outcome);
    }
    Ok(stats)
}

fn log_outcome(operation: &str, index: usize, outcome: &TransactionOutcome) {
    match outcome.status() {
        Some(ReceiptStatus::Success) => info!(operation, index, %outcome, "receipt"),
        Some(status) => warn!(operation, index, %status, %outcome, "transaction failed"),
        None => debug!(operation, index, %outcome, "queued"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            offline::{BatchTemplate, TxTarget},
            LiveBackend, OfflineBackend,
        },
        config::ReceiptPolicy,
    };
    use alloy_primitives::B256;
    use futures::executor::block_on;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    fn accounts(n: u64) -> Vec<Account> {
        (0..n).map(Account::from_seed).collect()
    }

    fn config(output_dir: &std::path::Path) -> BenchConfig {
        BenchConfig {
            round_timeout: Duration::ZERO,
            setup_grace: Duration::ZERO,
            output_dir: output_dir.to_path_buf(),
            ..BenchConfig::default()
        }
    }

    fn offline(accounts: &[Account], output_dir: &std::path::Path) -> OfflineBackend {
        OfflineBackend::new(1000, BatchTemplate::pristine(), accounts, output_dir).unwrap()
    }

    #[test]
    fn test_round_labels() {
        let shape = RoundShape::Transfers { count: 10, pattern: Pattern::Distinct, dispatch: Dispatch::Sequential };
        assert_eq!(shape.label(None), "10_different_transfers");
        let shape = RoundShape::TokenTransfers { count: 1, pattern: Pattern::Same };
        assert_eq!(shape.label(None), "gen-1_same_erc20_transfers");
        assert_eq!(RoundShape::Deployments { count: 100 }.label(None), "gen-deploy_100");
        assert_eq!(RoundShape::Hashes { count: 30 }.label(Some("SHA256")), "gen-SHA256_30");
    }

    #[test]
    fn test_workload_catalogue() {
        let transfers = BenchmarkKind::Transfers.rounds();
        assert_eq!(transfers.len(), 7);
        assert_eq!(transfers.iter().map(RoundShape::accounts_needed).max(), Some(201));

        let max = BenchmarkKind::MaxEthTransfers.rounds();
        assert!(max.iter().all(|shape| matches!(
            shape,
            RoundShape::Transfers { pattern: Pattern::Distinct, dispatch: Dispatch::Concurrent, .. }
        )));
        assert_eq!(max.last().map(RoundShape::accounts_needed), Some(4981));

        assert_eq!(BenchmarkKind::Sha256.rounds().len(), 3);
        assert_eq!(BenchmarkKind::PrecompileSha256.hash_contract(), Some(("KeccakPrecompile.sol", "KeccakPrecompile")));
        assert_eq!(BenchmarkKind::Deploy.rounds().iter().map(RoundShape::accounts_needed).max(), Some(200));
    }

    #[test]
    fn test_same_pair_single_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(2);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let shape = RoundShape::Transfers { count: 1, pattern: Pattern::Same, dispatch: Dispatch::Sequential };
        let report = block_on(driver.run_round(&shape, None)).unwrap();
        assert_eq!(report.label, "1_same_transfers");
        assert_eq!(report.stats, OutcomeStats::new(0, 0, 1));

        let written = BatchTemplate::load(dir.path().join("1_same_transfers.json")).unwrap();
        let txs = &written.batches()[0].txs;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].from, accounts[0].address);
        assert_eq!(txs[0].to, TxTarget::Address(accounts[1].address));
        assert_eq!(txs[0].value, TRANSFER_AMOUNT.to_string());

        // The round's transactions do not leak into the next round.
        assert!(backend.context().current_batch().txs.is_empty());
    }

    #[test]
    fn test_distinct_pairs_use_distinct_senders() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(11);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let shape = RoundShape::Transfers { count: 10, pattern: Pattern::Distinct, dispatch: Dispatch::Sequential };
        block_on(driver.run_round(&shape, None)).unwrap();

        let written = BatchTemplate::load(dir.path().join("10_different_transfers.json")).unwrap();
        let txs = &written.batches()[0].txs;
        assert_eq!(txs.len(), 10);
        for (i, tx) in txs.iter().enumerate() {
            assert_eq!(tx.from, accounts[i].address);
            assert_eq!(tx.to, TxTarget::Address(accounts[i + 1].address));
            assert_eq!(tx.nonce, 0);
        }
    }

    #[test]
    fn test_same_pair_nonces_increase() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(2);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let shape = RoundShape::Transfers { count: 10, pattern: Pattern::Same, dispatch: Dispatch::Sequential };
        block_on(driver.run_round(&shape, None)).unwrap();

        let written = BatchTemplate::load(dir.path().join("10_same_transfers.json")).unwrap();
        let nonces: Vec<u64> = written.batches()[0].txs.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_insufficient_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(5);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let err = block_on(driver.run(BenchmarkKind::Transfers)).unwrap_err();
        assert!(matches!(
            err,
            BackendError::InsufficientAccounts { needed: 201, available: 5, .. }
        ));
        assert!(backend.context().current_batch().txs.is_empty());
    }

    #[test]
    fn test_concurrent_round_on_offline_runs_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(4);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let shape = RoundShape::Transfers { count: 3, pattern: Pattern::Distinct, dispatch: Dispatch::Concurrent };
        let report = block_on(driver.run_round(&shape, None)).unwrap();
        assert_eq!(report.stats.queued, 3);
    }

    #[test]
    fn test_token_setup_opens_bound_batch() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(3);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let handle = block_on(driver.prepare(BenchmarkKind::Erc20)).unwrap().unwrap();
        assert_eq!(handle.name, TOKEN_CONTRACT);

        let shape = RoundShape::TokenTransfers { count: 2, pattern: Pattern::Same };
        let report = block_on(driver.run_round(&shape, Some(&handle))).unwrap();
        assert_eq!(report.stats.queued, 2);

        let written = BatchTemplate::load(dir.path().join("gen-2_same_erc20_transfers.json")).unwrap();
        let [setup, round] = written.batches() else { panic!("expected two batches") };
        assert_eq!(setup.txs.len(), 1 + accounts.len());
        assert_eq!(setup.txs[0].to, TxTarget::Deploy);
        assert_eq!(round.genesis.contracts[0].contract_name, TOKEN_CONTRACT);
        assert_eq!(round.genesis.contracts[0].params_deploy.types.len(), 5);

        // Owner nonce continues after the deploy and three mints.
        let nonces: Vec<u64> = round.txs.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![4, 5]);
        assert_eq!(round.txs[0].function.as_deref(), Some("transfer"));
        assert_eq!(
            round.txs[0].params,
            Some(vec![json!(accounts[1].address.to_string()), json!(TOKEN_TRANSFER)])
        );
        let owner = round.genesis.accounts.iter().find(|a| a.address == accounts[0].address).unwrap();
        assert_eq!(owner.nonce, "4");

        assert!(backend.context().current_batch().txs.is_empty());
    }

    #[test]
    fn test_hash_round_requires_prepared_contract() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(1);
        let mut backend = offline(&accounts, dir.path());
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config(dir.path()));

        let err = block_on(driver.run_round(&RoundShape::Hashes { count: 1 }, None)).unwrap_err();
        assert!(err.is_unknown_reference());

        let reports = block_on(driver.run(BenchmarkKind::Sha256)).unwrap();
        let labels: Vec<&str> = reports.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["gen-SHA256_1", "gen-SHA256_10", "gen-SHA256_30"]);
        assert!(dir.path().join("gen-SHA256_30.json").exists());
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
    }

    async fn mock(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(rpc_result(result))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_lanes_against_live_node() {
        let server = MockServer::start().await;
        mock(&server, "eth_blockNumber", json!("0x1")).await;
        mock(&server, "eth_getTransactionCount", json!("0x0")).await;
        mock(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        mock(&server, "eth_sendRawTransaction", json!(B256::with_last_byte(1))).await;
        mock(
            &server,
            "eth_getTransactionReceipt",
            json!({
                "transactionHash": B256::with_last_byte(1),
                "blockNumber": "0x2",
                "gasUsed": "0x5208",
                "status": "0x1",
                "contractAddress": null
            }),
        )
        .await;
        let policy =
            ReceiptPolicy { timeout: Duration::from_millis(500), poll_interval: Duration::from_millis(10) };
        let mut backend = LiveBackend::connect(&server.uri(), 1337, policy).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(6);
        let config = BenchConfig { concurrency: 2, ..config(dir.path()) };
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config);

        let shape = RoundShape::Transfers { count: 5, pattern: Pattern::Distinct, dispatch: Dispatch::Concurrent };
        let report = driver.run_round(&shape, None).await.unwrap();
        assert_eq!(report.stats, OutcomeStats::new(5, 0, 0));
    }

    #[tokio::test]
    async fn test_node_errors_end_the_round_in_both_tiers() {
        let server = MockServer::start().await;
        mock(&server, "eth_blockNumber", json!("0x1")).await;
        mock(&server, "eth_getTransactionCount", json!("0x0")).await;
        mock(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendRawTransaction" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32000, "message": "nonce too low" }
            })))
            // One from the sequential round, one per lane in flight for the concurrent round.
            .expect(3)
            .mount(&server)
            .await;
        let policy =
            ReceiptPolicy { timeout: Duration::from_millis(500), poll_interval: Duration::from_millis(10) };
        let mut backend = LiveBackend::connect(&server.uri(), 1337, policy).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(6);
        let config = BenchConfig { concurrency: 2, ..config(dir.path()) };
        let mut driver = BenchmarkDriver::new(&mut backend, &accounts, config);

        for dispatch in [Dispatch::Sequential, Dispatch::Concurrent] {
            let shape = RoundShape::Transfers { count: 5, pattern: Pattern::Distinct, dispatch };
            let err = driver.run_round(&shape, None).await.unwrap_err();
            assert!(matches!(err, BackendError::Rpc(_)), "{dispatch:?}: {err}");
        }
        server.verify().await;
    }
}
