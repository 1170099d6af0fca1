//! The transaction backend capability interface and its variants.
//!
//! Every backend speaks the same [`TransactionBackend`] contract; the
//! [`Backend`] enum closes over the three variants so drivers never branch on
//! backend identity.

use std::{fmt, time::Duration};

use alloy_primitives::{hex, Address, U256};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    abi::{decode_output, encode_call, lookup_function},
    account::AccountRef,
    contract::{ContractBinding, ContractHandle},
    error::{BackendError, Result},
    intent::{CallIntent, DeployIntent, TransactionIntent, TransferIntent},
    outcome::{Receipt, TransactionOutcome},
    rpc::RpcClient,
};

pub mod layer2;
pub mod live;
pub mod offline;

pub use layer2::Layer2Backend;
pub use live::LiveBackend;
pub use offline::{BatchContext, BatchTemplate, NonceState, OfflineBackend};

/// Backend variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Ethereum-compatible JSON-RPC network.
    Live,
    /// Layer2 network with typed-transaction signing.
    Layer2,
    /// Offline batch file generator.
    Offline,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Layer2 => "layer2",
            Self::Offline => "offline",
        })
    }
}

/// Result of a deployment: the outcome plus a handle when a contract exists.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Outcome of the deploy transaction.
    pub outcome: TransactionOutcome,
    /// Handle for later calls. `None` if the deployment reverted or timed out.
    pub handle: Option<ContractHandle>,
}

impl Deployment {
    /// Returns the handle or fails with [`BackendError::DeploymentFailed`].
    pub fn into_handle(self, contract: &str) -> Result<ContractHandle> {
        let outcome = self.outcome;
        self.handle.ok_or_else(|| BackendError::DeploymentFailed {
            contract: contract.to_string(),
            outcome: outcome.to_string(),
        })
    }
}

/// What [`TransactionBackend::submit`] produced.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Transfer or call outcome.
    Outcome(TransactionOutcome),
    /// Deployment outcome and handle.
    Deployed(Deployment),
}

impl Submission {
    /// The transaction outcome.
    pub fn outcome(&self) -> &TransactionOutcome {
        match self {
            Self::Outcome(outcome) => outcome,
            Self::Deployed(deployment) => &deployment.outcome,
        }
    }
}

/// Timing of a finished benchmark round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundWindow {
    /// Round label, also used as the offline output file stem.
    pub label: String,
    /// Time spent submitting the round.
    pub elapsed: Duration,
    /// Configured round length.
    pub timeout: Duration,
}

impl RoundWindow {
    /// Time left in the window. Zero if the round overran.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed)
    }
}

/// Capability contract shared by every backend variant.
///
/// Operations return exactly one [`TransactionOutcome`] variant consistent
/// with the backend: receipts for live networks, queued records for the
/// offline generator. Transaction-level failures are outcomes, never errors.
#[allow(async_fn_in_trait)]
pub trait TransactionBackend {
    /// Variant tag.
    fn kind(&self) -> BackendKind;

    /// Derives or looks up the address for a key or registered name.
    fn resolve_account(&self, account: AccountRef<'_>) -> Result<Address>;

    /// Registers a symbolic account name.
    fn register_account(&mut self, name: &str, address: Address);

    /// Native balance of `address`. The offline backend returns
    /// [`BackendError::Unsupported`].
    async fn balance(&self, address: Address) -> Result<U256>;

    /// Native value transfer.
    async fn transfer(&mut self, intent: &TransferIntent) -> Result<TransactionOutcome>;

    /// Compiles (live backends) and deploys a contract.
    async fn deploy(&mut self, intent: &DeployIntent) -> Result<Deployment>;

    /// Calls a contract function. View calls never consume a nonce.
    async fn execute(&mut self, intent: &CallIntent<'_>) -> Result<TransactionOutcome>;

    /// Performs any intent.
    async fn submit(&mut self, intent: &TransactionIntent<'_>) -> Result<Submission> {
        Ok(match intent {
            TransactionIntent::Transfer(transfer) => Submission::Outcome(self.transfer(transfer).await?),
            TransactionIntent::Deploy(deploy) => Submission::Deployed(self.deploy(deploy).await?),
            TransactionIntent::Call(call) => Submission::Outcome(self.execute(call).await?),
        })
    }

    /// Shared-reference submitter for concurrent dispatch.
    ///
    /// `None` for backends whose state must not be mutated concurrently.
    fn concurrent(&self) -> Option<ConcurrentSubmitter<'_>> {
        None
    }

    /// Called before a benchmark round starts submitting.
    async fn begin_round(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after a round: live backends pace to the window, the offline
    /// backend persists and resets its batch state.
    async fn end_round(&mut self, window: &RoundWindow) -> Result<()>;

    /// Called once a workload's setup transactions (deploy, mint) are queued.
    async fn settle_setup(&mut self, binding: &ContractBinding, grace: Duration) -> Result<()>;

    /// Called after the last step of a script replay. Networked backends have
    /// nothing left to do; the offline backend writes its batch file.
    async fn finish_replay(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Submits transfers through a shared reference, so many can be in flight.
#[derive(Debug, Clone, Copy)]
pub enum ConcurrentSubmitter<'a> {
    /// Live network.
    Live(&'a LiveBackend),
    /// Layer2 network.
    Layer2(&'a Layer2Backend),
}

impl ConcurrentSubmitter<'_> {
    /// Sends one transfer and waits for inclusion.
    pub async fn transfer(self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        match self {
            Self::Live(backend) => backend.send_transfer(intent).await,
            Self::Layer2(backend) => backend.send_transfer(intent).await,
        }
    }
}

/// A backend selected at runtime.
#[derive(Debug)]
pub enum Backend {
    /// Ethereum-compatible JSON-RPC network.
    Live(LiveBackend),
    /// Layer2 network.
    Layer2(Layer2Backend),
    /// Offline batch generator.
    Offline(OfflineBackend),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $body:expr) => {
        match $self {
            Backend::Live($backend) => $body,
            Backend::Layer2($backend) => $body,
            Backend::Offline($backend) => $body,
        }
    };
}

impl TransactionBackend for Backend {
    fn kind(&self) -> BackendKind {
        dispatch!(self, backend => backend.kind())
    }

    fn resolve_account(&self, account: AccountRef<'_>) -> Result<Address> {
        dispatch!(self, backend => backend.resolve_account(account))
    }

    fn register_account(&mut self, name: &str, address: Address) {
        dispatch!(self, backend => backend.register_account(name, address))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        dispatch!(self, backend => backend.balance(address).await)
    }

    async fn transfer(&mut self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        dispatch!(self, backend => backend.transfer(intent).await)
    }

    async fn deploy(&mut self, intent: &DeployIntent) -> Result<Deployment> {
        dispatch!(self, backend => backend.deploy(intent).await)
    }

    async fn execute(&mut self, intent: &CallIntent<'_>) -> Result<TransactionOutcome> {
        dispatch!(self, backend => backend.execute(intent).await)
    }

    fn concurrent(&self) -> Option<ConcurrentSubmitter<'_>> {
        dispatch!(self, backend => backend.concurrent())
    }

    async fn begin_round(&mut self) -> Result<()> {
        dispatch!(self, backend => backend.begin_round().await)
    }

    async fn end_round(&mut self, window: &RoundWindow) -> Result<()> {
        dispatch!(self, backend => backend.end_round(window).await)
    }

    async fn settle_setup(&mut self, binding: &ContractBinding, grace: Duration) -> Result<()> {
        dispatch!(self, backend => backend.settle_setup(binding, grace).await)
    }

    async fn finish_replay(&mut self) -> Result<()> {
        dispatch!(self, backend => backend.finish_replay().await)
    }
}

impl From<LiveBackend> for Backend {
    fn from(backend: LiveBackend) -> Self {
        Self::Live(backend)
    }
}

impl From<Layer2Backend> for Backend {
    fn from(backend: Layer2Backend) -> Self {
        Self::Layer2(backend)
    }
}

impl From<OfflineBackend> for Backend {
    fn from(backend: OfflineBackend) -> Self {
        Self::Offline(backend)
    }
}

/// Probes a node so construction fails fast on an unreachable endpoint.
pub(crate) async fn connect_rpc(url: &str) -> Result<(RpcClient, u64)> {
    let connection_error = |source| BackendError::Connection { url: url.to_string(), source };
    let rpc = RpcClient::new(url).map_err(connection_error)?;
    let block = rpc.block_number().await.map_err(connection_error)?;
    Ok((rpc, block))
}

/// Performs a read-only `eth_call` and decodes its result.
///
/// A revert is reported as a failed receipt. No transaction is sent.
pub(crate) async fn read_contract(
    rpc: &RpcClient,
    intent: &CallIntent<'_>,
    from: Address,
    to: Address,
) -> Result<Receipt> {
    let abi = intent.contract.abi()?;
    let function = lookup_function(abi, &intent.function, intent.args.len())?;
    let data = encode_call(function, &intent.args)?;
    let request = json!({
        "from": from,
        "to": to,
        "data": hex::encode_prefixed(&data),
    });
    match rpc.call(&request).await {
        Ok(output) => Ok(Receipt::view(decode_output(function, &output)?)),
        Err(err) if err.is_revert() => {
            warn!(function = %intent.function, %to, error = %err, "view call reverted");
            Ok(Receipt::reverted_preflight())
        }
        Err(err) => Err(err.into()),
    }
}

/// Sleeps for what is left of a round window.
pub(crate) async fn pace_round(window: &RoundWindow) {
    let remaining = window.remaining();
    info!(
        round = %window.label,
        elapsed_secs = format!("{:.2}", window.elapsed.as_secs_f64()),
        wait_secs = format!("{:.2}", remaining.as_secs_f64()),
        "round submitted, waiting out the window"
    );
    tokio::time::sleep(remaining).await;
}

/// Resolves a call target to a concrete address.
pub(crate) fn target_address(intent: &CallIntent<'_>) -> Result<Address> {
    intent.target.address().ok_or_else(|| {
        BackendError::UnknownReference(format!("contract `{}` has no on-chain address", intent.target))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_saturates() {
        let window = RoundWindow {
            label: "1_same_transfers".into(),
            elapsed: Duration::from_secs(200),
            timeout: Duration::from_secs(180),
        };
        assert_eq!(window.remaining(), Duration::ZERO);

        let window = RoundWindow { elapsed: Duration::from_secs(30), ..window };
        assert_eq!(window.remaining(), Duration::from_secs(150));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(BackendKind::Live.to_string(), "live");
        assert_eq!(BackendKind::Layer2.to_string(), "layer2");
        assert_eq!(BackendKind::Offline.to_string(), "offline");
    }

    #[test]
    fn test_failed_deployment_into_handle() {
        let deployment =
            Deployment { outcome: Receipt::reverted_preflight().into(), handle: None };
        let err = deployment.into_handle("Greeter").unwrap_err();
        assert!(matches!(err, BackendError::DeploymentFailed { ref contract, .. } if contract == "Greeter"));
    }
}
