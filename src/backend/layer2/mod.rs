//! Layer2 (zkSync era) backend.
//!
//! Every state-mutating operation follows the same path: build an unsigned
//! [`Eip712Transaction`], estimate gas with the typed request, sign the
//! EIP-712 digest, submit the typed encoding and poll for the receipt. A
//! revert during estimation becomes a failed receipt and nothing is sent.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use tracing::{debug, info, warn};

use super::{
    connect_rpc, pace_round, read_contract, target_address, BackendKind, ConcurrentSubmitter,
    Deployment, RoundWindow, TransactionBackend,
};
use crate::{
    abi::{encode_call, encode_constructor, lookup_function},
    account::{AccountRef, AccountResolver, PrivateKey},
    compiler::{Compiler, Toolchain},
    config::ReceiptPolicy,
    contract::{ContractBinding, ContractHandle},
    error::Result,
    intent::{CallIntent, DeployIntent, TransferIntent},
    outcome::{Receipt, TransactionOutcome},
    rpc::{BlockTag, RpcClient},
    signer::sign_hash,
};

pub mod eip712;

pub use eip712::{hash_bytecode, Eip712Transaction, CONTRACT_DEPLOYER, DEFAULT_GAS_PER_PUBDATA};

use eip712::ContractDeployer;

/// Priority fee for transfers and deployments.
pub const TRANSFER_PRIORITY_FEE: u128 = 100_000_000;

/// Priority fee for contract calls.
pub const CALL_PRIORITY_FEE: u128 = 1_000_000;

/// Parameters of one typed submission.
struct TypedCall {
    to: Address,
    value: U256,
    data: Bytes,
    factory_deps: Vec<Bytes>,
    nonce_tag: BlockTag,
    priority_fee: u128,
}

/// Backend for a zkSync era network.
#[derive(Debug)]
pub struct Layer2Backend {
    rpc: RpcClient,
    chain_id: u64,
    receipts: ReceiptPolicy,
    compiler: Compiler,
    accounts: AccountResolver,
}

impl Layer2Backend {
    /// Connects to `url`, failing with a connection error if the node does not answer.
    pub async fn connect(url: &str, chain_id: u64, receipts: ReceiptPolicy) -> Result<Self> {
        let (rpc, block) = connect_rpc(url).await?;
        info!(url, chain_id, block, "connected to layer2 network");
        Ok(Self {
            rpc,
            chain_id,
            receipts,
            compiler: Compiler::new(Toolchain::Zksolc),
            accounts: AccountResolver::deriving(),
        })
    }

    /// Replaces the contract compiler.
    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// The underlying RPC client.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn submit_typed(&self, key: &PrivateKey, call: TypedCall) -> Result<Receipt> {
        let from = key.address();
        let nonce = self.rpc.transaction_count(from, call.nonce_tag).await?;
        let max_fee_per_gas = self.rpc.gas_price().await?;

        let mut tx = Eip712Transaction {
            chain_id: self.chain_id,
            nonce,
            from,
            to: call.to,
            gas_limit: 0,
            gas_per_pubdata: DEFAULT_GAS_PER_PUBDATA,
            max_fee_per_gas,
            max_priority_fee_per_gas: call.priority_fee,
            value: call.value,
            data: call.data,
            factory_deps: call.factory_deps,
        };
        tx.gas_limit = match self.rpc.estimate_gas(&tx.to_request()).await {
            Ok(gas) => gas,
            Err(err) if err.is_revert() => {
                warn!(%from, to = %tx.to, error = %err, "gas estimation reverted, not submitting");
                return Ok(Receipt::reverted_preflight());
            }
            Err(err) => return Err(err.into()),
        };

        let signature = sign_hash(key, tx.signing_hash()?)?;
        let hash = self.rpc.send_raw_transaction(&tx.encode_signed(&signature)).await?;
        debug!(%from, nonce, gas_limit = tx.gas_limit, %hash, "typed transaction submitted");

        Ok(self.rpc.await_inclusion(hash, &self.receipts).await?)
    }

    /// Sends a transfer through a shared reference.
    pub async fn send_transfer(&self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        let call = TypedCall {
            to: intent.to,
            value: intent.amount,
            data: Bytes::new(),
            factory_deps: vec![],
            nonce_tag: BlockTag::Committed,
            priority_fee: TRANSFER_PRIORITY_FEE,
        };
        let receipt = self.submit_typed(&intent.from, call).await?;
        info!(to = %intent.to, status = %receipt.status, "transfer");
        Ok(receipt.into())
    }
}

impl TransactionBackend for Layer2Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Layer2
    }

    fn resolve_account(&self, account: AccountRef<'_>) -> Result<Address> {
        self.accounts.resolve(account)
    }

    fn register_account(&mut self, name: &str, address: Address) {
        self.accounts.register_name(name, address);
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.rpc.balance(address, BlockTag::Latest).await?)
    }

    async fn transfer(&mut self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        self.send_transfer(intent).await
    }

    async fn deploy(&mut self, intent: &DeployIntent) -> Result<Deployment> {
        let artifact = self
            .compiler
            .compile(&intent.source, &intent.contract_name, intent.source_kind)
            .await?;
        let constructor = encode_constructor(&artifact.abi, &intent.constructor_args)?;
        let data = ContractDeployer::createCall {
            salt: B256::ZERO,
            bytecodeHash: hash_bytecode(&artifact.bytecode)?,
            input: constructor.into(),
        }
        .abi_encode();

        let call = TypedCall {
            to: CONTRACT_DEPLOYER,
            value: U256::ZERO,
            data: data.into(),
            factory_deps: vec![artifact.bytecode.clone()],
            nonce_tag: BlockTag::Pending,
            priority_fee: TRANSFER_PRIORITY_FEE,
        };
        let receipt = self.submit_typed(&intent.from, call).await?;
        let handle = match receipt.contract_address {
            Some(address) if receipt.is_success() => Some(ContractHandle::deployed(artifact, address)),
            _ => None,
        };
        info!(
            contract = %intent.contract_name,
            status = %receipt.status,
            address = ?receipt.contract_address,
            "deployment"
        );
        Ok(Deployment { outcome: receipt.into(), handle })
    }

    async fn execute(&mut self, intent: &CallIntent<'_>) -> Result<TransactionOutcome> {
        let to = target_address(intent)?;
        if intent.view {
            return Ok(read_contract(&self.rpc, intent, intent.from.address(), to).await?.into());
        }

        let abi = intent.contract.abi()?;
        let function = lookup_function(abi, &intent.function, intent.args.len())?;
        let call = TypedCall {
            to,
            value: intent.amount,
            data: encode_call(function, &intent.args)?.into(),
            factory_deps: vec![],
            nonce_tag: BlockTag::Latest,
            priority_fee: CALL_PRIORITY_FEE,
        };
        let receipt = self.submit_typed(&intent.from, call).await?;
        info!(function = %intent.function, %to, status = %receipt.status, "call");
        Ok(receipt.into())
    }

    fn concurrent(&self) -> Option<ConcurrentSubmitter<'_>> {
        Some(ConcurrentSubmitter::Layer2(self))
    }

    async fn end_round(&mut self, window: &RoundWindow) -> Result<()> {
        pace_round(window).await;
        Ok(())
    }

    async fn settle_setup(&mut self, binding: &ContractBinding, grace: Duration) -> Result<()> {
        info!(contract = %binding.contract_name, wait_secs = grace.as_secs(), "waiting for setup to be mined");
        tokio::time::sleep(grace).await;
        Ok(())
    }
}
