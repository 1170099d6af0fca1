//! Ethereum-compatible JSON-RPC backend.
//!
//! Transactions are EIP-155 legacy transactions priced with `eth_gasPrice`.
//! The nonce is fetched from the pending block before every submission, so
//! there is no local nonce cache.

use std::time::Duration;

use alloy_consensus::TxLegacy;
use alloy_primitives::{hex, Address, Bytes, TxKind, U256};
use serde_json::json;
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
    signer::{encode_legacy, sign_legacy},
};

/// Gas limit for transfers without a hint.
pub const DEFAULT_TRANSFER_GAS: u64 = 500_000;

/// Gas limit for state-mutating contract calls.
pub const CALL_GAS: u64 = 500_000;

/// Backend for a live Ethereum-style network.
#[derive(Debug)]
pub struct LiveBackend {
    rpc: RpcClient,
    chain_id: u64,
    receipts: ReceiptPolicy,
    compiler: Compiler,
    accounts: AccountResolver,
}

impl LiveBackend {
    /// Connects to `url`, failing with [`BackendError::Connection`] if the
    /// node does not answer.
    ///
    /// [`BackendError::Connection`]: crate::BackendError::Connection
    pub async fn connect(url: &str, chain_id: u64, receipts: ReceiptPolicy) -> Result<Self> {
        let (rpc, block) = connect_rpc(url).await?;
        info!(url, chain_id, block, "connected to live network");
        Ok(Self {
            rpc,
            chain_id,
            receipts,
            compiler: Compiler::new(Toolchain::Solc),
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

    /// Signs and submits a legacy transaction, then waits for inclusion.
    async fn send_legacy(
        &self,
        key: &PrivateKey,
        to: TxKind,
        value: U256,
        input: Bytes,
        gas_limit: u64,
    ) -> Result<Receipt> {
        let from = key.address();
        let nonce = self.rpc.transaction_count(from, BlockTag::Pending).await?;
        let gas_price = self.rpc.gas_price().await?;

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            input,
        };
        let raw = encode_legacy(sign_legacy(key, tx)?);
        let hash = self.rpc.send_raw_transaction(&raw).await?;
        debug!(%from, nonce, %hash, "transaction submitted");

        Ok(self.rpc.await_inclusion(hash, &self.receipts).await?)
    }

    /// Sends a transfer through a shared reference.
    pub async fn send_transfer(&self, intent: &TransferIntent) -> Result<TransactionOutcome> {
        let gas = intent.gas.unwrap_or(DEFAULT_TRANSFER_GAS);
        let receipt = self
            .send_legacy(&intent.from, TxKind::Call(intent.to), intent.amount, Bytes::new(), gas)
            .await?;
        info!(to = %intent.to, status = %receipt.status, "transfer");
        Ok(receipt.into())
    }
}

impl TransactionBackend for LiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Live
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
        let mut input = artifact.bytecode.to_vec();
        input.extend(encode_constructor(&artifact.abi, &intent.constructor_args)?);

        let from = intent.from.address();
        let request = json!({ "from": from, "data": hex::encode_prefixed(&input) });
        let gas = match self.rpc.estimate_gas(&request).await {
            Ok(gas) => gas,
            Err(err) if err.is_revert() => {
                warn!(contract = %intent.contract_name, error = %err, "deployment reverted during estimation");
                return Ok(Deployment { outcome: Receipt::reverted_preflight().into(), handle: None });
            }
            Err(err) => return Err(err.into()),
        };

        let receipt =
            self.send_legacy(&intent.from, TxKind::Create, U256::ZERO, input.into(), gas).await?;
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
        let data = encode_call(function, &intent.args)?;
        let receipt =
            self.send_legacy(&intent.from, TxKind::Call(to), intent.amount, data.into(), CALL_GAS).await?;
        info!(function = %intent.function, %to, status = %receipt.status, "call");
        Ok(receipt.into())
    }

    fn concurrent(&self) -> Option<ConcurrentSubmitter<'_>> {
        Some(ConcurrentSubmitter::Live(self))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompiledContract, contract::ContractLocation, outcome::ReceiptStatus,
        BackendError,
    };
    use alloy_consensus::{Signed, TxEnvelope};
    use alloy_eips::eip2718::Decodable2718;
    use alloy_json_abi::JsonAbi;
    use alloy_primitives::B256;
    use serde_json::Value;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

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

    async fn connected(server: &MockServer) -> LiveBackend {
        mock(server, "eth_blockNumber", json!("0x1")).await;
        let policy =
            ReceiptPolicy { timeout: Duration::from_millis(500), poll_interval: Duration::from_millis(10) };
        LiveBackend::connect(&server.uri(), 1337, policy).await.unwrap()
    }

    fn greeter() -> ContractHandle {
        let abi = JsonAbi::parse([
            "function greet() view returns (uint256)",
            "function setGreeting(uint256 value)",
        ])
        .unwrap();
        let artifact = CompiledContract {
            name: "Greeter".into(),
            bytecode: Bytes::from_static(&[0x60, 0x00]),
            abi,
            storage_layout: None,
        };
        ContractHandle::deployed(artifact, Address::with_last_byte(0x42))
    }

    #[tokio::test]
    async fn test_connection_failure() {
        // Nothing listens on port 9 (discard) in the test environment.
        let err = LiveBackend::connect("http://127.0.0.1:9", 1337, ReceiptPolicy::LIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_view_call_sends_no_transaction() {
        let server = MockServer::start().await;
        let mut backend = connected(&server).await;
        mock(&server, "eth_call", json!(format!("0x{}", "00".repeat(31) + "07"))).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getTransactionCount" })))
            .respond_with(rpc_result(json!("0x0")))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendRawTransaction" })))
            .respond_with(rpc_result(json!(B256::ZERO)))
            .expect(0)
            .mount(&server)
            .await;

        let handle = greeter();
        let call = CallIntent::view(PrivateKey::from_seed(1), &handle, "greet", vec![]);
        let outcome = backend.execute(&call).await.unwrap();

        let receipt = outcome.receipt().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert!(receipt.transaction_hash.is_none());
        assert_eq!(receipt.return_value.as_ref().unwrap().len(), 1);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_reverted_transfers_are_counted_not_raised() {
        let server = MockServer::start().await;
        let mut backend = connected(&server).await;
        mock(&server, "eth_getTransactionCount", json!("0x3")).await;
        mock(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        mock(&server, "eth_sendRawTransaction", json!(B256::with_last_byte(1))).await;
        mock(
            &server,
            "eth_getTransactionReceipt",
            json!({
                "transactionHash": B256::with_last_byte(1),
                "blockNumber": "0x2",
                "gasUsed": "0x5208",
                "status": "0x0",
                "contractAddress": null
            }),
        )
        .await;

        let mut stats = crate::OutcomeStats::default();
        for _ in 0..2 {
            let intent = TransferIntent::new(
                PrivateKey::from_seed(2),
                Address::with_last_byte(1),
                U256::from(1),
            );
            stats.record(&backend.transfer(&intent).await.unwrap());
        }
        assert_eq!(stats, crate::OutcomeStats::new(0, 2, 0));
    }

    #[tokio::test]
    async fn test_symbolic_target_is_rejected() {
        let server = MockServer::start().await;
        let mut backend = connected(&server).await;
        let mut handle = greeter();
        handle.location = ContractLocation::Symbolic("Greeter".into());

        let call = CallIntent::transact(PrivateKey::from_seed(3), &handle, "setGreeting", vec![json!(1)]);
        let err = backend.execute(&call).await.unwrap_err();
        assert!(err.is_unknown_reference());
    }

    /// Raw transactions submitted to the node, decoded as legacy transactions.
    async fn sent_legacy(server: &MockServer) -> Vec<Signed<TxLegacy>> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|request| serde_json::from_slice::<Value>(&request.body).ok())
            .filter(|body| body["method"] == "eth_sendRawTransaction")
            .map(|body| {
                let raw: Bytes = body["params"][0].as_str().unwrap().parse().unwrap();
                let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap();
                envelope.as_legacy().unwrap().clone()
            })
            .collect()
    }

    async fn expect_nonce(server: &MockServer, key: &PrivateKey, tag: &str, nonce: u64) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_getTransactionCount",
                "params": [key.address(), tag]
            })))
            .respond_with(rpc_result(json!(format!("{nonce:#x}"))))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mined(server: &MockServer, hash: B256, contract_address: Option<Address>) {
        mock(server, "eth_sendRawTransaction", json!(hash)).await;
        mock(
            server,
            "eth_getTransactionReceipt",
            json!({
                "transactionHash": hash,
                "blockNumber": "0x7",
                "gasUsed": "0x1000",
                "status": "0x1",
                "contractAddress": contract_address
            }),
        )
        .await;
    }

    #[cfg(unix)]
    fn scripted_greeter(dir: &std::path::Path) -> (Compiler, std::path::PathBuf) {
        let source = dir.join("Greeter.sol");
        std::fs::write(&source, "contract Greeter { constructor(uint256 value) {} }").unwrap();
        let output = json!({
            "contracts": { "Contract": { "Greeter": {
                "abi": [{
                    "type": "constructor",
                    "inputs": [{ "name": "value", "type": "uint256" }],
                    "stateMutability": "nonpayable"
                }],
                "evm": { "bytecode": { "object": "6080" } }
            } } }
        });
        let compiler = crate::compiler::testing::scripted(dir, Toolchain::Solc, &output.to_string());
        (compiler, source)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deploy_creates_contract_from_compiled_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, source) = scripted_greeter(dir.path());
        let server = MockServer::start().await;
        let mut backend = connected(&server).await.with_compiler(compiler);
        let key = PrivateKey::from_seed(4);
        let deployed_at = Address::with_last_byte(0x42);

        expect_nonce(&server, &key, "pending", 5).await;
        mock(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        mock(&server, "eth_estimateGas", json!("0x30d40")).await;
        mined(&server, B256::with_last_byte(3), Some(deployed_at)).await;

        let intent = DeployIntent::new(source, "Greeter", key, vec![json!(10)]);
        let deployment = backend.deploy(&intent).await.unwrap();

        assert!(deployment.outcome.is_success());
        let handle = deployment.handle.unwrap();
        assert_eq!(handle.location.address(), Some(deployed_at));
        assert!(handle.artifact.is_some());

        let sent = sent_legacy(&server).await;
        assert_eq!(sent.len(), 1);
        let tx = sent[0].tx();
        assert_eq!(tx.nonce, 5);
        assert_eq!(tx.to, TxKind::Create);
        assert_eq!(tx.gas_limit, 200_000);
        // Creation code followed by the encoded constructor argument.
        assert_eq!(tx.input.len(), 2 + 32);
        assert_eq!(&tx.input[..2], &[0x60, 0x80]);
        assert_eq!(tx.input[33], 10);
        server.verify().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deploy_reverting_estimate_is_a_failed_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, source) = scripted_greeter(dir.path());
        let server = MockServer::start().await;
        let mut backend = connected(&server).await.with_compiler(compiler);

        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": 3, "message": "execution reverted" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendRawTransaction" })))
            .respond_with(rpc_result(json!(B256::ZERO)))
            .expect(0)
            .mount(&server)
            .await;

        let intent = DeployIntent::new(source, "Greeter", PrivateKey::from_seed(4), vec![json!(10)]);
        let deployment = backend.deploy(&intent).await.unwrap();

        assert_eq!(deployment.outcome.status(), Some(ReceiptStatus::Reverted));
        assert!(deployment.handle.is_none());
        assert!(deployment.into_handle("Greeter").is_err());
        server.verify().await;
    }

    #[tokio::test]
    async fn test_state_changing_call_sends_transaction() {
        let server = MockServer::start().await;
        let mut backend = connected(&server).await;
        let key = PrivateKey::from_seed(5);

        expect_nonce(&server, &key, "pending", 2).await;
        mock(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        mined(&server, B256::with_last_byte(4), None).await;

        let handle = greeter();
        let call = CallIntent::transact(key, &handle, "setGreeting", vec![json!(7)]);
        let outcome = backend.execute(&call).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.receipt().unwrap().transaction_hash, Some(B256::with_last_byte(4)));

        let sent = sent_legacy(&server).await;
        assert_eq!(sent.len(), 1);
        let tx = sent[0].tx();
        assert_eq!(tx.nonce, 2);
        assert_eq!(tx.to, TxKind::Call(Address::with_last_byte(0x42)));
        assert_eq!(tx.gas_limit, CALL_GAS);
        let selector = handle.abi().unwrap().function("setGreeting").unwrap()[0].selector();
        assert_eq!(&tx.input[..4], selector.as_slice());
        assert_eq!(tx.input[35], 7);
        server.verify().await;
    }
}
