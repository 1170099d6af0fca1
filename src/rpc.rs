//! Minimal JSON-RPC client for Ethereum-compatible nodes.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_primitives::{hex, Address, Bytes, B256, U128, U256, U64};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::{
    config::ReceiptPolicy,
    outcome::{Receipt, ReceiptStatus},
};

/// JSON-RPC failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional payload, e.g. revert data.
        data: Option<Value>,
    },

    /// The result did not have the expected shape.
    #[error("failed to decode {method} response: {source}")]
    Decode {
        /// Method that was called.
        method: String,
        /// Decode error.
        source: serde_json::Error,
    },
}

impl RpcError {
    /// Returns true if the node rejected the request because execution reverted.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Server { code, message, .. } => {
                *code == 3 || message.to_ascii_lowercase().contains("revert")
            }
            _ => false,
        }
    }
}

/// Block tag used for state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Latest mined block.
    Latest,
    /// Pending state, including mempool transactions.
    Pending,
    /// Latest block committed to L1 (Layer2 only).
    Committed,
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latest => "latest",
            Self::Pending => "pending",
            Self::Committed => "committed",
        })
    }
}

/// Transaction receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Block number.
    pub block_number: Option<U64>,
    /// Gas used by this transaction.
    pub gas_used: Option<U64>,
    /// `1` on success, `0` on revert.
    pub status: Option<U64>,
    /// Address of a created contract.
    pub contract_address: Option<Address>,
}

impl From<RpcReceipt> for Receipt {
    fn from(receipt: RpcReceipt) -> Self {
        // Pre-byzantium receipts carry no status field.
        let status = match receipt.status {
            Some(status) if status.is_zero() => ReceiptStatus::Reverted,
            _ => ReceiptStatus::Success,
        };
        Self {
            status,
            transaction_hash: Some(receipt.transaction_hash),
            block_number: receipt.block_number.map(|n| n.saturating_to()),
            gas_used: receipt.gas_used.map(|n| n.saturating_to()),
            contract_address: receipt.contract_address,
            return_value: None,
        }
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    data: Option<Value>,
}

/// HTTP JSON-RPC client.
#[derive(Debug)]
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Creates a client for `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .build()?;
        Ok(Self { client, url: url.into(), next_id: AtomicU64::new(1) })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issues a JSON-RPC request and decodes its result.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        trace!(method, id, "rpc request");

        let response: RpcResponse =
            self.client.post(&self.url).json(&body).send().await?.json().await?;

        if let Some(error) = response.error {
            return Err(RpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|source| RpcError::Decode { method: method.to_string(), source })
    }

    /// `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.saturating_to())
    }

    /// `eth_chainId`.
    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.saturating_to())
    }

    /// `eth_getBalance`.
    pub async fn balance(&self, address: Address, tag: BlockTag) -> Result<U256, RpcError> {
        self.request("eth_getBalance", json!([address, tag.to_string()])).await
    }

    /// `eth_getTransactionCount`.
    pub async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        let count: U64 =
            self.request("eth_getTransactionCount", json!([address, tag.to_string()])).await?;
        Ok(count.saturating_to())
    }

    /// `eth_gasPrice`.
    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        let price: U128 = self.request("eth_gasPrice", json!([])).await?;
        Ok(price.saturating_to())
    }

    /// `eth_estimateGas`.
    pub async fn estimate_gas(&self, request: &Value) -> Result<u64, RpcError> {
        let gas: U64 = self.request("eth_estimateGas", json!([request])).await?;
        Ok(gas.saturating_to())
    }

    /// `eth_call` against the latest block.
    pub async fn call(&self, request: &Value) -> Result<Bytes, RpcError> {
        self.request("eth_call", json!([request, BlockTag::Latest.to_string()])).await
    }

    /// `eth_sendRawTransaction`.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
        self.request("eth_sendRawTransaction", json!([hex::encode_prefixed(raw)])).await
    }

    /// `eth_getTransactionReceipt`. `None` while the transaction is pending.
    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, RpcError> {
        self.request("eth_getTransactionReceipt", json!([hash])).await
    }

    /// Polls for a receipt until it appears or the policy timeout elapses.
    pub async fn wait_for_receipt(
        &self,
        hash: B256,
        policy: &ReceiptPolicy,
    ) -> Result<Option<RpcReceipt>, RpcError> {
        let deadline = Instant::now() + policy.timeout;
        loop {
            if let Some(receipt) = self.transaction_receipt(hash).await? {
                return Ok(Some(receipt));
            }
            if Instant::now() + policy.poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Waits for inclusion and normalizes the result.
    ///
    /// A missing receipt after the timeout yields [`ReceiptStatus::TimedOut`];
    /// it is not retried.
    pub async fn await_inclusion(
        &self,
        hash: B256,
        policy: &ReceiptPolicy,
    ) -> Result<Receipt, RpcError> {
        match self.wait_for_receipt(hash, policy).await? {
            Some(receipt) => Ok(receipt.into()),
            None => {
                warn!(%hash, timeout = ?policy.timeout, "transaction not included before timeout");
                Ok(Receipt::timed_out(hash))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    async fn mock_result(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_block_number() {
        let server = MockServer::start().await;
        mock_result(&server, "eth_blockNumber", json!("0x10")).await;

        let client = RpcClient::new(server.uri()).unwrap();
        assert_eq!(client.block_number().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": 3, "message": "execution reverted", "data": "0x" }
            })))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri()).unwrap();
        let err = client.estimate_gas(&json!({})).await.unwrap_err();
        assert!(err.is_revert());
        assert!(matches!(err, RpcError::Server { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_wait_for_receipt_times_out() {
        let server = MockServer::start().await;
        mock_result(&server, "eth_getTransactionReceipt", Value::Null).await;

        let client = RpcClient::new(server.uri()).unwrap();
        let policy = ReceiptPolicy {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
        };
        let receipt = client.await_inclusion(B256::ZERO, &policy).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::TimedOut);
        assert_eq!(receipt.transaction_hash, Some(B256::ZERO));
    }

    #[tokio::test]
    async fn test_reverted_receipt() {
        let server = MockServer::start().await;
        mock_result(
            &server,
            "eth_getTransactionReceipt",
            json!({
                "transactionHash": B256::with_last_byte(1),
                "blockNumber": "0x5",
                "gasUsed": "0x5208",
                "status": "0x0",
                "contractAddress": null
            }),
        )
        .await;

        let client = RpcClient::new(server.uri()).unwrap();
        let receipt =
            client.await_inclusion(B256::with_last_byte(1), &ReceiptPolicy::LIVE).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert_eq!(receipt.block_number, Some(5));
        assert_eq!(receipt.gas_used, Some(21_000));
    }

    #[test]
    fn test_block_tag_display() {
        assert_eq!(BlockTag::Committed.to_string(), "committed");
        assert_eq!(BlockTag::Pending.to_string(), "pending");
    }
}
