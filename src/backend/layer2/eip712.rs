//! zkSync era EIP-712 transactions (type `0x71`).
//!
//! The signature covers the EIP-712 hash of the `Transaction` struct under the
//! `zkSync` v2 domain. The wire encoding is the type byte followed by an RLP
//! list that carries the factory dependencies and the 65-byte signature.

use alloy_primitives::{address, Address, Bytes, Signature, B256, U256};
use alloy_rlp::{Encodable, Header};
use alloy_sol_types::{sol, Eip712Domain, SolStruct};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{BackendError, Result};

/// Transaction type byte.
pub const EIP712_TX_TYPE: u8 = 0x71;

/// Default gas limit per pubdata byte.
pub const DEFAULT_GAS_PER_PUBDATA: u64 = 50_000;

/// System contract that performs deployments.
pub const CONTRACT_DEPLOYER: Address = address!("0x0000000000000000000000000000000000008006");

mod typed {
    alloy_sol_types::sol! {
        struct Transaction {
            uint256 txType;
            uint256 from;
            uint256 to;
            uint256 gasLimit;
            uint256 gasPerPubdataByteLimit;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            uint256 paymaster;
            uint256 nonce;
            uint256 value;
            bytes data;
            bytes32[] factoryDeps;
            bytes paymasterInput;
        }
    }
}

sol! {
    /// Deployment entry point of the contract deployer system contract.
    interface ContractDeployer {
        function create(bytes32 salt, bytes32 bytecodeHash, bytes input) external payable returns (address);
    }
}

/// An unsigned EIP-712 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip712Transaction {
    /// Chain id.
    pub chain_id: u64,
    /// Sender nonce.
    pub nonce: u64,
    /// Sender.
    pub from: Address,
    /// Recipient or contract.
    pub to: Address,
    /// Gas limit, filled in after estimation.
    pub gas_limit: u64,
    /// Gas limit per pubdata byte.
    pub gas_per_pubdata: u64,
    /// Fee cap.
    pub max_fee_per_gas: u128,
    /// Priority fee.
    pub max_priority_fee_per_gas: u128,
    /// Attached value.
    pub value: U256,
    /// Calldata.
    pub data: Bytes,
    /// Bytecodes the transaction deploys.
    pub factory_deps: Vec<Bytes>,
}

impl Eip712Transaction {
    fn typed(&self) -> Result<typed::Transaction> {
        let factory_deps =
            self.factory_deps.iter().map(|dep| hash_bytecode(dep)).collect::<Result<Vec<_>>>()?;
        Ok(typed::Transaction {
            txType: U256::from(EIP712_TX_TYPE),
            from: address_word(self.from),
            to: address_word(self.to),
            gasLimit: U256::from(self.gas_limit),
            gasPerPubdataByteLimit: U256::from(self.gas_per_pubdata),
            maxFeePerGas: U256::from(self.max_fee_per_gas),
            maxPriorityFeePerGas: U256::from(self.max_priority_fee_per_gas),
            paymaster: U256::ZERO,
            nonce: U256::from(self.nonce),
            value: self.value,
            data: self.data.clone(),
            factoryDeps: factory_deps,
            paymasterInput: Bytes::new(),
        })
    }

    /// The `zkSync` v2 signing domain for this chain.
    pub fn domain(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some("zkSync".into()),
            Some("2".into()),
            Some(U256::from(self.chain_id)),
            None,
            None,
        )
    }

    /// EIP-712 digest to sign.
    pub fn signing_hash(&self) -> Result<B256> {
        Ok(self.typed()?.eip712_signing_hash(&self.domain()))
    }

    /// Encodes the signed transaction for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, signature: &Signature) -> Vec<u8> {
        let signature_bytes = Bytes::copy_from_slice(&signature.as_bytes());
        let r = signature.r();
        let s = signature.s();
        let y_parity = signature.v() as u8;
        let fields: [&dyn Encodable; 7] = [
            &self.nonce,
            &self.max_priority_fee_per_gas,
            &self.max_fee_per_gas,
            &self.gas_limit,
            &self.to,
            &self.value,
            &self.data,
        ];
        let tail: [&dyn Encodable; 7] = [
            &y_parity,
            &r,
            &s,
            &self.chain_id,
            &self.from,
            &self.gas_per_pubdata,
            &self.factory_deps,
        ];

        let mut payload = Vec::new();
        for field in fields.iter().chain(tail.iter()) {
            field.encode(&mut payload);
        }
        signature_bytes.encode(&mut payload);
        // No paymaster.
        Header { list: true, payload_length: 0 }.encode(&mut payload);

        let mut out = Vec::with_capacity(payload.len() + 8);
        out.push(EIP712_TX_TYPE);
        Header { list: true, payload_length: payload.len() }.encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// JSON request object for `eth_estimateGas`.
    pub fn to_request(&self) -> Value {
        let factory_deps: Vec<Vec<u8>> = self.factory_deps.iter().map(|dep| dep.to_vec()).collect();
        json!({
            "from": self.from,
            "to": self.to,
            "data": self.data,
            "value": self.value,
            "type": format!("{:#x}", EIP712_TX_TYPE),
            "maxFeePerGas": U256::from(self.max_fee_per_gas),
            "maxPriorityFeePerGas": U256::from(self.max_priority_fee_per_gas),
            "eip712Meta": {
                "gasPerPubdata": U256::from(self.gas_per_pubdata),
                "factoryDeps": factory_deps,
            },
        })
    }
}

fn address_word(address: Address) -> U256 {
    U256::from_be_slice(address.as_slice())
}

/// Versioned bytecode hash used by the contract deployer.
///
/// Bytecode must be a whole, odd number of 32-byte words below 2^16 words.
/// The hash is `sha256(bytecode)` with its first four bytes replaced by the
/// version (`0x01 0x00`) and the big-endian word count.
pub fn hash_bytecode(bytecode: &[u8]) -> Result<B256> {
    if bytecode.len() % 32 != 0 {
        return Err(BackendError::InvalidBytecode("length is not a multiple of 32 bytes"));
    }
    let words = u16::try_from(bytecode.len() / 32)
        .map_err(|_| BackendError::InvalidBytecode("bytecode is too long"))?;
    if words % 2 == 0 {
        return Err(BackendError::InvalidBytecode("word count must be odd"));
    }

    let mut hash: [u8; 32] = Sha256::digest(bytecode).into();
    hash[0] = 1;
    hash[1] = 0;
    hash[2..4].copy_from_slice(&words.to_be_bytes());
    Ok(B256::from(hash))
}
