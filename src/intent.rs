//! Backend-agnostic descriptions of the transactions a caller wants performed.

use std::path::PathBuf;

use alloy_primitives::{Address, U256};
use serde_json::Value;

use crate::{
    account::PrivateKey,
    compiler::SourceKind,
    contract::{ContractHandle, ContractLocation},
};

/// Native value transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferIntent {
    /// Sender key.
    pub from: PrivateKey,
    /// Receiver.
    pub to: Address,
    /// Amount in wei.
    pub amount: U256,
    /// Gas limit hint. Backends that estimate gas ignore it.
    pub gas: Option<u64>,
}

impl TransferIntent {
    /// Creates a transfer without a gas hint.
    pub fn new(from: PrivateKey, to: Address, amount: U256) -> Self {
        Self { from, to, amount, gas: None }
    }

    /// Sets the gas limit hint.
    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }
}

/// Contract deployment from source.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployIntent {
    /// Contract source file.
    pub source: PathBuf,
    /// Name of the contract within the source.
    pub contract_name: String,
    /// Deployer key.
    pub from: PrivateKey,
    /// Constructor arguments as JSON values.
    pub constructor_args: Vec<Value>,
    /// Source language.
    pub source_kind: SourceKind,
}

impl DeployIntent {
    /// Creates a deployment, inferring the source language from the extension.
    pub fn new(
        source: impl Into<PathBuf>,
        contract_name: impl Into<String>,
        from: PrivateKey,
        constructor_args: Vec<Value>,
    ) -> Self {
        let source = source.into();
        let source_kind = SourceKind::from_path(&source);
        Self { source, contract_name: contract_name.into(), from, constructor_args, source_kind }
    }
}

/// Contract function invocation.
#[derive(Debug, Clone)]
pub struct CallIntent<'a> {
    /// Caller key.
    pub from: PrivateKey,
    /// Handle returned by the deployment.
    pub contract: &'a ContractHandle,
    /// Address or symbolic name to call.
    pub target: ContractLocation,
    /// Function name.
    pub function: String,
    /// Function arguments as JSON values.
    pub args: Vec<Value>,
    /// Read-only call. Never submits a transaction.
    pub view: bool,
    /// Attached value in wei.
    pub amount: U256,
}

impl<'a> CallIntent<'a> {
    /// A state-mutating call to the handle's own location.
    pub fn transact(
        from: PrivateKey,
        contract: &'a ContractHandle,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            from,
            target: contract.location.clone(),
            contract,
            function: function.into(),
            args,
            view: false,
            amount: U256::ZERO,
        }
    }

    /// A read-only call to the handle's own location.
    pub fn view(
        from: PrivateKey,
        contract: &'a ContractHandle,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self { view: true, ..Self::transact(from, contract, function, args) }
    }
}

/// Any operation a backend can perform.
#[derive(Debug, Clone)]
pub enum TransactionIntent<'a> {
    /// Value transfer.
    Transfer(TransferIntent),
    /// Contract deployment.
    Deploy(DeployIntent),
    /// Contract call.
    Call(CallIntent<'a>),
}

impl TransactionIntent<'_> {
    /// The signing key of the operation.
    pub fn sender(&self) -> &PrivateKey {
        match self {
            Self::Transfer(intent) => &intent.from,
            Self::Deploy(intent) => &intent.from,
            Self::Call(intent) => &intent.from,
        }
    }
}

impl From<TransferIntent> for TransactionIntent<'_> {
    fn from(intent: TransferIntent) -> Self {
        Self::Transfer(intent)
    }
}

impl From<DeployIntent> for TransactionIntent<'_> {
    fn from(intent: DeployIntent) -> Self {
        Self::Deploy(intent)
    }
}

impl<'a> From<CallIntent<'a>> for TransactionIntent<'a> {
    fn from(intent: CallIntent<'a>) -> Self {
        Self::Call(intent)
    }
}
