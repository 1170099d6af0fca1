//! Contract handles and deployment metadata.

use std::fmt;

use alloy_json_abi::JsonAbi;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{abi::AbiError, compiler::CompiledContract};

/// Where a deployed contract lives.
///
/// Live backends know the concrete address once the deployment is included.
/// The offline backend only knows the contract's symbolic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractLocation {
    /// On-chain address.
    Address(Address),
    /// Symbolic contract name, resolved by out-of-band execution.
    Symbolic(String),
}

impl ContractLocation {
    /// The concrete address, if known.
    pub fn address(&self) -> Option<Address> {
        match self {
            Self::Address(address) => Some(*address),
            Self::Symbolic(_) => None,
        }
    }
}

impl fmt::Display for ContractLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Symbolic(name) => write!(f, "{name}"),
        }
    }
}

/// A deployed (or queued) contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractHandle {
    /// Contract name.
    pub name: String,
    /// Compiled artifact. Absent for offline deployments, which are never compiled.
    pub artifact: Option<CompiledContract>,
    /// Deployed location.
    pub location: ContractLocation,
}

impl ContractHandle {
    /// Creates a handle for a compiled contract deployed at `address`.
    pub fn deployed(artifact: CompiledContract, address: Address) -> Self {
        Self {
            name: artifact.name.clone(),
            artifact: Some(artifact),
            location: ContractLocation::Address(address),
        }
    }

    /// Creates a handle known only by name.
    pub fn symbolic(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { location: ContractLocation::Symbolic(name.clone()), name, artifact: None }
    }

    /// The contract ABI.
    pub fn abi(&self) -> Result<&JsonAbi, AbiError> {
        self.artifact
            .as_ref()
            .map(|artifact| &artifact.abi)
            .ok_or_else(|| AbiError::MissingArtifact(self.name.clone()))
    }

    /// The compiler-emitted storage layout, if any.
    pub fn storage_layout(&self) -> Option<&Value> {
        self.artifact.as_ref().and_then(|artifact| artifact.storage_layout.as_ref())
    }
}

/// Constructor parameters recorded in an offline batch genesis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployParams {
    /// Solidity type names.
    pub types: Vec<String>,
    /// Argument values.
    pub values: Vec<Value>,
}

impl DeployParams {
    /// Pairs types with values.
    pub fn new(types: impl IntoIterator<Item = impl Into<String>>, values: Vec<Value>) -> Self {
        Self { types: types.into_iter().map(Into::into).collect(), values }
    }
}

/// The contract a benchmark round operates on.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractBinding {
    /// Contract name.
    pub contract_name: String,
    /// Constructor parameters.
    pub params: DeployParams,
}

impl ContractBinding {
    /// Creates a binding.
    pub fn new(contract_name: impl Into<String>, params: DeployParams) -> Self {
        Self { contract_name: contract_name.into(), params }
    }
}
