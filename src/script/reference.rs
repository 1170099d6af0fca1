//! Typed references into the script state.
//!
//! A reference is a bracket path such as `["contracts"]["Greeter"]["address"]`,
//! optionally prefixed with `data`. Only the shapes below are accepted; a
//! well-formed reference to something not yet produced resolves to
//! [`BackendError::UnknownReference`].

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use alloy_primitives::Address;
use serde_json::Value;

use super::ScriptError;
use crate::{
    account::PrivateKey,
    contract::{ContractHandle, ContractLocation},
    error::BackendError,
};

/// A resolved reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `["accounts"]["pv"][name]`
    AccountKey(String),
    /// `["accounts"]["address"][name]`
    AccountAddress(String),
    /// `["contracts"][name]["path"]`
    ContractPath(String),
    /// `["contracts"][name]["address"]`
    ContractAddress(String),
    /// `["contracts"][name]["instance"]`
    ContractInstance(String),
    /// `["contracts"][name]["storage_layout"]`
    ContractStorageLayout(String),
}

/// Returns true if an argument string should be resolved as a reference.
pub fn is_reference(value: &str) -> bool {
    value.starts_with("data[")
}

impl FromStr for Reference {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ScriptError::MalformedReference(s.to_string());
        let trimmed = s.trim();
        let mut rest = trimmed.strip_prefix("data").unwrap_or(trimmed);

        let mut segments = Vec::new();
        while !rest.is_empty() {
            let inner = rest.strip_prefix('[').ok_or_else(malformed)?;
            let quote = inner.chars().next().filter(|c| *c == '"' || *c == '\'').ok_or_else(malformed)?;
            let inner = &inner[1..];
            let end = inner.find(quote).ok_or_else(malformed)?;
            segments.push(&inner[..end]);
            rest = inner[end + 1..].strip_prefix(']').ok_or_else(malformed)?;
        }

        let reference = match segments.as_slice() {
            ["accounts", "pv", name] => Self::AccountKey(name.to_string()),
            ["accounts", "address", name] => Self::AccountAddress(name.to_string()),
            ["contracts", name, "path"] => Self::ContractPath(name.to_string()),
            ["contracts", name, "address"] => Self::ContractAddress(name.to_string()),
            ["contracts", name, "instance"] => Self::ContractInstance(name.to_string()),
            ["contracts", name, "storage_layout"] => Self::ContractStorageLayout(name.to_string()),
            _ => return Err(malformed()),
        };
        Ok(reference)
    }
}

impl TryFrom<String> for Reference {
    type Error = ScriptError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountKey(name) => write!(f, r#"["accounts"]["pv"]["{name}"]"#),
            Self::AccountAddress(name) => write!(f, r#"["accounts"]["address"]["{name}"]"#),
            Self::ContractPath(name) => write!(f, r#"["contracts"]["{name}"]["path"]"#),
            Self::ContractAddress(name) => write!(f, r#"["contracts"]["{name}"]["address"]"#),
            Self::ContractInstance(name) => write!(f, r#"["contracts"]["{name}"]["instance"]"#),
            Self::ContractStorageLayout(name) => {
                write!(f, r#"["contracts"]["{name}"]["storage_layout"]"#)
            }
        }
    }
}

/// A contract declared by the script.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractEntry {
    /// Source path.
    pub path: PathBuf,
    /// Handle, once deployed.
    pub handle: Option<ContractHandle>,
}

/// Accumulated symbol table of a script run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptState {
    pub(super) keys: BTreeMap<String, PrivateKey>,
    pub(super) addresses: BTreeMap<String, Address>,
    pub(super) contracts: BTreeMap<String, ContractEntry>,
}

fn unknown(reference: &Reference) -> ScriptError {
    BackendError::UnknownReference(reference.to_string()).into()
}

fn wrong_kind(reference: &Reference, expected: &'static str) -> ScriptError {
    ScriptError::ReferenceKind { reference: reference.to_string(), expected }
}

impl ScriptState {
    /// Declares a named account key.
    pub fn insert_key(&mut self, name: impl Into<String>, key: PrivateKey) {
        self.keys.insert(name.into(), key);
    }

    /// Records a resolved account address.
    pub fn insert_address(&mut self, name: impl Into<String>, address: Address) {
        self.addresses.insert(name.into(), address);
    }

    /// Declares a contract source.
    pub fn insert_contract(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.contracts.insert(name.into(), ContractEntry { path: path.into(), handle: None });
    }

    /// Named keys in name order.
    pub fn keys(&self) -> impl Iterator<Item = (&str, &PrivateKey)> {
        self.keys.iter().map(|(name, key)| (name.as_str(), key))
    }

    /// Resolved address for an account name.
    pub fn account_address(&self, name: &str) -> Option<Address> {
        self.addresses.get(name).copied()
    }

    /// Declared contract.
    pub fn contract(&self, name: &str) -> Option<&ContractEntry> {
        self.contracts.get(name)
    }

    /// Stores the handle of a completed deployment.
    pub fn record_deployment(&mut self, name: &str, handle: ContractHandle) -> Result<(), ScriptError> {
        let entry = self
            .contracts
            .get_mut(name)
            .ok_or_else(|| unknown(&Reference::ContractPath(name.to_string())))?;
        entry.handle = Some(handle);
        Ok(())
    }

    fn deployed(&self, reference: &Reference, name: &str) -> Result<&ContractHandle, ScriptError> {
        self.contracts
            .get(name)
            .and_then(|entry| entry.handle.as_ref())
            .ok_or_else(|| unknown(reference))
    }

    /// Resolves a private key reference.
    pub fn key(&self, reference: &Reference) -> Result<&PrivateKey, ScriptError> {
        match reference {
            Reference::AccountKey(name) => self.keys.get(name).ok_or_else(|| unknown(reference)),
            _ => Err(wrong_kind(reference, "a private key")),
        }
    }

    /// Resolves an address reference.
    pub fn address(&self, reference: &Reference) -> Result<Address, ScriptError> {
        match reference {
            Reference::AccountAddress(name) => {
                self.addresses.get(name).copied().ok_or_else(|| unknown(reference))
            }
            Reference::ContractAddress(name) => self
                .deployed(reference, name)?
                .location
                .address()
                .ok_or_else(|| wrong_kind(reference, "an on-chain address")),
            _ => Err(wrong_kind(reference, "an address")),
        }
    }

    /// Resolves a contract location reference.
    pub fn location(&self, reference: &Reference) -> Result<ContractLocation, ScriptError> {
        match reference {
            Reference::ContractAddress(name) => Ok(self.deployed(reference, name)?.location.clone()),
            _ => Err(wrong_kind(reference, "a contract address")),
        }
    }

    /// Resolves a contract instance reference.
    pub fn handle(&self, reference: &Reference) -> Result<&ContractHandle, ScriptError> {
        match reference {
            Reference::ContractInstance(name) => self.deployed(reference, name),
            _ => Err(wrong_kind(reference, "a contract instance")),
        }
    }

    /// Resolves a reference to a JSON value usable as a call argument.
    pub fn value(&self, reference: &Reference) -> Result<Value, ScriptError> {
        match reference {
            Reference::AccountKey(_) => Ok(Value::String(self.key(reference)?.to_hex())),
            Reference::AccountAddress(_) => Ok(Value::String(self.address(reference)?.to_string())),
            Reference::ContractPath(name) => self
                .contracts
                .get(name)
                .map(|entry| Value::String(entry.path.display().to_string()))
                .ok_or_else(|| unknown(reference)),
            Reference::ContractAddress(_) => Ok(Value::String(self.location(reference)?.to_string())),
            Reference::ContractStorageLayout(name) => Ok(self
                .deployed(reference, name)?
                .storage_layout()
                .cloned()
                .unwrap_or(Value::Null)),
            Reference::ContractInstance(_) => Err(wrong_kind(reference, "a plain value")),
        }
    }

    /// Replaces `data[...]` strings in `args` by their resolved values.
    pub fn resolve_args(&self, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        args.iter()
            .map(|arg| match arg {
                Value::String(s) if is_reference(s) => self.value(&s.parse()?),
                other => Ok(other.clone()),
            })
            .collect()
    }
}
