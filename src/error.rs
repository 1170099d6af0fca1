//! Error taxonomy shared by every backend variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::{abi::AbiError, backend::BackendKind, compiler::CompileError, rpc::RpcError};

/// Convenience alias used throughout the crate.
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Errors raised by a [`TransactionBackend`](crate::TransactionBackend).
///
/// Infrastructure failures (connection, missing toolchain, unknown reference)
/// are returned as errors and terminate the run. Transaction-level failures
/// (reverts, inclusion timeouts) are not errors: they are carried inside the
/// [`TransactionOutcome`](crate::TransactionOutcome).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached at construction time.
    #[error("unable to reach {url}: {source}")]
    Connection {
        /// Endpoint that was probed.
        url: String,
        /// Underlying transport failure.
        source: RpcError,
    },

    /// The backend variant does not implement the requested capability.
    #[error("{backend} backend does not support {operation}")]
    Unsupported {
        /// Variant that rejected the call.
        backend: BackendKind,
        /// Human readable capability name.
        operation: &'static str,
    },

    /// A symbolic name or key was used before it was registered.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// Contract compilation failed, including a missing compiler binary.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// JSON-RPC request failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Arguments could not be ABI encoded or return data decoded.
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// The signer rejected the payload.
    #[error("failed to sign transaction: {0}")]
    Signing(#[from] k256::ecdsa::Error),

    /// A workload needs more participant accounts than were supplied.
    #[error("not enough accounts for {workload}: need {needed}, have {available}")]
    InsufficientAccounts {
        /// Workload label.
        workload: String,
        /// Accounts required.
        needed: usize,
        /// Accounts available.
        available: usize,
    },

    /// A deployment completed without yielding a usable contract handle.
    #[error("deployment of {contract} produced no contract ({outcome})")]
    DeploymentFailed {
        /// Contract name.
        contract: String,
        /// Rendered outcome of the deploy transaction.
        outcome: String,
    },

    /// Compiled bytecode cannot be hashed for a typed deployment.
    #[error("invalid contract bytecode: {0}")]
    InvalidBytecode(&'static str),

    /// A batch template is structurally unusable.
    #[error("invalid batch template: {0}")]
    InvalidTemplate(&'static str),

    /// Failed to read a file.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// IO error.
        source: std::io::Error,
    },

    /// Failed to write a file.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Path that failed.
        path: PathBuf,
        /// IO error.
        source: std::io::Error,
    },

    /// Malformed JSON document.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    /// Returns true when the backend signalled a missing capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Returns true for an unregistered symbolic reference.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(self, Self::UnknownReference(_))
    }

    /// Returns true when a required compiler binary is absent.
    pub fn is_toolchain_missing(&self) -> bool {
        matches!(self, Self::Compile(CompileError::ToolchainMissing(_)))
    }
}
