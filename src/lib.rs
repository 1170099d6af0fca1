//! Transaction execution and load benchmarking for blockchain networks.
//!
//! This crate drives scripted transaction sequences and canned benchmark
//! workloads through one capability interface, [`TransactionBackend`], so the
//! same driver code runs against a live node, a Layer2 node, or an offline
//! batch file generator.
//!
//! # Architecture
//!
//! The crate is organized around three main concepts:
//!
//! - **Backend**: a [`TransactionBackend`] variant. [`LiveBackend`] signs
//!   legacy transactions for an Ethereum JSON-RPC node, [`Layer2Backend`]
//!   signs EIP-712 typed transactions for a zkSync era node, and
//!   [`OfflineBackend`] appends records to a [`BatchTemplate`] without
//!   touching a network.
//! - **Outcome**: every operation returns a [`TransactionOutcome`], either a
//!   [`Receipt`] or a [`QueuedRecord`]. Reverts and timeouts are outcomes,
//!   not errors.
//! - **Driver**: the [`ScriptReplayer`] runs a declarative script in order;
//!   the [`BenchmarkDriver`] runs timed rounds of a [`BenchmarkKind`].
//!
//! # Quick Start
//!
//! ```
//! use alloy_primitives::U256;
//! use chain_bench::{Account, BatchTemplate, OfflineBackend, TransactionBackend, TransferIntent};
//!
//! let accounts: Vec<Account> = (0..2).map(Account::from_seed).collect();
//! let mut backend = OfflineBackend::new(1000, BatchTemplate::pristine(), &accounts, "offline_bench")?;
//!
//! let intent = TransferIntent::new(accounts[0].private_key.clone(), accounts[1].address, U256::from(1));
//! let outcome = futures::executor::block_on(backend.transfer(&intent))?;
//!
//! let record = outcome.queued().expect("offline backends queue transactions");
//! assert_eq!(record.transaction.nonce, 0);
//! # Ok::<(), chain_bench::BackendError>(())
//! ```

pub mod abi;
pub mod account;
pub mod addresses;
pub mod backend;
pub mod bench;
pub mod compiler;
pub mod config;
pub mod contract;
pub mod error;
pub mod intent;
pub mod outcome;
pub mod rpc;
pub mod script;
pub mod signer;

pub use account::{Account, AccountRef, AccountResolver, PrivateKey};
pub use backend::{
    Backend, BackendKind, BatchTemplate, ConcurrentSubmitter, Deployment, Layer2Backend,
    LiveBackend, OfflineBackend, RoundWindow, TransactionBackend,
};
pub use bench::{BenchmarkDriver, BenchmarkKind, Dispatch, Pattern, RoundReport, RoundShape};
pub use config::{BenchConfig, Network, NetworkProfile, ReceiptPolicy};
pub use contract::{ContractBinding, ContractHandle, ContractLocation, DeployParams};
pub use error::{BackendError, Result};
pub use intent::{CallIntent, DeployIntent, TransactionIntent, TransferIntent};
pub use outcome::{OutcomeStats, QueuedRecord, Receipt, ReceiptStatus, TransactionOutcome};
pub use script::{replay_script, ReplayReport, Script, ScriptError, ScriptReplayer};
