//! Network presets and run configuration.

use std::{path::PathBuf, time::Duration};

use clap::ValueEnum;

use crate::backend::BackendKind;

/// How long to wait for a receipt and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptPolicy {
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay between receipt polls.
    pub poll_interval: Duration,
}

impl ReceiptPolicy {
    /// Ethereum-style networks.
    pub const LIVE: Self =
        Self { timeout: Duration::from_secs(120), poll_interval: Duration::from_millis(100) };

    /// Layer2 networks, which batch transactions and confirm more slowly.
    pub const LAYER2: Self =
        Self { timeout: Duration::from_secs(240), poll_interval: Duration::from_millis(500) };
}

/// Known target networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    /// Local geth dev node.
    Geth,
    /// Local zkSync era node.
    Zksync,
    /// zkSync in-memory test node.
    ZksyncInMemory,
    /// Offline batch generation for a Polygon-style executor.
    Polygon,
}

impl Network {
    /// Resolves the preset's defaults.
    pub fn profile(self) -> NetworkProfile {
        let (kind, rpc_url, chain_id) = match self {
            Self::Geth => (BackendKind::Live, Some("http://0.0.0.0:8547"), 1337),
            Self::Zksync => (BackendKind::Layer2, Some("http://localhost:3050"), 270),
            Self::ZksyncInMemory => (BackendKind::Layer2, Some("http://127.0.0.1:8011"), 260),
            Self::Polygon => (BackendKind::Offline, None, 1000),
        };
        let receipts = match kind {
            BackendKind::Layer2 => ReceiptPolicy::LAYER2,
            _ => ReceiptPolicy::LIVE,
        };
        NetworkProfile { kind, rpc_url: rpc_url.map(str::to_string), chain_id, receipts }
    }
}

/// Connection settings for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    /// Backend variant to construct.
    pub kind: BackendKind,
    /// JSON-RPC endpoint. `None` for the offline backend.
    pub rpc_url: Option<String>,
    /// Chain id used for signing and offline records.
    pub chain_id: u64,
    /// Receipt polling policy.
    pub receipts: ReceiptPolicy,
}

impl NetworkProfile {
    /// Overrides the endpoint.
    pub fn with_rpc_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.rpc_url = url;
        }
        self
    }

    /// Overrides the chain id.
    pub fn with_chain_id(mut self, chain_id: Option<u64>) -> Self {
        if let Some(chain_id) = chain_id {
            self.chain_id = chain_id;
        }
        self
    }
}

/// Benchmark driver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    /// Wall-clock window each live round is padded to.
    pub round_timeout: Duration,
    /// Pause after setup transactions (deployments, mints) on live networks.
    pub setup_grace: Duration,
    /// Directory holding the benchmark contracts.
    pub contracts_dir: PathBuf,
    /// Maximum in-flight senders in the concurrent tier.
    pub concurrency: usize,
    /// Where offline rounds are written.
    pub output_dir: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(180),
            setup_grace: Duration::from_secs(10),
            contracts_dir: PathBuf::from("contracts"),
            concurrency: 32,
            output_dir: PathBuf::from("offline_bench"),
        }
    }
}
