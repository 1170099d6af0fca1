//! CLI for replaying transaction scripts and running network benchmarks.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chain_bench::{
    addresses::{load_accounts, write_accounts},
    replay_script, Account, Backend, BackendKind, BatchTemplate, BenchConfig, BenchmarkDriver,
    BenchmarkKind, Layer2Backend, LiveBackend, Network, NetworkProfile, OfflineBackend, RoundReport,
    Script,
};
use clap::{Args, Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use tracing::info;

/// Transaction replay and benchmark harness.
#[derive(Parser, Debug)]
#[command(name = "chain-bench", version, about = "Transaction replay and benchmark harness")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a transaction script in order.
    Replay {
        #[command(flatten)]
        node: NodeArgs,

        /// Script file.
        script: PathBuf,
    },

    /// Run a benchmark workload.
    Bench {
        #[command(flatten)]
        node: NodeArgs,

        /// Workload to run.
        #[arg(value_enum)]
        kind: BenchmarkKind,

        /// CSV of `private key,address` rows.
        #[arg(long, default_value = "addresses.csv")]
        addresses: PathBuf,

        /// Round window in seconds.
        #[arg(long, default_value_t = 180)]
        timeout: u64,

        /// Directory holding the benchmark contracts.
        #[arg(long, default_value = "contracts")]
        contracts_dir: PathBuf,

        /// Maximum concurrent senders in the concurrent tier.
        #[arg(long, default_value_t = 32)]
        concurrency: usize,
    },

    /// Generate fresh wallets into an address list file.
    GenWallets {
        /// Number of wallets.
        #[arg(long, default_value_t = 100)]
        count: usize,

        /// Output CSV.
        #[arg(long, default_value = "addresses.csv")]
        output: PathBuf,
    },
}

/// Target network selection.
#[derive(Args, Debug)]
struct NodeArgs {
    /// Network preset.
    #[arg(long, value_enum)]
    node: Network,

    /// Override the preset's RPC endpoint.
    #[arg(long, env = "CHAIN_BENCH_RPC_URL")]
    rpc_url: Option<String>,

    /// Override the preset's chain id.
    #[arg(long, env = "CHAIN_BENCH_CHAIN_ID")]
    chain_id: Option<u64>,

    /// Batch template for offline generation.
    #[arg(long)]
    template: Option<PathBuf>,

    /// Where offline batch files are written.
    #[arg(long, default_value = "offline_bench")]
    output_dir: PathBuf,
}

impl NodeArgs {
    fn profile(&self) -> NetworkProfile {
        self.node.profile().with_rpc_url(self.rpc_url.clone()).with_chain_id(self.chain_id)
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).with(filter).init();
}

async fn connect(node: &NodeArgs, accounts: &[Account]) -> Result<Backend> {
    let profile = node.profile();
    let endpoint = || {
        profile
            .rpc_url
            .as_deref()
            .ok_or_else(|| eyre!("network {:?} needs an RPC endpoint (--rpc-url)", node.node))
    };

    let backend: Backend = match profile.kind {
        BackendKind::Live => {
            let url = endpoint()?;
            LiveBackend::connect(url, profile.chain_id, profile.receipts)
                .await
                .wrap_err("failed to connect to live network")?
                .into()
        }
        BackendKind::Layer2 => {
            let url = endpoint()?;
            Layer2Backend::connect(url, profile.chain_id, profile.receipts)
                .await
                .wrap_err("failed to connect to layer2 network")?
                .into()
        }
        BackendKind::Offline => {
            let template = match &node.template {
                Some(path) => BatchTemplate::load(path)?,
                None => BatchTemplate::pristine(),
            };
            OfflineBackend::new(profile.chain_id, template, accounts, &node.output_dir)?.into()
        }
    };
    Ok(backend)
}

async fn replay(node: NodeArgs, path: &Path) -> Result<()> {
    let script = Script::load(path).wrap_err_with(|| format!("failed to load {}", path.display()))?;
    let mut backend = connect(&node, &script.accounts()).await?;

    let report = replay_script(&mut backend, script).await?;

    println!(
        "{} steps | {} successful | {} failed | {} queued",
        report.steps.len(),
        report.stats.successful,
        report.stats.failed,
        report.stats.queued
    );
    Ok(())
}

async fn bench(node: NodeArgs, kind: BenchmarkKind, addresses: &Path, config: BenchConfig) -> Result<()> {
    let accounts = load_accounts(addresses)
        .wrap_err_with(|| format!("failed to load address list {}", addresses.display()))?;
    info!(accounts = accounts.len(), path = %addresses.display(), "loaded address list");

    let mut backend = connect(&node, &accounts).await?;
    let reports = BenchmarkDriver::new(&mut backend, &accounts, config).run(kind).await?;
    print_reports(kind, &reports);
    Ok(())
}

fn print_reports(kind: BenchmarkKind, reports: &[RoundReport]) {
    println!("=== {kind} ===");
    for report in reports {
        println!(
            "{:36} | {:5} successful | {:5} failed | {:5} queued | {:8.2} s",
            report.label,
            report.stats.successful,
            report.stats.failed,
            report.stats.queued,
            report.elapsed.as_secs_f64()
        );
    }
}

fn gen_wallets(count: usize, output: &Path) -> Result<()> {
    let mut rng = rand::thread_rng();
    let accounts: Vec<Account> = (0..count).map(|_| Account::random(&mut rng)).collect();
    write_accounts(output, &accounts)?;
    info!(count, path = %output.display(), "wallets written");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Replay { node, script } => replay(node, &script).await,
        Command::Bench { node, kind, addresses, timeout, contracts_dir, concurrency } => {
            let config = BenchConfig {
                round_timeout: Duration::from_secs(timeout),
                contracts_dir,
                concurrency,
                output_dir: node.output_dir.clone(),
                ..BenchConfig::default()
            };
            bench(node, kind, &addresses, config).await
        }
        Command::GenWallets { count, output } => gen_wallets(count, &output),
    }
}
