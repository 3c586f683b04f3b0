//! Master binary

use clap::Parser;
use miniblob::bootstrap::shutdown_signal;
use miniblob::common::utils::build_runtime;
use miniblob::common::{Config, MasterConfig};
use miniblob::{Bootstrap, MasterServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniblob-master")]
#[command(about = "miniblob master with Raft consensus")]
#[command(version)]
struct Cli {
    /// Address other nodes use to reach this master; also its Raft id
    #[arg(long)]
    address: Option<String>,

    /// Bind address for HTTP
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Other masters (comma-separated)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Raft log directory
    #[arg(long)]
    meta_dir: Option<PathBuf>,

    /// Volume size limit in MB
    #[arg(long)]
    volume_size_limit_mb: Option<u64>,

    /// Default replica placement, e.g. 001
    #[arg(long)]
    default_replication: Option<String>,

    /// Seconds between storage node heartbeats
    #[arg(long)]
    pulse_seconds: Option<u64>,

    /// Client IPs or CIDR ranges allowed to assign (comma-separated)
    #[arg(long, value_delimiter = ',')]
    whitelist: Vec<String>,

    /// Worker threads, 0 for one per core
    #[arg(long)]
    max_cpu: Option<usize>,
}

impl Cli {
    /// CLI arguments take priority over the config file
    fn apply(&self, conf: &mut MasterConfig) -> anyhow::Result<()> {
        if let Some(address) = &self.address {
            conf.address = address.clone();
        }
        if let Some(bind) = self.bind {
            conf.bind_addr = bind;
        }
        if !self.peers.is_empty() {
            conf.peers = self.peers.clone();
        }
        if let Some(dir) = &self.meta_dir {
            conf.meta_dir = dir.clone();
        }
        if let Some(limit) = self.volume_size_limit_mb {
            conf.volume_size_limit_mb = limit;
        }
        if let Some(code) = &self.default_replication {
            conf.default_replica_placement = code.parse()?;
        }
        if let Some(pulse) = self.pulse_seconds {
            conf.pulse_seconds = pulse;
        }
        if !self.whitelist.is_empty() {
            conf.whitelist = self.whitelist.clone();
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut master = config.master.take().unwrap_or_default();
    cli.apply(&mut master)?;

    let runtime = build_runtime(cli.max_cpu.unwrap_or(config.max_cpu))?;
    runtime.block_on(async move {
        let shutdown = shutdown_signal();
        MasterServer::new(master, Bootstrap::new())
            .serve(shutdown)
            .await
    })?;

    Ok(())
}
