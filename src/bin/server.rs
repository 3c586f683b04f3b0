//! Master and storage node in one process

use clap::Parser;
use miniblob::bootstrap::shutdown_signal;
use miniblob::common::utils::build_runtime;
use miniblob::common::Config;
use miniblob::{Bootstrap, MasterServer, VolumeServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniblob-server")]
#[command(about = "miniblob master and storage node in one process")]
#[command(version)]
struct Cli {
    /// Host part of both advertised addresses
    #[arg(long, default_value = "localhost")]
    ip: String,

    #[arg(long, default_value_t = 9333)]
    master_port: u16,

    #[arg(long, default_value_t = 8080)]
    volume_port: u16,

    /// Other masters (comma-separated)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Raft log directory, defaults to the first data folder
    #[arg(long)]
    meta_dir: Option<PathBuf>,

    /// Data folders (comma-separated)
    #[arg(long, value_delimiter = ',')]
    dir: Vec<PathBuf>,

    /// Max volumes per folder (comma-separated, one per --dir)
    #[arg(long, value_delimiter = ',')]
    max: Vec<u32>,

    /// Default replica placement, e.g. 001
    #[arg(long)]
    default_replication: Option<String>,

    #[arg(long)]
    data_center: Option<String>,

    #[arg(long)]
    rack: Option<String>,

    /// Seconds between storage node heartbeats
    #[arg(long)]
    pulse_seconds: Option<u64>,

    /// Client IPs or CIDR ranges allowed to write (comma-separated)
    #[arg(long, value_delimiter = ',')]
    whitelist: Vec<String>,

    /// Worker threads, 0 for one per core
    #[arg(long)]
    max_cpu: Option<usize>,
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
    let mut volume = config.volume.take().unwrap_or_default();

    master.address = format!("{}:{}", cli.ip, cli.master_port);
    master.bind_addr = SocketAddr::from(([0, 0, 0, 0], cli.master_port));
    volume.address = format!("{}:{}", cli.ip, cli.volume_port);
    volume.bind_addr = SocketAddr::from(([0, 0, 0, 0], cli.volume_port));

    if !cli.dir.is_empty() {
        volume.folders = cli.dir.clone();
        volume.max_volume_counts = vec![7; cli.dir.len()];
    }
    if !cli.max.is_empty() {
        volume.max_volume_counts = cli.max.clone();
    }
    master.meta_dir = match &cli.meta_dir {
        Some(dir) => dir.clone(),
        None => volume
            .folders
            .first()
            .cloned()
            .unwrap_or_else(|| master.meta_dir.clone()),
    };
    if !cli.peers.is_empty() {
        master.peers = cli.peers.clone();
    }
    if let Some(code) = &cli.default_replication {
        master.default_replica_placement = code.parse()?;
    }
    if let Some(pulse) = cli.pulse_seconds {
        master.pulse_seconds = pulse;
        volume.pulse_seconds = pulse;
    }
    if let Some(dc) = &cli.data_center {
        volume.data_center = dc.clone();
    }
    if let Some(rack) = &cli.rack {
        volume.rack = rack.clone();
    }
    if !cli.whitelist.is_empty() {
        master.whitelist = cli.whitelist.clone();
        volume.whitelist = cli.whitelist.clone();
    }
    // The local master first, then the rest of the cluster
    volume.masters = std::iter::once(master.address.clone())
        .chain(master.peers.iter().cloned())
        .collect();

    let runtime = build_runtime(cli.max_cpu.unwrap_or(config.max_cpu))?;
    runtime.block_on(async move {
        let shutdown = shutdown_signal();
        // The node agent waits until the local master has joined consensus
        let bootstrap = Bootstrap::new();
        tokio::try_join!(
            MasterServer::new(master, bootstrap.clone()).serve(shutdown.clone()),
            VolumeServer::new(volume, bootstrap).serve(shutdown),
        )
    })?;

    Ok(())
}
