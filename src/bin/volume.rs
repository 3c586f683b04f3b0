//! Storage node binary

use clap::Parser;
use miniblob::bootstrap::shutdown_signal;
use miniblob::common::utils::build_runtime;
use miniblob::common::{Config, VolumeConfig};
use miniblob::{Bootstrap, VolumeServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniblob-volume")]
#[command(about = "miniblob storage node")]
#[command(version)]
struct Cli {
    /// Address masters use to reach this node (ip:port)
    #[arg(long)]
    address: Option<String>,

    /// Bind address for HTTP
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Address handed to clients, defaults to --address
    #[arg(long)]
    public_url: Option<String>,

    /// Data folders (comma-separated)
    #[arg(long, value_delimiter = ',')]
    dir: Vec<PathBuf>,

    /// Max volumes per folder (comma-separated, one per --dir)
    #[arg(long, value_delimiter = ',')]
    max: Vec<u32>,

    /// Master addresses (comma-separated)
    #[arg(long = "master", value_delimiter = ',')]
    masters: Vec<String>,

    #[arg(long)]
    data_center: Option<String>,

    #[arg(long)]
    rack: Option<String>,

    /// Seconds between heartbeats
    #[arg(long)]
    pulse_seconds: Option<u64>,

    /// Client IPs or CIDR ranges allowed to write (comma-separated)
    #[arg(long, value_delimiter = ',')]
    whitelist: Vec<String>,

    /// Worker threads, 0 for one per core
    #[arg(long)]
    max_cpu: Option<usize>,
}

impl Cli {
    /// CLI arguments take priority over the config file
    fn apply(&self, conf: &mut VolumeConfig) {
        if let Some(address) = &self.address {
            conf.address = address.clone();
        }
        if let Some(bind) = self.bind {
            conf.bind_addr = bind;
        }
        if self.public_url.is_some() {
            conf.public_url = self.public_url.clone();
        }
        if !self.dir.is_empty() {
            conf.folders = self.dir.clone();
            if self.max.is_empty() {
                conf.max_volume_counts = vec![7; self.dir.len()];
            }
        }
        if !self.max.is_empty() {
            conf.max_volume_counts = self.max.clone();
        }
        if !self.masters.is_empty() {
            conf.masters = self.masters.clone();
        }
        if let Some(dc) = &self.data_center {
            conf.data_center = dc.clone();
        }
        if let Some(rack) = &self.rack {
            conf.rack = rack.clone();
        }
        if let Some(pulse) = self.pulse_seconds {
            conf.pulse_seconds = pulse;
        }
        if !self.whitelist.is_empty() {
            conf.whitelist = self.whitelist.clone();
        }
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

    let mut volume = config.volume.take().unwrap_or_default();
    cli.apply(&mut volume);

    let runtime = build_runtime(cli.max_cpu.unwrap_or(config.max_cpu))?;
    runtime.block_on(async move {
        let shutdown = shutdown_signal();
        VolumeServer::new(volume, Bootstrap::completed())
            .serve(shutdown)
            .await
    })?;

    Ok(())
}
