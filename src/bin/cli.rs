//! CLI for cluster operations

use clap::{Parser, Subcommand};
use miniblob::common::parse_duration;
use miniblob::coordinator::allocation::AssignRequest;
use miniblob::ops::MasterClient;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "miniblob")]
#[command(about = "miniblob distributed blob store CLI")]
#[command(version)]
struct Cli {
    /// Master addresses (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "localhost:9333")]
    master: Vec<String>,

    /// Request timeout, e.g. 500ms or 10s
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate new volumes
    Assign {
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Replica placement code, e.g. 010
        #[arg(long)]
        replication: Option<String>,

        /// Preferred data center for the primary copy
        #[arg(long)]
        data_center: Option<String>,

        /// Preferred rack for the primary copy
        #[arg(long)]
        rack: Option<String>,
    },

    /// Show the nodes hosting a volume
    Lookup {
        /// Volume id
        vid: u32,
    },

    /// Show Raft role, term, leader and peers
    ClusterStatus,

    /// Show data centers, racks, nodes and volumes
    Topology,

    /// List volumes above the garbage threshold
    Garbage,

    /// List volumes with missing replicas
    Degraded,
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = MasterClient::new(cli.master.clone(), cli.timeout)?;

    match cli.command {
        Commands::Assign {
            count,
            replication,
            data_center,
            rack,
        } => {
            let resp = client
                .assign(&AssignRequest {
                    count,
                    replication,
                    data_center,
                    rack,
                })
                .await?;
            for vol in &resp.volumes {
                let nodes: Vec<&str> = vol.nodes.iter().map(|n| n.public_url.as_str()).collect();
                println!("{}\t{}\t{}", vol.vid, vol.replica_placement, nodes.join(","));
            }
        }

        Commands::Lookup { vid } => {
            let resp = client.lookup(vid).await?;
            for location in &resp.locations {
                println!("{}\t{}", location.address, location.public_url);
            }
        }

        Commands::ClusterStatus => {
            let status = client.cluster_status().await?;
            println!("Cluster status:");
            println!("  Node: {}", status.id);
            println!("  Role: {}", status.role);
            println!("  Term: {}", status.term);
            println!("  Leader: {}", status.leader.as_deref().unwrap_or("-"));
            println!("  Commit index: {}", status.commit_index);
            println!("  Peers: {}", status.peers.join(", "));
        }

        Commands::Topology => print_json(&client.dir_status().await?)?,

        Commands::Garbage => print_json(&client.garbage().await?)?,

        Commands::Degraded => print_json(&client.degraded().await?)?,
    }

    Ok(())
}
