//! A master and a storage node talking over real sockets

use miniblob::common::{MasterConfig, VolumeConfig};
use miniblob::coordinator::allocation::AssignRequest;
use miniblob::ops::MasterClient;
use miniblob::{Bootstrap, Error, MasterServer, StartupPhase, VolumeServer};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

struct Harness {
    master_addr: String,
    bootstrap: Bootstrap,
    shutdown: watch::Sender<bool>,
    master: tokio::task::JoinHandle<miniblob::Result<()>>,
    volume: tokio::task::JoinHandle<miniblob::Result<()>>,
    _dirs: (TempDir, TempDir),
}

async fn start() -> Harness {
    let meta = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let master_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let volume_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master_listener.local_addr().unwrap().to_string();
    let volume_addr = volume_listener.local_addr().unwrap().to_string();

    let master_config = MasterConfig {
        address: master_addr.clone(),
        meta_dir: meta.path().to_path_buf(),
        volume_size_limit_mb: 1,
        pulse_seconds: 1,
        election_timeout_ms: 100,
        raft_heartbeat_ms: 20,
        ..Default::default()
    };
    let volume_config = VolumeConfig {
        address: volume_addr,
        folders: vec![data.path().to_path_buf()],
        max_volume_counts: vec![3],
        masters: vec![master_addr.clone()],
        data_center: "dc1".into(),
        rack: "r1".into(),
        pulse_seconds: 1,
        heartbeat_timeout_ms: 500,
        ..Default::default()
    };

    let (shutdown, rx) = watch::channel(false);
    let bootstrap = Bootstrap::new();
    let master = tokio::spawn(
        MasterServer::new(master_config, bootstrap.clone())
            .serve_with_listener(master_listener, rx.clone()),
    );
    let volume = tokio::spawn(
        VolumeServer::new(volume_config, bootstrap.clone()).serve_with_listener(volume_listener, rx),
    );

    Harness {
        master_addr,
        bootstrap,
        shutdown,
        master,
        volume,
        _dirs: (meta, data),
    }
}

async fn wait_for_node(client: &MasterClient) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(status) = client.dir_status().await {
            let nodes: usize = status
                .topology
                .data_centers
                .iter()
                .flat_map(|dc| dc.racks.iter())
                .map(|rack| rack.nodes.len())
                .sum();
            if status.leader.is_some() && nodes == 1 {
                return;
            }
        }
        assert!(Instant::now() < deadline, "storage node never registered");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_assign_then_write_and_read_a_needle() {
    let h = start().await;
    tokio::time::timeout(
        Duration::from_secs(5),
        h.bootstrap.wait_for(StartupPhase::NodeAgentAllowed),
    )
    .await
    .unwrap();

    let client = MasterClient::new(vec![h.master_addr.clone()], Duration::from_secs(2)).unwrap();
    wait_for_node(&client).await;

    let resp = client
        .assign(&AssignRequest {
            count: 1,
            replication: Some("000".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let vol = &resp.volumes[0];
    assert_eq!(vol.nodes.len(), 1);

    let lookup = client.lookup(vol.vid).await.unwrap();
    assert_eq!(lookup.locations, vol.nodes);

    let http = reqwest::Client::new();
    let url = format!("http://{}/{}/42", vol.nodes[0].public_url, vol.vid);

    // The node provisions the volume from the push or the next heartbeat
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let resp = http.put(&url).body("hello blob").send().await.unwrap();
        if resp.status() == reqwest::StatusCode::CREATED {
            break;
        }
        assert!(Instant::now() < deadline, "volume {} never provisioned", vol.vid);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let body = http.get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "hello blob");

    // Three slots, one used
    let err = client
        .assign(&AssignRequest {
            count: 3,
            replication: Some("000".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { .. }));

    let status = client.cluster_status().await.unwrap();
    assert_eq!(status.leader.as_deref(), Some(h.master_addr.as_str()));

    h.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), h.master)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), h.volume)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
