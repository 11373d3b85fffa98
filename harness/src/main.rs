//! # Summary
//!
//! Drives a `pichain-server` cluster through a scripted scenario: spawn
//! replicas as child processes, open/close client connections to them,
//! issue `put`/`get` requests, kill replicas to simulate crashes, and
//! sleep between steps. Scenarios are JSON files listing the cluster's
//! static shape plus an ordered command list; see `command::Execution`.

use std::collections::HashMap as Map;
use std::io::Write as _;

use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

mod command;

use crate::command::{ClusterPeer, Command, Execution};

#[derive(StructOpt)]
#[structopt(name = "pichain-harness")]
struct Opt {
    /// Path to the pichain-server binary
    #[structopt(short = "s", long = "server")]
    server: std::path::PathBuf,

    /// Scenario file
    #[structopt(short = "f", long = "file")]
    file: std::path::PathBuf,

    /// Directory to render per-replica config and storage under
    #[structopt(short = "d", long = "work-dir", default_value = "./harness-run")]
    work_dir: std::path::PathBuf,

    /// Logging output verbosity
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

struct Replica(std::process::Child);

impl Drop for Replica {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

struct Connection {
    reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Renders replica `self_id`'s config from `cluster`. The peer table
/// always lists every cluster member — quorum is computed against the
/// static cluster size, partitioned or not — but `unreachable` lists the
/// ids `self_id` should neither dial nor accept connections from, which
/// is how a network partition is simulated.
fn render_config(
    work_dir: &std::path::Path,
    cluster: &[ClusterPeer],
    self_id: usize,
    unreachable: &[usize],
) -> std::path::PathBuf {
    let mut toml = String::new();
    toml.push_str(&format!("self_id = {}\n", self_id));
    toml.push_str("timeout_ms = 200\n");
    toml.push_str(&format!(
        "storage_dir = \"{}\"\n",
        work_dir.join(format!("data-{}", self_id)).display()
    ));
    let this = cluster.iter().find(|p| p.id == self_id).expect("self_id in cluster table");
    toml.push_str(&format!("bootstrap_quick = {}\n", this.bootstrap_quick));
    toml.push_str(&format!(
        "unreachable = [{}]\n",
        unreachable.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
    ));
    for peer in cluster {
        toml.push_str("\n[[peer]]\n");
        toml.push_str(&format!("node_id = {}\n", peer.id));
        toml.push_str("host = \"127.0.0.1\"\n");
        toml.push_str(&format!("peer_port = {}\n", peer.peer_port));
        toml.push_str(&format!("client_port = {}\n", peer.client_port));
        toml.push_str(&format!("uuid = \"{}\"\n", peer.uuid));
    }

    let path = work_dir.join(format!("config-{}.toml", self_id));
    let mut file = std::fs::File::create(&path).expect("could not create rendered config");
    file.write_all(toml.as_bytes()).expect("could not write rendered config");
    path
}

/// Kill (if running) and (re-)spawn replica `id`, rendering its config
/// with `unreachable` as the set of peer ids it should not connect to.
fn spawn_replica(
    server: &std::path::Path,
    work_dir: &std::path::Path,
    cluster: &[ClusterPeer],
    replicas: &mut Map<usize, Replica>,
    id: usize,
    unreachable: &[usize],
) {
    replicas.remove(&id);
    let config_path = render_config(work_dir, cluster, id, unreachable);
    let child = std::process::Command::new(server)
        .arg("-f")
        .arg(&config_path)
        .spawn()
        .expect("could not spawn replica");
    replicas.insert(id, Replica(child));
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}]: {}", record.level(), record.target(), message))
        })
        .level_for("harness", level)
        .chain(std::io::stdout())
        .apply()
        .expect("logger already initialized");

    let text = std::fs::read_to_string(&opt.file).expect("could not read scenario file");
    let execution: Execution = serde_json::from_str(&text).expect("could not parse scenario file");

    std::fs::create_dir_all(&opt.work_dir).expect("could not create work directory");

    let cluster_by_id: Map<usize, &ClusterPeer> =
        execution.cluster.iter().map(|p| (p.id, p)).collect();
    let mut replicas: Map<usize, Replica> = Map::default();
    let mut connections: Map<usize, Connection> = Map::default();

    for command in execution.commands {
        log::info!("executing {:?}", command);
        match command {
            Command::Start { id } => {
                spawn_replica(&opt.server, &opt.work_dir, &execution.cluster, &mut replicas, id, &[]);
            }
            Command::Connect { id } => {
                let port = cluster_by_id[&id].client_port;
                let stream = connect_with_retry(port).await;
                let (read_half, writer) = stream.into_split();
                let reader = BufReader::new(read_half).lines();
                connections.insert(id, Connection { reader, writer });
            }
            Command::Disconnect { id } => {
                connections.remove(&id);
            }
            Command::Get { id, key } => {
                if let Some(conn) = connections.get_mut(&id) {
                    let line = format!("get {}\n", key);
                    let _ = conn.writer.write_all(line.as_bytes()).await;
                    if let Ok(Some(response)) = conn.reader.next_line().await {
                        println!("replica {} -> {}", id, response);
                    }
                } else {
                    log::warn!("replica {} has no open connection", id);
                }
            }
            Command::Put { id, key, value } => {
                if let Some(conn) = connections.get_mut(&id) {
                    let line = format!("put {} {}\n", key, value);
                    let _ = conn.writer.write_all(line.as_bytes()).await;
                    if let Ok(Some(response)) = conn.reader.next_line().await {
                        println!("replica {} -> {}", id, response);
                    }
                } else {
                    log::warn!("replica {} has no open connection", id);
                }
            }
            Command::Crash { id } => {
                replicas.remove(&id);
            }
            Command::Partition { groups } => {
                for group in &groups {
                    let unreachable: Vec<usize> = execution
                        .cluster
                        .iter()
                        .map(|p| p.id)
                        .filter(|id| !group.contains(id))
                        .collect();
                    for &id in group {
                        if replicas.contains_key(&id) {
                            spawn_replica(&opt.server, &opt.work_dir, &execution.cluster, &mut replicas, id, &unreachable);
                        }
                    }
                }
            }
            Command::Heal => {
                let running: Vec<usize> = replicas.keys().copied().collect();
                for id in running {
                    spawn_replica(&opt.server, &opt.work_dir, &execution.cluster, &mut replicas, id, &[]);
                }
            }
            Command::Sleep { ms } => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
        }
    }
}

async fn connect_with_retry(port: u16) -> TcpStream {
    let addr = format!("127.0.0.1:{}", port);
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(&addr).await {
            return stream;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("could not connect to replica at {}", addr);
}
