//! # Summary
//!
//! This module defines the static cluster configuration: a table of
//! peers keyed by `NodeId`, each with a host, peer port, client port, and
//! a stable `uuid` identity. Rather than taking `id`/`port`/`count` as
//! bare CLI flags and deriving every peer's address from a fixed
//! port-numbering convention, piChain reads the full peer table from a
//! TOML file, since each peer here carries its own host/ports/uuid
//! rather than living on `127.0.0.1` at a predictable offset.

use std::collections::HashMap as Map;

use serde_derive::{Deserialize, Serialize};
use structopt::StructOpt;

pub type NodeId = usize;

/// One row of the static peer table.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub host: String,
    pub peer_port: u16,
    pub client_port: u16,
    pub uuid: String,
}

/// On-disk configuration format, one `[[peer]]` table per cluster member.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct RawConfig {
    self_id: NodeId,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_storage_dir")]
    storage_dir: String,
    /// Whether `self_id` bootstraps as `quick` instead of the default
    /// `slow`. Every node starts `slow`; a designated bootstrap node may
    /// start `quick` so the cluster has an initial leader without
    /// waiting out a full patience timeout.
    #[serde(default)]
    bootstrap_quick: bool,
    /// Peer ids this node should neither dial nor accept connections
    /// from, even though they remain in the peer table (and so still
    /// count toward quorum). Static membership never changes — this
    /// only lets a test harness simulate a network partition without
    /// shrinking the cluster size Paxos quorums are computed against.
    #[serde(default)]
    unreachable: Vec<NodeId>,
    peer: Vec<PeerEntry>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_storage_dir() -> String {
    "./pichain-data".to_string()
}

/// Fully resolved configuration for one running peer.
#[derive(Clone, Debug)]
pub struct Config {
    pub self_id: NodeId,
    pub timeout: std::time::Duration,
    pub storage_dir: std::path::PathBuf,
    pub bootstrap_quick: bool,
    pub unreachable: std::collections::HashSet<NodeId>,
    pub peers: Map<NodeId, PeerEntry>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read { path: std::path::PathBuf, source: std::io::Error },
    #[error("could not parse config file {path}: {source}")]
    Parse { path: std::path::PathBuf, source: toml::de::Error },
    #[error("self_id {self_id} is not present in the peer table")]
    MissingSelf { self_id: NodeId },
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let peers: Map<NodeId, PeerEntry> =
            raw.peer.into_iter().map(|p| (p.node_id, p)).collect();

        if !peers.contains_key(&raw.self_id) {
            return Err(ConfigError::MissingSelf { self_id: raw.self_id });
        }

        Ok(Config {
            self_id: raw.self_id,
            timeout: std::time::Duration::from_millis(raw.timeout_ms),
            storage_dir: std::path::PathBuf::from(raw.storage_dir),
            bootstrap_quick: raw.bootstrap_quick,
            unreachable: raw.unreachable.into_iter().collect(),
            peers,
        })
    }

    pub fn self_entry(&self) -> &PeerEntry {
        &self.peers[&self.self_id]
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.keys().copied()
    }

    pub fn is_reachable(&self, peer_id: NodeId) -> bool {
        !self.unreachable.contains(&peer_id)
    }
}

/// CLI flags for `pichain-server`: short/long flags with `-v` verbosity
/// counting.
#[derive(StructOpt, Debug)]
#[structopt(name = "pichain-server")]
pub struct Opt {
    /// Path to the TOML cluster configuration file.
    #[structopt(short = "f", long = "config")]
    pub config: std::path::PathBuf,

    /// Logging output verbosity: pass multiple times for more detail.
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbosity: u8,
}
