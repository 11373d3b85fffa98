use serde_derive::{Deserialize, Serialize};

/// One cluster member's static identity, declared once per scenario and
/// used to render every participating replica's TOML config before it
/// is started.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterPeer {
    pub id: usize,
    pub peer_port: u16,
    pub client_port: u16,
    pub uuid: String,
    #[serde(default)]
    pub bootstrap_quick: bool,
}

/// A scenario file: the cluster's static shape plus the ordered list of
/// actions to drive against it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Execution {
    pub cluster: Vec<ClusterPeer>,
    pub commands: Vec<Command>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum Command {
    /// Start replica `id`, rendering its config from the scenario's
    /// `cluster` table.
    Start { id: usize },

    /// Open a harness-owned client connection to replica `id`.
    Connect { id: usize },

    /// Close the harness-owned client connection to replica `id`,
    /// without touching the replica process itself.
    Disconnect { id: usize },

    /// Send `get <key>` over replica `id`'s client connection.
    Get { id: usize, key: String },

    /// Send `put <key> <value>` over replica `id`'s client connection.
    Put { id: usize, key: String, value: String },

    /// Kill replica `id`'s process, simulating a crash.
    Crash { id: usize },

    /// Partition the cluster into the given groups: every currently
    /// running replica is restarted with every peer outside its own
    /// group marked `unreachable`, so it neither dials nor accepts
    /// connections from them, while quorum is still computed against
    /// the full, unchanged cluster size. Storage is preserved across
    /// the restart.
    Partition { groups: Vec<Vec<usize>> },

    /// Heal a prior partition: every currently running replica is
    /// restarted with an empty `unreachable` set.
    Heal,

    /// Pause the harness for `ms` milliseconds.
    Sleep { ms: u64 },
}
