//! # Summary
//!
//! This module defines the wire-level message and identifier types for
//! both server-to-server (peer) and client-to-server communication.
//! Message names (`Prepare`/`Promise`/`Accept`/`Accepted`/`Decide`) follow
//! the classical Paxos Made Moderately Complex terminology; the value
//! each ballot carries is a whole `Block` rather than a single opaque
//! command, since this protocol replicates a chain of blocks rather than
//! a flat command log.

use serde_derive::{Deserialize, Serialize};

use crate::chain::Block;

/// A client's submitted key/value operation before it is batched into a
/// block. `(creator, client_seq)` is the globally unique transaction id.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub creator: usize,
    pub payload: Vec<u8>,
    pub client_seq: u64,
}

impl Transaction {
    /// Globally unique id: the pair the no-duplicate-commit invariant is
    /// keyed on.
    pub fn id(&self) -> (usize, u64) {
        (self.creator, self.client_seq)
    }
}

/// Totally-ordered (round, proposer) pair. Round increases monotonically
/// on conflict; `proposer` breaks exact-round ties.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    pub round: u64,
    pub proposer: usize,
}

impl Ballot {
    pub fn initial(proposer: usize) -> Self {
        Ballot { round: 1, proposer }
    }

    /// A ballot strictly greater than `other`, authored by `proposer`.
    pub fn higher_than(other: Ballot, proposer: usize) -> Self {
        Ballot {
            round: other.round + 1,
            proposer,
        }
    }
}

/// A proposed binding from commit depth to candidate block under a given
/// ballot — the Paxos "value" exchanged during the accept phase.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq)]
pub struct PValue {
    pub depth: u64,
    pub ballot: Ballot,
    pub block: Block,
}

/// Query from proposer to acceptor during the prepare phase.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Prepare {
    pub depth: u64,
    pub ballot: Ballot,
}

/// Acceptor's reply to a `Prepare` it did not reject.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Promise {
    pub acceptor: usize,
    pub depth: u64,
    pub ballot: Ballot,
    pub accepted: Option<PValue>,
}

/// Query from proposer to acceptor during the accept phase.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Accept {
    pub pvalue: PValue,
}

/// Acceptor's reply accepting a ballot/value pair.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Accepted {
    pub acceptor: usize,
    pub depth: u64,
    pub ballot: Ballot,
}

/// Rejection carrying the ballot the acceptor has actually promised,
/// so the proposer can retry with something strictly higher.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Nack {
    pub depth: u64,
    pub highest_promised: Ballot,
}

/// Broadcast once a quorum of acceptors has accepted a value for `depth`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Decide {
    pub depth: u64,
    pub block: Block,
}

/// Request for the ancestors of `have` back to (and including) `want`,
/// sent when a block's parent is unknown so the gap can be backfilled.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct BackfillRequest {
    pub missing: crate::chain::Hash,
    pub have: crate::chain::Hash,
}

/// Reply carrying the requested ancestry, ordered from shallowest to
/// deepest so the recipient can insert them without hitting
/// `InsertError::UnknownParent`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct BackfillResponse {
    pub blocks: Vec<Block>,
}

/// Discriminated union of every message exchanged between peers, tagged
/// on the wire with a single byte (see `crate::codec`).
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum PeerMessage {
    Txn(Transaction),
    Block(Block),
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
    Nack(Nack),
    Decide(Decide),
    Ping(usize),
    BackfillRequest(BackfillRequest),
    BackfillResponse(BackfillResponse),
}

impl PeerMessage {
    /// The 1-byte wire tag for this variant.
    pub fn tag(&self) -> u8 {
        match self {
            PeerMessage::Txn(_) => 0,
            PeerMessage::Block(_) => 1,
            PeerMessage::Prepare(_) => 2,
            PeerMessage::Promise(_) => 3,
            PeerMessage::Accept(_) => 4,
            PeerMessage::Accepted(_) => 5,
            PeerMessage::Nack(_) => 6,
            PeerMessage::Decide(_) => 7,
            PeerMessage::Ping(_) => 8,
            PeerMessage::BackfillRequest(_) => 9,
            PeerMessage::BackfillResponse(_) => 10,
        }
    }
}

/// Client request, parsed from a line-delimited UTF-8 command. Carries no
/// sequence number: the owning node assigns `client_seq` itself when it
/// turns this into a `Transaction`, since dedup is keyed on (creator,
/// client_seq) where creator is the node, not the individual connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
}

/// Server response line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientResponse {
    Committed { key: Vec<u8>, value: Vec<u8> },
    Value { key: Vec<u8>, value: Option<Vec<u8>> },
    Err { reason: String },
}
