mod chain;
pub mod client;
mod codec;
mod config;
mod error;
mod message;
mod node;
mod paxos;
mod storage;
pub mod transport;

pub use crate::chain::{Block, ChainStore, Hash, Role};
pub use crate::config::{Config, NodeId, Opt, PeerEntry};
pub use crate::error::Error;
pub use crate::message::{
    Accept, Accepted, Ballot, ClientRequest, ClientResponse, Nack, PValue, PeerMessage, Prepare,
    Promise, Transaction,
};
pub use crate::node::Node;
pub use crate::paxos::{quorum, AcceptorState, Phase, ProposerState};
pub use crate::storage::{SledStorage, Storage};
pub use crate::transport::Event;
