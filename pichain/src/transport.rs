//! # Summary
//!
//! This module owns every TCP connection to a peer server, and defines
//! `Event`, the single enum the `Node` event loop selects over — peer
//! connections feed it here, client connections feed it from
//! `crate::client`. Each peer gets one `PeerHandle`: an outbound queue
//! the event loop can push `PeerMessage`s onto, backed by a connection
//! task that dials, retries with backoff on failure, and funnels every
//! message it reads back into one shared `mpsc::Sender<Event>`.
//!
//! Connection tasks have no access to chain, Paxos, or role state at
//! all — they only decode bytes into `PeerMessage`s and hand them to the
//! one channel the `Node` event loop reads from. All dispatch logic
//! stays inside `Node::handle_event`.

use std::collections::HashMap as Map;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::PeerCodec;
use crate::config::NodeId;
use crate::message::PeerMessage;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Everything the event loop needs to know about an inbound message.
pub enum Event {
    FromPeer(NodeId, PeerMessage),
    /// A connection task (dialed out or accepted inbound) has a handle
    /// ready for the event loop to register in its `PeerSet`. Sent
    /// exactly once per connection task, before it attempts its first
    /// send or read.
    RegisterPeer(NodeId, PeerHandle),
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    /// A client connected and is ready to receive line-based responses.
    ClientConnected(u64, ClientHandle),
    FromClient(u64, crate::message::ClientRequest),
    ClientDisconnected(u64),
    Tick,
    /// A previously NACK'd proposer's randomized back-off has elapsed;
    /// re-check and, if still abandoned, retry with a higher ballot.
    RetryProposer(u64),
}

/// Handle the event loop uses to queue a response line to one connected
/// client.
#[derive(Clone)]
pub struct ClientHandle {
    outbound: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        ClientHandle { outbound }
    }

    pub fn send_line(&self, line: String) {
        let _ = self.outbound.send(line);
    }
}

/// Handle the event loop uses to queue an outbound message to one peer.
/// Cloning is cheap; every clone shares the same underlying channel, so
/// dropping the connection task's receiver only happens on shutdown.
#[derive(Clone)]
pub struct PeerHandle {
    outbound: mpsc::UnboundedSender<PeerMessage>,
}

impl PeerHandle {
    pub fn new(outbound: mpsc::UnboundedSender<PeerMessage>) -> Self {
        PeerHandle { outbound }
    }

    pub fn send(&self, message: PeerMessage) {
        // Errors here mean the connection task has exited (e.g. shutting
        // down); the event loop has no special action to take beyond
        // letting the next reconnect attempt re-establish delivery.
        let _ = self.outbound.send(message);
    }
}

/// Registry of outbound handles to every configured peer, plus the
/// address each is dialed at.
pub struct PeerSet {
    handles: Map<NodeId, PeerHandle>,
}

impl PeerSet {
    pub fn new() -> Self {
        PeerSet { handles: Map::default() }
    }

    pub fn insert(&mut self, peer_id: NodeId, handle: PeerHandle) {
        self.handles.insert(peer_id, handle);
    }

    pub fn get(&self, peer_id: NodeId) -> Option<&PeerHandle> {
        self.handles.get(&peer_id)
    }

    pub fn broadcast(&self, message: PeerMessage) {
        for handle in self.handles.values() {
            handle.send(message.clone());
        }
    }

    pub fn send_to(&self, peer_id: NodeId, message: PeerMessage) {
        if let Some(handle) = self.handles.get(&peer_id) {
            handle.send(message);
        }
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the outbound connection task for `peer_id` at `addr`. Registers
/// a `PeerHandle` with the event loop via `Event::RegisterPeer` before
/// the first dial attempt even starts, so messages queued immediately
/// are buffered in the unbounded channel and delivered once the task
/// connects.
pub fn connect(self_id: NodeId, peer_id: NodeId, addr: String, events: mpsc::Sender<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(dial_loop(self_id, peer_id, addr, tx, rx, events));
}

async fn dial_loop(
    self_id: NodeId,
    peer_id: NodeId,
    addr: String,
    handle_tx: mpsc::UnboundedSender<PeerMessage>,
    mut outbound: mpsc::UnboundedReceiver<PeerMessage>,
    events: mpsc::Sender<Event>,
) {
    let _ = events
        .send(Event::RegisterPeer(peer_id, PeerHandle { outbound: handle_tx }))
        .await;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                log::info!("connected to peer {} at {}", peer_id, addr);
                backoff = INITIAL_BACKOFF;
                let _ = events.send(Event::PeerConnected(peer_id)).await;
                run_connection(self_id, peer_id, stream, &mut outbound, &events).await;
                let _ = events.send(Event::PeerDisconnected(peer_id)).await;
            }
            Err(err) => {
                log::warn!("could not connect to peer {} at {}: {}", peer_id, addr, err);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

async fn run_connection(
    self_id: NodeId,
    peer_id: NodeId,
    stream: TcpStream,
    outbound: &mut mpsc::UnboundedReceiver<PeerMessage>,
    events: &mpsc::Sender<Event>,
) {
    let mut framed = Framed::new(stream, PeerCodec);
    if framed.send(PeerMessage::Ping(self_id)).await.is_err() {
        return;
    }

    let mut last_seen = Map::<NodeId, u64>::new();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(message) => {
                        if framed.send(message).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if dedup_allows(&mut last_seen, peer_id, &message) {
                            if events.send(Event::FromPeer(peer_id, message)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("peer {} connection error: {}", peer_id, err);
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Tracks the highest sequence number observed per sender so a
/// reconnect-triggered resend of an already-delivered transaction isn't
/// applied twice. Only `PeerMessage::Txn` carries a client-assigned
/// sequence number; every other variant is naturally idempotent
/// (ballots and depths already make Paxos/chain messages safe to
/// re-deliver) and is always let through.
fn dedup_allows(last_seen: &mut Map<NodeId, u64>, _peer_id: NodeId, message: &PeerMessage) -> bool {
    if let PeerMessage::Txn(txn) = message {
        let seen = last_seen.entry(txn.creator).or_insert(0);
        if txn.client_seq <= *seen && txn.client_seq != 0 {
            return false;
        }
        *seen = txn.client_seq;
    }
    true
}

/// Listens for inbound peer connections and hands each accepted socket
/// straight into `run_connection`'s read/write loop, registering a
/// fresh `PeerHandle` once the connecting side identifies itself with a
/// `Ping`. Connections from a peer listed in `unreachable` are dropped
/// right after the `Ping`, simulating a network partition without
/// touching the static peer table quorum is computed against.
pub async fn listen(
    self_id: NodeId,
    bind_addr: String,
    unreachable: std::sync::Arc<std::collections::HashSet<NodeId>>,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("peer listener bound on {}", bind_addr);
    loop {
        let (stream, remote) = listener.accept().await?;
        log::debug!("accepted peer connection from {}", remote);
        let events = events.clone();
        tokio::spawn(accept_connection(self_id, stream, unreachable.clone(), events));
    }
}

async fn accept_connection(
    self_id: NodeId,
    stream: TcpStream,
    unreachable: std::sync::Arc<std::collections::HashSet<NodeId>>,
    events: mpsc::Sender<Event>,
) {
    let mut framed = Framed::new(stream, PeerCodec);
    let peer_id = match framed.next().await {
        Some(Ok(PeerMessage::Ping(id))) => id,
        _ => return,
    };
    if unreachable.contains(&peer_id) {
        log::debug!("dropping connection from partitioned peer {}", peer_id);
        return;
    }
    log::debug!("peer {} identified itself to {}", peer_id, self_id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = PeerHandle { outbound: tx };
    if events.send(Event::RegisterPeer(peer_id, handle)).await.is_err() {
        return;
    }
    if events.send(Event::PeerConnected(peer_id)).await.is_err() {
        return;
    }

    let mut last_seen = Map::<NodeId, u64>::new();
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if framed.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if dedup_allows(&mut last_seen, peer_id, &message) {
                            if events.send(Event::FromPeer(peer_id, message)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("peer {} connection error: {}", peer_id, err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    let _ = events.send(Event::PeerDisconnected(peer_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Transaction;

    fn txn(creator: usize, seq: u64) -> PeerMessage {
        PeerMessage::Txn(Transaction { creator, payload: b"v".to_vec(), client_seq: seq })
    }

    #[test]
    fn dedup_rejects_stale_sequence() {
        let mut seen = Map::new();
        assert!(dedup_allows(&mut seen, 1, &txn(5, 1)));
        assert!(dedup_allows(&mut seen, 1, &txn(5, 2)));
        assert!(!dedup_allows(&mut seen, 1, &txn(5, 1)));
    }

    #[test]
    fn dedup_tracks_independently_per_creator() {
        let mut seen = Map::new();
        assert!(dedup_allows(&mut seen, 1, &txn(1, 3)));
        assert!(dedup_allows(&mut seen, 1, &txn(2, 1)));
    }
}
