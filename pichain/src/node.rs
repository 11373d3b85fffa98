//! # Summary
//!
//! This module is the single event loop: it owns the chain store, the
//! Paxos instances, the role state machine, the applied key/value state,
//! and the registries of connected peers and clients. Every other module
//! in this crate is either a pure data type (`chain`, `message`,
//! `paxos`) or an I/O task that only decodes/encodes bytes and moves
//! `Event`s across a channel (`transport`, `client`). `Node::run` is the
//! only place that ever mutates replicated state, so there is nothing
//! here that needs a lock.

use std::collections::{BTreeMap, HashMap as Map};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chain::{Block, ChainStore, Hash, InsertError, Role};
use crate::client;
use crate::config::{Config, NodeId};
use crate::message::{
    Accept, Accepted, BackfillRequest, BackfillResponse, Ballot, ClientRequest, ClientResponse,
    Decide, Nack, PeerMessage, Prepare, Promise, Transaction,
};
use crate::paxos::{Instances, Phase, ProposerState};
use crate::storage::Storage;
use crate::transport::{ClientHandle, Event, PeerSet};

const MEDIUM_DELAY_MULTIPLIER: u32 = 5;
const SLOW_DELAY_MULTIPLIER: u32 = 10;
const SLOW_JITTER_MAX_MS: u64 = 250;
const NACK_BACKOFF_MIN_MS: u64 = 20;
const NACK_BACKOFF_MAX_MS: u64 = 150;

pub struct Node {
    self_id: NodeId,
    count: usize,
    round_trip: Duration,

    chain: ChainStore,
    paxos: Instances,
    storage: Box<dyn Storage>,
    peers: PeerSet,

    role: Role,
    last_progress: Instant,
    slow_jitter: Duration,

    pending: Vec<Transaction>,
    known_quick: Option<NodeId>,

    /// Next sequence number this node will assign to a transaction it
    /// originates. Shared across every client connection, since the
    /// dedup key is (creator=this node, client_seq) and the client line
    /// protocol has no notion of its own sequence numbers.
    next_client_seq: u64,

    /// Depth of the last block this peer itself created. Used to break
    /// medium-vs-medium contention on receipt of a competing block: the
    /// peer that got further ahead stays medium.
    own_latest_created_depth: u64,

    /// Blocks that arrived before their parent; keyed by the missing
    /// parent's hash so they can be retried as soon as that parent is
    /// inserted.
    orphans: Map<Hash, Block>,

    /// Decided values not yet appliable because the chain hasn't caught
    /// up to their depth's parent; keyed by depth.
    decided: Map<u64, Block>,

    /// Transaction ids already applied to `applied`, so a commit replay
    /// (after a reconnect-induced duplicate block receipt) never reapplies
    /// the same put twice.
    applied_txn_ids: std::collections::HashSet<(NodeId, u64)>,
    applied: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Maps a locally originated transaction back to the client
    /// connection waiting on its commit.
    client_origin: Map<(NodeId, u64), u64>,
    clients: Map<u64, ClientHandle>,

    /// Maps a client connection's previously submitted `(key, value)` put
    /// to the transaction id it was assigned, so a resubmission of the
    /// identical line over that connection reuses the same `client_seq`
    /// instead of minting a fresh one — the client line protocol carries
    /// no sequence number of its own, so this is where dedup-by-retry
    /// actually becomes stable.
    client_submissions: Map<(u64, Vec<u8>, Vec<u8>), (NodeId, u64)>,

    /// Lets the event loop schedule its own future events (e.g. a
    /// randomized-backoff proposer retry) without blocking on a sleep
    /// inline.
    events: mpsc::Sender<Event>,
}

impl Node {
    pub fn bootstrap(
        config: &Config,
        mut storage: Box<dyn Storage>,
        events: mpsc::Sender<Event>,
    ) -> Result<Self, crate::error::Error> {
        let fresh = storage.get_genesis()?.is_none();
        let genesis = Block::genesis();
        let chain = if fresh {
            storage.put_block(&genesis)?;
            storage.set_genesis(genesis.block_id())?;
            storage.set_head(genesis.block_id())?;
            storage.set_committed(genesis.block_id())?;
            ChainStore::new(genesis)
        } else {
            let blocks = storage.all_blocks()?;
            let head = storage.get_head()?.unwrap_or_else(|| genesis.block_id());
            let committed = storage.get_committed()?.unwrap_or_else(|| genesis.block_id());
            ChainStore::restore(blocks, genesis.block_id(), head, committed)
        };

        let role = if fresh && config.bootstrap_quick { Role::Quick } else { Role::Slow };

        let mut applied = BTreeMap::default();
        let mut applied_txn_ids = std::collections::HashSet::new();
        let mut own_latest_created_depth = 0;
        let mut next_client_seq = 0;
        // Replay every committed block's transactions in ascending depth
        // order to rebuild the applied state machine and dedup set; the
        // chain store only persists blocks, not the derived KV state.
        let mut history: Vec<&Block> =
            chain.ancestors(chain.committed().block_id(), chain.genesis().block_id()).collect();
        history.reverse();
        for block in history {
            if block.creator == config.self_id {
                own_latest_created_depth = own_latest_created_depth.max(block.depth);
            }
            for txn in &block.transactions {
                if txn.creator == config.self_id {
                    next_client_seq = next_client_seq.max(txn.client_seq + 1);
                }
                if applied_txn_ids.insert(txn.id()) {
                    if let Some((key, value)) = decode_kv(&txn.payload) {
                        applied.insert(key, value);
                    }
                }
            }
        }

        let mut paxos = Instances::default();
        for (depth, state) in storage.all_acceptor_states()? {
            paxos.restore_acceptor(depth, state);
        }

        let now = Instant::now();
        Ok(Node {
            self_id: config.self_id,
            count: config.count(),
            round_trip: config.timeout,
            chain,
            paxos,
            storage,
            peers: PeerSet::new(),
            role,
            last_progress: now,
            slow_jitter: Duration::from_millis(0),
            pending: Vec::new(),
            known_quick: None,
            own_latest_created_depth,
            next_client_seq,
            orphans: Map::default(),
            decided: Map::default(),
            applied_txn_ids,
            applied,
            client_origin: Map::default(),
            clients: Map::default(),
            client_submissions: Map::default(),
            events,
        })
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        self.rearm_patience();
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        log::info!("event channel closed, shutting down");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RegisterPeer(peer_id, handle) => {
                self.peers.insert(peer_id, handle);
            }
            Event::PeerConnected(peer_id) => {
                log::info!("peer {} connected", peer_id);
                // Announce our head so a peer that missed our broadcasts
                // while disconnected (a healed partition, a restart)
                // discovers it is behind and triggers fork reconciliation
                // (`handle_incoming_block`'s backfill path) on its own.
                self.peers.send_to(peer_id, PeerMessage::Block(self.chain.head().clone()));
            }
            Event::PeerDisconnected(peer_id) => {
                log::info!("peer {} disconnected", peer_id);
            }
            Event::ClientConnected(client_id, handle) => {
                self.clients.insert(client_id, handle);
            }
            Event::ClientDisconnected(client_id) => {
                self.clients.remove(&client_id);
            }
            Event::FromClient(client_id, request) => self.handle_client_request(client_id, request),
            Event::FromPeer(peer_id, message) => self.handle_peer_message(peer_id, message),
            Event::Tick => self.handle_tick(),
            Event::RetryProposer(depth) => self.handle_retry_proposer(depth),
        }
    }

    // ---- client-facing ----

    fn handle_client_request(&mut self, client_id: u64, request: ClientRequest) {
        match request {
            ClientRequest::Put { key, value } => {
                // A resubmission of the same (client, key, value) line —
                // the wire protocol carries no sequence number of its
                // own — reuses the transaction id minted the first time,
                // so a retried `put` never produces a second block.
                let submission_key = (client_id, key.clone(), value.clone());
                let (creator, client_seq) = match self.client_submissions.get(&submission_key) {
                    Some(&assigned) => assigned,
                    None => {
                        let assigned = (self.self_id, self.next_client_seq);
                        self.next_client_seq += 1;
                        self.client_submissions.insert(submission_key, assigned);
                        assigned
                    }
                };
                let txn = Transaction { creator, payload: encode_kv(&key, &value), client_seq };
                if self.applied_txn_ids.contains(&txn.id()) {
                    self.reply_to_client(client_id, ClientResponse::Committed { key, value });
                    return;
                }
                self.client_origin.insert(txn.id(), client_id);
                self.handle_transaction(txn, self.self_id);
            }
            ClientRequest::Get { key } => {
                let value = self.applied.get(&key).cloned();
                self.reply_to_client(client_id, ClientResponse::Value { key, value });
            }
        }
    }

    fn reply_to_client(&self, client_id: u64, response: ClientResponse) {
        if let Some(handle) = self.clients.get(&client_id) {
            handle.send_line(client::format_response(&response));
        }
    }

    // ---- peer-facing ----

    fn handle_peer_message(&mut self, peer_id: NodeId, message: PeerMessage) {
        match message {
            PeerMessage::Txn(txn) => self.handle_transaction(txn, peer_id),
            PeerMessage::Block(block) => self.handle_incoming_block(block, peer_id),
            PeerMessage::Prepare(prepare) => self.handle_prepare(peer_id, prepare),
            PeerMessage::Promise(promise) => self.handle_promise(promise),
            PeerMessage::Accept(accept) => self.handle_accept(peer_id, accept),
            PeerMessage::Accepted(accepted) => self.handle_accepted(accepted),
            PeerMessage::Nack(nack) => self.handle_nack(peer_id, nack),
            PeerMessage::Decide(decide) => self.handle_decide(decide),
            PeerMessage::Ping(_) => {}
            PeerMessage::BackfillRequest(request) => self.handle_backfill_request(peer_id, request),
            PeerMessage::BackfillResponse(response) => self.handle_backfill_response(response),
        }
    }

    /// Transaction forwarding (§4.5 behaviour): a quick leader batches
    /// and proposes immediately; anyone else forwards to the last known
    /// quick peer, or broadcasts if no quick peer is known, and keeps the
    /// transaction in its own pool in case patience runs out first.
    fn handle_transaction(&mut self, txn: Transaction, origin_peer: NodeId) {
        if self.applied_txn_ids.contains(&txn.id()) || self.pending.iter().any(|t| t.id() == txn.id()) {
            return;
        }
        self.pending.push(txn.clone());

        if self.role == Role::Quick {
            self.propose_from_pool();
            return;
        }

        match self.known_quick {
            Some(quick_id) if quick_id != self.self_id => {
                if origin_peer != quick_id {
                    self.peers.send_to(quick_id, PeerMessage::Txn(txn));
                }
            }
            _ => {
                if origin_peer != self.self_id {
                    return;
                }
                self.peers.broadcast(PeerMessage::Txn(txn));
            }
        }
    }

    fn handle_incoming_block(&mut self, block: Block, from_peer: NodeId) {
        let block_id = block.block_id();
        match self.chain.insert(block.clone()) {
            Ok(()) => {
                self.observe_block(&block);
                self.retry_orphans();
                self.advance_commit_frontier();
            }
            Err(InsertError::UnknownParent) => {
                log::debug!("block {:?} from {} is missing parent, requesting backfill", block_id, from_peer);
                self.orphans.insert(block.parent_hash, block);
                self.peers.send_to(
                    from_peer,
                    PeerMessage::BackfillRequest(BackfillRequest {
                        missing: block_id,
                        have: self.chain.genesis().block_id(),
                    }),
                );
            }
            Err(InsertError::AlreadyPresent) => {}
            Err(InsertError::HashMismatch) => {
                log::warn!("dropping block {:?} from {}: hash mismatch", block_id, from_peer);
            }
        }
    }

    /// Applies the role-transition-on-receipt rules and resets the
    /// patience clock, since any new block is progress.
    fn observe_block(&mut self, block: &Block) {
        self.last_progress = Instant::now();

        if block.creator_role_at_creation == Role::Quick {
            self.known_quick = Some(block.creator);
        }

        if block.creator_role_at_creation == Role::Quick && block.creator != self.self_id {
            self.set_role(Role::Slow);
        } else if block.creator_role_at_creation == Role::Medium
            && self.role == Role::Medium
            && block.creator != self.self_id
            && block.depth > self.own_latest_created_depth
        {
            self.set_role(Role::Slow);
        }
    }

    fn retry_orphans(&mut self) {
        loop {
            let ready: Vec<Hash> = self
                .orphans
                .keys()
                .copied()
                .filter(|parent| self.chain.contains(parent))
                .collect();
            if ready.is_empty() {
                break;
            }
            for parent in ready {
                if let Some(block) = self.orphans.remove(&parent) {
                    let block_id = block.block_id();
                    match self.chain.insert(block) {
                        Ok(()) => {
                            if let Some(block) = self.chain.get(&block_id).cloned() {
                                self.observe_block(&block);
                            }
                        }
                        Err(_) => {}
                    }
                }
            }
        }
    }

    fn handle_backfill_request(&mut self, from_peer: NodeId, request: BackfillRequest) {
        if !self.chain.contains(&request.missing) {
            return;
        }
        let blocks: Vec<Block> = self
            .chain
            .ancestors(request.missing, request.have)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        self.peers.send_to(from_peer, PeerMessage::BackfillResponse(BackfillResponse { blocks }));
    }

    fn handle_backfill_response(&mut self, response: BackfillResponse) {
        for block in response.blocks {
            let block_id = block.block_id();
            match self.chain.insert(block) {
                Ok(()) => {
                    if let Some(block) = self.chain.get(&block_id).cloned() {
                        self.observe_block(&block);
                    }
                }
                Err(_) => {}
            }
        }
        self.retry_orphans();
        self.advance_commit_frontier();
    }

    // ---- block creation ----

    fn propose_from_pool(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let txns: Vec<Transaction> = self.pending.drain(..).collect();
        let parent = self.chain.head().clone();
        let block = Block::new(self.self_id, &parent, txns, self.role);
        if self.chain.insert(block.clone()).is_err() {
            return;
        }
        self.own_latest_created_depth = block.depth;
        self.observe_block(&block);
        self.peers.broadcast(PeerMessage::Block(block.clone()));
        self.start_proposer(block.depth, block);
    }

    // ---- Paxos ----

    fn start_proposer(&mut self, depth: u64, candidate: Block) {
        let highest_promised = self.paxos.acceptor(depth).highest_promised;
        let ballot = Ballot::higher_than(highest_promised, self.self_id);
        self.paxos.start_proposer(depth, ProposerState::new(ballot, candidate));
        self.broadcast_including_self(PeerMessage::Prepare(Prepare { depth, ballot }));
    }

    fn retry_proposer_with_higher_ballot(&mut self, depth: u64) {
        let candidate = match self.paxos.proposer(depth) {
            Some(proposer) => proposer.candidate.clone(),
            None => return,
        };
        self.start_proposer(depth, candidate);
    }

    fn handle_prepare(&mut self, from_peer: NodeId, prepare: Prepare) {
        let self_id = self.self_id;
        let depth = prepare.depth;
        let acceptor = self.paxos.acceptor(depth);
        match acceptor.receive_prepare(&prepare) {
            Ok(mut promise) => {
                self.persist_acceptor_state(depth);
                promise.acceptor = self_id;
                self.send_to_or_self(from_peer, PeerMessage::Promise(promise));
            }
            Err(nack) => self.send_to_or_self(from_peer, PeerMessage::Nack(nack)),
        }
    }

    fn handle_promise(&mut self, promise: Promise) {
        let depth = promise.depth;
        let count = self.count;
        let accept = match self.paxos.proposer(depth) {
            Some(proposer) => proposer.receive_promise(promise, count),
            None => None,
        };
        if let Some(accept) = accept {
            self.broadcast_including_self(PeerMessage::Accept(accept));
        }
    }

    fn handle_accept(&mut self, from_peer: NodeId, accept: Accept) {
        let self_id = self.self_id;
        let depth = accept.pvalue.depth;
        let acceptor = self.paxos.acceptor(depth);
        match acceptor.receive_accept(&accept) {
            Ok(mut accepted) => {
                self.persist_acceptor_state(depth);
                accepted.acceptor = self_id;
                self.send_to_or_self(from_peer, PeerMessage::Accepted(accepted));
            }
            Err(nack) => self.send_to_or_self(from_peer, PeerMessage::Nack(nack)),
        }
    }

    /// Flushes the acceptor-side Paxos state for `depth` to storage, so a
    /// crash between promising/accepting and the eventual commit doesn't
    /// let this peer re-promise a ballot, or re-accept a value, it has
    /// already durably promised/accepted.
    fn persist_acceptor_state(&mut self, depth: u64) {
        if let Some(state) = self.paxos.acceptor_snapshot(depth) {
            let _ = self.storage.put_acceptor_state(depth, &state);
        }
    }

    fn handle_accepted(&mut self, accepted: Accepted) {
        let depth = accepted.depth;
        let count = self.count;
        let decide = match self.paxos.proposer(depth) {
            Some(proposer) => proposer.receive_accepted(accepted, count),
            None => None,
        };
        if let Some(decide) = decide {
            self.paxos.discard(depth);
            self.broadcast_including_self(PeerMessage::Decide(decide));
        }
    }

    fn handle_nack(&mut self, _from_peer: NodeId, nack: Nack) {
        let depth = nack.depth;
        let should_retry = match self.paxos.proposer(depth) {
            Some(proposer) => proposer.receive_nack(&nack),
            None => false,
        };
        if should_retry {
            self.schedule_proposer_retry(depth);
        }
    }

    /// Schedules a retry of the abandoned proposer for `depth` after a
    /// randomized back-off (§4.3 conflict handling), instead of
    /// re-issuing Prepare immediately — an unconditional instant retry
    /// risks a live Prepare-storm between two dueling proposers under
    /// multi-leader contention. The delay runs as a detached timer task
    /// so it never blocks the event loop; `handle_retry_proposer`
    /// re-checks that this proposer is still abandoned before acting,
    /// since the instance may have moved on (committed, or already
    /// retried by another NACK) by the time the timer fires.
    fn schedule_proposer_retry(&self, depth: u64) {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(NACK_BACKOFF_MIN_MS..=NACK_BACKOFF_MAX_MS));
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RetryProposer(depth)).await;
        });
    }

    fn handle_retry_proposer(&mut self, depth: u64) {
        let still_abandoned = matches!(self.paxos.proposer(depth), Some(proposer) if proposer.phase == Phase::Abandoned);
        if still_abandoned {
            self.retry_proposer_with_higher_ballot(depth);
        }
    }

    fn handle_decide(&mut self, decide: Decide) {
        let block_id = decide.block.block_id();
        if !self.chain.contains(&block_id) {
            let _ = self.chain.insert(decide.block.clone());
        }
        self.decided.insert(decide.depth, decide.block);
        self.paxos.discard(decide.depth);
        self.advance_commit_frontier();
    }

    /// Applies every decided value whose parent is already committed,
    /// strictly in ascending depth order, then kicks off Paxos for the
    /// shallowest uncommitted ancestor of the current head if nothing is
    /// already in flight for it. This is the catch-up behaviour from the
    /// commit rule: a peer never commits a gap, and never skips ahead.
    fn advance_commit_frontier(&mut self) {
        loop {
            let next_depth = self.chain.committed().depth + 1;
            match self.decided.remove(&next_depth) {
                Some(block) => {
                    let block_id = block.block_id();
                    if block.parent_hash != self.chain.committed().block_id() {
                        self.decided.insert(next_depth, block);
                        break;
                    }
                    if !self.chain.contains(&block_id) && self.chain.insert(block.clone()).is_err() {
                        self.decided.insert(next_depth, block);
                        break;
                    }
                    if self.chain.advance_committed(block_id).is_ok() {
                        self.apply_commit(&block);
                    }
                }
                None => break,
            }
        }

        let head_id = self.chain.head().block_id();
        let ancestors = self.chain.uncommitted_ancestors(head_id);
        if let Some(&shallow) = ancestors.first() {
            if let Some(block) = self.chain.get(&shallow).cloned() {
                if self.paxos.proposer(block.depth).is_none() && !self.decided.contains_key(&block.depth) {
                    self.start_proposer(block.depth, block);
                }
            }
        }
    }

    fn apply_commit(&mut self, block: &Block) {
        let _ = self.storage.put_block(block);
        let _ = self.storage.set_head(self.chain.head().block_id());
        let _ = self.storage.set_committed(block.block_id());
        self.last_progress = Instant::now();

        for txn in &block.transactions {
            if self.applied_txn_ids.insert(txn.id()) {
                if let Some((key, value)) = decode_kv(&txn.payload) {
                    self.applied.insert(key.clone(), value.clone());
                    if let Some(&client_id) = self.client_origin.get(&txn.id()) {
                        self.reply_to_client(client_id, ClientResponse::Committed { key, value });
                    }
                }
                self.client_origin.remove(&txn.id());
            }
        }
    }

    // ---- role / patience ----

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            log::info!("role {:?} -> {:?}", self.role, role);
            self.role = role;
            self.rearm_patience();
        }
    }

    /// Force this node's role, bypassing the normal transition rules.
    /// Exists only so a scenario harness can set up contention/recovery
    /// scenarios deterministically; production code never calls this.
    pub fn set_role_for_test(&mut self, role: Role) {
        self.set_role(role);
    }

    fn rearm_patience(&mut self) {
        if self.role == Role::Slow {
            let jitter_ms = rand::thread_rng().gen_range(0..=SLOW_JITTER_MAX_MS);
            self.slow_jitter = Duration::from_millis(jitter_ms);
        }
    }

    fn patience_delay(&self) -> Option<Duration> {
        match self.role {
            Role::Quick => None,
            Role::Medium => Some(self.round_trip * MEDIUM_DELAY_MULTIPLIER),
            Role::Slow => Some(self.round_trip * SLOW_DELAY_MULTIPLIER + self.slow_jitter),
        }
    }

    fn handle_tick(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let delay = match self.patience_delay() {
            Some(delay) => delay,
            None => return,
        };
        if self.last_progress.elapsed() < delay {
            return;
        }

        let previous_role = self.role;
        self.propose_from_pool();
        match previous_role {
            Role::Slow => self.set_role(Role::Medium),
            Role::Medium => self.set_role(Role::Quick),
            Role::Quick => {}
        }
    }

    // ---- send helpers ----

    fn broadcast_including_self(&mut self, message: PeerMessage) {
        self.peers.broadcast(message.clone());
        self.handle_peer_message(self.self_id, message);
    }

    fn send_to_or_self(&mut self, peer_id: NodeId, message: PeerMessage) {
        if peer_id == self.self_id {
            self.handle_peer_message(self.self_id, message);
        } else {
            self.peers.send_to(peer_id, message);
        }
    }
}

fn encode_kv(key: &[u8], value: &[u8]) -> Vec<u8> {
    bincode::serialize(&(key, value)).expect("encoding a byte tuple never fails")
}

fn decode_kv(payload: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    bincode::deserialize::<(Vec<u8>, Vec<u8>)>(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStorage;

    fn config(self_id: NodeId, count: usize) -> Config {
        let mut peers = Map::default();
        for id in 0..count {
            peers.insert(
                id,
                crate::config::PeerEntry {
                    node_id: id,
                    host: "127.0.0.1".to_string(),
                    peer_port: 30000 + id as u16,
                    client_port: 40000 + id as u16,
                    uuid: format!("node-{}", id),
                },
            );
        }
        Config {
            self_id,
            timeout: Duration::from_millis(10),
            storage_dir: std::path::PathBuf::from("/tmp/unused"),
            bootstrap_quick: false,
            unreachable: std::collections::HashSet::new(),
            peers,
        }
    }

    fn node(self_id: NodeId, count: usize) -> Node {
        let cfg = config(self_id, count);
        let storage = Box::new(SledStorage::temporary().unwrap());
        let (events, _rx) = mpsc::channel(16);
        Node::bootstrap(&cfg, storage, events).unwrap()
    }

    #[test]
    fn quick_leader_proposes_immediately_on_local_transaction() {
        let mut n = node(0, 3);
        n.set_role(Role::Quick);
        n.handle_client_request(7, ClientRequest::Put { key: b"k".to_vec(), value: b"v".to_vec() });
        assert_eq!(n.chain.head().depth, 1);
        assert!(n.paxos.proposer(1).is_some());
    }

    #[test]
    fn non_quick_node_keeps_pending_transaction_until_patience_elapses() {
        let mut n = node(1, 3);
        n.handle_client_request(7, ClientRequest::Put { key: b"k".to_vec(), value: b"v".to_vec() });
        assert_eq!(n.chain.head().depth, 0);
        assert_eq!(n.pending.len(), 1);
    }

    #[test]
    fn receiving_quick_block_from_other_peer_demotes_to_slow() {
        let mut n = node(1, 3);
        n.set_role(Role::Medium);
        let genesis = n.chain.genesis().clone();
        let block = Block::new(0, &genesis, vec![], Role::Quick);
        n.handle_incoming_block(block, 0);
        assert_eq!(n.role, Role::Slow);
    }

    #[test]
    fn decide_applies_commit_and_responds_to_waiting_client() {
        let mut n = node(0, 1);
        n.set_role(Role::Quick);
        n.handle_client_request(3, ClientRequest::Put { key: b"k".to_vec(), value: b"v".to_vec() });
        // single-node cluster: quorum of one, so the round completes inline
        assert_eq!(n.chain.committed().depth, 1);
        assert_eq!(n.applied.get(&b"k".to_vec()), Some(&b"v".to_vec()));
    }

    #[test]
    fn duplicate_put_from_same_connection_commits_exactly_once() {
        let mut n = node(0, 1);
        n.set_role(Role::Quick);
        n.handle_client_request(2, ClientRequest::Put { key: b"x".to_vec(), value: b"1".to_vec() });
        assert_eq!(n.chain.committed().depth, 1);

        n.handle_client_request(2, ClientRequest::Put { key: b"x".to_vec(), value: b"1".to_vec() });
        assert_eq!(n.chain.committed().depth, 1, "resubmitting the same line must not create a second block");
        assert_eq!(n.applied.get(&b"x".to_vec()), Some(&b"1".to_vec()));
    }

    #[test]
    fn orphan_block_is_retried_after_backfill() {
        let mut n = node(1, 3);
        let genesis = n.chain.genesis().clone();
        let b1 = Block::new(0, &genesis, vec![], Role::Slow);
        let b2 = Block::new(0, &b1, vec![], Role::Slow);
        n.handle_incoming_block(b2.clone(), 0);
        assert!(!n.chain.contains(&b2.block_id()));
        assert_eq!(n.orphans.len(), 1);

        n.handle_backfill_response(BackfillResponse { blocks: vec![b1.clone(), b2.clone()] });
        assert!(n.chain.contains(&b2.block_id()));
    }
}
