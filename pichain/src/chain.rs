//! # Summary
//!
//! This module defines the block chain data structure: the immutable
//! `Block` type, the `Role` a block's creator held at creation time, and
//! the `ChainStore` that holds every known block indexed by hash together
//! with the `head`/`committed`/`genesis` pointers described in the data
//! model.
//!
//! Head selection and the commit rule both live here, since both are pure
//! functions of the store's contents — the `Node` (see `crate::node`) only
//! decides *when* to call them.

use std::collections::HashMap as Map;

use serde_derive::{Deserialize, Serialize};

use crate::message::Transaction;

/// Collision-resistant digest identifying a block. Fixed-width so it can
/// be framed directly on the wire without a length prefix of its own.
pub type Hash = [u8; 32];

/// All-zero hash used as the fixed parent of genesis.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Scheduling class a peer held when it created a block. Ordered so that
/// `quick < medium < slow` for the tie-break in head selection.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Quick,
    Medium,
    Slow,
}

impl Role {
    /// Lower rank wins head-selection ties. `Role` already derives `Ord`
    /// in the right order, but this spells out the invariant by name at
    /// call sites instead of relying on declaration order.
    pub fn rank(self) -> u8 {
        match self {
            Role::Quick => 0,
            Role::Medium => 1,
            Role::Slow => 2,
        }
    }
}

/// Immutable, hash-linked unit of commitment containing a batch of
/// transactions. `block_id` is computed once at construction and never
/// recomputed; `Block` has no setters.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub creator: usize,
    pub parent_hash: Hash,
    pub transactions: Vec<Transaction>,
    pub depth: u64,
    pub creator_role_at_creation: Role,
    block_id: Hash,
}

impl Block {
    /// Construct the fixed genesis block, identical across the cluster.
    pub fn genesis() -> Self {
        Block {
            creator: 0,
            parent_hash: ZERO_HASH,
            transactions: Vec::new(),
            depth: 0,
            creator_role_at_creation: Role::Slow,
            block_id: ZERO_HASH,
        }
    }

    /// Create a new block extending `parent`, hashing over every other
    /// field to derive `block_id`.
    pub fn new(
        creator: usize,
        parent: &Block,
        transactions: Vec<Transaction>,
        creator_role_at_creation: Role,
    ) -> Self {
        let mut block = Block {
            creator,
            parent_hash: parent.block_id(),
            transactions,
            depth: parent.depth + 1,
            creator_role_at_creation,
            block_id: ZERO_HASH,
        };
        block.block_id = block.compute_hash();
        block
    }

    pub fn block_id(&self) -> Hash {
        self.block_id
    }

    pub fn is_genesis(&self) -> bool {
        self.depth == 0
    }

    fn compute_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.creator.to_be_bytes());
        hasher.update(&self.parent_hash);
        hasher.update(&self.depth.to_be_bytes());
        hasher.update(&[self.creator_role_at_creation.rank()]);
        for txn in &self.transactions {
            hasher.update(&txn.creator.to_be_bytes());
            hasher.update(&txn.client_seq.to_be_bytes());
            hasher.update(&txn.payload);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Reason a block could not be inserted immediately.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The block's declared hash does not match its contents.
    HashMismatch,
    /// The block's parent is not yet present; caller should queue a
    /// backfill request to the block's creator.
    UnknownParent,
    /// A different block already occupies this id (should be unreachable
    /// given collision resistance, but checked defensively since store
    /// keys must be unique).
    AlreadyPresent,
}

/// Append-only content-addressed block store, indexed by `block_id`, with
/// three named pointers: `genesis`, `head_block`, `committed_block`.
pub struct ChainStore {
    blocks: Map<Hash, Block>,
    genesis: Hash,
    head: Hash,
    committed: Hash,
}

impl ChainStore {
    /// Start a fresh store rooted at `genesis`.
    pub fn new(genesis: Block) -> Self {
        let id = genesis.block_id();
        let mut blocks = Map::default();
        blocks.insert(id, genesis);
        ChainStore {
            blocks,
            genesis: id,
            head: id,
            committed: id,
        }
    }

    /// Restore a store from a set of previously-persisted blocks and
    /// pointers, used on crash recovery.
    pub fn restore(blocks: Vec<Block>, genesis: Hash, head: Hash, committed: Hash) -> Self {
        let mut map = Map::default();
        for block in blocks {
            map.insert(block.block_id(), block);
        }
        ChainStore {
            blocks: map,
            genesis,
            head,
            committed,
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[&self.genesis]
    }

    pub fn head(&self) -> &Block {
        &self.blocks[&self.head]
    }

    pub fn committed(&self) -> &Block {
        &self.blocks[&self.committed]
    }

    pub fn all_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Insert `block`, enforcing the no-orphans invariant, and update
    /// `head_block` if the new block wins head selection.
    pub fn insert(&mut self, block: Block) -> Result<(), InsertError> {
        if block.block_id() != block.compute_hash() {
            return Err(InsertError::HashMismatch);
        }
        if self.blocks.contains_key(&block.block_id()) {
            return Err(InsertError::AlreadyPresent);
        }
        if !block.is_genesis() && !self.blocks.contains_key(&block.parent_hash) {
            return Err(InsertError::UnknownParent);
        }

        let id = block.block_id();
        let replaces_head = self.wins_head(&block);
        self.blocks.insert(id, block);
        if replaces_head {
            self.head = id;
        }
        Ok(())
    }

    /// Head-selection rule: prefer greater depth, then lower creator-role
    /// rank (quick < medium < slow), then lower creator `NodeId`.
    fn wins_head(&self, candidate: &Block) -> bool {
        let current = self.head();
        match candidate.depth.cmp(&current.depth) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                match candidate
                    .creator_role_at_creation
                    .rank()
                    .cmp(&current.creator_role_at_creation.rank())
                {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => candidate.creator < current.creator,
                }
            }
        }
    }

    /// Advance `committed_block` to `candidate`, provided its parent is
    /// already committed (the commit rule's catch-up precondition — callers
    /// are expected to have already run Paxos for every ancestor in
    /// ascending depth order; see `crate::node`).
    pub fn advance_committed(&mut self, candidate: Hash) -> Result<(), InsertError> {
        let block = self.blocks.get(&candidate).ok_or(InsertError::UnknownParent)?;
        if block.parent_hash != self.committed && !block.is_genesis() {
            return Err(InsertError::UnknownParent);
        }
        self.committed = candidate;
        Ok(())
    }

    /// Iterate the ancestry chain from `from` up to and including
    /// `to` (normally genesis), yielding blocks from `from` backward.
    /// Terminates (returns `None` as soon as it runs off the known store)
    /// rather than looping forever on a malformed chain.
    pub fn ancestors(&self, from: Hash, to: Hash) -> Ancestors<'_> {
        Ancestors {
            store: self,
            cursor: Some(from),
            stop: to,
        }
    }

    /// Depth of the shallowest ancestor of `hash` not yet committed, or
    /// `None` if `hash` is itself committed or an ancestor of
    /// `committed_block`. Used to drive Paxos catch-up in ascending depth
    /// order per the commit rule.
    pub fn uncommitted_ancestors(&self, hash: Hash) -> Vec<Hash> {
        let mut chain = Vec::new();
        let mut cursor = hash;
        loop {
            if cursor == self.committed {
                break;
            }
            let block = match self.blocks.get(&cursor) {
                Some(block) => block,
                None => break,
            };
            chain.push(cursor);
            if block.is_genesis() {
                break;
            }
            cursor = block.parent_hash;
        }
        chain.reverse();
        chain
    }
}

/// Iterator produced by `ChainStore::ancestors`.
pub struct Ancestors<'a> {
    store: &'a ChainStore,
    cursor: Option<Hash>,
    stop: Hash,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.cursor?;
        let block = self.store.get(&hash)?;
        if hash == self.stop || block.is_genesis() {
            self.cursor = None;
        } else {
            self.cursor = Some(block.parent_hash);
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(creator: usize, seq: u64) -> Transaction {
        Transaction {
            creator,
            payload: b"v".to_vec(),
            client_seq: seq,
        }
    }

    #[test]
    fn genesis_has_depth_zero_and_fixed_parent() {
        let g = Block::genesis();
        assert_eq!(g.depth, 0);
        assert_eq!(g.parent_hash, ZERO_HASH);
    }

    #[test]
    fn insert_rejects_unknown_parent() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        let orphan_parent = Block::new(1, &Block::genesis(), vec![], Role::Slow);
        let orphan = Block::new(1, &orphan_parent, vec![txn(1, 1)], Role::Slow);
        assert_eq!(store.insert(orphan), Err(InsertError::UnknownParent));
    }

    #[test]
    fn head_prefers_deeper_block() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        let b1 = Block::new(2, &genesis, vec![txn(2, 1)], Role::Slow);
        store.insert(b1.clone()).unwrap();
        assert_eq!(store.head().block_id(), b1.block_id());
    }

    #[test]
    fn head_tie_break_prefers_quick_then_lower_creator() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        let slow = Block::new(2, &genesis, vec![txn(2, 1)], Role::Slow);
        let quick = Block::new(1, &genesis, vec![txn(1, 1)], Role::Quick);
        store.insert(slow).unwrap();
        store.insert(quick.clone()).unwrap();
        assert_eq!(store.head().block_id(), quick.block_id());
    }

    #[test]
    fn ancestors_terminate_at_genesis() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        let b1 = Block::new(0, &genesis, vec![txn(0, 1)], Role::Quick);
        let b2 = Block::new(0, &b1, vec![txn(0, 2)], Role::Quick);
        store.insert(b1.clone()).unwrap();
        store.insert(b2.clone()).unwrap();
        let chain: Vec<_> = store.ancestors(b2.block_id(), genesis.block_id()).collect();
        assert_eq!(chain.len(), (b2.depth + 1) as usize);
    }

    #[test]
    fn committed_advances_only_through_known_parent() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        let b1 = Block::new(0, &genesis, vec![txn(0, 1)], Role::Quick);
        store.insert(b1.clone()).unwrap();
        store.advance_committed(b1.block_id()).unwrap();
        assert_eq!(store.committed().block_id(), b1.block_id());
    }
}
