//! # Summary
//!
//! This module abstracts over stable storage: an ordered byte store
//! holding namespaced keys (`blocks/<hash>`, `meta/head`,
//! `meta/committed`, `paxos/<depth>`). The default implementation is
//! backed by `sled`, an embedded ordered key/byte store — any store with
//! the same namespace/flush semantics would do.
//!
//! Writes to `meta/committed` call `flush` before returning, so a commit
//! is never acknowledged before it is durable.

use crate::chain::{Block, Hash};
use crate::paxos::AcceptorState;

/// Errors from the storage layer. Treated as unrecoverable by the
/// caller, which should crash the process (exit code 2) rather than
/// proceed with a possibly-torn log.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("corrupt stored value: {0}")]
    Decode(#[from] bincode::Error),
}

/// Namespaced, ordered byte store for blocks, pointers, and Paxos acceptor
/// state.
pub trait Storage: Send {
    fn put_block(&mut self, block: &Block) -> Result<(), StorageError>;
    fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StorageError>;
    fn all_blocks(&self) -> Result<Vec<Block>, StorageError>;

    fn set_head(&mut self, hash: Hash) -> Result<(), StorageError>;
    fn get_head(&self) -> Result<Option<Hash>, StorageError>;

    /// Sets the committed pointer. Must durably flush before returning,
    /// so callers never acknowledge a commit that a crash could unwind.
    fn set_committed(&mut self, hash: Hash) -> Result<(), StorageError>;
    fn get_committed(&self) -> Result<Option<Hash>, StorageError>;

    fn set_genesis(&mut self, hash: Hash) -> Result<(), StorageError>;
    fn get_genesis(&self) -> Result<Option<Hash>, StorageError>;

    fn put_acceptor_state(&mut self, depth: u64, state: &AcceptorState) -> Result<(), StorageError>;
    fn get_acceptor_state(&self, depth: u64) -> Result<Option<AcceptorState>, StorageError>;
    /// Every persisted (depth, acceptor state) pair, used to repopulate
    /// the in-memory `Instances` table on restart.
    fn all_acceptor_states(&self) -> Result<Vec<(u64, AcceptorState)>, StorageError>;
}

/// `sled`-backed implementation. Each namespace is a separate `sled::Tree`
/// so that ordered iteration (e.g. "every block", "every paxos depth")
/// never has to filter by key prefix.
pub struct SledStorage {
    blocks: sled::Tree,
    meta: sled::Tree,
    paxos: sled::Tree,
    db: sled::Db,
}

const KEY_HEAD: &[u8] = b"head";
const KEY_COMMITTED: &[u8] = b"committed";
const KEY_GENESIS: &[u8] = b"genesis";

impl SledStorage {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let meta = db.open_tree("meta")?;
        let paxos = db.open_tree("paxos")?;
        Ok(SledStorage { blocks, meta, paxos, db })
    }

    /// In-memory store for tests and the scenario harness' ephemeral
    /// sub-processes that don't need to survive a reboot.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        let blocks = db.open_tree("blocks")?;
        let meta = db.open_tree("meta")?;
        let paxos = db.open_tree("paxos")?;
        Ok(SledStorage { blocks, meta, paxos, db })
    }
}

impl Storage for SledStorage {
    fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let bytes = bincode::serialize(block)?;
        self.blocks.insert(block.block_id(), bytes)?;
        Ok(())
    }

    fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.blocks
            .iter()
            .values()
            .map(|result| {
                let bytes = result?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }

    fn set_head(&mut self, hash: Hash) -> Result<(), StorageError> {
        self.meta.insert(KEY_HEAD, &hash)?;
        Ok(())
    }

    fn get_head(&self) -> Result<Option<Hash>, StorageError> {
        Ok(self.meta.get(KEY_HEAD)?.map(|bytes| hash_from_ivec(&bytes)))
    }

    fn set_committed(&mut self, hash: Hash) -> Result<(), StorageError> {
        self.meta.insert(KEY_COMMITTED, &hash)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_committed(&self) -> Result<Option<Hash>, StorageError> {
        Ok(self.meta.get(KEY_COMMITTED)?.map(|bytes| hash_from_ivec(&bytes)))
    }

    fn set_genesis(&mut self, hash: Hash) -> Result<(), StorageError> {
        self.meta.insert(KEY_GENESIS, &hash)?;
        Ok(())
    }

    fn get_genesis(&self) -> Result<Option<Hash>, StorageError> {
        Ok(self.meta.get(KEY_GENESIS)?.map(|bytes| hash_from_ivec(&bytes)))
    }

    fn put_acceptor_state(&mut self, depth: u64, state: &AcceptorState) -> Result<(), StorageError> {
        let bytes = bincode::serialize(state)?;
        self.paxos.insert(depth.to_be_bytes(), bytes)?;
        Ok(())
    }

    fn get_acceptor_state(&self, depth: u64) -> Result<Option<AcceptorState>, StorageError> {
        match self.paxos.get(depth.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all_acceptor_states(&self) -> Result<Vec<(u64, AcceptorState)>, StorageError> {
        self.paxos
            .iter()
            .map(|result| {
                let (key, bytes) = result?;
                let mut depth_bytes = [0u8; 8];
                depth_bytes.copy_from_slice(&key);
                Ok((u64::from_be_bytes(depth_bytes), bincode::deserialize(&bytes)?))
            })
            .collect()
    }
}

fn hash_from_ivec(bytes: &sled::IVec) -> Hash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Role;

    #[test]
    fn round_trips_block_and_pointers() {
        let mut storage = SledStorage::temporary().unwrap();
        let genesis = Block::genesis();
        storage.put_block(&genesis).unwrap();
        storage.set_genesis(genesis.block_id()).unwrap();
        storage.set_head(genesis.block_id()).unwrap();
        storage.set_committed(genesis.block_id()).unwrap();

        let child = Block::new(0, &genesis, vec![], Role::Quick);
        storage.put_block(&child).unwrap();

        assert_eq!(storage.get_genesis().unwrap(), Some(genesis.block_id()));
        assert_eq!(storage.get_head().unwrap(), Some(genesis.block_id()));
        assert_eq!(storage.get_committed().unwrap(), Some(genesis.block_id()));
        assert_eq!(storage.get_block(&child.block_id()).unwrap(), Some(child));
        assert_eq!(storage.all_blocks().unwrap().len(), 2);
    }

    #[test]
    fn acceptor_state_round_trips() {
        let mut storage = SledStorage::temporary().unwrap();
        let state = AcceptorState {
            highest_promised: crate::message::Ballot { round: 3, proposer: 1 },
            highest_accepted: None,
        };
        storage.put_acceptor_state(2, &state).unwrap();
        let loaded = storage.get_acceptor_state(2).unwrap().unwrap();
        assert_eq!(loaded.highest_promised, state.highest_promised);

        let all = storage.all_acceptor_states().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, 2);
    }
}
