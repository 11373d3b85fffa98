//! Property-based tests for the quantified invariants over `ChainStore`
//! that a handful of hand-picked unit tests can't cover: arbitrary chains
//! of randomly-created blocks, checked against the ancestor-walk and
//! serialization invariants spec.md states as "for all blocks" claims.

use pichain::{Block, ChainStore, Role, Transaction};

use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = Role> {
    use proptest::prelude::Just;
    proptest::prop_oneof![Just(Role::Quick), Just(Role::Medium), Just(Role::Slow)]
}

proptest::prop_compose! {
    fn arb_transaction()(creator in 0usize..8, client_seq in 0u64..1000, payload in proptest::collection::vec(any::<u8>(), 0..16)) -> Transaction {
        Transaction { creator, payload, client_seq }
    }
}

// A chain of `n` blocks linearly extending genesis, each with a random
// creator, role, and transaction batch. Linear rather than branching: the
// ancestry invariant below only makes a claim about the path from a block
// back to genesis, which is unaffected by whatever else was inserted
// alongside it.
proptest::prop_compose! {
    fn arb_chain(n: usize)(
        creators in proptest::collection::vec(0usize..8, n),
        roles in proptest::collection::vec(arb_role(), n),
        txn_batches in proptest::collection::vec(proptest::collection::vec(arb_transaction(), 0..3), n),
    ) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(n);
        let mut parent = Block::genesis();
        for ((creator, role), txns) in creators.into_iter().zip(roles).zip(txn_batches) {
            let block = Block::new(creator, &parent, txns, role);
            blocks.push(block.clone());
            parent = block;
        }
        blocks
    }
}

proptest::proptest! {
    /// `ancestors(B, genesis)` terminates and yields exactly `B.depth + 1`
    /// blocks, for any block reachable from genesis through inserted
    /// parents (spec.md §8, quantified invariants).
    #[test]
    fn ancestors_yield_depth_plus_one_blocks(chain in arb_chain(20)) {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone());
        for block in &chain {
            store.insert(block.clone()).unwrap();
        }

        for block in &chain {
            let walked: Vec<_> = store.ancestors(block.block_id(), genesis.block_id()).collect();
            prop_assert_eq!(walked.len() as u64, block.depth + 1);
            prop_assert_eq!(walked.last().unwrap().block_id(), genesis.block_id());
        }
    }

    /// Serializing a block, deserializing it, and serializing the result
    /// again yields byte-identical output (spec.md §8, round-trip property).
    #[test]
    fn block_serialize_round_trips_byte_identical(chain in arb_chain(5)) {
        for block in &chain {
            let first = bincode::serialize(block).unwrap();
            let restored: Block = bincode::deserialize(&first).unwrap();
            let second = bincode::serialize(&restored).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(&restored, block);
        }
    }

    /// Head selection always prefers strictly greater depth regardless of
    /// role or creator, matching the commit rule's depth-first ordering.
    #[test]
    fn deeper_block_always_wins_head(chain in arb_chain(10)) {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis);
        let mut max_depth = 0;
        for block in &chain {
            store.insert(block.clone()).unwrap();
            max_depth = max_depth.max(block.depth);
            prop_assert_eq!(store.head().depth, max_depth);
        }
    }
}
