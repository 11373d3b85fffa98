//! Property test for the core Paxos safety guarantee: running the
//! prepare/promise/accept/accepted round to completion for a sequence of
//! competing ballots never lets two different values get decided at the
//! same depth (spec.md §8's "two peers that committed at the same depth
//! agree" invariant, exercised here against the bare Paxos primitives
//! directly rather than through the full event loop).

use std::collections::HashMap as Map;

use pichain::{AcceptorState, Ballot, Block, Prepare, ProposerState, Role};

use proptest::prelude::*;

const ACCEPTORS: usize = 3;

fn candidate(creator: usize) -> Block {
    Block::new(creator, &Block::genesis(), vec![], Role::Quick)
}

/// Drive one proposer's full round (prepare against every acceptor, then
/// accept against every acceptor that promised) and return the block it
/// decided, if a quorum accepted it.
fn run_round(
    acceptors: &mut Map<usize, AcceptorState>,
    ballot: Ballot,
    proposer_candidate: Block,
) -> Option<[u8; 32]> {
    let mut proposer = ProposerState::new(ballot, proposer_candidate);
    let prepare = Prepare { depth: 1, ballot };

    let mut accept_to_send = None;
    for id in 0..ACCEPTORS {
        let acceptor = acceptors.entry(id).or_default();
        if let Ok(mut promise) = acceptor.receive_prepare(&prepare) {
            promise.acceptor = id;
            if let Some(accept) = proposer.receive_promise(promise, ACCEPTORS) {
                accept_to_send = Some(accept);
            }
        }
    }
    let accept = accept_to_send?;

    let mut decide = None;
    for id in 0..ACCEPTORS {
        let acceptor = acceptors.entry(id).or_default();
        if let Ok(mut accepted) = acceptor.receive_accept(&accept) {
            accepted.acceptor = id;
            if let Some(d) = proposer.receive_accepted(accepted, ACCEPTORS) {
                decide = Some(d);
            }
        }
    }
    decide.map(|d| d.block.block_id())
}

proptest::prop_compose! {
    fn arb_ballot_sequence()(pairs in proptest::collection::vec((1u64..6, 0usize..4), 2..8)) -> Vec<(u64, usize)> {
        pairs
    }
}

proptest::proptest! {
    /// A sequence of proposers, each with its own (round, proposer)
    /// ballot, takes turns running a full round against the same 3
    /// shared acceptors. No two of these rounds ever decide different
    /// blocks at the same depth, regardless of interleaving or how many
    /// ballots are stale by the time they run.
    #[test]
    fn at_most_one_value_decided_per_depth(ballots in arb_ballot_sequence()) {
        let mut acceptors: Map<usize, AcceptorState> = Map::default();
        let mut decided: Option<[u8; 32]> = None;

        for (round, proposer_id) in ballots {
            let ballot = Ballot { round, proposer: proposer_id };
            if let Some(value) = run_round(&mut acceptors, ballot, candidate(proposer_id)) {
                match decided {
                    None => decided = Some(value),
                    Some(first) => prop_assert_eq!(
                        first,
                        value,
                        "two different values reached quorum at the same depth"
                    ),
                }
            }
        }
    }
}
