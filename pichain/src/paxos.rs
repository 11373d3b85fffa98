//! # Summary
//!
//! This module implements the classical Paxos round used as a safety
//! fallback whenever the quick-leader chain protocol is uncertain. One
//! instance exists per commit depth; the proposer side is played by
//! whichever peer is trying to get its candidate block committed at that
//! depth, and the acceptor side is played by every peer, always.
//!
//! Proposer and acceptor roles are not independent `tokio::spawn`ed
//! futures coordinating through channels and a shared `Arc<RwLock<_>>`
//! hub; an `Instance` here is a plain data structure with no threading of
//! its own. A single event loop owns all Paxos state, so `Node` (see
//! `crate::node`) calls these methods directly and decides what to
//! broadcast.

use std::collections::HashMap as Map;
use std::collections::HashSet as Set;

use crate::chain::Block;
use crate::message::{Accept, Accepted, Ballot, Decide, Nack, PValue, Prepare, Promise};

/// ⌈(N+1)/2⌉ for a cluster of `count` peers.
pub fn quorum(count: usize) -> usize {
    (count + 2) / 2
}

/// Acceptor's durable memory for a single depth: the highest ballot it has
/// promised, and the highest-ballot value it has accepted, if any.
#[derive(Clone, Debug, Default, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct AcceptorState {
    pub highest_promised: Ballot,
    pub highest_accepted: Option<(Ballot, Block)>,
}

impl AcceptorState {
    /// Respond to a `Prepare`, updating `highest_promised` if the ballot
    /// is new enough.
    pub fn receive_prepare(&mut self, prepare: &Prepare) -> Result<Promise, Nack> {
        if prepare.ballot >= self.highest_promised {
            self.highest_promised = prepare.ballot;
            Ok(Promise {
                acceptor: 0, // filled in by caller, which knows its own id
                depth: prepare.depth,
                ballot: prepare.ballot,
                accepted: self.highest_accepted.as_ref().map(|(ballot, block)| PValue {
                    depth: prepare.depth,
                    ballot: *ballot,
                    block: block.clone(),
                }),
            })
        } else {
            Err(Nack {
                depth: prepare.depth,
                highest_promised: self.highest_promised,
            })
        }
    }

    /// Respond to an `Accept`, updating `highest_accepted` if the ballot
    /// is at least as high as anything promised.
    pub fn receive_accept(&mut self, accept: &Accept) -> Result<Accepted, Nack> {
        if accept.pvalue.ballot >= self.highest_promised {
            self.highest_promised = accept.pvalue.ballot;
            self.highest_accepted = Some((accept.pvalue.ballot, accept.pvalue.block.clone()));
            Ok(Accepted {
                acceptor: 0,
                depth: accept.pvalue.depth,
                ballot: accept.pvalue.ballot,
            })
        } else {
            Err(Nack {
                depth: accept.pvalue.depth,
                highest_promised: self.highest_promised,
            })
        }
    }
}

/// Current phase of a locally-driven proposer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    Accepting,
    Decided,
    Abandoned,
}

/// Proposer-side state for a depth this peer is actively trying to commit.
#[derive(Clone, Debug)]
pub struct ProposerState {
    pub ballot: Ballot,
    pub candidate: Block,
    pub phase: Phase,
    promises: Map<usize, Promise>,
    accepts: Set<usize>,
}

impl ProposerState {
    pub fn new(ballot: Ballot, candidate: Block) -> Self {
        ProposerState {
            ballot,
            candidate,
            phase: Phase::Preparing,
            promises: Map::default(),
            accepts: Set::default(),
        }
    }

    /// Record a `Promise`. Returns the `Accept` to broadcast once a
    /// quorum has promised this ballot, choosing the highest-ballot
    /// accepted value among the promises, or the proposer's own
    /// candidate if none reported one.
    pub fn receive_promise(&mut self, promise: Promise, count: usize) -> Option<Accept> {
        if self.phase != Phase::Preparing || promise.ballot != self.ballot {
            return None;
        }
        self.promises.insert(promise.acceptor, promise);
        if self.promises.len() < quorum(count) {
            return None;
        }
        let value = self
            .promises
            .values()
            .filter_map(|p| p.accepted.clone())
            .max_by_key(|pvalue| pvalue.ballot)
            .map(|pvalue| pvalue.block)
            .unwrap_or_else(|| self.candidate.clone());
        self.candidate = value.clone();
        self.phase = Phase::Accepting;
        Some(Accept {
            pvalue: PValue {
                depth: self.depth(),
                ballot: self.ballot,
                block: value,
            },
        })
    }

    /// Record an `Accepted`. Returns the `Decide` to broadcast once a
    /// quorum has accepted.
    pub fn receive_accepted(&mut self, accepted: Accepted, count: usize) -> Option<Decide> {
        if self.phase != Phase::Accepting || accepted.ballot != self.ballot {
            return None;
        }
        self.accepts.insert(accepted.acceptor);
        if self.accepts.len() < quorum(count) {
            return None;
        }
        self.phase = Phase::Decided;
        Some(Decide {
            depth: self.depth(),
            block: self.candidate.clone(),
        })
    }

    /// A `Nack` preempts this proposer if it carries a strictly higher
    /// ballot than the one we're running. Returns `true` if the caller
    /// should retry with a higher ballot.
    pub fn receive_nack(&mut self, nack: &Nack) -> bool {
        if nack.highest_promised > self.ballot {
            self.phase = Phase::Abandoned;
            true
        } else {
            false
        }
    }

    pub fn depth(&self) -> u64 {
        self.candidate.depth
    }
}

/// All Paxos instances currently tracked by this peer, keyed by commit
/// depth. An instance is discarded once that depth is committed.
#[derive(Default)]
pub struct Instances {
    acceptors: Map<u64, AcceptorState>,
    proposers: Map<u64, ProposerState>,
}

impl Instances {
    pub fn acceptor(&mut self, depth: u64) -> &mut AcceptorState {
        self.acceptors.entry(depth).or_default()
    }

    pub fn acceptor_snapshot(&self, depth: u64) -> Option<AcceptorState> {
        self.acceptors.get(&depth).cloned()
    }

    pub fn restore_acceptor(&mut self, depth: u64, state: AcceptorState) {
        self.acceptors.insert(depth, state);
    }

    pub fn proposer(&mut self, depth: u64) -> Option<&mut ProposerState> {
        self.proposers.get_mut(&depth)
    }

    pub fn start_proposer(&mut self, depth: u64, proposer: ProposerState) {
        self.proposers.insert(depth, proposer);
    }

    /// Drop all state for `depth` — called once that depth commits.
    pub fn discard(&mut self, depth: u64) {
        self.acceptors.remove(&depth);
        self.proposers.remove(&depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, Role};

    fn block(depth: u64) -> Block {
        let mut parent = Block::genesis();
        for _ in 0..depth.saturating_sub(1) {
            parent = Block::new(0, &parent, vec![], Role::Quick);
        }
        if depth == 0 {
            parent
        } else {
            Block::new(0, &parent, vec![], Role::Quick)
        }
    }

    #[test]
    fn quorum_matches_ceil_n_plus_one_over_two() {
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(7), 4);
    }

    #[test]
    fn acceptor_nacks_stale_ballot() {
        let mut acceptor = AcceptorState::default();
        let high = Prepare { depth: 1, ballot: Ballot { round: 5, proposer: 0 } };
        acceptor.receive_prepare(&high).unwrap();
        let low = Prepare { depth: 1, ballot: Ballot { round: 1, proposer: 1 } };
        assert!(acceptor.receive_prepare(&low).is_err());
    }

    #[test]
    fn proposer_adopts_highest_ballot_accepted_value() {
        let candidate = block(1);
        let other = Block::new(2, &Block::genesis(), vec![], Role::Quick);
        let ballot = Ballot { round: 2, proposer: 0 };
        let mut proposer = ProposerState::new(ballot, candidate.clone());

        let accept = proposer
            .receive_promise(
                Promise {
                    acceptor: 0,
                    depth: 1,
                    ballot,
                    accepted: None,
                },
                3,
            )
            .and_then(|_| {
                proposer.receive_promise(
                    Promise {
                        acceptor: 1,
                        depth: 1,
                        ballot,
                        accepted: Some(PValue {
                            depth: 1,
                            ballot: Ballot { round: 1, proposer: 9 },
                            block: other.clone(),
                        }),
                    },
                    3,
                )
            });
        assert_eq!(accept.unwrap().pvalue.block.block_id(), other.block_id());
    }

    #[test]
    fn nack_with_higher_ballot_abandons_proposer() {
        let ballot = Ballot { round: 1, proposer: 0 };
        let mut proposer = ProposerState::new(ballot, block(1));
        let nack = Nack { depth: 1, highest_promised: Ballot { round: 2, proposer: 1 } };
        assert!(proposer.receive_nack(&nack));
        assert_eq!(proposer.phase, Phase::Abandoned);
    }
}
