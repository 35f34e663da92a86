//! # commit
//!
//! why: decide which log entries are safe to treat as permanent
//! relations: reads membership.rs positions and the primary's log.rs, driven by replica.rs
//! what: CommitPoint, CommitTracker (majority-durability commit advancement per term)

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::log::LogStore;
use crate::membership::MembershipView;

/// The highest committed entry, identified by index and the term it was
/// appended in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitPoint {
    pub term: u64,
    pub index: u64,
}

impl CommitPoint {
    pub const ZERO: CommitPoint = CommitPoint { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for CommitPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@t{}", self.index, self.term)
    }
}

/// Computes the commit point for one primary term.
///
/// Starts from a floor (the commit point the node already knew when it
/// became primary) and never moves below it.
#[derive(Debug, Clone)]
pub struct CommitTracker {
    term: u64,
    floor: CommitPoint,
    commit_point: CommitPoint,
}

impl CommitTracker {
    pub fn new(term: u64, floor: CommitPoint) -> Self {
        Self {
            term,
            floor,
            commit_point: floor,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn floor(&self) -> CommitPoint {
        self.floor
    }

    pub fn commit_point(&self) -> CommitPoint {
        self.commit_point
    }

    /// The quorum-th highest durable position among voting nodes.
    ///
    /// CatchingUp nodes are not consulted at all, whatever they reported.
    pub fn candidate(view: &MembershipView) -> u64 {
        let mut positions = view.voting_positions();
        if positions.is_empty() {
            return 0;
        }
        positions.sort_unstable_by(|a, b| b.cmp(a));
        positions
            .get(view.quorum_size() - 1)
            .copied()
            .unwrap_or(0)
    }

    /// Run one recomputation pass. Returns the new commit point if it advanced.
    ///
    /// An entry from an earlier term is never committed on its own: the
    /// pass looks for the highest index at or below the candidate whose
    /// entry belongs to this term, which commits everything before it.
    pub fn recompute<L: LogStore + ?Sized>(
        &mut self,
        view: &MembershipView,
        log: &L,
    ) -> Option<CommitPoint> {
        if view.term() != self.term {
            warn!(view_term = view.term(), tracker_term = self.term, "membership view from another term, skipping recompute");
            return None;
        }
        let candidate = Self::candidate(view).min(log.last_index());
        if candidate <= self.commit_point.index {
            return None;
        }

        let mut index = candidate;
        while index > self.commit_point.index {
            match log.term_at(index) {
                Some(term) if term == self.term => {
                    let previous = self.commit_point;
                    self.commit_point = CommitPoint::new(term, index);
                    debug!(term, %previous, commit = index, candidate, "commit point advanced");
                    return Some(self.commit_point);
                }
                // terms never decrease along the log, nothing lower can match
                Some(term) if term < self.term => break,
                _ => index -= 1,
            }
        }
        debug!(candidate, term = self.term, "candidate not in current term, commit point held");
        None
    }
}
