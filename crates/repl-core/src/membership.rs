//! # membership
//!
//! why: track, for one term, every node's role and last reported durable position
//! relations: built by replica.rs on becoming primary, read by commit.rs for quorum
//! what: Roster (roles across terms), MembershipView (per-term positions), AckOutcome

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ReplError;
use crate::message::Acknowledgment;
use crate::node::{NodeId, NodeState, Role};

/// Whether a member may vote, independent of who is primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Voting,
    CatchingUp,
}

/// Cluster membership that outlives a term.
///
/// Only catch-up completion mutates it; which node is primary is
/// decided per term by the view built from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    members: BTreeMap<NodeId, MemberStatus>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every listed node is a voting member.
    pub fn voting(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut roster = Self::new();
        for id in ids {
            roster.insert(id, MemberStatus::Voting);
        }
        roster
    }

    pub fn insert(&mut self, id: NodeId, status: MemberStatus) {
        self.members.insert(id, status);
    }

    pub fn with_catching_up(mut self, id: NodeId) -> Self {
        self.insert(id, MemberStatus::CatchingUp);
        self
    }

    pub fn status(&self, id: NodeId) -> Option<MemberStatus> {
        self.members.get(&id).copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns true the one time a node moves CatchingUp -> Voting.
    pub fn mark_caught_up(&mut self, id: NodeId) -> Result<bool, ReplError> {
        match self.members.get_mut(&id) {
            None => Err(ReplError::UnknownNode(id)),
            Some(MemberStatus::Voting) => Ok(false),
            Some(status) => {
                *status = MemberStatus::Voting;
                Ok(true)
            }
        }
    }
}

/// Why an acknowledgment was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    UnknownNode,
    /// Carries a term other than the view's
    TermMismatch { expected: u64, got: u64 },
    /// Lower than what the node already reported
    Regressed { known: u64, reported: u64 },
    /// Same position as already known
    Duplicate,
    /// The receiving node is not primary
    NotPrimary,
    /// Claims to come from the primary, whose position only local flushes set
    FromPrimary,
}

/// Result of feeding an acknowledgment into a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied { previous: u64, current: u64 },
    Stale(StaleReason),
}

impl AckOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// The primary's view of the cluster for exactly one term.
///
/// Never carried across terms: a new primary builds a fresh view, so
/// acknowledgments from an earlier term cannot count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    term: u64,
    primary: NodeId,
    nodes: BTreeMap<NodeId, NodeState>,
}

impl MembershipView {
    /// Fresh view for `primary` in `term`. The primary is included even if
    /// the roster omits it.
    pub fn new(term: u64, primary: NodeId, roster: &Roster) -> Self {
        let mut nodes = BTreeMap::new();
        for id in roster.ids() {
            let role = match roster.status(id) {
                _ if id == primary => Role::Primary,
                Some(MemberStatus::CatchingUp) => Role::CatchingUp,
                _ => Role::Secondary,
            };
            nodes.insert(id, NodeState::new(id, role));
        }
        nodes
            .entry(primary)
            .or_insert_with(|| NodeState::new(primary, Role::Primary));
        Self { term, primary, nodes }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn primary(&self) -> NodeId {
        self.primary
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// Apply an acknowledgment; stale ones leave the view untouched.
    pub fn apply_ack(&mut self, ack: &Acknowledgment) -> AckOutcome {
        if ack.term != self.term {
            return Self::discard(
                ack,
                StaleReason::TermMismatch { expected: self.term, got: ack.term },
            );
        }
        if ack.node_id == self.primary {
            return Self::discard(ack, StaleReason::FromPrimary);
        }
        let Some(node) = self.nodes.get_mut(&ack.node_id) else {
            return Self::discard(ack, StaleReason::UnknownNode);
        };
        let known = node.last_known_durable_position;
        if ack.durable_position < known {
            return Self::discard(
                ack,
                StaleReason::Regressed { known, reported: ack.durable_position },
            );
        }
        if ack.durable_position == known && node.term_of_last_ack == self.term {
            return Self::discard(ack, StaleReason::Duplicate);
        }
        node.last_known_durable_position = ack.durable_position;
        node.term_of_last_ack = ack.term;
        AckOutcome::Applied { previous: known, current: ack.durable_position }
    }

    fn discard(ack: &Acknowledgment, reason: StaleReason) -> AckOutcome {
        debug!(node = ack.node_id, term = ack.term, position = ack.durable_position, ?reason, "discarding stale acknowledgment");
        AckOutcome::Stale(reason)
    }

    /// The primary's own durable position, which counts toward quorum.
    pub fn record_primary_durable(&mut self, position: u64) {
        if let Some(node) = self.nodes.get_mut(&self.primary) {
            if position > node.last_known_durable_position {
                node.last_known_durable_position = position;
                node.term_of_last_ack = self.term;
            }
        }
    }

    /// Promote a catching-up node to secondary; true only on the transition.
    pub fn catch_up_complete(&mut self, id: NodeId, at_index: u64) -> Result<bool, ReplError> {
        let node = self.nodes.get_mut(&id).ok_or(ReplError::UnknownNode(id))?;
        if node.role != Role::CatchingUp {
            return Ok(false);
        }
        node.role = Role::Secondary;
        info!(node = id, at_index, term = self.term, "node finished catching up, now voting");
        Ok(true)
    }

    /// Durable positions of Primary and Secondary nodes only.
    pub fn voting_positions(&self) -> Vec<u64> {
        self.nodes
            .values()
            .filter(|n| n.role.is_voting())
            .map(|n| n.last_known_durable_position)
            .collect()
    }

    pub fn voting_count(&self) -> usize {
        self.nodes.values().filter(|n| n.role.is_voting()).count()
    }

    /// `floor(N/2) + 1` over voting-eligible nodes
    pub fn quorum_size(&self) -> usize {
        self.voting_count() / 2 + 1
    }
}
