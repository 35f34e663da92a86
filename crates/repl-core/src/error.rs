//! # error
//!
//! why: one error taxonomy for every failure the replication core can surface
//! relations: returned by log.rs, replica.rs, link.rs and coordinator.rs
//! what: ReplError enum (stale acknowledgments are not errors, see membership.rs)

use crate::node::NodeId;

/// Errors surfaced by the replication core.
///
/// `LeadershipLost` and `ResultUnknown` both mean "the write may or may not
/// commit": the entry was appended and stays in the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplError {
    /// An append did not land at exactly `last_index + 1`.
    #[error("sequence violation: expected index {expected}, got {got}")]
    SequenceViolation { expected: u64, got: u64 },

    /// A replicated batch does not continue from this log: the entry before
    /// it is missing or carries another term.
    #[error("log mismatch at index {index}: primary has term {expected}, local log has {found:?}")]
    LogMismatch { index: u64, expected: u64, found: Option<u64> },

    /// An append carried a term lower than the current last entry.
    #[error("term regression at index {index}: term {term} after term {last_term}")]
    TermRegression { index: u64, term: u64, last_term: u64 },

    /// A durability mark or truncation fell outside `[low, high]`.
    #[error("index {index} out of range [{low}, {high}]")]
    OutOfRange { index: u64, low: u64, high: u64 },

    /// A write was addressed to a node that is not the primary.
    #[error("node {node} is not primary in term {term}")]
    NotPrimary { node: NodeId, term: u64 },

    /// The primary lost its role before the write was acknowledged.
    #[error("leadership lost in term {term}; outcome of index {index} unknown")]
    LeadershipLost { term: u64, index: u64 },

    /// The caller stopped waiting; the entry may still commit later.
    #[error("timed out waiting for index {index} (term {term}); result unknown")]
    ResultUnknown { term: u64, index: u64 },

    /// A message or event from an older term.
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { current: u64, received: u64 },

    /// A primary was handed entries from the link; it only ever ships them.
    #[error("node {node} is primary in term {term} and cannot accept replicated entries")]
    ConflictingPrimary { node: NodeId, term: u64 },

    /// Only a node that is no longer primary may roll back its log.
    #[error("node {node} cannot roll back while primary")]
    PrimaryRollback { node: NodeId },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("replication link to node {0} is closed")]
    LinkClosed(NodeId),

    /// The storage layer under a LogStore failed.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("write coordinator has shut down")]
    Shutdown,
}

impl ReplError {
    /// True when the caller cannot know whether its write will commit.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::LeadershipLost { .. } | Self::ResultUnknown { .. })
    }
}
