//! # message
//!
//! why: define the messages and events that cross the core's boundary
//! relations: produced by link.rs and secondary.rs, consumed by replica.rs and coordinator.rs
//! what: Acknowledgment, ReplicationMessage, ClusterEvent

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::node::{NodeId, Role};

/// A secondary's report of how far its log is durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub node_id: NodeId,
    pub term: u64,
    pub durable_position: u64,
}

/// Traffic on a replication link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Entries in strict index order, with the primary's commit index.
    /// An empty batch only carries the commit index.
    ///
    /// `prev_log_index`/`prev_log_term` name the primary's entry just before
    /// the batch; a receiver whose log disagrees there rejects the batch.
    Entries {
        term: u64,
        primary_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        commit_index: u64,
        entries: Vec<LogEntry>,
    },
    /// Secondary to primary
    Ack(Acknowledgment),
}

/// Events delivered by the election and catch-up subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// `node_id` now holds `new_role` in `new_term`
    RoleChange {
        node_id: NodeId,
        new_role: Role,
        new_term: u64,
    },
    /// `node_id` has replayed its log up to `at_index` and may vote
    CatchUpComplete { node_id: NodeId, at_index: u64 },
}

impl ClusterEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::RoleChange { node_id, .. } | Self::CatchUpComplete { node_id, .. } => *node_id,
        }
    }
}
