//! # node
//!
//! why: define the per-node roles and the state the primary keeps about each node
//! relations: used by membership.rs for quorum eligibility, replica.rs for the local role
//! what: NodeId alias, Role enum, NodeState struct

use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// The three roles a node can hold within a term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Accepts client writes and drives replication
    Primary,
    /// Replicates from the primary and counts toward quorum
    Secondary,
    /// Still copying historical data; never counts toward quorum
    CatchingUp,
}

impl Role {
    /// Whether a node in this role counts toward the commit quorum
    pub fn is_voting(self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Secondary
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Primary => "Primary",
            Self::Secondary => "Secondary",
            Self::CatchingUp => "CatchingUp",
        };
        f.write_str(name)
    }
}

/// What the primary knows about one node during its term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub role: Role,
    /// Highest index the node has reported durable in this term
    pub last_known_durable_position: u64,
    /// Term of the last accepted acknowledgment; 0 before the first one
    pub term_of_last_ack: u64,
}

impl NodeState {
    /// A node nothing has been heard from yet
    pub fn new(node_id: NodeId, role: Role) -> Self {
        Self {
            node_id,
            role,
            last_known_durable_position: 0,
            term_of_last_ack: 0,
        }
    }
}
