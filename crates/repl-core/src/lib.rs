//! # repl-core
//!
//! why: advance a replicated log's commit point only past entries a voting majority holds durably
//! relations: persisted through repl-storage, exercised end to end by repl-check
//! what: log store contract, membership view, commit tracker, write coordinator, replication links, traces

pub mod commit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod replica;
pub mod secondary;
pub mod trace;
pub mod waiter;

pub use commit::{CommitPoint, CommitTracker};
pub use config::{ClusterConfig, ConfigError, MemberConfig, ReplConfig};
pub use coordinator::{AckSink, PendingWrite, WriteCoordinator};
pub use error::ReplError;
pub use link::{link, ReplicationLink};
pub use log::{LogEntry, LogStore, MemoryLog};
pub use membership::{AckOutcome, MemberStatus, MembershipView, Roster, StaleReason};
pub use message::{Acknowledgment, ClusterEvent, ReplicationMessage};
pub use node::{NodeId, NodeState, Role};
pub use replica::{PrimaryEpoch, Replica, Submitted};
pub use secondary::serve_secondary;
pub use trace::{SharedRecorder, SystemState, TraceEvent, TraceRecorder, TraceViolation};
pub use waiter::{AckLevel, WaiterQueue, WriteReceipt};
