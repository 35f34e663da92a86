//! # secondary
//!
//! why: apply the primary's replication stream on a secondary and report durability back
//! relations: reads a link.rs receiver, drives a replica.rs Replica, acks through coordinator.rs
//! what: serve_secondary task body

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::coordinator::AckSink;
use crate::log::LogStore;
use crate::message::ReplicationMessage;
use crate::replica::Replica;
use crate::trace::{record_shared, SharedRecorder};

/// Apply every batch from `inbound`, flush it, and acknowledge.
///
/// Runs until the link closes or the primary goes away, then hands the
/// replica back. A rejected batch is logged and not acknowledged, so the
/// primary's view of this node simply stops advancing.
pub async fn serve_secondary<L: LogStore>(
    mut replica: Replica<L>,
    mut inbound: mpsc::Receiver<ReplicationMessage>,
    acks: AckSink,
    recorder: Option<SharedRecorder>,
) -> Replica<L> {
    while let Some(message) = inbound.recv().await {
        let ReplicationMessage::Entries {
            term,
            primary_id,
            prev_log_index,
            prev_log_term,
            commit_index,
            entries,
        } = message
        else {
            debug!(node = replica.id(), "secondary ignoring acknowledgment on inbound link");
            continue;
        };
        let count = entries.len();
        let last = match replica.receive_entries(term, prev_log_index, prev_log_term, entries, commit_index) {
            Ok(last) => last,
            Err(err) => {
                warn!(node = replica.id(), primary = primary_id, %err, "rejected replicated entries");
                continue;
            }
        };
        if let Err(err) = replica.mark_durable(last) {
            warn!(node = replica.id(), %err, "failed to flush replicated entries");
            continue;
        }
        if count > 0 {
            record_shared(recorder.as_ref(), "AppendOplog", || replica.snapshot());
        } else {
            record_shared(recorder.as_ref(), "LearnCommitPoint", || replica.snapshot());
        }
        if acks.send(replica.acknowledgment()).await.is_err() {
            debug!(node = replica.id(), "primary gone, secondary stopping");
            break;
        }
    }
    replica
}
