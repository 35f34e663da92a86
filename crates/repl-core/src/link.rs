//! # link
//!
//! why: carry log entries from the primary to one secondary in strict index order
//! relations: driven by coordinator.rs, read on the far side by secondary.rs
//! what: ReplicationLink (sender half with next-index cursor), link() constructor

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::error::ReplError;
use crate::log::LogStore;
use crate::message::ReplicationMessage;
use crate::node::NodeId;

/// Primary-side end of a link to one secondary.
///
/// `next_index` only moves forward once a batch is handed to the channel, so
/// the receiver sees every index exactly once and in order. A full channel
/// stalls this link alone. Every batch names the entry just before it, which
/// lets the receiver refuse a batch that does not continue its own log.
#[derive(Debug)]
pub struct ReplicationLink {
    target: NodeId,
    next_index: u64,
    commit_sent: u64,
    max_batch: usize,
    tx: mpsc::Sender<ReplicationMessage>,
}

/// Create a link to `target` whose first shipped entry will be `start_index`.
pub fn link(
    target: NodeId,
    start_index: u64,
    capacity: usize,
    max_batch: usize,
) -> (ReplicationLink, mpsc::Receiver<ReplicationMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let link = ReplicationLink {
        target,
        next_index: start_index.max(1),
        commit_sent: 0,
        max_batch: max_batch.max(1),
        tx,
    };
    (link, rx)
}

impl ReplicationLink {
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ship the next batch of unsent entries, or a bare commit update if only
    /// the commit index moved. Returns the number of entries sent.
    pub fn ship<L: LogStore + ?Sized>(
        &mut self,
        primary_id: NodeId,
        term: u64,
        log: &L,
        commit_index: u64,
    ) -> Result<usize, ReplError> {
        let pending = log.entries_from(self.next_index);
        if pending.is_empty() && commit_index <= self.commit_sent {
            return Ok(0);
        }
        let prev_log_index = self.next_index - 1;
        let Some(prev_log_term) = log.term_at(prev_log_index) else {
            debug!(target = self.target, next_index = self.next_index, "link cursor is past the log, nothing to anchor on");
            return Ok(0);
        };
        let entries: Vec<_> = pending.iter().take(self.max_batch).cloned().collect();
        let count = entries.len();
        let message = ReplicationMessage::Entries {
            term,
            primary_id,
            prev_log_index,
            prev_log_term,
            commit_index,
            entries,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.next_index += count as u64;
                self.commit_sent = commit_index;
                Ok(count)
            }
            Err(TrySendError::Full(_)) => {
                debug!(target = self.target, next_index = self.next_index, "replication link full, stalling");
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => Err(ReplError::LinkClosed(self.target)),
        }
    }

    /// Ship batches until everything is sent or the link stalls.
    pub fn ship_all<L: LogStore + ?Sized>(
        &mut self,
        primary_id: NodeId,
        term: u64,
        log: &L,
        commit_index: u64,
    ) -> Result<usize, ReplError> {
        let mut total = 0;
        loop {
            let sent = self.ship(primary_id, term, log, commit_index)?;
            total += sent;
            if sent == 0 || self.next_index > log.last_index() {
                return Ok(total);
            }
        }
    }
}
