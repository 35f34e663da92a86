//! # replica
//!
//! why: the single-writer state machine of one node across terms
//! relations: owns a log.rs LogStore, builds membership.rs/commit.rs/waiter.rs per primary term,
//!            driven by coordinator.rs (primary) and secondary.rs (secondaries)
//! what: Replica, PrimaryEpoch, Submitted

use tracing::{debug, info, warn};

use crate::commit::{CommitPoint, CommitTracker};
use crate::error::ReplError;
use crate::log::{LogEntry, LogStore, MemoryLog};
use crate::membership::{AckOutcome, MemberStatus, MembershipView, Roster, StaleReason};
use crate::message::{Acknowledgment, ClusterEvent};
use crate::node::{NodeId, Role};
use crate::trace::ServerSnapshot;
use crate::waiter::{AckLevel, Registration, WaiterId, WaiterQueue, WriteReceipt};

/// Everything that exists only while this node is primary for one term.
///
/// Built fresh on every promotion and dropped on step-down.
#[derive(Debug)]
pub struct PrimaryEpoch {
    pub view: MembershipView,
    pub tracker: CommitTracker,
    pub waiters: WaiterQueue,
}

/// Outcome of a client submission
#[derive(Debug)]
pub struct Submitted {
    pub term: u64,
    pub index: u64,
    /// `None` for fire-and-forget writes
    pub registration: Option<Registration>,
}

/// One node's replication state
#[derive(Debug)]
pub struct Replica<L: LogStore = MemoryLog> {
    id: NodeId,
    term: u64,
    role: Role,
    log: L,
    roster: Roster,
    commit_point: CommitPoint,
    epoch: Option<PrimaryEpoch>,
}

impl<L: LogStore> Replica<L> {
    /// A node starts as a secondary (or catching up, per the roster) in the
    /// term of its last log entry. Primacy only comes from a role change.
    pub fn new(id: NodeId, log: L, roster: Roster) -> Self {
        let role = match roster.status(id) {
            Some(MemberStatus::CatchingUp) => Role::CatchingUp,
            _ => Role::Secondary,
        };
        let term = log.last_term();
        Self {
            id,
            term,
            role,
            log,
            roster,
            commit_point: CommitPoint::ZERO,
            epoch: None,
        }
    }

    /// Resume with a commit point known from stable storage. A commit point
    /// past the recovered log is clamped to the last entry.
    pub fn with_commit_point(mut self, commit_point: CommitPoint) -> Self {
        let last = self.log.last_index();
        if commit_point.index <= last {
            self.commit_point = commit_point;
            return self;
        }
        warn!(node = self.id, stored = %commit_point, last, "stored commit point is past the log, clamping");
        self.commit_point = CommitPoint::new(self.log.last_term(), last);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn commit_point(&self) -> CommitPoint {
        self.commit_point
    }

    pub fn view(&self) -> Option<&MembershipView> {
        self.epoch.as_ref().map(|e| &e.view)
    }

    pub fn pending_waiters(&self) -> usize {
        self.epoch.as_ref().map_or(0, |e| e.waiters.len())
    }

    pub fn into_log(self) -> L {
        self.log
    }

    // -- primary path --

    /// Append a client operation and register its waiter.
    pub fn submit(&mut self, payload: Vec<u8>, level: AckLevel) -> Result<Submitted, ReplError> {
        let Some(epoch) = self.epoch.as_mut() else {
            return Err(ReplError::NotPrimary { node: self.id, term: self.term });
        };
        let index = self.log.last_index() + 1;
        self.log.append(LogEntry::new(self.term, index, payload))?;
        let registration = epoch.waiters.register(level, index, self.term);
        debug!(term = self.term, index, ?level, "appended client write");
        Ok(Submitted { term: self.term, index, registration })
    }

    /// Local storage flushed through `index`. On the primary this may
    /// release `Local` waiters and advance the commit point.
    pub fn mark_durable(&mut self, index: u64) -> Result<Vec<WriteReceipt>, ReplError> {
        self.log.mark_durable(index)?;
        let durable = self.log.durable_position();
        let Some(epoch) = self.epoch.as_mut() else {
            return Ok(Vec::new());
        };
        epoch.view.record_primary_durable(durable);
        let mut released = epoch.waiters.release_through(AckLevel::Local, durable, &self.log);
        released.extend(self.recompute());
        Ok(released)
    }

    /// Feed a secondary's acknowledgment into this term's view.
    pub fn handle_ack(&mut self, ack: &Acknowledgment) -> (AckOutcome, Vec<WriteReceipt>) {
        let Some(epoch) = self.epoch.as_mut() else {
            debug!(node = ack.node_id, "acknowledgment received while not primary");
            return (AckOutcome::Stale(StaleReason::NotPrimary), Vec::new());
        };
        let outcome = epoch.view.apply_ack(ack);
        if !outcome.is_applied() {
            return (outcome, Vec::new());
        }
        (outcome, self.recompute())
    }

    /// One atomic recomputation pass over this term's view.
    fn recompute(&mut self) -> Vec<WriteReceipt> {
        let Some(epoch) = self.epoch.as_mut() else {
            return Vec::new();
        };
        let Some(commit) = epoch.tracker.recompute(&epoch.view, &self.log) else {
            return Vec::new();
        };
        self.commit_point = commit;
        epoch.waiters.release_through(AckLevel::Quorum, commit.index, &self.log)
    }

    /// Forget a waiter whose caller went away. The entry stays.
    pub fn abandon(&mut self, waiter: WaiterId) -> bool {
        self.epoch.as_mut().is_some_and(|e| e.waiters.cancel(waiter))
    }

    // -- secondary path --

    /// Append entries shipped by the primary of `term`, then adopt its
    /// commit index as far as the log is known to match the primary's.
    ///
    /// The batch must continue exactly from `(prev_log_index, prev_log_term)`
    /// and this log must end there; anything else is rejected untouched.
    pub fn receive_entries(
        &mut self,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        primary_commit: u64,
    ) -> Result<u64, ReplError> {
        if self.is_primary() {
            warn!(node = self.id, term = self.term, received = term, "primary was sent replicated entries");
            return Err(ReplError::ConflictingPrimary { node: self.id, term: self.term });
        }
        if term < self.term {
            return Err(ReplError::StaleTerm { current: self.term, received: term });
        }
        if term > self.term {
            self.term = term;
        }

        let found = self.log.term_at(prev_log_index);
        if found != Some(prev_log_term) {
            warn!(node = self.id, index = prev_log_index, expected = prev_log_term, ?found, "replicated batch does not match local log");
            return Err(ReplError::LogMismatch { index: prev_log_index, expected: prev_log_term, found });
        }
        // a longer local log holds a suffix the primary has not vouched for
        if self.log.last_index() != prev_log_index {
            return Err(ReplError::SequenceViolation {
                expected: self.log.last_index() + 1,
                got: prev_log_index + 1,
            });
        }

        for entry in entries {
            self.log.append(entry)?;
        }
        self.learn_commit(primary_commit);
        Ok(self.log.last_index())
    }

    fn learn_commit(&mut self, primary_commit: u64) {
        let index = primary_commit.min(self.log.last_index());
        if index <= self.commit_point.index {
            return;
        }
        if let Some(term) = self.log.term_at(index) {
            self.commit_point = CommitPoint::new(term, index);
        }
    }

    /// This node's durability report for the current term.
    pub fn acknowledgment(&self) -> Acknowledgment {
        Acknowledgment {
            node_id: self.id,
            term: self.term,
            durable_position: self.log.durable_position(),
        }
    }

    /// Discard entries after `index`, the common ancestor with a new primary.
    /// Committed or durable entries are never discarded.
    pub fn rollback_to(&mut self, index: u64) -> Result<Vec<LogEntry>, ReplError> {
        if self.is_primary() {
            return Err(ReplError::PrimaryRollback { node: self.id });
        }
        if index < self.commit_point.index {
            return Err(ReplError::OutOfRange {
                index,
                low: self.commit_point.index,
                high: self.log.last_index(),
            });
        }
        let removed = self.log.truncate_after(index)?;
        if !removed.is_empty() {
            info!(node = self.id, after = index, removed = removed.len(), "rolled back uncommitted entries");
        }
        Ok(removed)
    }

    // -- events --

    pub fn apply_event(&mut self, event: &ClusterEvent) -> Result<Vec<WriteReceipt>, ReplError> {
        match *event {
            ClusterEvent::RoleChange { node_id, new_role, new_term } if node_id == self.id => {
                self.change_role(new_role, new_term)?;
                Ok(Vec::new())
            }
            ClusterEvent::RoleChange { .. } => Ok(Vec::new()),
            ClusterEvent::CatchUpComplete { node_id, at_index } => {
                self.catch_up_complete(node_id, at_index)
            }
        }
    }

    /// React to this node's role change. Returns how many waiters failed.
    pub fn change_role(&mut self, new_role: Role, new_term: u64) -> Result<usize, ReplError> {
        if new_term < self.term {
            warn!(node = self.id, current = self.term, received = new_term, "ignoring role change from older term");
            return Err(ReplError::StaleTerm { current: self.term, received: new_term });
        }
        if new_term == self.term && new_role == self.role {
            return Ok(0);
        }

        let mut failed = 0;
        if let Some(mut epoch) = self.epoch.take() {
            failed = epoch.waiters.fail_all(self.term);
            warn!(node = self.id, term = self.term, failed, "stepped down as primary");
        }

        self.term = new_term;
        self.role = new_role;
        if new_role == Role::Primary {
            self.epoch = Some(self.new_epoch());
            info!(node = self.id, term = new_term, floor = %self.commit_point, "became primary");
        } else {
            info!(node = self.id, term = new_term, role = %new_role, "role changed");
        }
        Ok(failed)
    }

    fn new_epoch(&self) -> PrimaryEpoch {
        let mut view = MembershipView::new(self.term, self.id, &self.roster);
        view.record_primary_durable(self.log.durable_position());
        PrimaryEpoch {
            view,
            tracker: CommitTracker::new(self.term, self.commit_point),
            waiters: WaiterQueue::new(),
        }
    }

    /// A node finished catching up. Exactly one transition per node; on
    /// the primary it may complete a quorum.
    pub fn catch_up_complete(
        &mut self,
        node: NodeId,
        at_index: u64,
    ) -> Result<Vec<WriteReceipt>, ReplError> {
        if !self.roster.mark_caught_up(node)? {
            debug!(node, "catch-up already complete");
            return Ok(Vec::new());
        }
        if node == self.id && self.role == Role::CatchingUp {
            self.role = Role::Secondary;
        }
        let Some(epoch) = self.epoch.as_mut() else {
            return Ok(Vec::new());
        };
        epoch.view.catch_up_complete(node, at_index)?;
        Ok(self.recompute())
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let log = (1..=self.log.last_index())
            .filter_map(|i| self.log.term_at(i))
            .collect();
        ServerSnapshot {
            node_id: self.id,
            role: self.role,
            term: self.term,
            commit_point: self.commit_point,
            durable_position: self.log.durable_position(),
            log,
        }
    }
}
