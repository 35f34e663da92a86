//! # waiter
//!
//! why: hold client acknowledgment requests until the log is durable enough to answer them
//! relations: owned by the primary epoch in replica.rs, released from commit.rs results
//! what: AckLevel, WriteReceipt, AckWaiter, WaiterQueue (index-ordered release)

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ReplError;
use crate::log::LogStore;

/// How much durability a client waits for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckLevel {
    /// Fire-and-forget
    None,
    /// The primary's own log has flushed the entry
    Local,
    /// The commit point covers the entry
    #[default]
    Quorum,
}

/// Proof handed to a released waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub term: u64,
    pub index: u64,
    pub level: AckLevel,
}

pub type WaiterId = u64;
pub type WaitResult = Result<WriteReceipt, ReplError>;

/// One pending acknowledgment request
#[derive(Debug)]
pub struct AckWaiter {
    pub id: WaiterId,
    pub requested_index: u64,
    pub requested_term: u64,
    pub level: AckLevel,
    release: oneshot::Sender<WaitResult>,
}

/// The caller's side of a registration
#[derive(Debug)]
pub struct Registration {
    pub id: WaiterId,
    pub receiver: oneshot::Receiver<WaitResult>,
}

/// Pending waiters, kept sorted by `(index, id)` per level so release
/// always runs lowest index first.
#[derive(Debug, Default)]
pub struct WaiterQueue {
    next_id: WaiterId,
    local: BTreeMap<(u64, WaiterId), AckWaiter>,
    quorum: BTreeMap<(u64, WaiterId), AckWaiter>,
    keys: HashMap<WaiterId, (AckLevel, u64)>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn queue_mut(&mut self, level: AckLevel) -> Option<&mut BTreeMap<(u64, WaiterId), AckWaiter>> {
        match level {
            AckLevel::None => None,
            AckLevel::Local => Some(&mut self.local),
            AckLevel::Quorum => Some(&mut self.quorum),
        }
    }

    /// Register a waiter for `(term, index)`. `AckLevel::None` registers nothing.
    pub fn register(&mut self, level: AckLevel, index: u64, term: u64) -> Option<Registration> {
        let id = self.next_id;
        let (release, receiver) = oneshot::channel();
        let waiter = AckWaiter {
            id,
            requested_index: index,
            requested_term: term,
            level,
            release,
        };
        self.queue_mut(level)?.insert((index, id), waiter);
        self.keys.insert(id, (level, index));
        self.next_id += 1;
        Some(Registration { id, receiver })
    }

    /// Drop a registration without touching the log.
    pub fn cancel(&mut self, id: WaiterId) -> bool {
        let Some((level, index)) = self.keys.remove(&id) else {
            return false;
        };
        self.queue_mut(level)
            .and_then(|queue| queue.remove(&(index, id)))
            .is_some()
    }

    /// Release every `level` waiter with index `<= through`, lowest index
    /// first, and return the receipts in release order.
    ///
    /// A waiter whose entry has been replaced by another term's entry is
    /// failed with `LeadershipLost` instead.
    pub fn release_through<L: LogStore + ?Sized>(
        &mut self,
        level: AckLevel,
        through: u64,
        log: &L,
    ) -> Vec<WriteReceipt> {
        let mut released = Vec::new();
        loop {
            let Some(queue) = self.queue_mut(level) else {
                return released;
            };
            let ready = matches!(queue.first_key_value(), Some(((index, _), _)) if *index <= through);
            if !ready {
                break;
            }
            let Some((_, waiter)) = queue.pop_first() else {
                break;
            };
            self.keys.remove(&waiter.id);

            let index = waiter.requested_index;
            let result = match log.term_at(index) {
                Some(term) if term == waiter.requested_term => {
                    let receipt = WriteReceipt { term, index, level };
                    released.push(receipt);
                    Ok(receipt)
                }
                _ => Err(ReplError::LeadershipLost { term: waiter.requested_term, index }),
            };
            if waiter.release.send(result).is_err() {
                debug!(waiter = waiter.id, index, "waiter abandoned before release");
            }
        }
        released
    }

    /// Fail every pending waiter with `LeadershipLost`; returns how many.
    pub fn fail_all(&mut self, term: u64) -> usize {
        let waiters = std::mem::take(&mut self.local)
            .into_values()
            .chain(std::mem::take(&mut self.quorum).into_values());
        let mut failed = 0;
        for waiter in waiters {
            let index = waiter.requested_index;
            let _ = waiter.release.send(Err(ReplError::LeadershipLost { term, index }));
            failed += 1;
        }
        self.keys.clear();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogEntry, MemoryLog};

    fn log_of(n: u64, term: u64) -> MemoryLog {
        let mut log = MemoryLog::new();
        for i in 1..=n {
            log.append(LogEntry::new(term, i, vec![])).unwrap();
        }
        log
    }

    #[test]
    fn none_level_registers_nothing() {
        let mut queue = WaiterQueue::new();
        assert!(queue.register(AckLevel::None, 1, 1).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn release_is_in_index_order() {
        let log = log_of(5, 1);
        let mut queue = WaiterQueue::new();
        for index in [4, 2, 5, 1, 3] {
            queue.register(AckLevel::Quorum, index, 1);
        }
        let released = queue.release_through(AckLevel::Quorum, 4, &log);
        let indexes: Vec<u64> = released.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn release_never_passes_commit_point() {
        let log = log_of(3, 1);
        let mut queue = WaiterQueue::new();
        let mut late = queue.register(AckLevel::Quorum, 3, 1).unwrap();
        queue.release_through(AckLevel::Quorum, 2, &log);
        assert!(late.receiver.try_recv().is_err());
    }

    #[test]
    fn levels_release_independently() {
        let log = log_of(2, 1);
        let mut queue = WaiterQueue::new();
        let mut local = queue.register(AckLevel::Local, 1, 1).unwrap();
        let mut quorum = queue.register(AckLevel::Quorum, 1, 1).unwrap();
        queue.release_through(AckLevel::Local, 2, &log);
        assert!(local.receiver.try_recv().unwrap().is_ok());
        assert!(quorum.receiver.try_recv().is_err());
    }

    #[test]
    fn replaced_entry_fails_waiter() {
        let log = log_of(2, 2);
        let mut queue = WaiterQueue::new();
        let mut reg = queue.register(AckLevel::Quorum, 2, 1).unwrap();
        assert!(queue.release_through(AckLevel::Quorum, 2, &log).is_empty());
        assert_eq!(
            reg.receiver.try_recv().unwrap(),
            Err(ReplError::LeadershipLost { term: 1, index: 2 })
        );
    }

    #[test]
    fn cancel_removes_only_registration() {
        let mut queue = WaiterQueue::new();
        let reg = queue.register(AckLevel::Quorum, 1, 1).unwrap();
        assert!(queue.cancel(reg.id));
        assert!(!queue.cancel(reg.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn fail_all_reports_leadership_lost() {
        let mut queue = WaiterQueue::new();
        let mut a = queue.register(AckLevel::Local, 1, 3).unwrap();
        let mut b = queue.register(AckLevel::Quorum, 2, 3).unwrap();
        assert_eq!(queue.fail_all(3), 2);
        assert!(a.receiver.try_recv().unwrap().unwrap_err().is_outcome_unknown());
        assert!(b.receiver.try_recv().unwrap().unwrap_err().is_outcome_unknown());
    }
}
