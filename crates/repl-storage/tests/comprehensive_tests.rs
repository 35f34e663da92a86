//! # comprehensive storage tests
//!
//! why: verify persisted logs and commit points survive restarts and feed the replication core
//! relations: tests repl-storage crate against repl-core's Replica
//! what: meta persistence, log files, crash recovery, replicas over persistent logs

use repl_core::{AckLevel, Acknowledgment, CommitPoint, LogEntry, LogStore, ReplError, Replica, Role, Roster};
use repl_storage::{FileStorage, InMemoryStorage, PersistentLog, Storage, StoredMeta};
use std::fs;
use tempfile::tempdir;

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
    range.map(|i| LogEntry::new(term, i, format!("op{i}").into_bytes())).collect()
}

// =============================================================================
// SECTION 1: META TESTS
// =============================================================================

mod meta {
    use super::*;

    #[test]
    fn new_storage_has_default_meta() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_meta().unwrap(), StoredMeta::default());
        assert_eq!(InMemoryStorage::new().load_meta().unwrap(), StoredMeta::default());
    }

    #[test]
    fn overwrite_meta() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_meta(&StoredMeta { term: 1, commit_point: CommitPoint::new(1, 1) }).unwrap();
        let latest = StoredMeta { term: 3, commit_point: CommitPoint::new(2, 8) };
        storage.save_meta(&latest).unwrap();
        assert_eq!(storage.load_meta().unwrap(), latest);
        assert!(!dir.path().join("meta.tmp").exists());
    }

    #[test]
    fn corrupt_meta_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("meta.json"), "not json").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(storage.load_meta().is_err());
    }
}

// =============================================================================
// SECTION 2: LOG FILE TESTS
// =============================================================================

mod log_file {
    use super::*;

    #[test]
    fn empty_directory_has_empty_log() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested/node-1")).unwrap();
        assert!(storage.load_log().unwrap().is_empty());
        assert!(storage.dir().exists());
    }

    #[test]
    fn append_empty_batch_creates_nothing() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[]).unwrap();
        assert!(!dir.path().join("log.jsonl").exists());
    }

    #[test]
    fn appends_accumulate_across_reopen() {
        let dir = tempdir().unwrap();
        FileStorage::new(dir.path()).unwrap().append_entries(&entries(1, 1..=2)).unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(2, 3..=3)).unwrap();
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap().term, 2);
    }

    #[test]
    fn payload_bytes_survive() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let binary = LogEntry::new(1, 1, vec![0, 255, 10, 13]);
        storage.append_entries(std::slice::from_ref(&binary)).unwrap();
        assert_eq!(storage.load_log().unwrap(), vec![binary]);
    }
}

// =============================================================================
// SECTION 3: PERSISTENT LOG TESTS
// =============================================================================

mod persistent_log {
    use super::*;

    #[test]
    fn recovered_log_rejects_gaps() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[LogEntry::new(1, 1, vec![]), LogEntry::new(1, 3, vec![])]).unwrap();
        assert!(matches!(
            PersistentLog::open(storage),
            Err(ReplError::SequenceViolation { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn non_durable_suffix_truncates_without_storage() {
        let mut log = PersistentLog::open(InMemoryStorage::new()).unwrap();
        for entry in entries(1, 1..=4) {
            log.append(entry).unwrap();
        }
        log.mark_durable(2).unwrap();
        assert_eq!(log.truncate_after(2).unwrap().len(), 2);
        assert!(log.truncate_after(1).is_err());
        assert_eq!(log.storage().load_log().unwrap().len(), 2);
    }

    #[test]
    fn crash_loses_only_unflushed_entries() {
        let dir = tempdir().unwrap();
        {
            let mut log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
            for entry in entries(1, 1..=5) {
                log.append(entry).unwrap();
            }
            log.mark_durable(3).unwrap();
            log.save_meta(1, CommitPoint::new(1, 2)).unwrap();
        }

        let log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.durable_position(), 3);
        assert_eq!(log.load_meta().unwrap().commit_point, CommitPoint::new(1, 2));
    }
}

// =============================================================================
// SECTION 4: REPLICA OVER PERSISTENT LOG
// =============================================================================

mod replica_restart {
    use super::*;

    fn ack(node_id: u64, term: u64, durable_position: u64) -> Acknowledgment {
        Acknowledgment { node_id, term, durable_position }
    }

    #[test]
    fn primary_commits_only_flushed_entries() {
        let log = PersistentLog::open(InMemoryStorage::new()).unwrap();
        let mut replica = Replica::new(1, log, Roster::voting([1, 2, 3]));
        replica.change_role(Role::Primary, 1).unwrap();
        replica.submit(b"a".to_vec(), AckLevel::Quorum).unwrap();
        replica.submit(b"b".to_vec(), AckLevel::Quorum).unwrap();
        replica.mark_durable(1).unwrap();

        replica.handle_ack(&ack(2, 1, 1));
        assert_eq!(replica.commit_point(), CommitPoint::new(1, 1));
        assert_eq!(replica.log().storage().load_log().unwrap().len(), 1);
    }

    #[test]
    fn restarted_node_keeps_commit_point_as_new_term_floor() {
        let dir = tempdir().unwrap();
        let (term, commit) = {
            let log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
            let mut replica = Replica::new(1, log, Roster::voting([1, 2, 3]));
            replica.change_role(Role::Primary, 1).unwrap();
            for i in 0..3u8 {
                replica.submit(vec![i], AckLevel::Quorum).unwrap();
            }
            replica.mark_durable(3).unwrap();
            replica.handle_ack(&ack(3, 1, 3));
            let (term, commit) = (replica.term(), replica.commit_point());
            let mut log = replica.into_log();
            log.save_meta(term, commit).unwrap();
            (term, commit)
        };
        assert_eq!(commit, CommitPoint::new(1, 3));

        let log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
        let meta = log.load_meta().unwrap();
        assert_eq!(meta.term, term);
        let mut replica = Replica::new(1, log, Roster::voting([1, 2, 3])).with_commit_point(meta.commit_point);
        assert_eq!(replica.term(), 1);
        replica.change_role(Role::Primary, 2).unwrap();
        assert_eq!(replica.commit_point(), commit);

        replica.handle_ack(&ack(2, 2, 1));
        assert_eq!(replica.commit_point(), commit);
    }
}

// =============================================================================
// SECTION 5: FLUSH FAILURES
// =============================================================================

mod flush_failures {
    use super::*;
    use repl_core::{ReplConfig, WriteCoordinator};
    use std::io;
    use std::time::Duration;

    /// Storage whose log writes always fail
    #[derive(Debug, Default)]
    struct FullDisk {
        inner: InMemoryStorage,
    }

    impl Storage for FullDisk {
        fn save_meta(&mut self, meta: &StoredMeta) -> io::Result<()> {
            self.inner.save_meta(meta)
        }

        fn load_meta(&self) -> io::Result<StoredMeta> {
            self.inner.load_meta()
        }

        fn append_entries(&mut self, _entries: &[LogEntry]) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }

        fn load_log(&self) -> io::Result<Vec<LogEntry>> {
            self.inner.load_log()
        }
    }

    fn ack(node_id: u64, term: u64, durable_position: u64) -> Acknowledgment {
        Acknowledgment { node_id, term, durable_position }
    }

    #[test]
    fn failed_flush_leaves_durable_position() {
        let mut log = PersistentLog::open(FullDisk::default()).unwrap();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        assert!(matches!(log.mark_durable(1), Err(ReplError::Storage(_))));
        assert_eq!(log.durable_position(), 0);
        assert_eq!(log.last_index(), 1);
    }

    #[tokio::test]
    async fn write_is_accepted_when_flush_fails() {
        let log = PersistentLog::open(FullDisk::default()).unwrap();
        let mut replica = Replica::new(1, log, Roster::voting([1, 2, 3]));
        replica.change_role(Role::Primary, 1).unwrap();
        let (coordinator, primary) = WriteCoordinator::spawn(replica, Vec::new(), &ReplConfig::default(), None);

        let pending = coordinator.submit(b"a".to_vec(), AckLevel::Quorum).await.unwrap();
        assert_eq!(pending.index(), 1);

        // the secondaries hold the entry even though the primary could not flush it
        coordinator.acknowledge(ack(2, 1, 1)).await.unwrap();
        coordinator.acknowledge(ack(3, 1, 1)).await.unwrap();
        let receipt = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(receipt.index, 1);

        drop(coordinator);
        let replica = primary.await.unwrap();
        assert_eq!(replica.commit_point(), CommitPoint::new(1, 1));
        assert_eq!(replica.log().durable_position(), 0);
    }

    #[tokio::test]
    async fn local_write_stays_unknown_when_flush_fails() {
        let log = PersistentLog::open(FullDisk::default()).unwrap();
        let mut replica = Replica::new(1, log, Roster::voting([1, 2, 3]));
        replica.change_role(Role::Primary, 1).unwrap();
        let config = ReplConfig { write_timeout_ms: 50, ..ReplConfig::default() };
        let (coordinator, _primary) = WriteCoordinator::spawn(replica, Vec::new(), &config, None);

        let err = coordinator.write(b"a".to_vec(), Some(AckLevel::Local)).await.unwrap_err();
        assert_eq!(err, ReplError::ResultUnknown { term: 1, index: 1 });
    }
}
