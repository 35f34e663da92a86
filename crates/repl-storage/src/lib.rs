//! # repl-storage
//!
//! why: make a node's operation log and commit point survive restarts using standard rust fs apis
//! relations: implements repl-core's LogStore contract, used by repl-check for on-disk clusters
//! what: Storage trait, FileStorage, InMemoryStorage, PersistentLog, StoredMeta

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use repl_core::{CommitPoint, LogEntry, LogStore, MemoryLog, ReplError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// trait for durable storage of a node's replication state
///
/// entries handed to `append_entries` are on stable storage when it returns;
/// that is what lets the log report them as durable. stored entries are
/// never rewritten since durable entries are never rolled back
pub trait Storage {
    /// persist the node's term and the last commit point it knew
    fn save_meta(&mut self, meta: &StoredMeta) -> io::Result<()>;

    /// load the persisted meta, or the default for a new node
    fn load_meta(&self) -> io::Result<StoredMeta>;

    /// append entries to the end of the stored log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;
}

/// what a node remembers besides its log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMeta {
    pub term: u64,
    pub commit_point: CommitPoint,
}

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores state in a directory with:
/// - meta.json: term and commit point, replaced atomically
/// - log.jsonl: one entry per line, append-only
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// atomic write: write to temp file then rename
    fn replace(&self, name: &str, target: PathBuf, contents: &[u8]) -> io::Result<()> {
        let temp_path = self.dir.join(name);
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)
    }
}

fn encode_lines(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry).map_err(invalid_data)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

impl Storage for FileStorage {
    fn save_meta(&mut self, meta: &StoredMeta) -> io::Result<()> {
        let json = serde_json::to_string_pretty(meta).map_err(invalid_data)?;
        self.replace("meta.tmp", self.meta_path(), json.as_bytes())
    }

    fn load_meta(&self) -> io::Result<StoredMeta> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(StoredMeta::default());
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        serde_json::from_str(&contents).map_err(invalid_data)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(entries)?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        file.write_all(&buf)?;
        file.sync_all()
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let lines: Vec<String> = BufReader::new(File::open(&path)?).lines().collect::<io::Result<_>>()?;
        let mut log = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => log.push(entry),
                // a crash mid-append leaves at most one torn line at the end
                Err(e) if number + 1 == lines.len() => {
                    warn!(path = %path.display(), line = number + 1, %e, "ignoring torn log tail");
                }
                Err(e) => return Err(invalid_data(format!("line {}: {e}", number + 1))),
            }
        }
        Ok(log)
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    meta: StoredMeta,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_meta(&mut self, meta: &StoredMeta) -> io::Result<()> {
        self.meta = *meta;
        Ok(())
    }

    fn load_meta(&self) -> io::Result<StoredMeta> {
        Ok(self.meta)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }
}

// -- persistent log --

fn storage_error(e: io::Error) -> ReplError {
    ReplError::Storage(e.to_string())
}

/// a LogStore whose durable prefix lives in a Storage
///
/// appends stay in memory until `mark_durable` writes them out; the durable
/// position only moves once the write has returned
#[derive(Debug)]
pub struct PersistentLog<S: Storage> {
    storage: S,
    log: MemoryLog,
}

impl<S: Storage> PersistentLog<S> {
    /// recover the log held by `storage`; every stored entry is durable
    pub fn open(storage: S) -> Result<Self, ReplError> {
        let entries = storage.load_log().map_err(storage_error)?;
        let log = MemoryLog::recover(entries)?;
        debug!(entries = log.len(), "recovered log from storage");
        Ok(Self { storage, log })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn load_meta(&self) -> Result<StoredMeta, ReplError> {
        self.storage.load_meta().map_err(storage_error)
    }

    pub fn save_meta(&mut self, term: u64, commit_point: CommitPoint) -> Result<(), ReplError> {
        self.storage
            .save_meta(&StoredMeta { term, commit_point })
            .map_err(storage_error)
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

impl<S: Storage> LogStore for PersistentLog<S> {
    fn append(&mut self, entry: LogEntry) -> Result<u64, ReplError> {
        self.log.append(entry)
    }

    fn mark_durable(&mut self, index: u64) -> Result<bool, ReplError> {
        let durable = self.log.durable_position();
        if index <= durable || index > self.log.last_index() {
            return self.log.mark_durable(index);
        }
        let count = (index - durable) as usize;
        let unflushed = &self.log.entries_from(durable + 1)[..count];
        self.storage.append_entries(unflushed).map_err(storage_error)?;
        self.log.mark_durable(index)
    }

    fn truncate_after(&mut self, index: u64) -> Result<Vec<LogEntry>, ReplError> {
        let removed = self.log.truncate_after(index)?;
        // only the non-durable suffix can go, and it was never written out
        debug_assert!(removed.iter().all(|e| e.index > self.log.durable_position()));
        Ok(removed)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry(index)
    }

    fn entries_from(&self, index: u64) -> &[LogEntry] {
        self.log.entries_from(index)
    }

    fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    fn durable_position(&self) -> u64 {
        self.log.durable_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_storage_persists_meta() {
        let mut storage = InMemoryStorage::new();
        let meta = StoredMeta { term: 5, commit_point: CommitPoint::new(4, 9) };
        storage.save_meta(&meta).unwrap();
        assert_eq!(storage.load_meta().unwrap(), meta);
    }

    #[test]
    fn in_memory_storage_appends_log() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[LogEntry::new(1, 1, vec![1])]).unwrap();
        storage.append_entries(&[LogEntry::new(1, 2, vec![2])]).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 2);
    }

    #[test]
    fn file_storage_appends_in_order() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        storage.append_entries(&[LogEntry::new(1, 2, b"b".to_vec())]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(log[1].payload, b"b".to_vec());
    }

    #[test]
    fn file_storage_ignores_torn_tail() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, vec![])]).unwrap();
        let mut file = OpenOptions::new().append(true).open(dir.path().join("log.jsonl")).unwrap();
        file.write_all(b"{\"term\":1,\"ind").unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 1);
    }

    #[test]
    fn file_storage_rejects_corrupt_middle() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("log.jsonl"), "garbage\n{\"term\":1,\"index\":1,\"payload\":[]}\n").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_log().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn persistent_log_writes_only_on_mark_durable() {
        let mut log = PersistentLog::open(InMemoryStorage::new()).unwrap();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(1, 2, vec![])).unwrap();
        assert!(log.storage().load_log().unwrap().is_empty());

        assert!(log.mark_durable(1).unwrap());
        assert_eq!(log.storage().load_log().unwrap().len(), 1);
        assert!(!log.mark_durable(1).unwrap());
        assert_eq!(log.storage().load_log().unwrap().len(), 1);

        assert!(log.mark_durable(2).unwrap());
        assert_eq!(log.storage().load_log().unwrap().len(), 2);
    }

    #[test]
    fn persistent_log_refuses_mark_past_end() {
        let mut log = PersistentLog::open(InMemoryStorage::new()).unwrap();
        assert!(matches!(log.mark_durable(1), Err(ReplError::OutOfRange { index: 1, .. })));
        assert!(log.storage().load_log().unwrap().is_empty());
    }

    #[test]
    fn persistent_log_recovers_durable_prefix_only() {
        let dir = tempdir().unwrap();
        {
            let mut log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
            for i in 1..=3 {
                log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
            }
            log.mark_durable(2).unwrap();
        }

        let log = PersistentLog::open(FileStorage::new(dir.path()).unwrap()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.durable_position(), 2);
    }
}
