//! # trace
//!
//! why: record what every node believed at each step and check the protocol's safety rules over it
//! relations: snapshots come from replica.rs, recorded by coordinator.rs and secondary.rs,
//!            replayed by the repl-check binary
//! what: ServerSnapshot, TraceEvent, TraceRecorder, SystemState, TraceViolation, json-lines io

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::commit::CommitPoint;
use crate::node::{NodeId, Role};

/// One node's state at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub commit_point: CommitPoint,
    pub durable_position: u64,
    /// Term of every log entry, index 1 first
    pub log: Vec<u64>,
}

/// A node changed state because of `action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Global order across all recorded nodes
    pub seq: u64,
    pub action: String,
    pub snapshot: ServerSnapshot,
}

impl TraceEvent {
    pub fn node_id(&self) -> NodeId {
        self.snapshot.node_id
    }
}

/// Collects events in the order they are recorded
#[derive(Debug, Default)]
pub struct TraceRecorder {
    next_seq: u64,
    events: Vec<TraceEvent>,
}

/// Recorder shared between the coordinator and secondary drivers
pub type SharedRecorder = Arc<Mutex<TraceRecorder>>;

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRecorder {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record(&mut self, action: impl Into<String>, snapshot: ServerSnapshot) {
        self.next_seq += 1;
        self.events.push(TraceEvent {
            seq: self.next_seq,
            action: action.into(),
            snapshot,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

/// Record into a shared recorder; a poisoned lock drops the event.
pub fn record_shared(recorder: Option<&SharedRecorder>, action: &str, snapshot: impl FnOnce() -> ServerSnapshot) {
    if let Some(recorder) = recorder {
        if let Ok(mut recorder) = recorder.lock() {
            recorder.record(action, snapshot());
        }
    }
}

// -- json lines --

pub fn write_events<W: Write>(mut writer: W, events: &[TraceEvent]) -> std::io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

/// Read one event per non-blank line.
pub fn read_events<R: BufRead>(reader: R) -> std::io::Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("line {}: {e}", number + 1))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Merge per-node streams into one, ordered by `seq`.
pub fn merge_streams(streams: Vec<Vec<TraceEvent>>) -> Vec<TraceEvent> {
    let mut merged: Vec<TraceEvent> = streams.into_iter().flatten().collect();
    merged.sort_by_key(|e| e.seq);
    merged
}

// -- replay and invariants --

/// A broken safety rule found while replaying a trace
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceViolation {
    #[error("event {seq}: node {node} commit point regressed from {from} to {to}")]
    CommitRegressed { seq: u64, node: NodeId, from: CommitPoint, to: CommitPoint },

    #[error("event {seq}: node {node} commit point {commit} beyond its log of {log_len}")]
    CommitBeyondLog { seq: u64, node: NodeId, commit: CommitPoint, log_len: u64 },

    #[error("event {seq}: nodes {first} and {second} are both primary in term {term}")]
    TwoPrimaries { seq: u64, term: u64, first: NodeId, second: NodeId },

    #[error("event {seq}: primary {node} in term {term} lacks committed entry {committed}")]
    CommittedEntryLost { seq: u64, node: NodeId, term: u64, committed: CommitPoint },

    #[error("event {seq}: node {node} committed term {found} at index {index}, already committed as term {expected}")]
    CommitDiverged { seq: u64, node: NodeId, index: u64, expected: u64, found: u64 },
}

/// Cluster-wide state rebuilt from per-node snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    /// The highest term any node has reported
    pub global_current_term: u64,
    pub servers: BTreeMap<NodeId, ServerSnapshot>,
    /// Highest commit point any node has reported
    pub highest_commit: CommitPoint,
    /// Term of every entry known committed, index 1 first
    pub committed: Vec<u64>,
    pub last_action: String,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one node's snapshot and check every invariant the change
    /// could break.
    pub fn apply(&mut self, event: &TraceEvent) -> Vec<TraceViolation> {
        let mut violations = Vec::new();
        let seq = event.seq;
        let next = &event.snapshot;
        let node = next.node_id;

        if let Some(prev) = self.servers.get(&node) {
            if next.commit_point.index < prev.commit_point.index {
                violations.push(TraceViolation::CommitRegressed {
                    seq,
                    node,
                    from: prev.commit_point,
                    to: next.commit_point,
                });
            }
        }

        let log_len = next.log.len() as u64;
        if next.commit_point.index > log_len {
            violations.push(TraceViolation::CommitBeyondLog { seq, node, commit: next.commit_point, log_len });
        }

        // this node's committed prefix must agree with everything committed so far
        let reported = next.commit_point.index.min(log_len) as usize;
        let overlap = reported.min(self.committed.len());
        if let Some(i) = (0..overlap).find(|&i| next.log[i] != self.committed[i]) {
            violations.push(TraceViolation::CommitDiverged {
                seq,
                node,
                index: i as u64 + 1,
                expected: self.committed[i],
                found: next.log[i],
            });
        } else if reported > self.committed.len() {
            self.committed.extend_from_slice(&next.log[self.committed.len()..reported]);
        }

        if next.role == Role::Primary {
            let rival = self
                .servers
                .values()
                .find(|s| s.node_id != node && s.role == Role::Primary && s.term == next.term);
            if let Some(rival) = rival {
                violations.push(TraceViolation::TwoPrimaries {
                    seq,
                    term: next.term,
                    first: rival.node_id,
                    second: node,
                });
            }

            // every entry committed in this term or earlier must be in the log
            let lost = self
                .committed
                .iter()
                .zip(1..)
                .map(|(&term, index)| CommitPoint::new(term, index))
                .find(|&entry| entry.term <= next.term && !holds_entry(next, entry));
            if let Some(committed) = lost {
                violations.push(TraceViolation::CommittedEntryLost { seq, node, term: next.term, committed });
            }
        }

        if next.commit_point.index > self.highest_commit.index {
            self.highest_commit = next.commit_point;
        }
        self.global_current_term = self.global_current_term.max(next.term);
        self.last_action = event.action.clone();
        self.servers.insert(node, next.clone());
        violations
    }

    /// One line per server, for humans.
    pub fn pretty(&self) -> String {
        let mut out = format!("globalCurrentTerm={}\n", self.global_current_term);
        for server in self.servers.values() {
            let log = if server.log.is_empty() {
                "empty".to_string()
            } else {
                server.log.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
            };
            out.push_str(&format!(
                "server {}: state={}, term={}, commit point={}, durable={}, log=[{}]\n",
                server.node_id, server.role, server.term, server.commit_point, server.durable_position, log
            ));
        }
        out
    }
}

fn holds_entry(snapshot: &ServerSnapshot, entry: CommitPoint) -> bool {
    let index = entry.index as usize;
    index >= 1 && snapshot.log.get(index - 1) == Some(&entry.term)
}

/// Replay `events` in order; returns the final state and every violation.
pub fn check_trace(events: &[TraceEvent]) -> (SystemState, Vec<TraceViolation>) {
    let mut state = SystemState::new();
    let mut violations = Vec::new();
    for event in events {
        violations.extend(state.apply(event));
    }
    (state, violations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(node_id: NodeId, role: Role, term: u64, commit: u64, log: &[u64]) -> ServerSnapshot {
        let commit_term = if commit == 0 { 0 } else { log[commit as usize - 1] };
        ServerSnapshot {
            node_id,
            role,
            term,
            commit_point: CommitPoint::new(commit_term, commit),
            durable_position: log.len() as u64,
            log: log.to_vec(),
        }
    }

    fn events(snapshots: Vec<ServerSnapshot>) -> Vec<TraceEvent> {
        let mut recorder = TraceRecorder::new();
        for s in snapshots {
            recorder.record("Step", s);
        }
        recorder.into_events()
    }

    #[test]
    fn clean_trace_has_no_violations() {
        let trace = events(vec![
            snap(1, Role::Primary, 1, 0, &[1]),
            snap(2, Role::Secondary, 1, 0, &[1]),
            snap(1, Role::Primary, 1, 1, &[1]),
            snap(2, Role::Primary, 2, 1, &[1, 2]),
        ]);
        let (state, violations) = check_trace(&trace);
        assert!(violations.is_empty(), "{violations:?}");
        assert_eq!(state.global_current_term, 2);
        assert_eq!(state.highest_commit, CommitPoint::new(1, 1));
    }

    #[test]
    fn regressed_commit_detected() {
        let trace = events(vec![snap(1, Role::Primary, 1, 2, &[1, 1]), snap(1, Role::Primary, 1, 1, &[1, 1])]);
        let (_, violations) = check_trace(&trace);
        assert!(matches!(violations[..], [TraceViolation::CommitRegressed { node: 1, .. }]));
    }

    #[test]
    fn new_primary_missing_committed_entry_detected() {
        let trace = events(vec![
            snap(1, Role::Primary, 1, 2, &[1, 1]),
            snap(1, Role::Secondary, 2, 2, &[1, 1]),
            snap(2, Role::Primary, 2, 0, &[1]),
        ]);
        let (_, violations) = check_trace(&trace);
        assert!(matches!(
            violations[..],
            [TraceViolation::CommittedEntryLost { node: 2, term: 2, .. }]
        ));
    }

    #[test]
    fn primary_missing_an_earlier_committed_entry_detected() {
        // the newest committed entry matches, the first one does not
        let trace = events(vec![
            snap(1, Role::Primary, 2, 3, &[1, 2, 2]),
            snap(1, Role::Secondary, 3, 3, &[1, 2, 2]),
            snap(3, Role::Primary, 3, 0, &[2, 2, 2]),
        ]);
        let (_, violations) = check_trace(&trace);
        assert_eq!(
            violations,
            vec![TraceViolation::CommittedEntryLost {
                seq: 3,
                node: 3,
                term: 3,
                committed: CommitPoint::new(1, 1),
            }]
        );
    }

    #[test]
    fn diverging_commit_detected() {
        let trace = events(vec![snap(1, Role::Primary, 2, 2, &[1, 2]), snap(2, Role::Secondary, 2, 2, &[1, 1])]);
        let (state, violations) = check_trace(&trace);
        assert!(matches!(
            violations[..],
            [TraceViolation::CommitDiverged { node: 2, index: 2, expected: 2, found: 1, .. }]
        ));
        assert_eq!(state.committed, vec![1, 2]);
    }

    #[test]
    fn two_primaries_in_one_term_detected() {
        let trace = events(vec![snap(1, Role::Primary, 3, 0, &[]), snap(2, Role::Primary, 3, 0, &[])]);
        let (_, violations) = check_trace(&trace);
        assert!(matches!(violations[..], [TraceViolation::TwoPrimaries { term: 3, .. }]));
    }

    #[test]
    fn json_lines_and_merge_keep_order() {
        let all = events(vec![
            snap(1, Role::Primary, 1, 0, &[1]),
            snap(2, Role::Secondary, 1, 0, &[1]),
            snap(1, Role::Primary, 1, 1, &[1]),
        ]);
        let node1: Vec<_> = all.iter().filter(|e| e.node_id() == 1).cloned().collect();
        let node2: Vec<_> = all.iter().filter(|e| e.node_id() == 2).cloned().collect();

        let mut buf = Vec::new();
        write_events(&mut buf, &node1).unwrap();
        let node1 = read_events(buf.as_slice()).unwrap();

        assert_eq!(merge_streams(vec![node1, node2]), all);
    }
}
