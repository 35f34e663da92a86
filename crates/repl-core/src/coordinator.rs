//! # coordinator
//!
//! why: serve client writes on the primary and release them as durability arrives
//! relations: owns a replica.rs Replica and its link.rs links inside one tokio task;
//!            fed acknowledgments by secondary.rs, events by the election/catch-up layers
//! what: WriteCoordinator (cloneable handle), PendingWrite, the actor loop

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReplConfig;
use crate::error::ReplError;
use crate::link::ReplicationLink;
use crate::log::LogStore;
use crate::message::{Acknowledgment, ClusterEvent};
use crate::node::{NodeId, Role};
use crate::replica::Replica;
use crate::trace::{record_shared, ServerSnapshot, SharedRecorder};
use crate::waiter::{AckLevel, Registration, WaiterId, WriteReceipt};

enum Command {
    Submit {
        payload: Vec<u8>,
        level: AckLevel,
        reply: oneshot::Sender<Result<Accepted, ReplError>>,
    },
    Ack(Acknowledgment),
    MarkDurable {
        index: u64,
        reply: oneshot::Sender<Result<u64, ReplError>>,
    },
    Event {
        event: ClusterEvent,
        reply: oneshot::Sender<Result<(), ReplError>>,
    },
    Abandon(WaiterId),
    Snapshot(oneshot::Sender<ServerSnapshot>),
}

struct Accepted {
    term: u64,
    index: u64,
    registration: Option<Registration>,
}

/// Handle to a node's write path. Cheap to clone; the actor stops once every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct WriteCoordinator {
    node_id: NodeId,
    commands: mpsc::Sender<Command>,
    write_timeout: Duration,
    default_level: AckLevel,
}

impl WriteCoordinator {
    /// Start the actor for `replica`, shipping to `links`. The join handle
    /// yields the replica back once every handle is gone.
    pub fn spawn<L>(
        replica: Replica<L>,
        links: Vec<ReplicationLink>,
        config: &ReplConfig,
        recorder: Option<SharedRecorder>,
    ) -> (Self, JoinHandle<Replica<L>>)
    where
        L: LogStore + Send + 'static,
    {
        let (commands, inbox) = mpsc::channel(config.command_capacity.max(1));
        let handle = Self {
            node_id: replica.id(),
            commands,
            write_timeout: config.write_timeout(),
            default_level: config.default_ack_level,
        };
        let actor = Actor {
            replica,
            links: links.into_iter().map(|l| (l.target(), l)).collect(),
            flush_on_append: config.flush_on_append,
            recorder,
        };
        let task = tokio::spawn(actor.run(inbox));
        (handle, task)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ReplError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ReplError::Shutdown)?;
        response.await.map_err(|_| ReplError::Shutdown)
    }

    /// Append `payload` on the primary. Returns as soon as the entry is in
    /// the primary's log; await the handle for the requested durability.
    pub async fn submit(&self, payload: Vec<u8>, level: AckLevel) -> Result<PendingWrite, ReplError> {
        let accepted = self
            .request(|reply| Command::Submit { payload, level, reply })
            .await??;
        Ok(PendingWrite {
            term: accepted.term,
            index: accepted.index,
            level,
            registration: accepted.registration,
            commands: self.commands.clone(),
        })
    }

    /// Submit and wait with the configured timeout.
    pub async fn write(&self, payload: Vec<u8>, level: Option<AckLevel>) -> Result<WriteReceipt, ReplError> {
        let level = level.unwrap_or(self.default_level);
        self.submit(payload, level).await?.wait(self.write_timeout).await
    }

    /// Deliver an acknowledgment from a secondary. Delivery is fire-and-forget.
    pub async fn acknowledge(&self, ack: Acknowledgment) -> Result<(), ReplError> {
        self.commands
            .send(Command::Ack(ack))
            .await
            .map_err(|_| ReplError::Shutdown)
    }

    /// Storage flushed the primary's log through `index`. Returns the
    /// resulting durable position.
    pub async fn mark_durable(&self, index: u64) -> Result<u64, ReplError> {
        self.request(|reply| Command::MarkDurable { index, reply }).await?
    }

    pub async fn apply_event(&self, event: ClusterEvent) -> Result<(), ReplError> {
        self.request(|reply| Command::Event { event, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ServerSnapshot, ReplError> {
        self.request(Command::Snapshot).await
    }

    /// An acknowledgment channel that does not keep the actor alive.
    pub fn ack_sink(&self) -> AckSink {
        AckSink {
            commands: self.commands.downgrade(),
        }
    }
}

/// Where secondaries send acknowledgments. Fails with `Shutdown` once the
/// coordinator has stopped.
#[derive(Debug, Clone)]
pub struct AckSink {
    commands: mpsc::WeakSender<Command>,
}

impl AckSink {
    pub async fn send(&self, ack: Acknowledgment) -> Result<(), ReplError> {
        let commands = self.commands.upgrade().ok_or(ReplError::Shutdown)?;
        commands
            .send(Command::Ack(ack))
            .await
            .map_err(|_| ReplError::Shutdown)
    }
}

/// A write that is in the log and may still be waiting for durability.
///
/// Dropping it without waiting abandons the wait only; the entry stays.
#[derive(Debug)]
pub struct PendingWrite {
    term: u64,
    index: u64,
    level: AckLevel,
    registration: Option<Registration>,
    commands: mpsc::Sender<Command>,
}

impl PendingWrite {
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Wait for release. A timeout reports `ResultUnknown`, never failure:
    /// the entry can still commit after the caller stops waiting.
    pub async fn wait(mut self, timeout: Duration) -> Result<WriteReceipt, ReplError> {
        let Some(registration) = self.registration.as_mut() else {
            return Ok(WriteReceipt { term: self.term, index: self.index, level: self.level });
        };
        match tokio::time::timeout(timeout, &mut registration.receiver).await {
            Ok(Ok(result)) => {
                self.registration = None;
                result
            }
            Ok(Err(_)) => {
                self.registration = None;
                Err(ReplError::Shutdown)
            }
            Err(_) => Err(ReplError::ResultUnknown { term: self.term, index: self.index }),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            let _ = self.commands.try_send(Command::Abandon(registration.id));
        }
    }
}

// -- actor --

struct Actor<L: LogStore> {
    replica: Replica<L>,
    links: BTreeMap<NodeId, ReplicationLink>,
    flush_on_append: bool,
    recorder: Option<SharedRecorder>,
}

impl<L: LogStore> Actor<L> {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>) -> Replica<L> {
        debug!(node = self.replica.id(), "write coordinator started");
        while let Some(command) = inbox.recv().await {
            self.handle(command);
            self.ship();
        }
        debug!(node = self.replica.id(), "write coordinator stopped");
        self.replica
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { payload, level, reply } => {
                let result = self.submit(payload, level);
                if let Err(Ok(accepted)) = reply.send(result) {
                    // caller vanished before hearing back; drop its waiter
                    if let Some(registration) = accepted.registration {
                        self.replica.abandon(registration.id);
                    }
                }
            }
            Command::Ack(ack) => {
                let (outcome, released) = self.replica.handle_ack(&ack);
                if outcome.is_applied() {
                    self.record("Ack");
                }
                self.after_release(&released);
            }
            Command::MarkDurable { index, reply } => {
                let result = self.replica.mark_durable(index).map(|released| {
                    self.after_release(&released);
                    self.replica.log().durable_position()
                });
                let _ = reply.send(result);
            }
            Command::Event { event, reply } => {
                let result = self.replica.apply_event(&event).map(|released| {
                    self.record(event_action(&event));
                    self.after_release(&released);
                });
                let _ = reply.send(result);
            }
            Command::Abandon(id) => {
                if self.replica.abandon(id) {
                    debug!(waiter = id, "waiter abandoned");
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.replica.snapshot());
            }
        }
    }

    fn submit(&mut self, payload: Vec<u8>, level: AckLevel) -> Result<Accepted, ReplError> {
        let submitted = self.replica.submit(payload, level)?;
        self.record("ClientWrite");
        // the entry is in the log now; a failed flush leaves its waiter
        // pending for quorum acks, a later flush or the caller's timeout
        if self.flush_on_append {
            match self.replica.mark_durable(submitted.index) {
                Ok(released) => self.after_release(&released),
                Err(err) => warn!(index = submitted.index, %err, "flush after append failed"),
            }
        }
        Ok(Accepted {
            term: submitted.term,
            index: submitted.index,
            registration: submitted.registration,
        })
    }

    fn after_release(&mut self, released: &[WriteReceipt]) {
        if released.iter().any(|r| r.level == AckLevel::Quorum) {
            self.record("AdvanceCommitPoint");
        }
        if let Some(last) = released.last() {
            debug!(count = released.len(), through = last.index, "released waiters");
        }
    }

    fn record(&self, action: &str) {
        record_shared(self.recorder.as_ref(), action, || self.replica.snapshot());
    }

    /// Push unsent entries and the commit index down every live link.
    fn ship(&mut self) {
        if !self.replica.is_primary() {
            return;
        }
        let id = self.replica.id();
        let term = self.replica.term();
        let commit = self.replica.commit_point().index;
        let mut closed = Vec::new();
        for (target, link) in self.links.iter_mut() {
            if let Err(err) = link.ship_all(id, term, self.replica.log(), commit) {
                warn!(%err, "dropping replication link");
                closed.push(*target);
            }
        }
        for target in closed {
            self.links.remove(&target);
            if self.links.is_empty() {
                info!(node = id, "no replication links left");
            }
        }
    }
}

fn event_action(event: &ClusterEvent) -> &'static str {
    match event {
        ClusterEvent::RoleChange { new_role: Role::Primary, .. } => "BecomePrimary",
        ClusterEvent::RoleChange { .. } => "StepDown",
        ClusterEvent::CatchUpComplete { .. } => "CatchUpComplete",
    }
}
