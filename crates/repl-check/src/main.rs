//! # repl-check
//!
//! why: run and audit replication histories against the commit-point safety rules
//! relations: drives repl-core's coordinator and secondaries, persists through repl-storage
//! what: `check` replays recorded traces, `simulate` runs an in-process cluster and checks its trace

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use repl_core::trace::{check_trace, merge_streams, read_events, record_shared, write_events};
use repl_core::{
    link, serve_secondary, AckLevel, ClusterConfig, ClusterEvent, CommitPoint, LogStore, MemoryLog, NodeId,
    Replica, Role, TraceEvent, TraceRecorder, WriteCoordinator,
};
use repl_storage::{FileStorage, PersistentLog};
use tracing::{info, warn};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "repl-check", about = "Check replicated-log commit point traces")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay JSON-lines traces and report every safety violation.
    Check(CheckArgs),
    /// Run an in-process cluster, record its trace and check it.
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug, Clone)]
struct CheckArgs {
    /// Trace files, typically one per server. Merged by sequence number.
    #[arg(required = true)]
    traces: Vec<PathBuf>,

    /// Print the final cluster state.
    #[arg(long)]
    show_state: bool,
}

#[derive(Parser, Debug, Clone)]
struct SimulateArgs {
    /// Cluster config (JSON). Defaults to three voting nodes with node 1 primary.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of client writes to issue.
    #[arg(long, default_value_t = 100)]
    writes: usize,

    /// Acknowledgment level for every write: none, local or quorum.
    #[arg(long, value_parser = parse_ack_level)]
    ack_level: Option<AckLevel>,

    /// Complete catch-up for every catching-up member after this many writes.
    #[arg(long)]
    catch_up_after: Option<usize>,

    /// Persist each node's log under `<data-dir>/node-<id>`. A second run
    /// over the same directory resumes in a new term.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Where to write the recorded trace.
    #[arg(long, default_value = "trace.jsonl")]
    out: PathBuf,
}

fn parse_ack_level(s: &str) -> Result<AckLevel, String> {
    match s {
        "none" => Ok(AckLevel::None),
        "local" => Ok(AckLevel::Local),
        "quorum" => Ok(AckLevel::Quorum),
        other => Err(format!("unknown ack level `{other}` (expected none, local or quorum)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Check(args) => check(args),
        Command::Simulate(args) => simulate(args).await,
    }
}

// -- check --

fn load_trace(path: &Path) -> anyhow::Result<Vec<TraceEvent>> {
    let file = File::open(path).with_context(|| format!("open trace {}", path.display()))?;
    read_events(BufReader::new(file)).with_context(|| format!("read trace {}", path.display()))
}

fn check(args: CheckArgs) -> anyhow::Result<()> {
    let streams = args
        .traces
        .iter()
        .map(|path| load_trace(path))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let events = merge_streams(streams);
    report(&events, args.show_state)
}

/// Replay `events`, print what was found and fail on any violation.
fn report(events: &[TraceEvent], show_state: bool) -> anyhow::Result<()> {
    let (state, violations) = check_trace(events);
    if show_state {
        print!("{}", state.pretty());
    }
    for violation in &violations {
        println!("violation: {violation}");
    }
    if !violations.is_empty() {
        bail!("{} invariant violation(s) in {} events", violations.len(), events.len());
    }
    println!(
        "ok: {} events, {} servers, highest commit point {}",
        events.len(),
        state.servers.len(),
        state.highest_commit
    );
    Ok(())
}

// -- simulate --

/// What the simulated client does.
#[derive(Debug, Clone, Copy)]
struct Workload {
    writes: usize,
    level: AckLevel,
    catch_up_after: Option<usize>,
}

/// Result of one simulated run.
struct Outcome<L: LogStore> {
    replicas: Vec<Replica<L>>,
    events: Vec<TraceEvent>,
    committed: CommitPoint,
    acknowledged: usize,
    unknown: usize,
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ClusterConfig::load(path).with_context(|| format!("load config {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    config.validate().context("invalid cluster config")?;
    let workload = Workload {
        writes: args.writes,
        level: args.ack_level.unwrap_or(config.replication.default_ack_level),
        catch_up_after: args.catch_up_after,
    };

    let events = match &args.data_dir {
        Some(dir) => {
            let outcome = run_cluster(&config, workload, |id| open_persistent(dir, id)).await?;
            summarize(&outcome);
            for replica in outcome.replicas {
                let (id, term, commit) = (replica.id(), replica.term(), replica.commit_point());
                replica
                    .into_log()
                    .save_meta(term, commit)
                    .with_context(|| format!("persist meta for node {id}"))?;
            }
            outcome.events
        }
        None => {
            let outcome = run_cluster(&config, workload, |_| Ok((MemoryLog::new(), CommitPoint::ZERO))).await?;
            summarize(&outcome);
            outcome.events
        }
    };

    let file = File::create(&args.out).with_context(|| format!("create {}", args.out.display()))?;
    write_events(BufWriter::new(file), &events).with_context(|| format!("write {}", args.out.display()))?;
    info!(path = %args.out.display(), events = events.len(), "trace written");
    report(&events, false)
}

fn open_persistent(dir: &Path, id: NodeId) -> anyhow::Result<(PersistentLog<FileStorage>, CommitPoint)> {
    let node_dir = dir.join(format!("node-{id}"));
    let storage = FileStorage::new(&node_dir).with_context(|| format!("open {}", node_dir.display()))?;
    let log = PersistentLog::open(storage).with_context(|| format!("recover log for node {id}"))?;
    let meta = log.load_meta()?;
    Ok((log, meta.commit_point))
}

fn summarize<L: LogStore>(outcome: &Outcome<L>) {
    info!(
        acknowledged = outcome.acknowledged,
        unknown = outcome.unknown,
        committed = %outcome.committed,
        "simulation finished"
    );
    for replica in &outcome.replicas {
        info!(
            node = replica.id(),
            role = %replica.role(),
            last_index = replica.log().last_index(),
            commit = %replica.commit_point(),
            "final replica state"
        );
    }
}

/// Highest index at which both logs hold an entry of the same term.
fn matching_prefix<P: LogStore, S: LogStore>(primary: &P, secondary: &S) -> u64 {
    let mut index = primary.last_index().min(secondary.last_index());
    while index > 0 && primary.term_at(index) != secondary.term_at(index) {
        index -= 1;
    }
    index
}

/// Start every member, promote the configured primary in a fresh term, run
/// the workload and shut everything down again.
async fn run_cluster<L, F>(config: &ClusterConfig, workload: Workload, mut open: F) -> anyhow::Result<Outcome<L>>
where
    L: LogStore + Send + 'static,
    F: FnMut(NodeId) -> anyhow::Result<(L, CommitPoint)>,
{
    let roster = config.roster();
    let recorder = TraceRecorder::shared();

    let mut replicas = BTreeMap::new();
    for member in &config.members {
        let (log, commit) = open(member.id)?;
        let replica = Replica::new(member.id, log, roster.clone()).with_commit_point(commit);
        replicas.insert(member.id, replica);
    }
    let term = replicas
        .values()
        .map(|r| r.term() + 1)
        .max()
        .unwrap_or(1)
        .max(config.initial_term);

    let mut primary = replicas
        .remove(&config.primary)
        .ok_or_else(|| anyhow!("primary {} is not a member", config.primary))?;
    primary.change_role(Role::Primary, term)?;
    record_shared(Some(&recorder), "BecomePrimary", || primary.snapshot());
    info!(node = primary.id(), term, "simulated primary elected");

    let mut links = Vec::new();
    let mut secondaries = Vec::new();
    for (id, mut replica) in replicas {
        let matched = matching_prefix(primary.log(), replica.log());
        if replica.log().last_index() > matched {
            replica
                .rollback_to(matched)
                .with_context(|| format!("node {id} diverges from the primary after index {matched}; wipe the data dir"))?;
        }
        let (l, inbound) = link(id, matched + 1, config.replication.link_capacity, config.replication.max_batch);
        links.push(l);
        secondaries.push((replica, inbound));
    }

    let (coordinator, primary_task) =
        WriteCoordinator::spawn(primary, links, &config.replication, Some(recorder.clone()));
    let drivers: Vec<_> = secondaries
        .into_iter()
        .map(|(replica, inbound)| {
            tokio::spawn(serve_secondary(replica, inbound, coordinator.ack_sink(), Some(recorder.clone())))
        })
        .collect();

    let (acknowledged, unknown) = drive(&coordinator, config, workload).await?;
    let committed = coordinator.snapshot().await?.commit_point;
    drop(coordinator);

    let mut finished = vec![primary_task.await.context("primary task failed")?];
    for driver in drivers {
        finished.push(driver.await.context("secondary task failed")?);
    }
    let events = recorder
        .lock()
        .map_err(|_| anyhow!("trace recorder poisoned"))?
        .events()
        .to_vec();

    Ok(Outcome { replicas: finished, events, committed, acknowledged, unknown })
}

/// Issue the workload's writes one at a time. Returns how many were
/// acknowledged and how many ended with an unknown outcome.
async fn drive(
    coordinator: &WriteCoordinator,
    config: &ClusterConfig,
    workload: Workload,
) -> anyhow::Result<(usize, usize)> {
    let catching_up: Vec<NodeId> = config.members.iter().filter(|m| m.catching_up).map(|m| m.id).collect();
    let timeout = config.replication.write_timeout();
    let (mut acknowledged, mut unknown) = (0, 0);

    for n in 0..workload.writes {
        if workload.catch_up_after == Some(n) {
            let at_index = coordinator.snapshot().await?.log.len() as u64;
            for &node_id in &catching_up {
                coordinator.apply_event(ClusterEvent::CatchUpComplete { node_id, at_index }).await?;
            }
        }

        let pending = coordinator.submit(format!("op-{n}").into_bytes(), workload.level).await?;
        if !config.replication.flush_on_append {
            coordinator.mark_durable(pending.index()).await?;
        }
        match pending.wait(timeout).await {
            Ok(_) => acknowledged += 1,
            Err(err) if err.is_outcome_unknown() => {
                warn!(%err, "write outcome unknown");
                unknown += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((acknowledged, unknown))
}
