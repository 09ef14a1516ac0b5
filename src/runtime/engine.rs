//! Scenario engine: drive the actors under capture, then replay the capture through the verifier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{
    Actor, ActorAction, ActorId, CatalogEntry, Capture, Clock, CommandCapture, CommandMounter, Config,
    ConflictKind, DelegError, DelegResult, DelegationType, ExitStatus, HostRunner, HumanDuration, LocalActor, LockKind,
    LockRange, Mounter, OpenMode, PacketEvent, ProcessActor, ReplayTarget, Reporter, RunIdentity, RunSummary,
    ScenarioConfig, ScenarioKind, ScenarioReport, SshRunner, TraceFile, VerificationResult, WallClock,
    check_file_size, select_scenarios, verify_basic, verify_recall, wall_time_iso_utc, write_report,
};

const ANCHOR: u32 = 0;
const MAIN: u32 = 1;
const REOPEN_READ: u32 = 2;
const REOPEN_WRITE: u32 = 3;

/// Mode the peer chmods the file to.
const CONFLICT_MODE: u32 = 0o600;
/// Bytes the peer reads or writes after opening for a conflict.
const CONFLICT_IO: u64 = 4096;

/// Where a scenario got to. Reported for scenarios that end in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Prepared,
    Mounted,
    MountedBoth,
    DelegationRequested,
    LocalContentionProbed,
    DelegationGranted,
    PartialIo,
    ConflictInjected,
    Captured,
    Recalled,
    NotRecalled,
    ReturnSequence,
    Verified,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prepared => "prepared",
            Self::Mounted => "mounted",
            Self::MountedBoth => "mounted_both",
            Self::DelegationRequested => "delegation_requested",
            Self::LocalContentionProbed => "local_contention_probed",
            Self::DelegationGranted => "delegation_granted",
            Self::PartialIo => "partial_io",
            Self::ConflictInjected => "conflict_injected",
            Self::Captured => "captured",
            Self::Recalled => "recalled",
            Self::NotRecalled => "not_recalled",
            Self::ReturnSequence => "return_sequence",
            Self::Verified => "verified",
        }
    }
}

pub struct PeerRig {
    pub mount: Box<dyn Mounter>,
    pub actor: Box<dyn Actor>,
    /// The peer's address on the wire.
    pub addr: String,
}

/// Everything a scenario touches outside the verifier.
pub struct Rig {
    pub capture: Box<dyn Capture>,
    pub mount: Box<dyn Mounter>,
    pub local: Box<dyn Actor>,
    pub child: Box<dyn Actor>,
    pub peer: Option<PeerRig>,
    pub clock: Box<dyn Clock>,
}

impl Rig {
    /// Real mounts, a real capture, `program child` for the child actor, ssh for the peer.
    pub fn live(config: &Config, workdir: &Path, program: impl Into<String>) -> DelegResult<Self> {
        config.validate_live()?;
        let program = program.into();
        let peer = config.peer.as_ref().zip(config.peer_mount_spec()).map(|(p, spec)| PeerRig {
            mount: Box::new(CommandMounter::new(spec, Box::new(SshRunner::new(&p.ssh_target)))),
            actor: Box::new(ProcessActor::new(
                ActorId::Peer,
                Box::new(SshRunner::new(&p.ssh_target)),
                p.program.clone(),
            )),
            addr: p.addr.clone(),
        });
        Ok(Self {
            capture: Box::new(CommandCapture::new(config.capture.clone(), &config.server, workdir)),
            mount: Box::new(CommandMounter::new(config.mount_spec(), Box::new(HostRunner))),
            local: Box::new(LocalActor::new()),
            child: Box::new(ProcessActor::new(ActorId::Child, Box::new(HostRunner), program)),
            peer,
            clock: Box::new(WallClock),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub globs: Vec<String>,
    /// Only scenarios for this delegation type.
    pub deleg: Option<DelegationType>,
    pub lock_range: Option<LockRange>,
    /// Open-for-write conflicts truncate instead of appending.
    pub truncate: bool,
    pub settle: Option<HumanDuration>,
    pub file_size: Option<u64>,
    pub reporter: Option<Reporter>,
}

/// Identity and artifact directory of one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: String,
    pub artifacts_dir: PathBuf,
}

impl RunPlan {
    pub fn new(config: &Config) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            artifacts_dir: config.runs_dir().join(&run_id),
            run_id,
        }
    }
}

/// Settings a scenario runs with, after CLI overrides.
#[derive(Debug, Clone)]
struct Settings {
    file_name: String,
    file_size: u64,
    settle: Duration,
    client_addr: String,
    server_addr: String,
}

/// Catalog entries for a run, with run options applied, plus why any were left out.
pub fn plan_scenarios(config: &Config, opts: &RunOptions, peer_available: bool) -> DelegResult<(Vec<CatalogEntry>, Vec<String>)> {
    let lock_range = opts.lock_range.unwrap_or_else(|| config.lock_range());
    let mut notes = Vec::new();
    let mut skipped = Vec::new();
    let mut out = Vec::new();
    for mut entry in select_scenarios(&opts.globs)? {
        if opts.deleg.is_some_and(|d| d != entry.config.delegation_type) {
            continue;
        }
        if entry.kind() == ScenarioKind::Recall && !peer_available {
            skipped.push(entry.name);
            continue;
        }
        entry.config.lock_range = lock_range;
        entry.config.truncate_on_conflict = opts.truncate && entry.config.conflict == Some(ConflictKind::OpenWrite);
        out.push(entry);
    }
    if !skipped.is_empty() {
        notes.push(format!("skipped (no peer configured): {}", skipped.join(", ")));
    }
    Ok((out, notes))
}

pub fn run_scenarios(config: &Config, rig: &mut Rig, opts: &RunOptions, plan: &RunPlan) -> DelegResult<RunSummary> {
    let started_at = wall_time_iso_utc();
    let started = Instant::now();
    let file_size = opts.file_size.unwrap_or(config.file_size);
    check_file_size(file_size)?;
    let (entries, mut notes) = plan_scenarios(config, opts, rig.peer.is_some())?;
    let settings = Settings {
        file_name: config.file_name.clone(),
        file_size,
        settle: opts.settle.unwrap_or(config.settle).0,
        client_addr: config.client_addr.clone(),
        server_addr: config.server.clone(),
    };
    tracing::info!(run_id = %plan.run_id, scenarios = entries.len(), "starting run");

    let mut scenarios = Vec::with_capacity(entries.len());
    for entry in &entries {
        let report = run_one(rig, entry, &settings, &plan.artifacts_dir);
        tracing::info!(
            scenario = %entry.name,
            status = ?report.status,
            failed = report.failed_count(),
            "scenario finished"
        );
        scenarios.push(report);
    }
    if entries.is_empty() {
        notes.push("no scenario left to run".to_string());
    }

    let (status, tests) = RunSummary::tally(&scenarios);
    let mut summary = RunSummary {
        status,
        identity: RunIdentity {
            run_id: plan.run_id.clone(),
            report_path: None,
            artifacts_dir: Some(plan.artifacts_dir.display().to_string()),
        },
        started_at,
        finished_at: wall_time_iso_utc(),
        duration_ms: started.elapsed().as_millis() as u64,
        tests,
        scenarios,
        notes,
    };
    let reporter = opts.reporter.unwrap_or(config.reporter);
    let report_path = write_report(&summary, &plan.artifacts_dir, reporter)?;
    summary.identity.report_path = Some(report_path.display().to_string());
    Ok(summary)
}

struct ScenarioCtx<'e> {
    entry: &'e CatalogEntry,
    stage: Stage,
    capturing: bool,
    actor_results: Vec<VerificationResult>,
}

impl ScenarioCtx<'_> {
    fn advance(&mut self, stage: Stage) {
        tracing::debug!(scenario = %self.entry.name, from = self.stage.label(), to = stage.label(), "stage");
        self.stage = stage;
    }
}

fn run_one(rig: &mut Rig, entry: &CatalogEntry, settings: &Settings, artifacts_dir: &Path) -> ScenarioReport {
    let started = Instant::now();
    tracing::info!(scenario = %entry.name, desc = %entry.description(), "starting scenario");
    let mut ctx = ScenarioCtx {
        entry,
        stage: Stage::Init,
        capturing: false,
        actor_results: Vec::new(),
    };
    let target = ReplayTarget {
        file_name: settings.file_name.clone(),
        client_addr: settings.client_addr.clone(),
        peer_addr: rig.peer.as_ref().map(|p| p.addr.clone()),
        server_addr: settings.server_addr.clone(),
        file_size: settings.file_size,
    };

    let driven = entry.config.validate().and_then(|()| {
        prepare_file(rig, &entry.config, settings)?;
        ctx.advance(Stage::Prepared);
        match entry.kind() {
            ScenarioKind::Basic => drive_basic(rig, &mut ctx, settings),
            ScenarioKind::Recall => drive_recall(rig, &mut ctx, settings),
        }
    });
    let events = match driven {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!(scenario = %entry.name, stage = ctx.stage.label(), %err, "scenario setup failed");
            cleanup(rig, &mut ctx);
            return ScenarioReport {
                name: entry.name.clone(),
                description: entry.description(),
                status: ExitStatus::Error,
                stage: ctx.stage.label().to_string(),
                results: ctx.actor_results,
                notes: vec![err.to_string()],
                trace_path: None,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    let trace = TraceFile::new(entry.clone(), target, events).with_actor_results(ctx.actor_results.clone());
    let trace_path = artifacts_dir.join(format!("{}.trace.json", entry.name));
    let mut notes = Vec::new();
    let trace_path = match trace.write_json(&trace_path) {
        Ok(()) => Some(trace_path.display().to_string()),
        Err(err) => {
            tracing::warn!(scenario = %entry.name, %err, "failed to persist trace");
            notes.push(format!("trace not saved: {err}"));
            None
        }
    };

    let eval = evaluate_trace(&trace);
    if let Some(recalled) = eval.recalled {
        ctx.advance(if recalled { Stage::Recalled } else { Stage::NotRecalled });
        ctx.advance(Stage::ReturnSequence);
    }
    ctx.advance(Stage::Verified);
    notes.extend(eval.notes);
    ScenarioReport {
        name: entry.name.clone(),
        description: entry.description(),
        status: ScenarioReport::status_for(&eval.results),
        stage: ctx.stage.label().to_string(),
        results: eval.results,
        notes,
        trace_path,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub results: Vec<VerificationResult>,
    pub notes: Vec<String>,
    pub recalled: Option<bool>,
}

/// Runs the verifier matching the trace's scenario kind. Actor outcomes come first.
pub fn evaluate_trace(trace: &TraceFile) -> Evaluation {
    let config = &trace.scenario.config;
    let (verdicts, recalled) = match trace.scenario.kind() {
        ScenarioKind::Basic => (verify_basic(&trace.events, &trace.target, config), None),
        ScenarioKind::Recall => {
            let r = verify_recall(&trace.events, &trace.target, config);
            (r.verdicts, r.recalled)
        }
    };
    let (checks, notes) = verdicts.into_parts();
    let mut results = trace.actor_results.clone();
    results.extend(checks);
    Evaluation {
        results,
        notes,
        recalled,
    }
}

/// Re-verifies a recorded trace file.
pub fn replay_trace_file(path: &Path) -> DelegResult<ScenarioReport> {
    let started = Instant::now();
    let trace = TraceFile::read_json(path)?;
    tracing::info!(scenario = %trace.scenario.name, events = trace.events.len(), "replaying trace");
    let eval = evaluate_trace(&trace);
    Ok(ScenarioReport {
        name: trace.scenario.name.clone(),
        description: trace.scenario.description(),
        status: ScenarioReport::status_for(&eval.results),
        stage: Stage::Verified.label().to_string(),
        results: eval.results,
        notes: eval.notes,
        trace_path: Some(path.display().to_string()),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Leaves the file in the state the scenario starts from, before anything is captured.
fn prepare_file(rig: &mut Rig, config: &ScenarioConfig, settings: &Settings) -> DelegResult<()> {
    rig.mount.mount()?;
    let path = rig.mount.mountpoint().join(&settings.file_name);
    let prepared = if config.use_existing_file {
        rig.local
            .run(&[
                ActorAction::Open {
                    handle: MAIN,
                    path,
                    mode: OpenMode::Create,
                },
                ActorAction::Write {
                    handle: MAIN,
                    offset: 0,
                    len: settings.file_size,
                },
                ActorAction::Close { handle: MAIN },
            ])
            .map(|_| ())
    } else {
        match std::fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    };
    let unmounted = rig.mount.unmount();
    prepared?;
    unmounted
}

fn main_open_mode(config: &ScenarioConfig) -> OpenMode {
    match (config.delegation_type, config.use_existing_file) {
        (DelegationType::Read, _) => OpenMode::Read,
        (DelegationType::Write, true) => OpenMode::Write,
        (DelegationType::Write, false) => OpenMode::Create,
    }
}

fn io_action(deleg: DelegationType, handle: u32, offset: u64, len: u64) -> ActorAction {
    match deleg {
        DelegationType::Read => ActorAction::Read { handle, offset, len },
        DelegationType::Write => ActorAction::Write { handle, offset, len },
    }
}

fn lock_action(config: &ScenarioConfig) -> ActorAction {
    ActorAction::Lock {
        handle: MAIN,
        kind: match config.delegation_type {
            DelegationType::Read => LockKind::Shared,
            DelegationType::Write => LockKind::Exclusive,
        },
        offset: config.lock_range.offset,
        len: config.lock_range.len,
    }
}

/// Anchor open, optional stat, the delegation-requesting open and its I/O, optional lock.
fn open_for_delegation(
    rig: &mut Rig,
    config: &ScenarioConfig,
    settings: &Settings,
    io_len: u64,
) -> DelegResult<()> {
    let root = rig.mount.mountpoint().to_path_buf();
    let path = root.join(&settings.file_name);
    let mut batch = vec![ActorAction::Open {
        handle: ANCHOR,
        path: root.join(format!(".{}.anchor", settings.file_name)),
        mode: OpenMode::Create,
    }];
    if config.use_stat {
        batch.push(ActorAction::Stat { path: path.clone() });
    }
    batch.push(ActorAction::Open {
        handle: MAIN,
        path,
        mode: main_open_mode(config),
    });
    batch.push(io_action(config.delegation_type, MAIN, 0, io_len));
    if config.use_lock {
        batch.push(lock_action(config));
    }
    rig.local.run(&batch)?;
    Ok(())
}

fn drive_basic(rig: &mut Rig, ctx: &mut ScenarioCtx<'_>, settings: &Settings) -> DelegResult<Vec<PacketEvent>> {
    let entry = ctx.entry;
    let config = &entry.config;
    let deleg = config.delegation_type;
    let size = settings.file_size;

    rig.capture.start(&entry.name)?;
    ctx.capturing = true;
    rig.mount.mount()?;
    ctx.advance(Stage::Mounted);

    open_for_delegation(rig, config, settings, size)?;
    ctx.advance(Stage::DelegationRequested);
    rig.clock.sleep(settings.settle);

    let path = rig.mount.mountpoint().join(&settings.file_name);
    let mut reopen = vec![
        ActorAction::Open {
            handle: REOPEN_READ,
            path: path.clone(),
            mode: OpenMode::Read,
        },
        ActorAction::Read {
            handle: REOPEN_READ,
            offset: 0,
            len: size,
        },
    ];
    if deleg == DelegationType::Write {
        reopen.push(ActorAction::Open {
            handle: REOPEN_WRITE,
            path: path.clone(),
            mode: OpenMode::Write,
        });
        reopen.push(ActorAction::Write {
            handle: REOPEN_WRITE,
            offset: 0,
            len: size,
        });
        reopen.push(ActorAction::Close { handle: REOPEN_WRITE });
    }
    reopen.push(ActorAction::Close { handle: REOPEN_READ });
    rig.local.run(&reopen)?;

    let mut child_batch = vec![
        ActorAction::Open {
            handle: 1,
            path: path.clone(),
            mode: OpenMode::Read,
        },
        ActorAction::Read {
            handle: 1,
            offset: 0,
            len: size,
        },
        ActorAction::Close { handle: 1 },
    ];
    if deleg == DelegationType::Write {
        child_batch.extend([
            ActorAction::Open {
                handle: 2,
                path,
                mode: OpenMode::Write,
            },
            ActorAction::Write {
                handle: 2,
                offset: 0,
                len: size,
            },
            ActorAction::Close { handle: 2 },
        ]);
    }
    let child = rig.child.run(&child_batch);
    ctx.actor_results.push(VerificationResult {
        name: match deleg {
            DelegationType::Read => "Different process can read the file".to_string(),
            DelegationType::Write => "Different process can read and write the file".to_string(),
        },
        passed: child.is_ok(),
        detail: child.err().map(|e| e.to_string()).unwrap_or_default(),
    });
    ctx.advance(Stage::LocalContentionProbed);

    rig.local.run(&[ActorAction::Close { handle: MAIN }, ActorAction::Close { handle: ANCHOR }])?;
    rig.mount.unmount()?;
    finish_capture(rig, ctx)
}

fn drive_recall(rig: &mut Rig, ctx: &mut ScenarioCtx<'_>, settings: &Settings) -> DelegResult<Vec<PacketEvent>> {
    let entry = ctx.entry;
    let config = &entry.config;
    let deleg = config.delegation_type;
    let size = settings.file_size;
    let half = size / 2;
    let Some(conflict) = config.conflict else {
        return Err(DelegError::Scenario(format!("{} names no conflict", entry.name)));
    };

    rig.capture.start(&entry.name)?;
    ctx.capturing = true;
    rig.mount.mount()?;
    let peer = peer_mut(rig)?;
    peer.mount.mount()?;
    let peer_path = peer.mount.mountpoint().join(&settings.file_name);
    ctx.advance(Stage::MountedBoth);

    open_for_delegation(rig, config, settings, half)?;
    ctx.advance(Stage::DelegationGranted);
    ctx.advance(Stage::PartialIo);
    rig.clock.sleep(settings.settle);

    let peer = peer_mut(rig)?;
    if deleg == DelegationType::Read {
        // Shares the file without conflicting; must not cost the delegation.
        peer.actor.run(&[
            ActorAction::Open {
                handle: 1,
                path: peer_path.clone(),
                mode: OpenMode::Read,
            },
            ActorAction::Read {
                handle: 1,
                offset: 0,
                len: size,
            },
            ActorAction::Close { handle: 1 },
        ])?;
        rig.clock.sleep(settings.settle);
    }

    let peer_io = CONFLICT_IO.min(size);
    let conflict_batch = match conflict {
        ConflictKind::Chmod => vec![ActorAction::Chmod {
            path: peer_path,
            mode: CONFLICT_MODE,
        }],
        ConflictKind::OpenRead => vec![
            ActorAction::Open {
                handle: 1,
                path: peer_path,
                mode: OpenMode::Read,
            },
            ActorAction::Read {
                handle: 1,
                offset: 0,
                len: peer_io.min(half),
            },
            ActorAction::Close { handle: 1 },
        ],
        ConflictKind::OpenWrite => vec![
            ActorAction::Open {
                handle: 1,
                path: peer_path,
                mode: if config.truncate_on_conflict {
                    OpenMode::Truncate
                } else {
                    OpenMode::Append
                },
            },
            ActorAction::Write {
                handle: 1,
                offset: 0,
                len: peer_io,
            },
            ActorAction::Close { handle: 1 },
        ],
    };
    let peer = peer_mut(rig)?;
    peer.actor.run(&conflict_batch)?;
    ctx.advance(Stage::ConflictInjected);
    rig.clock.sleep(settings.settle);

    // A truncating peer leaves nothing for a reader to read back.
    if !(deleg == DelegationType::Read && config.truncate_on_conflict) {
        rig.local.perform(io_action(deleg, MAIN, half, size - half))?;
    }
    rig.clock.sleep(settings.settle);

    rig.local.run(&[ActorAction::Close { handle: MAIN }, ActorAction::Close { handle: ANCHOR }])?;
    if let Some(peer) = rig.peer.as_mut() {
        peer.mount.unmount()?;
    }
    rig.mount.unmount()?;
    finish_capture(rig, ctx)
}

fn peer_mut(rig: &mut Rig) -> DelegResult<&mut PeerRig> {
    rig.peer
        .as_mut()
        .ok_or_else(|| DelegError::Config("recall scenarios need a [peer]".to_string()))
}

fn finish_capture(rig: &mut Rig, ctx: &mut ScenarioCtx<'_>) -> DelegResult<Vec<PacketEvent>> {
    ctx.capturing = false;
    let events = rig.capture.stop()?;
    ctx.advance(Stage::Captured);
    Ok(events)
}

/// Best effort: every step runs, failures are only logged.
fn cleanup(rig: &mut Rig, ctx: &mut ScenarioCtx<'_>) {
    rig.local.reset();
    if let Some(peer) = rig.peer.as_mut() {
        peer.actor.reset();
        if let Err(err) = peer.mount.unmount() {
            tracing::warn!(scenario = %ctx.entry.name, %err, "peer unmount failed during cleanup");
        }
    }
    if let Err(err) = rig.mount.unmount() {
        tracing::warn!(scenario = %ctx.entry.name, %err, "unmount failed during cleanup");
    }
    if ctx.capturing {
        ctx.capturing = false;
        if let Err(err) = rig.capture.stop() {
            tracing::warn!(scenario = %ctx.entry.name, %err, "stopping capture failed during cleanup");
        }
    }
}
