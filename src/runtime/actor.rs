//! Actors: the participants that touch the file through the NFS mount.
//!
//! Every actor executes the same [`ActorAction`] vocabulary. The local actor runs it in this
//! process and keeps its open files between batches; the child and peer actors ship a batch as
//! JSON to `delegtrace child`, on this host or over ssh, and block until it exits.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{FileExt as _, PermissionsExt as _};
use std::os::unix::io::AsRawFd as _;
use std::path::PathBuf;

use crate::{CommandRunner, DelegError, DelegResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorId {
    Local,
    Child,
    Peer,
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Child => "child",
            Self::Peer => "peer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    Create,
    Append,
    Truncate,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut o = OpenOptions::new();
        match self {
            Self::Read => o.read(true),
            Self::Write => o.write(true),
            Self::Create => o.write(true).create(true).truncate(true),
            Self::Append => o.append(true),
            Self::Truncate => o.write(true).truncate(true),
        };
        o
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Handles are small integers picked by the caller; they name open files within one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActorAction {
    Open { handle: u32, path: PathBuf, mode: OpenMode },
    /// Reads `len` bytes at `offset` and checks them against the fill pattern.
    Read { handle: u32, offset: u64, len: u64 },
    Write { handle: u32, offset: u64, len: u64 },
    /// Blocking POSIX byte-range lock. `len == 0` locks to end of file.
    Lock { handle: u32, kind: LockKind, offset: u64, len: u64 },
    Chmod { path: PathBuf, mode: u32 },
    Stat { path: PathBuf },
    Close { handle: u32 },
}

impl ActorAction {
    pub fn describe(&self) -> String {
        match self {
            Self::Open { handle, path, mode } => format!("open #{handle} {} ({mode:?})", path.display()),
            Self::Read { handle, offset, len } => format!("read #{handle} {offset}+{len}"),
            Self::Write { handle, offset, len } => format!("write #{handle} {offset}+{len}"),
            Self::Lock {
                handle,
                kind,
                offset,
                len,
            } => format!("lock #{handle} {kind:?} {offset}+{len}"),
            Self::Chmod { path, mode } => format!("chmod {:o} {}", mode, path.display()),
            Self::Stat { path } => format!("stat {}", path.display()),
            Self::Close { handle } => format!("close #{handle}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub ok: bool,
    /// Bytes moved by a read or write.
    #[serde(default)]
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub actor: ActorId,
    pub outcomes: Vec<ActionOutcome>,
}

impl BatchReport {
    pub fn ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.ok)
    }

    pub fn first_failure(&self) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| !o.ok)
    }

    pub fn bytes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes).sum()
    }

    pub fn into_result(self) -> DelegResult<Self> {
        match self.first_failure() {
            None => Ok(self),
            Some(f) => Err(DelegError::Actor {
                actor: self.actor,
                detail: format!("{}: {}", f.action, f.detail),
            }),
        }
    }
}

/// Byte stored at `offset` by every write, so any reader can check what it got back.
pub fn pattern_byte(offset: u64) -> u8 {
    b'a' + (offset % 26) as u8
}

const IO_CHUNK: u64 = 64 * 1024;

/// Executes actions against the local filesystem, keeping open files by handle.
#[derive(Debug, Default)]
pub struct ActionRunner {
    files: BTreeMap<u32, File>,
}

impl ActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_handles(&self) -> usize {
        self.files.len()
    }

    /// Runs `batch` in order and stops at the first failing action.
    pub fn run_batch(&mut self, actor: ActorId, batch: &[ActorAction]) -> BatchReport {
        let mut outcomes = Vec::with_capacity(batch.len());
        for action in batch {
            let described = action.describe();
            match self.apply(action) {
                Ok(bytes) => {
                    tracing::debug!(%actor, action = %described, bytes, "ok");
                    outcomes.push(ActionOutcome {
                        action: described,
                        ok: true,
                        bytes,
                        detail: String::new(),
                    });
                }
                Err(err) => {
                    tracing::debug!(%actor, action = %described, %err, "failed");
                    outcomes.push(ActionOutcome {
                        action: described,
                        ok: false,
                        bytes: 0,
                        detail: err.to_string(),
                    });
                    break;
                }
            }
        }
        BatchReport { actor, outcomes }
    }

    pub fn apply(&mut self, action: &ActorAction) -> DelegResult<u64> {
        match action {
            ActorAction::Open { handle, path, mode } => {
                if self.files.contains_key(handle) {
                    return Err(DelegError::InvalidArgument(format!("handle #{handle} is already open")));
                }
                let f = mode.options().open(path)?;
                self.files.insert(*handle, f);
                Ok(0)
            }
            ActorAction::Read { handle, offset, len } => {
                let f = self.file(*handle)?;
                let mut buf = vec![0u8; IO_CHUNK.min(*len).max(1) as usize];
                let mut done = 0u64;
                while done < *len {
                    let n = (len - done).min(IO_CHUNK) as usize;
                    let at = offset + done;
                    f.read_exact_at(&mut buf[..n], at)?;
                    if let Some(i) = (0..n).find(|&i| buf[i] != pattern_byte(at + i as u64)) {
                        return Err(DelegError::Scenario(format!(
                            "unexpected data at offset {}",
                            at + i as u64
                        )));
                    }
                    done += n as u64;
                }
                Ok(done)
            }
            ActorAction::Write { handle, offset, len } => {
                let f = self.file(*handle)?;
                let mut done = 0u64;
                while done < *len {
                    let n = (len - done).min(IO_CHUNK);
                    let at = offset + done;
                    let chunk: Vec<u8> = (0..n).map(|i| pattern_byte(at + i)).collect();
                    f.write_all_at(&chunk, at)?;
                    done += n;
                }
                Ok(done)
            }
            ActorAction::Lock {
                handle,
                kind,
                offset,
                len,
            } => {
                let f = self.file(*handle)?;
                lock_range(f, *kind, *offset, *len)?;
                Ok(0)
            }
            ActorAction::Chmod { path, mode } => {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))?;
                Ok(0)
            }
            ActorAction::Stat { path } => {
                std::fs::metadata(path)?;
                Ok(0)
            }
            ActorAction::Close { handle } => {
                let f = self
                    .files
                    .remove(handle)
                    .ok_or_else(|| DelegError::InvalidArgument(format!("handle #{handle} is not open")))?;
                drop(f);
                Ok(0)
            }
        }
    }

    pub fn close_all(&mut self) {
        self.files.clear();
    }

    fn file(&self, handle: u32) -> DelegResult<&File> {
        self.files
            .get(&handle)
            .ok_or_else(|| DelegError::InvalidArgument(format!("handle #{handle} is not open")))
    }
}

fn lock_range(f: &File, kind: LockKind, offset: u64, len: u64) -> DelegResult<()> {
    let start = i64::try_from(offset)
        .map_err(|_| DelegError::InvalidArgument(format!("lock offset {offset} out of range")))?;
    let len = i64::try_from(len).map_err(|_| DelegError::InvalidArgument(format!("lock length {len} out of range")))?;
    // SAFETY: flock is plain old data; every field we rely on is set below.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        LockKind::Shared => libc::F_RDLCK,
        LockKind::Exclusive => libc::F_WRLCK,
    } as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    // SAFETY: the descriptor is owned by `f` and stays open for the call.
    let rc = unsafe { libc::fcntl(f.as_raw_fd(), libc::F_SETLKW, &fl) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

pub trait Actor {
    fn id(&self) -> ActorId;

    /// Runs a batch in order. Any failed action makes the whole batch an error.
    fn run(&mut self, batch: &[ActorAction]) -> DelegResult<BatchReport>;

    fn perform(&mut self, action: ActorAction) -> DelegResult<BatchReport> {
        self.run(std::slice::from_ref(&action))
    }

    /// Drops whatever the actor still holds open.
    fn reset(&mut self) {}
}

/// Runs actions in this process.
#[derive(Debug, Default)]
pub struct LocalActor {
    runner: ActionRunner,
}

impl LocalActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_handles(&self) -> usize {
        self.runner.open_handles()
    }
}

impl Actor for LocalActor {
    fn id(&self) -> ActorId {
        ActorId::Local
    }

    fn run(&mut self, batch: &[ActorAction]) -> DelegResult<BatchReport> {
        self.runner.run_batch(ActorId::Local, batch).into_result()
    }

    fn reset(&mut self) {
        self.runner.close_all();
    }
}

/// Ships each batch to `<program> child` through a command runner: a separate process on this
/// host (a different lock owner), or the peer client over ssh.
pub struct ProcessActor {
    id: ActorId,
    runner: Box<dyn CommandRunner>,
    program: String,
}

impl ProcessActor {
    pub fn new(id: ActorId, runner: Box<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            id,
            runner,
            program: program.into(),
        }
    }
}

impl Actor for ProcessActor {
    fn id(&self) -> ActorId {
        self.id
    }

    fn run(&mut self, batch: &[ActorAction]) -> DelegResult<BatchReport> {
        let input = serde_json::to_vec(batch)?;
        let argv = vec![self.program.clone(), "child".to_string()];
        tracing::debug!(actor = %self.id, via = %self.runner.describe(), actions = batch.len(), "actor batch");
        let out = self.runner.run(&argv, Some(&input))?;
        let report = serde_json::from_slice::<BatchReport>(&out.stdout).ok();
        if out.code != 0 {
            let detail = report
                .as_ref()
                .and_then(|r| r.first_failure())
                .map(|f| format!("{}: {}", f.action, f.detail))
                .unwrap_or_else(|| out.failure_detail());
            return Err(DelegError::Actor { actor: self.id, detail });
        }
        let mut report = report.ok_or_else(|| DelegError::Actor {
            actor: self.id,
            detail: "child printed no batch report".to_string(),
        })?;
        report.actor = self.id;
        report.into_result()
    }
}

/// Body of `delegtrace child`: one JSON batch in, one JSON report out.
///
/// Returns whether every action succeeded.
pub fn serve_child_batch(input: &mut impl Read, output: &mut impl Write) -> DelegResult<bool> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let batch: Vec<ActorAction> = serde_json::from_slice(&raw)?;
    let mut runner = ActionRunner::new();
    let report = runner.run_batch(ActorId::Child, &batch);
    serde_json::to_writer(&mut *output, &report)?;
    output.write_all(b"\n")?;
    Ok(report.ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("delegtrace-actor-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn write_then_read_checks_pattern() {
        let dir = temp_dir("rw");
        let path = dir.join("f");
        let mut actor = LocalActor::new();
        actor
            .run(&[
                ActorAction::Open { handle: 1, path: path.clone(), mode: OpenMode::Create },
                ActorAction::Write { handle: 1, offset: 0, len: 100_000 },
                ActorAction::Close { handle: 1 },
                ActorAction::Open { handle: 2, path: path.clone(), mode: OpenMode::Read },
                ActorAction::Read { handle: 2, offset: 70_000, len: 30_000 },
            ])
            .expect("batch");
        assert_eq!(actor.open_handles(), 1);
        actor.reset();
        assert_eq!(actor.open_handles(), 0);

        std::fs::write(&path, b"zzzz").expect("overwrite");
        let err = actor
            .run(&[
                ActorAction::Open { handle: 1, path, mode: OpenMode::Read },
                ActorAction::Read { handle: 1, offset: 0, len: 4 },
            ])
            .expect_err("pattern mismatch");
        assert!(err.to_string().contains("unexpected data at offset 0"));
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let dir = temp_dir("stop");
        let mut runner = ActionRunner::new();
        let report = runner.run_batch(
            ActorId::Local,
            &[
                ActorAction::Open { handle: 1, path: dir.join("missing"), mode: OpenMode::Read },
                ActorAction::Stat { path: dir.clone() },
            ],
        );
        assert!(!report.ok());
        assert_eq!(report.outcomes.len(), 1);
    }

    #[test]
    fn lock_and_chmod_on_local_file() {
        let dir = temp_dir("lock");
        let path = dir.join("f");
        let mut actor = LocalActor::new();
        actor
            .run(&[
                ActorAction::Open { handle: 1, path: path.clone(), mode: OpenMode::Create },
                ActorAction::Write { handle: 1, offset: 0, len: 4096 },
                ActorAction::Lock { handle: 1, kind: LockKind::Exclusive, offset: 0, len: 0 },
                ActorAction::Chmod { path: path.clone(), mode: 0o600 },
                ActorAction::Stat { path: path.clone() },
            ])
            .expect("batch");
        let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn child_batch_round_trip_over_pipes() {
        let dir = temp_dir("child");
        let batch = vec![
            ActorAction::Open { handle: 1, path: dir.join("f"), mode: OpenMode::Create },
            ActorAction::Write { handle: 1, offset: 0, len: 10 },
        ];
        let input = serde_json::to_vec(&batch).expect("json");
        let mut out = Vec::new();
        assert!(serve_child_batch(&mut input.as_slice(), &mut out).expect("serve"));
        let report: BatchReport = serde_json::from_slice(&out).expect("report");
        assert_eq!(report.bytes(), 10);
    }
}
