//! External commands: local processes, ssh to the peer client, and NFS mounts.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::{DelegError, DelegResult};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.code)
        } else {
            format!("exit code {}: {stderr}", self.code)
        }
    }
}

pub trait CommandRunner {
    /// Runs `argv` to completion, feeding `stdin` when given.
    fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> DelegResult<CommandOutput>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> DelegResult<CommandOutput> {
        let (cmd, args) = argv
            .split_first()
            .ok_or_else(|| DelegError::InvalidArgument("empty command line".to_string()))?;
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DelegError::InvalidArgument(format!("failed to spawn {cmd:?}: {e}")))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn describe(&self) -> String {
        "host".to_string()
    }
}

/// Runs commands on another host with `ssh <options..> <target> -- <argv>`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    pub target: String,
    pub options: Vec<String>,
}

impl SshRunner {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    pub fn ssh_argv(&self, argv: &[String]) -> Vec<String> {
        let mut out = vec!["ssh".to_string()];
        out.extend(self.options.iter().cloned());
        out.push(self.target.clone());
        out.push("--".to_string());
        out.push(argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "));
        out
    }
}

impl CommandRunner for SshRunner {
    fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> DelegResult<CommandOutput> {
        let out = HostRunner.run(&self.ssh_argv(argv), stdin).map_err(|e| DelegError::Remote {
            target: self.target.clone(),
            detail: e.to_string(),
        })?;
        // ssh reserves 255 for its own failures.
        if out.code == 255 {
            return Err(DelegError::Remote {
                target: self.target.clone(),
                detail: out.failure_detail(),
            });
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("ssh {}", self.target)
    }
}

/// Quotes one word for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@'));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

pub trait Mounter {
    fn mount(&mut self) -> DelegResult<()>;
    fn unmount(&mut self) -> DelegResult<()>;
    fn mountpoint(&self) -> &Path;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub server: String,
    pub export: String,
    pub mountpoint: PathBuf,
    pub nfs_version: String,
    pub options: Vec<String>,
    pub sudo: bool,
}

impl MountSpec {
    pub fn mount_argv(&self) -> Vec<String> {
        let mut opts = vec![format!("vers={}", self.nfs_version)];
        opts.extend(self.options.iter().cloned());
        let mut argv = self.prefix();
        argv.extend([
            "mount".to_string(),
            "-t".to_string(),
            "nfs".to_string(),
            "-o".to_string(),
            opts.join(","),
            format!("{}:{}", self.server, self.export),
            self.mountpoint.display().to_string(),
        ]);
        argv
    }

    pub fn unmount_argv(&self) -> Vec<String> {
        let mut argv = self.prefix();
        argv.extend(["umount".to_string(), self.mountpoint.display().to_string()]);
        argv
    }

    fn prefix(&self) -> Vec<String> {
        if self.sudo {
            vec!["sudo".to_string(), "-n".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Mounts with the system `mount`/`umount` through a command runner.
pub struct CommandMounter {
    spec: MountSpec,
    runner: Box<dyn CommandRunner>,
    mounted: bool,
}

impl CommandMounter {
    pub fn new(spec: MountSpec, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            spec,
            runner,
            mounted: false,
        }
    }

    fn exec(&self, argv: &[String]) -> DelegResult<()> {
        tracing::debug!(via = %self.runner.describe(), cmd = %argv.join(" "), "mount command");
        let out = self.runner.run(argv, None)?;
        if !out.success() {
            return Err(DelegError::Mount(format!(
                "{} ({}) failed with {}",
                argv.join(" "),
                self.runner.describe(),
                out.failure_detail()
            )));
        }
        Ok(())
    }
}

impl Mounter for CommandMounter {
    fn mount(&mut self) -> DelegResult<()> {
        self.exec(&self.spec.mount_argv())?;
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> DelegResult<()> {
        if !self.mounted {
            return Ok(());
        }
        self.exec(&self.spec.unmount_argv())?;
        self.mounted = false;
        Ok(())
    }

    fn mountpoint(&self) -> &Path {
        &self.spec.mountpoint
    }
}
