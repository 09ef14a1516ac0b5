//! Packet capture around a scenario, decoded into [`PacketEvent`]s.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::{CaptureConfig, CommandRunner, DelegError, DelegResult, HostRunner, PacketEvent};

pub trait Capture {
    fn start(&mut self, label: &str) -> DelegResult<()>;

    /// Stops the capture and returns the decoded trace.
    fn stop(&mut self) -> DelegResult<Vec<PacketEvent>>;
}

/// Runs the configured capture command in the background and the decoder afterwards.
pub struct CommandCapture {
    config: CaptureConfig,
    server: String,
    workdir: PathBuf,
    running: Option<(Child, PathBuf)>,
}

impl CommandCapture {
    pub fn new(config: CaptureConfig, server: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            server: server.into(),
            workdir: workdir.into(),
            running: None,
        }
    }

    pub fn expand(&self, argv: &[String], pcap: &Path) -> Vec<String> {
        argv.iter()
            .map(|a| {
                a.replace("{interface}", &self.config.interface)
                    .replace("{pcap}", &pcap.display().to_string())
                    .replace("{server}", &self.server)
            })
            .collect()
    }
}

impl Capture for CommandCapture {
    fn start(&mut self, label: &str) -> DelegResult<()> {
        if self.running.is_some() {
            return Err(DelegError::Capture("capture already running".to_string()));
        }
        std::fs::create_dir_all(&self.workdir)?;
        let pcap = self.workdir.join(format!("{label}.pcap"));
        let argv = self.expand(&self.config.start, &pcap);
        let (cmd, args) = argv
            .split_first()
            .ok_or_else(|| DelegError::Capture("capture command is empty".to_string()))?;
        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DelegError::Capture(format!("failed to start {cmd:?}: {e}")))?;
        tracing::debug!(pid = child.id(), pcap = %pcap.display(), "capture started");
        self.running = Some((child, pcap));
        Ok(())
    }

    fn stop(&mut self) -> DelegResult<Vec<PacketEvent>> {
        let (mut child, pcap) = self
            .running
            .take()
            .ok_or_else(|| DelegError::Capture("capture is not running".to_string()))?;
        let pid = libc::pid_t::try_from(child.id())
            .map_err(|_| DelegError::Capture(format!("capture pid {} out of range", child.id())))?;
        // SIGINT lets the capture tool flush its buffer and close the file.
        // SAFETY: plain signal delivery to a child we spawned and have not reaped.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == -1 {
            tracing::warn!(pid, err = %std::io::Error::last_os_error(), "failed to interrupt capture");
        }
        let status = child.wait()?;
        tracing::debug!(?status, "capture stopped");

        let argv = self.expand(&self.config.decode, &pcap);
        let out = HostRunner.run(&argv, None)?;
        if !out.success() {
            return Err(DelegError::Capture(format!(
                "decoder {} failed with {}",
                argv.join(" "),
                out.failure_detail()
            )));
        }
        let events: Vec<PacketEvent> = serde_json::from_slice(&out.stdout)
            .map_err(|e| DelegError::Capture(format!("decoder output is not an event list: {e}")))?;
        tracing::info!(events = events.len(), pcap = %pcap.display(), "capture decoded");
        Ok(events)
    }
}

/// Hands out prepared traces in order; each `start`/`stop` pair consumes one.
#[derive(Debug, Default)]
pub struct ScriptedCapture {
    traces: VecDeque<Vec<PacketEvent>>,
    started: Vec<String>,
    active: bool,
}

impl ScriptedCapture {
    pub fn new(traces: impl IntoIterator<Item = Vec<PacketEvent>>) -> Self {
        Self {
            traces: traces.into_iter().collect(),
            started: Vec::new(),
            active: false,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.started
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Capture for ScriptedCapture {
    fn start(&mut self, label: &str) -> DelegResult<()> {
        if self.active {
            return Err(DelegError::Capture("capture already running".to_string()));
        }
        self.active = true;
        self.started.push(label.to_string());
        Ok(())
    }

    fn stop(&mut self) -> DelegResult<Vec<PacketEvent>> {
        if !std::mem::take(&mut self.active) {
            return Err(DelegError::Capture("capture is not running".to_string()));
        }
        Ok(self.traces.pop_front().unwrap_or_default())
    }
}
