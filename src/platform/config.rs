//! `delegtrace.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{DelegError, DelegResult, HumanDuration, LockRange, MountSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for run artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// NFS server address, as it appears in the capture.
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_export")]
    pub export: String,

    #[serde(default = "default_mountpoint")]
    pub mountpoint: PathBuf,

    #[serde(default = "default_nfs_version")]
    pub nfs_version: String,

    /// Extra `-o` options appended after `vers=`.
    #[serde(default)]
    pub mount_options: Vec<String>,

    /// Run mount/umount through `sudo -n`.
    #[serde(default)]
    pub sudo: bool,

    /// This host's address, as it appears in the capture.
    #[serde(default)]
    pub client_addr: String,

    /// Name of the test file under the mountpoint.
    #[serde(default = "default_file_name")]
    pub file_name: String,

    #[serde(default = "default_file_size")]
    pub file_size: u64,

    /// Delay after each step that must reach the server before the next one.
    #[serde(default = "default_settle")]
    pub settle: HumanDuration,

    #[serde(default)]
    pub lock_offset: u64,

    /// Zero locks to end of file.
    #[serde(default)]
    pub lock_len: u64,

    #[serde(default = "default_reporter")]
    pub reporter: crate::Reporter,

    /// Second client used by recall scenarios.
    #[serde(default)]
    pub peer: Option<PeerConfig>,

    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PeerConfig {
    /// `user@host` handed to ssh.
    pub ssh_target: String,
    /// The peer's address, as it appears in the capture.
    pub addr: String,
    #[serde(default = "default_mountpoint")]
    pub mountpoint: PathBuf,
    /// `delegtrace` binary on the peer.
    #[serde(default = "default_program")]
    pub program: String,
}

/// Capture and decode command lines. `{interface}`, `{pcap}` and `{server}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CaptureConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_capture_start")]
    pub start: Vec<String>,
    /// Must print the decoded events of `{pcap}` as a JSON array on stdout.
    #[serde(default)]
    pub decode: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            start: default_capture_start(),
            decode: Vec::new(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".delegtrace")
}

fn default_export() -> String {
    "/".to_string()
}

fn default_mountpoint() -> PathBuf {
    PathBuf::from("/mnt/delegtrace")
}

fn default_nfs_version() -> String {
    "4.1".to_string()
}

fn default_file_name() -> String {
    "delegtrace.dat".to_string()
}

fn default_file_size() -> u64 {
    64 * 1024
}

fn default_settle() -> HumanDuration {
    HumanDuration(Duration::from_secs(2))
}

fn default_reporter() -> crate::Reporter {
    crate::Reporter::Pretty
}

fn default_program() -> String {
    "delegtrace".to_string()
}

fn default_interface() -> String {
    "any".to_string()
}

fn default_capture_start() -> Vec<String> {
    ["tcpdump", "-i", "{interface}", "-s", "0", "-w", "{pcap}", "host", "{server}"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            server: String::new(),
            export: default_export(),
            mountpoint: default_mountpoint(),
            nfs_version: default_nfs_version(),
            mount_options: Vec::new(),
            sudo: false,
            client_addr: String::new(),
            file_name: default_file_name(),
            file_size: default_file_size(),
            settle: default_settle(),
            lock_offset: 0,
            lock_len: 0,
            reporter: default_reporter(),
            peer: None,
            capture: CaptureConfig::default(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn lock_range(&self) -> LockRange {
        LockRange {
            offset: self.lock_offset,
            len: self.lock_len,
        }
    }

    pub fn mount_spec(&self) -> MountSpec {
        MountSpec {
            server: self.server.clone(),
            export: self.export.clone(),
            mountpoint: self.mountpoint.clone(),
            nfs_version: self.nfs_version.clone(),
            options: self.mount_options.clone(),
            sudo: self.sudo,
        }
    }

    pub fn peer_mount_spec(&self) -> Option<MountSpec> {
        self.peer.as_ref().map(|p| MountSpec {
            mountpoint: p.mountpoint.clone(),
            ..self.mount_spec()
        })
    }

    /// Settings a live run cannot do without.
    pub fn validate_live(&self) -> DelegResult<()> {
        if self.server.is_empty() {
            return Err(DelegError::Config("`server` is not set".to_string()));
        }
        if self.client_addr.is_empty() {
            return Err(DelegError::Config("`client_addr` is not set".to_string()));
        }
        check_file_size(self.file_size)?;
        if self.capture.start.is_empty() {
            return Err(DelegError::Config("`capture.start` is empty".to_string()));
        }
        if self.capture.decode.is_empty() {
            return Err(DelegError::Config("`capture.decode` is empty".to_string()));
        }
        if let Some(peer) = &self.peer
            && (peer.ssh_target.is_empty() || peer.addr.is_empty())
        {
            return Err(DelegError::Config(
                "`peer.ssh_target` and `peer.addr` must both be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scenarios split the file into two halves, each at least a byte.
pub fn check_file_size(size: u64) -> DelegResult<()> {
    if size < 2 {
        return Err(DelegError::Config(format!(
            "`file_size` must be at least 2 bytes, got {size}"
        )));
    }
    Ok(())
}
