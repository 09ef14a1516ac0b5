//! Recorded scenario traces (`<scenario>.trace.json`): read, write, checksum.

use serde::{Deserialize, Serialize};

use std::path::Path;

use crate::{
    CatalogEntry, DelegError, DelegResult, PacketEvent, ReplayTarget, VerificationResult, VersionInfo,
};

pub const TRACE_FORMAT: &str = "delegtrace-trace";
pub const CURRENT_TRACE_VERSION: u32 = 1;

/// Everything needed to re-run the verifier offline: the scenario, who was who, the events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFile {
    pub format: String,
    pub version: u32,
    pub engine: VersionInfo,
    pub scenario: CatalogEntry,
    pub target: ReplayTarget,
    #[serde(rename = "capturedAt", default)]
    pub captured_at: String,
    pub events: Vec<PacketEvent>,
    /// Outcomes observed by the actors themselves rather than on the wire.
    #[serde(rename = "actorResults", default, skip_serializing_if = "Vec::is_empty")]
    pub actor_results: Vec<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TraceFile {
    pub fn new(scenario: CatalogEntry, target: ReplayTarget, events: Vec<PacketEvent>) -> Self {
        Self {
            format: TRACE_FORMAT.to_string(),
            version: CURRENT_TRACE_VERSION,
            engine: crate::version_info(),
            scenario,
            target,
            captured_at: crate::wall_time_iso_utc(),
            events,
            actor_results: Vec::new(),
            checksum: None,
        }
    }

    pub fn with_actor_results(mut self, results: Vec<VerificationResult>) -> Self {
        self.actor_results = results;
        self
    }

    pub fn write_json(&self, path: &Path) -> DelegResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut with_checksum = self.clone();
        with_checksum.checksum = None;
        let canonical = serde_json::to_vec(&with_checksum)?;
        with_checksum.checksum = Some(blake3::hash(&canonical).to_hex().to_string());
        let bytes = serde_json::to_vec_pretty(&with_checksum)?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("trace.json");
        let tmp_path = parent.join(format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> DelegResult<Self> {
        let bytes = std::fs::read(path)?;
        let t: TraceFile = serde_json::from_slice(&bytes)
            .map_err(|e| DelegError::Trace(format!("failed to parse trace {}: {e}", path.display())))?;
        if t.format != TRACE_FORMAT {
            return Err(DelegError::Trace(format!(
                "{} is not a {TRACE_FORMAT} file (format {:?})",
                path.display(),
                t.format
            )));
        }
        if t.version > CURRENT_TRACE_VERSION {
            return Err(DelegError::Trace(format!(
                "trace schema v{} is newer than supported v{CURRENT_TRACE_VERSION}",
                t.version
            )));
        }
        verify_checksum(&t, path)?;
        Ok(t)
    }
}

fn verify_checksum(trace: &TraceFile, path: &Path) -> DelegResult<()> {
    let Some(expected) = trace.checksum.as_ref() else {
        return Ok(());
    };
    let mut canonical = trace.clone();
    canonical.checksum = None;
    let bytes = serde_json::to_vec(&canonical)?;
    let got = blake3::hash(&bytes).to_hex().to_string();
    if &got != expected {
        return Err(DelegError::Trace(format!(
            "trace checksum mismatch for {} (expected {}, got {})",
            path.display(),
            expected,
            got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario_catalog;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("delegtrace-trace-tests-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir.join(name)
    }

    fn sample() -> TraceFile {
        let entry = scenario_catalog().into_iter().next().expect("catalog");
        TraceFile::new(
            entry,
            ReplayTarget {
                file_name: "delegtrace.dat".to_string(),
                client_addr: "10.0.0.1".to_string(),
                peer_addr: None,
                server_addr: "10.0.0.2".to_string(),
                file_size: 4096,
            },
            Vec::new(),
        )
    }

    #[test]
    fn written_trace_reads_back_with_checksum() {
        let path = temp_file("basic01.trace.json");
        sample().write_json(&path).expect("write");
        let back = TraceFile::read_json(&path).expect("read");
        assert!(back.checksum.is_some());
        assert_eq!(back.scenario.name, "basic01");
        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let path = temp_file("bad.trace.json");
        sample().write_json(&path).expect("write");
        let raw = std::fs::read_to_string(&path).expect("read raw");
        std::fs::write(&path, raw.replace("10.0.0.1", "10.0.0.9")).expect("tamper");
        let err = TraceFile::read_json(&path).expect_err("tampered");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn foreign_format_is_rejected() {
        let path = temp_file("other.json");
        let mut t = sample();
        t.format = "something-else".to_string();
        t.write_json(&path).expect("write");
        assert!(TraceFile::read_json(&path).is_err());
    }
}
