//! Environment and version metadata for `delegtrace env` / `delegtrace version`.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvInfo {
    pub os: String,
    pub arch: String,
    pub delegtrace: VersionInfo,
    pub capabilities: BTreeMap<String, CapabilityInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub backend: String,
    pub configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("DELEGTRACE_COMMIT").map(|s| s.to_string()),
        build_date: option_env!("DELEGTRACE_BUILD_DATE").map(|s| s.to_string()),
    }
}

pub fn env_info(config: &crate::Config) -> EnvInfo {
    let mut capabilities = BTreeMap::new();
    capabilities.insert(
        "mount".to_string(),
        CapabilityInfo {
            backend: format!(
                "{}mount -t nfs vers={}",
                if config.sudo { "sudo " } else { "" },
                config.nfs_version
            ),
            configured: !config.server.is_empty(),
        },
    );
    capabilities.insert(
        "capture".to_string(),
        CapabilityInfo {
            backend: config.capture.start.first().cloned().unwrap_or_default(),
            configured: !config.capture.start.is_empty() && !config.capture.decode.is_empty(),
        },
    );
    capabilities.insert(
        "peer".to_string(),
        CapabilityInfo {
            backend: match &config.peer {
                Some(p) => format!("ssh {}", p.ssh_target),
                None => "none".to_string(),
            },
            configured: config.peer.is_some(),
        },
    );
    capabilities.insert(
        "clock".to_string(),
        CapabilityInfo {
            backend: format!("wall (settle {})", config.settle),
            configured: true,
        },
    );

    EnvInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        delegtrace: version_info(),
        capabilities,
    }
}
