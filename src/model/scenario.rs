//! Scenario parameters and the fixed catalog of delegation scenarios.

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::{DelegError, DelegResult, DelegationType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Basic,
    Recall,
}

/// What the second client does to take the delegation away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Chmod,
    OpenRead,
    OpenWrite,
}

impl ConflictKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Chmod => "SETATTR (chmod)",
            Self::OpenRead => "OPEN for reading",
            Self::OpenWrite => "OPEN for writing",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::OpenRead | Self::OpenWrite)
    }
}

/// Byte range for advisory locks. A zero length means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockRange {
    pub offset: u64,
    pub len: u64,
}

impl std::str::FromStr for LockRange {
    type Err = DelegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (off, len) = s.split_once(':').ok_or_else(|| {
            DelegError::InvalidArgument(format!("invalid lock range {s:?} (expected OFFSET:LEN)"))
        })?;
        let parse = |v: &str| {
            v.trim().parse::<u64>().map_err(|_| {
                DelegError::InvalidArgument(format!("invalid lock range number {v:?} in {s:?}"))
            })
        };
        Ok(Self {
            offset: parse(off)?,
            len: parse(len)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub delegation_type: DelegationType,
    #[serde(default)]
    pub use_lock: bool,
    #[serde(default)]
    pub use_stat: bool,
    #[serde(default)]
    pub use_existing_file: bool,
    #[serde(default)]
    pub conflict: Option<ConflictKind>,
    #[serde(default)]
    pub truncate_on_conflict: bool,
    #[serde(default)]
    pub lock_range: LockRange,
}

impl ScenarioConfig {
    pub fn basic(delegation_type: DelegationType) -> Self {
        Self {
            delegation_type,
            use_lock: false,
            use_stat: false,
            // A read delegation is only handed out for data that is already there.
            use_existing_file: delegation_type == DelegationType::Read,
            conflict: None,
            truncate_on_conflict: false,
            lock_range: LockRange::default(),
        }
    }

    pub fn recall(delegation_type: DelegationType, conflict: ConflictKind) -> Self {
        Self {
            conflict: Some(conflict),
            ..Self::basic(delegation_type)
        }
    }

    pub fn with_lock(mut self) -> Self {
        self.use_lock = true;
        self
    }

    pub fn with_stat(mut self) -> Self {
        self.use_stat = true;
        self.use_existing_file = true;
        self
    }

    pub fn with_existing_file(mut self) -> Self {
        self.use_existing_file = true;
        self
    }

    pub fn kind(&self) -> ScenarioKind {
        if self.conflict.is_some() {
            ScenarioKind::Recall
        } else {
            ScenarioKind::Basic
        }
    }

    pub fn validate(&self) -> DelegResult<()> {
        if self.delegation_type == DelegationType::Read && !self.use_existing_file {
            return Err(DelegError::Scenario(
                "read delegation scenarios need an existing file".to_string(),
            ));
        }
        if self.use_stat && !self.use_existing_file {
            return Err(DelegError::Scenario(
                "stat before open needs an existing file".to_string(),
            ));
        }
        if self.delegation_type == DelegationType::Read
            && self.conflict == Some(ConflictKind::OpenRead)
        {
            return Err(DelegError::Scenario(
                "a peer read cannot recall a read delegation".to_string(),
            ));
        }
        if self.truncate_on_conflict && self.conflict != Some(ConflictKind::OpenWrite) {
            return Err(DelegError::Scenario(
                "truncate only applies to an open-for-write conflict".to_string(),
            ));
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let mut out = match self.conflict {
            None => format!("{} delegation", self.delegation_type),
            Some(conflict) => format!(
                "recall {} delegation by {}{}",
                self.delegation_type,
                conflict.label(),
                match (conflict, self.truncate_on_conflict) {
                    (ConflictKind::OpenWrite, true) => " with truncate",
                    (ConflictKind::OpenWrite, false) => " with append",
                    _ => "",
                }
            ),
        };
        if self.use_stat {
            out.push_str(", stat first");
        }
        if self.use_lock {
            out.push_str(", byte-range lock");
        }
        if self.use_existing_file && self.delegation_type == DelegationType::Write {
            out.push_str(", existing file");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub config: ScenarioConfig,
}

impl CatalogEntry {
    fn new(name: impl Into<String>, config: ScenarioConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn kind(&self) -> ScenarioKind {
        self.config.kind()
    }

    pub fn description(&self) -> String {
        self.config.describe()
    }
}

pub fn scenario_catalog() -> Vec<CatalogEntry> {
    use ConflictKind::*;
    use DelegationType::*;

    let mut out = vec![
        CatalogEntry::new("basic01", ScenarioConfig::basic(Read)),
        CatalogEntry::new("basic02", ScenarioConfig::basic(Write)),
        CatalogEntry::new("basic03", ScenarioConfig::basic(Write).with_existing_file()),
        CatalogEntry::new("basic04", ScenarioConfig::basic(Read).with_stat()),
        CatalogEntry::new("basic05", ScenarioConfig::basic(Write).with_stat()),
        CatalogEntry::new("basic06", ScenarioConfig::basic(Read).with_lock()),
        CatalogEntry::new("basic07", ScenarioConfig::basic(Write).with_lock()),
        CatalogEntry::new("basic08", ScenarioConfig::basic(Read).with_stat().with_lock()),
        CatalogEntry::new("basic09", ScenarioConfig::basic(Write).with_stat().with_lock()),
    ];

    let conflicts = [
        (Read, Chmod),
        (Read, OpenWrite),
        (Write, Chmod),
        (Write, OpenRead),
        (Write, OpenWrite),
    ];
    let mut n = 1;
    for lock in [false, true] {
        for (deleg, conflict) in conflicts {
            let mut config = ScenarioConfig::recall(deleg, conflict);
            if lock {
                config = config.with_lock();
            }
            out.push(CatalogEntry::new(format!("recall{n:02}"), config));
            n += 1;
        }
    }
    out
}

/// Catalog entries whose names match any of `patterns` (all entries when empty).
pub fn select_scenarios(patterns: &[String]) -> DelegResult<Vec<CatalogEntry>> {
    let catalog = scenario_catalog();
    if patterns.is_empty() {
        return Ok(catalog);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p)
            .map_err(|e| DelegError::InvalidArgument(format!("invalid scenario glob {p:?}: {e}")))?;
        b.add(g);
    }
    let set = b
        .build()
        .map_err(|e| DelegError::InvalidArgument(format!("invalid scenario globset: {e}")))?;
    let picked: Vec<CatalogEntry> = catalog.into_iter().filter(|e| set.is_match(&e.name)).collect();
    if picked.is_empty() {
        return Err(DelegError::InvalidArgument(format!(
            "no scenario matches {}",
            patterns.join(" ")
        )));
    }
    Ok(picked)
}
