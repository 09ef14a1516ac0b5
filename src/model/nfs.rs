//! Decoded NFSv4 wire events as handed over by the capture decoder.

use serde::{Deserialize, Serialize};

pub const NFS4_OK: u32 = 0;
pub const NFS4ERR_DELAY: u32 = 10008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Call,
    Reply,
}

/// NFSv4 stateid. `other` identifies the state; `seqid` moves with every change to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId {
    #[serde(default)]
    pub seqid: u32,
    pub other: String,
}

impl StateId {
    pub fn new(seqid: u32, other: impl Into<String>) -> Self {
        Self {
            seqid,
            other: other.into(),
        }
    }

    pub fn same_state(&self, other: &StateId) -> bool {
        self.other.eq_ignore_ascii_case(&other.other)
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.seqid, self.other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub String);

impl FileHandle {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn matches(&self, other: &FileHandle) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Handles are long; the tail is what differs between files on one export.
        let skip = self.0.chars().count().saturating_sub(16);
        let tail = self.0.char_indices().nth(skip).map_or("", |(i, _)| &self.0[i..]);
        f.write_str(tail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Null,
    Previous,
    DelegateCur,
    DelegatePrev,
    Fh,
    DelegCurFh,
    DelegPrevFh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareAccess {
    Read,
    Write,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationType {
    Read,
    Write,
}

impl DelegationType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

impl std::fmt::Display for DelegationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl clap::ValueEnum for DelegationType {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Read, Self::Write]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Read => clap::builder::PossibleValue::new("read"),
            Self::Write => clap::builder::PossibleValue::new("write"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    #[serde(rename = "type")]
    pub kind: DelegationType,
    pub stateid: StateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    PutFh,
    Lookup,
    GetFh,
    Open,
    Close,
    Read,
    Write,
    Lock,
    LockU,
    SetAttr,
    DelegReturn,
    CbRecall,
    LayoutGet,
    GetDeviceInfo,
    Other,
}

impl OpKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::PutFh => "PUTFH",
            Self::Lookup => "LOOKUP",
            Self::GetFh => "GETFH",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Lock => "LOCK",
            Self::LockU => "LOCKU",
            Self::SetAttr => "SETATTR",
            Self::DelegReturn => "DELEGRETURN",
            Self::CbRecall => "CB_RECALL",
            Self::LayoutGet => "LAYOUTGET",
            Self::GetDeviceInfo => "GETDEVICEINFO",
            Self::Other => "OTHER",
        }
    }
}

/// One operation inside a COMPOUND. Reply-only fields are absent on calls and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NfsOp {
    #[serde(rename = "putfh")]
    PutFh {
        fh: FileHandle,
    },
    Lookup {
        name: String,
    },
    #[serde(rename = "getfh")]
    GetFh {
        #[serde(default)]
        fh: Option<FileHandle>,
    },
    Open {
        #[serde(default)]
        name: Option<String>,
        claim: ClaimType,
        access: ShareAccess,
        #[serde(default)]
        stateid: Option<StateId>,
        #[serde(default)]
        delegation: Option<DelegationGrant>,
        #[serde(default)]
        deleg_stateid: Option<StateId>,
    },
    Close {
        #[serde(default)]
        stateid: Option<StateId>,
    },
    Read {
        #[serde(default)]
        stateid: Option<StateId>,
        #[serde(default)]
        offset: Option<u64>,
        count: u64,
    },
    Write {
        #[serde(default)]
        stateid: Option<StateId>,
        #[serde(default)]
        offset: Option<u64>,
        count: u64,
    },
    Lock {
        #[serde(default)]
        stateid: Option<StateId>,
        offset: u64,
        length: u64,
    },
    #[serde(rename = "locku")]
    LockU {
        #[serde(default)]
        stateid: Option<StateId>,
        offset: u64,
        length: u64,
    },
    #[serde(rename = "setattr")]
    SetAttr {
        #[serde(default)]
        stateid: Option<StateId>,
        #[serde(default)]
        mode: Option<u32>,
        #[serde(default)]
        size: Option<u64>,
    },
    #[serde(rename = "delegreturn")]
    DelegReturn {
        stateid: StateId,
    },
    CbRecall {
        stateid: StateId,
        fh: FileHandle,
        #[serde(default)]
        truncate: bool,
    },
    #[serde(rename = "layoutget")]
    LayoutGet {
        #[serde(default)]
        device_ids: Vec<String>,
        #[serde(default)]
        fhs: Vec<FileHandle>,
    },
    #[serde(rename = "getdeviceinfo")]
    GetDeviceInfo {
        device_id: String,
        #[serde(default)]
        addrs: Vec<String>,
    },
    Other {
        name: String,
    },
}

impl NfsOp {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::PutFh { .. } => OpKind::PutFh,
            Self::Lookup { .. } => OpKind::Lookup,
            Self::GetFh { .. } => OpKind::GetFh,
            Self::Open { .. } => OpKind::Open,
            Self::Close { .. } => OpKind::Close,
            Self::Read { .. } => OpKind::Read,
            Self::Write { .. } => OpKind::Write,
            Self::Lock { .. } => OpKind::Lock,
            Self::LockU { .. } => OpKind::LockU,
            Self::SetAttr { .. } => OpKind::SetAttr,
            Self::DelegReturn { .. } => OpKind::DelegReturn,
            Self::CbRecall { .. } => OpKind::CbRecall,
            Self::LayoutGet { .. } => OpKind::LayoutGet,
            Self::GetDeviceInfo { .. } => OpKind::GetDeviceInfo,
            Self::Other { .. } => OpKind::Other,
        }
    }

    /// Every stateid the op carries, in argument order.
    pub fn stateids(&self) -> Vec<&StateId> {
        match self {
            Self::Open {
                stateid,
                delegation,
                deleg_stateid,
                ..
            } => stateid
                .iter()
                .chain(delegation.iter().map(|d| &d.stateid))
                .chain(deleg_stateid.iter())
                .collect(),
            Self::Close { stateid }
            | Self::Read { stateid, .. }
            | Self::Write { stateid, .. }
            | Self::Lock { stateid, .. }
            | Self::LockU { stateid, .. }
            | Self::SetAttr { stateid, .. } => stateid.iter().collect(),
            Self::DelegReturn { stateid } | Self::CbRecall { stateid, .. } => vec![stateid],
            _ => Vec::new(),
        }
    }

    pub fn file_handle(&self) -> Option<&FileHandle> {
        match self {
            Self::PutFh { fh } | Self::CbRecall { fh, .. } => Some(fh),
            Self::GetFh { fh } => fh.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Lookup { name } => Some(name),
            Self::Open { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

/// One RPC message of the capture: a COMPOUND (or callback COMPOUND) call or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub frame: u64,
    #[serde(default)]
    pub time_ms: u64,
    pub src: String,
    pub dst: String,
    pub xid: u32,
    pub kind: MessageKind,
    #[serde(default)]
    pub callback: bool,
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub ops: Vec<NfsOp>,
}

impl PacketEvent {
    pub fn is_call(&self) -> bool {
        self.kind == MessageKind::Call
    }

    pub fn is_ok(&self) -> bool {
        self.status == NFS4_OK
    }

    pub fn has_op(&self, kind: OpKind) -> bool {
        self.ops.iter().any(|op| op.kind() == kind)
    }

    pub fn ops_of(&self, kind: OpKind) -> impl Iterator<Item = &NfsOp> {
        self.ops.iter().filter(move |op| op.kind() == kind)
    }

    pub fn first_op(&self, kind: OpKind) -> Option<&NfsOp> {
        self.ops_of(kind).next()
    }

    /// First GETFH result that follows the first `after` op in this compound.
    pub fn handle_after(&self, after: OpKind) -> Option<&FileHandle> {
        let start = self.ops.iter().position(|op| op.kind() == after)?;
        self.ops[start + 1..].iter().find_map(|op| match op {
            NfsOp::GetFh { fh } => fh.as_ref(),
            _ => None,
        })
    }

    /// The compound's current filehandle as set by its first PUTFH.
    pub fn put_handle(&self) -> Option<&FileHandle> {
        self.ops.iter().find_map(|op| match op {
            NfsOp::PutFh { fh } => Some(fh),
            _ => None,
        })
    }

    pub fn summary(&self) -> String {
        let ops: Vec<&str> = self.ops.iter().map(|op| op.kind().label()).collect();
        format!(
            "frame {} {} {} -> {} xid={:#010x} [{}]",
            self.frame,
            match self.kind {
                MessageKind::Call => "call",
                MessageKind::Reply => "reply",
            },
            self.src,
            self.dst,
            self.xid,
            ops.join(",")
        )
    }
}
