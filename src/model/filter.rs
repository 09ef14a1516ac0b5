//! Structured match expressions over decoded wire events.
//!
//! A [`Filter`] is a conjunction of clauses. Header terms compare the RPC message itself;
//! op terms hold when any operation of the compound carries the value, which is how display
//! filters over decoded captures behave.

use crate::{ClaimType, DelegationType, FileHandle, MessageKind, NfsOp, OpKind, PacketEvent, ShareAccess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Src(String),
    Dst(String),
    Xid(u32),
    Kind(MessageKind),
    Callback(bool),
    Status(u32),
    Op(OpKind),
    Name(String),
    Fh(FileHandle),
    /// Matches on the stateid `other` field.
    StateId(String),
    Claim(ClaimType),
    Access(ShareAccess),
    Delegation(DelegationType),
    /// Any OPEN in the compound carries a delegation grant.
    Delegated,
    DeviceId(String),
    Any(Vec<Term>),
}

impl Term {
    pub fn holds(&self, ev: &PacketEvent) -> bool {
        match self {
            Self::Src(addr) => ev.src == *addr,
            Self::Dst(addr) => ev.dst == *addr,
            Self::Xid(xid) => ev.xid == *xid,
            Self::Kind(kind) => ev.kind == *kind,
            Self::Callback(cb) => ev.callback == *cb,
            Self::Status(status) => ev.status == *status,
            Self::Op(kind) => ev.has_op(*kind),
            Self::Name(name) => ev.ops.iter().any(|op| op.name() == Some(name.as_str())),
            Self::Fh(fh) => ev
                .ops
                .iter()
                .any(|op| op.file_handle().is_some_and(|h| h.matches(fh))),
            Self::StateId(other) => ev.ops.iter().any(|op| {
                op.stateids()
                    .iter()
                    .any(|s| s.other.eq_ignore_ascii_case(other))
            }),
            Self::Claim(claim) => ev
                .ops
                .iter()
                .any(|op| matches!(op, NfsOp::Open { claim: c, .. } if c == claim)),
            Self::Access(access) => ev
                .ops
                .iter()
                .any(|op| matches!(op, NfsOp::Open { access: a, .. } if a == access)),
            Self::Delegation(kind) => ev.ops.iter().any(|op| {
                matches!(op, NfsOp::Open { delegation: Some(d), .. } if d.kind == *kind)
            }),
            Self::Delegated => ev
                .ops
                .iter()
                .any(|op| matches!(op, NfsOp::Open { delegation: Some(_), .. })),
            Self::DeviceId(id) => ev
                .ops
                .iter()
                .any(|op| matches!(op, NfsOp::GetDeviceInfo { device_id, .. } if device_id == id)),
            Self::Any(terms) => terms.iter().any(|t| t.holds(ev)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub cmp: Cmp,
    pub term: Term,
}

impl Clause {
    pub fn holds(&self, ev: &PacketEvent) -> bool {
        match self.cmp {
            Cmp::Eq => self.term.holds(ev),
            Cmp::Ne => !self.term.holds(ev),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call() -> Self {
        Self::new().with(Term::Kind(MessageKind::Call))
    }

    pub fn reply() -> Self {
        Self::new().with(Term::Kind(MessageKind::Reply))
    }

    /// Reply to the call `xid` travelling back to `to`.
    pub fn reply_to(xid: u32, to: &str) -> Self {
        Self::reply().xid(xid).dst(to)
    }

    pub fn with(mut self, term: Term) -> Self {
        self.clauses.push(Clause { cmp: Cmp::Eq, term });
        self
    }

    pub fn without(mut self, term: Term) -> Self {
        self.clauses.push(Clause { cmp: Cmp::Ne, term });
        self
    }

    pub fn op(self, kind: OpKind) -> Self {
        self.with(Term::Op(kind))
    }

    pub fn src(self, addr: &str) -> Self {
        self.with(Term::Src(addr.to_string()))
    }

    pub fn dst(self, addr: &str) -> Self {
        self.with(Term::Dst(addr.to_string()))
    }

    pub fn xid(self, xid: u32) -> Self {
        self.with(Term::Xid(xid))
    }

    pub fn name(self, name: &str) -> Self {
        self.with(Term::Name(name.to_string()))
    }

    pub fn fh(self, fh: &FileHandle) -> Self {
        self.with(Term::Fh(fh.clone()))
    }

    pub fn stateid(self, stateid: &crate::StateId) -> Self {
        self.with(Term::StateId(stateid.other.clone()))
    }

    pub fn any_of(self, terms: Vec<Term>) -> Self {
        self.with(Term::Any(terms))
    }

    pub fn matches(&self, ev: &PacketEvent) -> bool {
        self.clauses.iter().all(|c| c.holds(ev))
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DelegationGrant, StateId};

    fn open_reply(deleg: Option<DelegationType>) -> PacketEvent {
        PacketEvent {
            frame: 9,
            time_ms: 0,
            src: "srv".into(),
            dst: "cli".into(),
            xid: 5,
            kind: MessageKind::Reply,
            callback: false,
            status: 0,
            ops: vec![
                NfsOp::PutFh {
                    fh: FileHandle::new("D1"),
                },
                NfsOp::Open {
                    name: Some("file".into()),
                    claim: ClaimType::Null,
                    access: ShareAccess::Read,
                    stateid: Some(StateId::new(1, "open1")),
                    delegation: deleg.map(|kind| DelegationGrant {
                        kind,
                        stateid: StateId::new(1, "deleg1"),
                    }),
                    deleg_stateid: None,
                },
                NfsOp::GetFh {
                    fh: Some(FileHandle::new("f1")),
                },
            ],
        }
    }

    #[test]
    fn op_terms_match_anywhere_in_the_compound() {
        let ev = open_reply(Some(DelegationType::Read));
        assert!(Filter::reply().op(OpKind::Open).fh(&FileHandle::new("F1")).matches(&ev));
        assert!(Filter::new().name("file").stateid(&StateId::new(9, "DELEG1")).matches(&ev));
        assert!(!Filter::call().op(OpKind::Open).matches(&ev));
    }

    #[test]
    fn ne_negates_the_whole_term() {
        let granted = open_reply(Some(DelegationType::Write));
        let plain = open_reply(None);
        let no_deleg = Filter::reply().op(OpKind::Open).without(Term::Delegated);
        assert!(!no_deleg.matches(&granted));
        assert!(no_deleg.matches(&plain));
        assert!(Filter::new().with(Term::Delegation(DelegationType::Write)).matches(&granted));
        assert!(!Filter::new().with(Term::Delegation(DelegationType::Read)).matches(&granted));
    }

    #[test]
    fn any_of_holds_when_one_alternative_does() {
        let ev = open_reply(None);
        let f = Filter::new().any_of(vec![
            Term::Name("other".into()),
            Term::Fh(FileHandle::new("f1")),
        ]);
        assert!(f.matches(&ev));
        let f = Filter::new().any_of(vec![Term::Name("other".into()), Term::Xid(6)]);
        assert!(!f.matches(&ev));
        assert_eq!(f.clauses().len(), 1);
    }
}
