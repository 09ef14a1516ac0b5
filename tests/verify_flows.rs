use delegtrace::{
    ClaimType, ConflictKind, DelegationGrant, DelegationType, FileHandle, MessageKind, NFS4ERR_DELAY, NFS4_OK,
    NfsOp, PacketEvent, ReplayTarget, ScenarioConfig, ShareAccess, StateId, Verdicts, verify_basic,
    verify_recall,
};

const CLIENT: &str = "10.0.0.1";
const SERVER: &str = "10.0.0.2";
const PEER: &str = "10.0.0.3";
const DATA_SERVER: &str = "10.0.0.5";
const FILE: &str = "delegtrace.dat";
const SIZE: u64 = 64 * 1024;

fn file_fh() -> FileHandle {
    FileHandle::new("01f00d00aa")
}

fn dir_fh() -> FileHandle {
    FileHandle::new("01d1")
}

fn deleg_sid() -> StateId {
    StateId::new(1, "de1e9a7e0000")
}

fn open_sid(seqid: u32) -> StateId {
    StateId::new(seqid, "0be700010000")
}

fn target(peer: bool) -> ReplayTarget {
    ReplayTarget {
        file_name: FILE.to_string(),
        client_addr: CLIENT.to_string(),
        peer_addr: peer.then(|| PEER.to_string()),
        server_addr: SERVER.to_string(),
        file_size: SIZE,
    }
}

#[derive(Default)]
struct Trace {
    events: Vec<PacketEvent>,
    next_xid: u32,
}

impl Trace {
    fn push(&mut self, src: &str, dst: &str, xid: u32, kind: MessageKind, callback: bool, status: u32, ops: Vec<NfsOp>) {
        let frame = self.events.len() as u64 + 1;
        self.events.push(PacketEvent {
            frame,
            time_ms: frame * 10,
            src: src.to_string(),
            dst: dst.to_string(),
            xid,
            kind,
            callback,
            status,
            ops,
        });
    }

    fn call(&mut self, from: &str, to: &str, ops: Vec<NfsOp>) -> u32 {
        self.next_xid += 1;
        let xid = self.next_xid;
        self.push(from, to, xid, MessageKind::Call, false, NFS4_OK, ops);
        xid
    }

    fn reply(&mut self, xid: u32, from: &str, to: &str, status: u32, ops: Vec<NfsOp>) {
        self.push(from, to, xid, MessageKind::Reply, false, status, ops);
    }

    fn rpc(&mut self, from: &str, to: &str, call: Vec<NfsOp>, status: u32, reply: Vec<NfsOp>) -> u32 {
        let xid = self.call(from, to, call);
        self.reply(xid, to, from, status, reply);
        xid
    }

    fn open_by_name(&mut self, from: &str, access: ShareAccess, status: u32, stateid: StateId, grant: Option<DelegationType>) {
        self.rpc(
            from,
            SERVER,
            vec![
                NfsOp::PutFh { fh: dir_fh() },
                open_op(Some(FILE), ClaimType::Null, access, None, None),
                NfsOp::GetFh { fh: None },
            ],
            status,
            vec![
                NfsOp::PutFh { fh: dir_fh() },
                open_op(None, ClaimType::Null, access, Some(stateid), grant.map(|kind| DelegationGrant {
                    kind,
                    stateid: deleg_sid(),
                })),
                NfsOp::GetFh { fh: Some(file_fh()) },
            ],
        );
    }

    fn grant(&mut self, kind: DelegationType) {
        let access = match kind {
            DelegationType::Read => ShareAccess::Read,
            DelegationType::Write => ShareAccess::Both,
        };
        self.open_by_name(CLIENT, access, NFS4_OK, open_sid(1), Some(kind));
    }

    fn io(&mut self, write: bool, to: &str, fh: FileHandle, stateid: StateId, offset: u64, count: u64) {
        let op = |stateid: Option<StateId>, offset: Option<u64>| {
            if write {
                NfsOp::Write { stateid, offset, count }
            } else {
                NfsOp::Read { stateid, offset, count }
            }
        };
        self.rpc(
            CLIENT,
            to,
            vec![NfsOp::PutFh { fh: fh.clone() }, op(Some(stateid), Some(offset))],
            NFS4_OK,
            vec![NfsOp::PutFh { fh }, op(None, None)],
        );
    }

    fn recall(&mut self) {
        self.next_xid += 1;
        let xid = self.next_xid;
        let ops = vec![NfsOp::CbRecall {
            stateid: deleg_sid(),
            fh: file_fh(),
            truncate: false,
        }];
        self.push(SERVER, CLIENT, xid, MessageKind::Call, true, NFS4_OK, ops.clone());
        self.push(CLIENT, SERVER, xid, MessageKind::Reply, true, NFS4_OK, ops);
    }

    fn reclaim(&mut self, reply_stateid: StateId, grant: bool) {
        self.rpc(
            CLIENT,
            SERVER,
            vec![
                NfsOp::PutFh { fh: dir_fh() },
                NfsOp::Open {
                    name: Some(FILE.to_string()),
                    claim: ClaimType::DelegateCur,
                    access: ShareAccess::Both,
                    stateid: None,
                    delegation: None,
                    deleg_stateid: Some(deleg_sid()),
                },
            ],
            NFS4_OK,
            vec![
                NfsOp::PutFh { fh: dir_fh() },
                open_op(
                    None,
                    ClaimType::DelegateCur,
                    ShareAccess::Both,
                    Some(reply_stateid),
                    grant.then(|| DelegationGrant {
                        kind: DelegationType::Write,
                        stateid: StateId::new(1, "ffff"),
                    }),
                ),
            ],
        );
    }

    fn delegreturn(&mut self) {
        self.rpc(
            CLIENT,
            SERVER,
            vec![NfsOp::PutFh { fh: file_fh() }, NfsOp::DelegReturn { stateid: deleg_sid() }],
            NFS4_OK,
            vec![NfsOp::PutFh { fh: file_fh() }, NfsOp::DelegReturn { stateid: deleg_sid() }],
        );
    }

    fn peer_chmod(&mut self, status: u32) {
        let ops = vec![
            NfsOp::PutFh { fh: file_fh() },
            NfsOp::SetAttr {
                stateid: None,
                mode: Some(0o600),
                size: None,
            },
        ];
        self.rpc(PEER, SERVER, ops.clone(), status, ops);
    }

    fn lock(&mut self, stateid: StateId) {
        let ops = vec![
            NfsOp::PutFh { fh: file_fh() },
            NfsOp::Lock {
                stateid: Some(stateid),
                offset: 0,
                length: 0,
            },
        ];
        self.rpc(CLIENT, SERVER, ops.clone(), NFS4_OK, ops);
    }
}

fn open_op(
    name: Option<&str>,
    claim: ClaimType,
    access: ShareAccess,
    stateid: Option<StateId>,
    delegation: Option<DelegationGrant>,
) -> NfsOp {
    NfsOp::Open {
        name: name.map(String::from),
        claim,
        access,
        stateid,
        delegation,
        deleg_stateid: None,
    }
}

fn names(v: &Verdicts) -> Vec<&str> {
    v.results().iter().map(|r| r.name.as_str()).collect()
}

fn failed(v: &Verdicts) -> Vec<&str> {
    v.results()
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.as_str())
        .collect()
}

#[test]
fn basic_write_delegation_passes() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE);

    let v = verify_basic(&t.events, &target(false), &ScenarioConfig::basic(DelegationType::Write));
    assert!(v.all_passed(), "{:?}", v.results());
    assert_eq!(
        names(&v),
        vec![
            "OPEN grants a WRITE delegation for delegtrace.dat",
            "No OPEN sent for the file while the delegation is held",
            "WRITE sent to the server",
            "WRITE uses the delegation stateid",
        ]
    );
}

#[test]
fn basic_read_flags_reopen_and_refetch() {
    let mut t = Trace::default();
    t.grant(DelegationType::Read);
    t.io(false, SERVER, file_fh(), deleg_sid(), 0, SIZE);
    t.open_by_name(CLIENT, ShareAccess::Read, NFS4_OK, open_sid(2), None);
    t.io(false, SERVER, file_fh(), open_sid(2), 0, SIZE);

    let v = verify_basic(&t.events, &target(false), &ScenarioConfig::basic(DelegationType::Read));
    assert_eq!(
        failed(&v),
        vec![
            "No OPEN sent for the file while the delegation is held",
            "READ uses the delegation stateid",
            "READ does not fetch cached data again",
        ]
    );
    let dup = v
        .results()
        .iter()
        .find(|r| r.name == "READ does not fetch cached data again")
        .expect("dup check");
    assert!(dup.detail.contains("offset 0 read 2 times"));
}

#[test]
fn basic_stat_finds_open_by_lookup_handle() {
    let mut t = Trace::default();
    t.rpc(
        CLIENT,
        SERVER,
        vec![
            NfsOp::PutFh { fh: dir_fh() },
            NfsOp::Lookup { name: FILE.to_string() },
            NfsOp::GetFh { fh: None },
        ],
        NFS4_OK,
        vec![
            NfsOp::PutFh { fh: dir_fh() },
            NfsOp::Lookup { name: FILE.to_string() },
            NfsOp::GetFh { fh: Some(file_fh()) },
        ],
    );
    t.rpc(
        CLIENT,
        SERVER,
        vec![
            NfsOp::PutFh { fh: file_fh() },
            open_op(None, ClaimType::Fh, ShareAccess::Read, None, None),
        ],
        NFS4_OK,
        vec![
            NfsOp::PutFh { fh: file_fh() },
            open_op(
                None,
                ClaimType::Fh,
                ShareAccess::Read,
                Some(open_sid(1)),
                Some(DelegationGrant {
                    kind: DelegationType::Read,
                    stateid: deleg_sid(),
                }),
            ),
        ],
    );
    t.io(false, SERVER, file_fh(), deleg_sid(), 0, SIZE);

    let config = ScenarioConfig::basic(DelegationType::Read).with_stat();
    let v = verify_basic(&t.events, &target(false), &config);
    assert!(v.all_passed(), "{:?}", v.results());
}

#[test]
fn basic_without_delegation_stops_after_grant_check() {
    let mut t = Trace::default();
    t.open_by_name(CLIENT, ShareAccess::Both, NFS4_OK, open_sid(1), None);
    t.io(true, SERVER, file_fh(), open_sid(1), 0, SIZE);

    let v = verify_basic(&t.events, &target(false), &ScenarioConfig::basic(DelegationType::Write));
    assert_eq!(v.results().len(), 1);
    assert!(!v.all_passed());
    let (results, notes) = v.into_parts();
    assert!(results[0].detail.contains("no delegation"));
    assert!(notes[0].starts_with("remaining checks skipped"));
}

#[test]
fn basic_wrong_delegation_type_is_reported() {
    let mut t = Trace::default();
    t.grant(DelegationType::Read);
    let v = verify_basic(&t.events, &target(false), &ScenarioConfig::basic(DelegationType::Write));
    assert_eq!(v.results().len(), 1);
    assert!(v.results()[0].detail.contains("READ delegation instead"));
}

#[test]
fn basic_pnfs_io_goes_to_data_server() {
    let ds_fh = FileHandle::new("dd5500");
    let mut t = Trace::default();
    t.rpc(
        CLIENT,
        SERVER,
        vec![NfsOp::Other { name: "GETDEVICEINFO".to_string() }],
        NFS4_OK,
        vec![NfsOp::GetDeviceInfo {
            device_id: "dev1".to_string(),
            addrs: vec![DATA_SERVER.to_string()],
        }],
    );
    t.grant(DelegationType::Write);
    t.rpc(
        CLIENT,
        SERVER,
        vec![
            NfsOp::PutFh { fh: file_fh() },
            NfsOp::LayoutGet {
                device_ids: Vec::new(),
                fhs: Vec::new(),
            },
        ],
        NFS4_OK,
        vec![
            NfsOp::PutFh { fh: file_fh() },
            NfsOp::LayoutGet {
                device_ids: vec!["dev1".to_string()],
                fhs: vec![ds_fh.clone()],
            },
        ],
    );
    t.io(true, DATA_SERVER, ds_fh, deleg_sid(), 0, SIZE);

    let v = verify_basic(&t.events, &target(false), &ScenarioConfig::basic(DelegationType::Write));
    assert!(v.all_passed(), "{:?}", v.results());
    assert!(names(&v).contains(&"WRITE sent to data servers 10.0.0.5"));
}

#[test]
fn basic_lock_must_stay_local() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE);
    t.lock(deleg_sid());

    let config = ScenarioConfig::basic(DelegationType::Write).with_lock();
    let v = verify_basic(&t.events, &target(false), &config);
    assert_eq!(failed(&v), vec!["No LOCK sent while holding the delegation"]);
}

/// 64 KiB WRITE delegation recalled by a peer opening for write without truncation.
fn write_recall_trace() -> Trace {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.open_by_name(PEER, ShareAccess::Write, NFS4ERR_DELAY, StateId::new(1, "9ee7"), None);
    t.recall();
    t.reclaim(open_sid(2), false);
    t.io(true, SERVER, file_fh(), open_sid(2), SIZE / 2, SIZE / 2);
    t.delegreturn();
    t.open_by_name(PEER, ShareAccess::Write, NFS4_OK, StateId::new(1, "9ee7"), None);
    t
}

#[test]
fn write_recall_by_open_for_write_passes() {
    let t = write_recall_trace();
    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::OpenWrite);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(out.recalled, Some(true));
    assert!(out.verdicts.all_passed(), "{:?}", out.verdicts.results());
    assert_eq!(
        names(&out.verdicts),
        vec![
            "OPEN grants a WRITE delegation to the first client",
            "Conflicting OPEN for writing from the second client seen on the wire",
            "CB_RECALL sent to the first client",
            "CB_RECALL carries the delegation stateid",
            "Reclaim OPEN sent before DELEGRETURN",
            "Reclaim OPEN returns the original open stateid",
            "Reclaim OPEN is not granted a new delegation",
            "Delegated writes are flushed before the delegation is returned",
            "WRITE before the reclaim OPEN uses the delegation stateid",
            "DELEGRETURN sent for the recalled delegation",
            "OPEN for writing from the second client succeeds after DELEGRETURN",
            "Second client is not granted a delegation",
        ]
    );
    let (_, notes) = out.verdicts.into_parts();
    assert!(notes.iter().any(|n| n.contains("NFS4ERR_DELAY")));
}

#[test]
fn write_recall_with_unflushed_data_fails() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.open_by_name(PEER, ShareAccess::Write, NFS4ERR_DELAY, StateId::new(1, "9ee7"), None);
    t.recall();
    t.reclaim(open_sid(2), false);
    t.delegreturn();
    t.open_by_name(PEER, ShareAccess::Write, NFS4_OK, StateId::new(1, "9ee7"), None);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::OpenWrite);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(
        failed(&out.verdicts),
        vec![
            "Delegated writes are flushed before the delegation is returned",
            "WRITE before the reclaim OPEN uses the delegation stateid",
        ]
    );
}

#[test]
fn write_recall_flushed_under_open_stateid_fails() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.peer_chmod(NFS4ERR_DELAY);
    t.recall();
    t.io(true, SERVER, file_fh(), open_sid(1), 0, SIZE / 2);
    t.reclaim(open_sid(2), false);
    t.delegreturn();
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::Chmod);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(
        failed(&out.verdicts),
        vec!["WRITE before the reclaim OPEN uses the delegation stateid"]
    );
    let stateid_check = out
        .verdicts
        .results()
        .iter()
        .find(|r| r.name == "WRITE before the reclaim OPEN uses the delegation stateid")
        .expect("stateid check");
    assert!(stateid_check.detail.contains("no WRITE with the delegation stateid"));
}

#[test]
fn read_recall_by_open_for_write_passes_with_shared_read_delegation() {
    let mut t = Trace::default();
    t.grant(DelegationType::Read);
    t.io(false, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.open_by_name(PEER, ShareAccess::Read, NFS4_OK, StateId::new(1, "9ee7"), Some(DelegationType::Read));
    t.open_by_name(PEER, ShareAccess::Write, NFS4ERR_DELAY, StateId::new(2, "9ee7"), None);
    t.recall();
    t.reclaim(open_sid(2), false);
    t.delegreturn();
    t.open_by_name(PEER, ShareAccess::Write, NFS4_OK, StateId::new(2, "9ee7"), None);

    let config = ScenarioConfig::recall(DelegationType::Read, ConflictKind::OpenWrite);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(out.recalled, Some(true));
    assert!(out.verdicts.all_passed(), "{:?}", out.verdicts.results());
    assert_eq!(
        names(&out.verdicts),
        vec![
            "OPEN grants a READ delegation to the first client",
            "Conflicting OPEN for writing from the second client seen on the wire",
            "No recall on a non-conflicting read from the second client",
            "No recall while both clients hold READ delegations",
            "CB_RECALL sent to the first client",
            "CB_RECALL carries the delegation stateid",
            "Reclaim OPEN sent before DELEGRETURN",
            "Reclaim OPEN returns the original open stateid",
            "Reclaim OPEN is not granted a new delegation",
            "DELEGRETURN sent for the recalled delegation",
            "OPEN for writing from the second client succeeds after DELEGRETURN",
            "Second client is not granted a delegation",
        ]
    );
}

#[test]
fn write_recall_flush_between_recall_and_reclaim_counts() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.peer_chmod(NFS4ERR_DELAY);
    t.recall();
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.reclaim(open_sid(2), false);
    t.lock(open_sid(2));
    t.delegreturn();
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::Chmod).with_lock();
    let out = verify_recall(&t.events, &target(true), &config);
    assert!(out.verdicts.all_passed(), "{:?}", out.verdicts.results());
    assert!(names(&out.verdicts).contains(&"LOCK sent between the reclaim OPEN and DELEGRETURN"));
}

#[test]
fn reclaim_with_new_stateid_or_delegation_fails() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.peer_chmod(NFS4ERR_DELAY);
    t.recall();
    t.reclaim(StateId::new(1, "77770000"), true);
    t.delegreturn();
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::Chmod);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(
        failed(&out.verdicts),
        vec![
            "Reclaim OPEN returns the original open stateid",
            "Reclaim OPEN is not granted a new delegation",
        ]
    );
}

#[test]
fn read_recall_missing_callback_stops_early() {
    let mut t = Trace::default();
    t.grant(DelegationType::Read);
    t.io(false, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.open_by_name(PEER, ShareAccess::Read, NFS4_OK, StateId::new(1, "9ee7"), None);
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Read, ConflictKind::Chmod);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(out.recalled, Some(false));
    assert_eq!(failed(&out.verdicts), vec!["CB_RECALL sent to the first client"]);
    let (_, notes) = out.verdicts.into_parts();
    assert!(notes.iter().any(|n| n.contains("never recalled")));
    assert!(notes.iter().any(|n| n.contains("not granted a READ delegation")));
}

#[test]
fn read_recall_before_conflict_is_flagged() {
    let mut t = Trace::default();
    t.grant(DelegationType::Read);
    t.open_by_name(PEER, ShareAccess::Read, NFS4_OK, StateId::new(1, "9ee7"), Some(DelegationType::Read));
    t.recall();
    t.delegreturn();
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Read, ConflictKind::Chmod);
    let out = verify_recall(&t.events, &target(true), &config);
    let bad = failed(&out.verdicts);
    assert!(bad.contains(&"No recall on a non-conflicting read from the second client"));
    assert!(bad.contains(&"No recall while both clients hold READ delegations"));
    assert!(bad.contains(&"Reclaim OPEN sent before DELEGRETURN"));
    assert!(!bad.contains(&"CB_RECALL sent to the first client"));
}

#[test]
fn conflict_answered_before_return_fails() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.peer_chmod(NFS4_OK);
    t.recall();
    t.reclaim(open_sid(2), false);
    t.delegreturn();

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::Chmod);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(
        failed(&out.verdicts),
        vec!["SETATTR (chmod) from the second client succeeds after DELEGRETURN"]
    );
}

#[test]
fn delay_is_retried_only_once() {
    let mut t = write_recall_trace();
    // The retry after the return is delayed again.
    let last = t.events.len() - 1;
    t.events[last].status = NFS4ERR_DELAY;
    t.open_by_name(PEER, ShareAccess::Write, NFS4_OK, StateId::new(1, "9ee7"), None);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::OpenWrite);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(
        failed(&out.verdicts),
        vec!["OPEN for writing from the second client succeeds after DELEGRETURN"]
    );
}

#[test]
fn conflict_missing_from_wire_skips_the_rest() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::OpenRead);
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(out.recalled, None);
    assert_eq!(
        failed(&out.verdicts),
        vec!["Conflicting OPEN for reading from the second client seen on the wire"]
    );
}

#[test]
fn lock_before_conflict_is_flagged() {
    let mut t = Trace::default();
    t.grant(DelegationType::Write);
    t.io(true, SERVER, file_fh(), deleg_sid(), 0, SIZE / 2);
    t.lock(deleg_sid());
    t.peer_chmod(NFS4ERR_DELAY);
    t.recall();
    t.reclaim(open_sid(2), false);
    t.lock(open_sid(2));
    t.delegreturn();
    t.peer_chmod(NFS4_OK);

    let config = ScenarioConfig::recall(DelegationType::Write, ConflictKind::Chmod).with_lock();
    let out = verify_recall(&t.events, &target(true), &config);
    assert_eq!(failed(&out.verdicts), vec!["No LOCK sent before the conflict"]);
}
