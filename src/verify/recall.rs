//! Assertions for a delegation taken away by a conflicting access from a second client.
//!
//! The walk keeps a handful of bookmarks: the granting OPEN reply (lower bound), the first
//! conflicting call from the peer, the CB_RECALL, the reclaim OPEN and the DELEGRETURN. Each
//! check rewinds to the bookmark it needs and searches a bounded window.

use crate::{
    ClaimType, ConflictKind, DelegationContext, DelegationType, Filter, GrantMiss, Hit, IoFacts, NFS4ERR_DELAY,
    NfsOp, OpKind, PacketEvent, ReplayTarget, ScenarioConfig, ShareAccess, Term, TraceCursor,
    TracePosition, Verdicts, locate_grant,
};

#[derive(Debug, Clone)]
pub struct RecallVerdict {
    pub verdicts: Verdicts,
    /// Whether a recall was seen; `None` when the walk stopped before looking.
    pub recalled: Option<bool>,
}

impl RecallVerdict {
    fn stopped(verdicts: Verdicts) -> Self {
        Self {
            verdicts,
            recalled: None,
        }
    }
}

/// Calls from the peer that conflict with the delegation.
pub fn conflict_filter(conflict: ConflictKind, file_name: &str, ctx: &DelegationContext) -> Filter {
    let who = vec![
        Term::Name(file_name.to_string()),
        Term::Fh(ctx.file_handle.clone()),
    ];
    match conflict {
        ConflictKind::Chmod => Filter::call()
            .op(OpKind::SetAttr)
            .fh(&ctx.file_handle),
        ConflictKind::OpenRead => Filter::call()
            .op(OpKind::Open)
            .any_of(who)
            .with(Term::Access(ShareAccess::Read)),
        ConflictKind::OpenWrite => Filter::call()
            .op(OpKind::Open)
            .any_of(who)
            .any_of(vec![
                Term::Access(ShareAccess::Write),
                Term::Access(ShareAccess::Both),
            ]),
    }
}

pub fn verify_recall(events: &[PacketEvent], target: &ReplayTarget, config: &ScenarioConfig) -> RecallVerdict {
    let mut v = Verdicts::new();
    let mut cursor = TraceCursor::new(events);
    let client = target.client_addr.as_str();
    let deleg = config.delegation_type;

    let Some(conflict) = config.conflict else {
        v.check("Scenario names a conflicting operation", false, "no conflict configured");
        return RecallVerdict::stopped(v);
    };
    let Some(peer) = target.peer_addr.as_deref() else {
        v.check("Second client address is known", false, "no peer address in the target");
        return RecallVerdict::stopped(v);
    };

    let grant_name = format!("OPEN grants a {deleg} delegation to the first client");
    let ctx = match locate_grant(&mut cursor, target, client, config.use_stat, deleg) {
        Ok(ctx) => {
            v.check(grant_name, true, format!("delegation stateid {}", ctx.delegation_stateid));
            ctx
        }
        Err(miss) => {
            v.check(grant_name, false, miss.to_string());
            v.skip_rest(match miss {
                GrantMiss::NoOpen => "the file was never opened on the wire",
                _ => "no delegation was granted",
            });
            return RecallVerdict::stopped(v);
        }
    };
    let lower = ctx.granted_at.next();

    let conflicting = conflict_filter(conflict, &target.file_name, &ctx);
    let conflict_name = format!("Conflicting {} from the second client seen on the wire", conflict.label());
    cursor.rewind(lower);
    let Some(first_attempt) = cursor.find_event(&conflicting, Some(peer), None) else {
        v.check(conflict_name, false, "no matching call from the second client after the grant");
        v.skip_rest("the conflict never reached the server");
        return RecallVerdict::stopped(v);
    };
    v.check(conflict_name, true, first_attempt.event.summary());
    let conflict_pos = first_attempt.pos;
    let first_reply = cursor.find(&Filter::reply_to(first_attempt.event.xid, peer), None);

    let recall_to_client = Filter::call()
        .op(OpKind::CbRecall)
        .dst(client)
        .any_of(vec![
            Term::Fh(ctx.file_handle.clone()),
            Term::StateId(ctx.delegation_stateid.other.clone()),
        ]);
    cursor.rewind(lower);
    let early_recall = cursor.find(&recall_to_client, Some(conflict_pos));
    let early_detail = early_recall
        .map(|h| format!("CB_RECALL before the conflict: {}", h.event.summary()))
        .unwrap_or_default();

    if deleg == DelegationType::Read {
        v.check(
            "No recall on a non-conflicting read from the second client",
            early_recall.is_none(),
            early_detail.clone(),
        );
        match peer_read_delegation(&mut cursor, target, &ctx, peer, lower, conflict_pos) {
            Some(true) => {
                v.check(
                    "No recall while both clients hold READ delegations",
                    early_recall.is_none(),
                    early_detail.clone(),
                );
            }
            Some(false) => v.note("second client was not granted a READ delegation for its read"),
            None => v.note("no OPEN for the second client's read found before the conflict"),
        }
    }

    if config.use_lock {
        v.check(
            "No recall before the conflict while holding a lock",
            early_recall.is_none(),
            early_detail,
        );
        cursor.rewind(lower);
        let lock = cursor.find_event(&Filter::call().op(OpKind::Lock), Some(client), Some(conflict_pos));
        v.check(
            "No LOCK sent before the conflict",
            lock.is_none(),
            lock.map(|h| format!("unexpected LOCK at {}", h.event.summary()))
                .unwrap_or_default(),
        );
    }

    cursor.rewind(lower);
    let Some(recall) = cursor.find(&recall_to_client, None) else {
        v.check("CB_RECALL sent to the first client", false, "no recall callback for the file");
        v.skip_rest("the delegation was never recalled");
        return RecallVerdict {
            verdicts: v,
            recalled: Some(false),
        };
    };
    v.check("CB_RECALL sent to the first client", true, recall.event.summary());
    let recalled_stateid = recall.event.ops.iter().find_map(|op| match op {
        NfsOp::CbRecall { stateid, .. } => Some(stateid.clone()),
        _ => None,
    });
    v.check(
        "CB_RECALL carries the delegation stateid",
        recalled_stateid
            .as_ref()
            .is_some_and(|s| s.same_state(&ctx.delegation_stateid)),
        format!(
            "expected {}, got {}",
            ctx.delegation_stateid,
            recalled_stateid.map(|s| s.to_string()).unwrap_or_else(|| "-".into())
        ),
    );
    let recall_pos = recall.pos;

    cursor.rewind(recall_pos.next());
    let ret_call = cursor.find_event(
        &Filter::call()
            .op(OpKind::DelegReturn)
            .stateid(&ctx.delegation_stateid),
        Some(client),
        None,
    );
    let ret_reply = ret_call.and_then(|c| cursor.find(&Filter::reply_to(c.event.xid, client), None));
    let return_bound = ret_call.map_or(cursor.end(), |c| c.pos);
    let return_done = ret_reply.or(ret_call).map(|h| h.pos.next());

    let reclaim = check_reclaim(&mut v, &mut cursor, target, &ctx, client, recall_pos, return_bound);
    let reclaim_bound = reclaim.map_or(return_bound, |h| h.pos);

    if deleg == DelegationType::Write {
        check_flush(&mut v, &mut cursor, target, &ctx, client, recall_pos, reclaim_bound, return_bound);
        if config.use_lock {
            cursor.rewind(reclaim_bound);
            let lock = cursor.find_event(&Filter::call().op(OpKind::Lock), Some(client), Some(return_bound));
            v.check(
                "LOCK sent between the reclaim OPEN and DELEGRETURN",
                lock.is_some(),
                "locks held under the delegation were not sent to the server before returning it",
            );
        }
    }

    v.check(
        "DELEGRETURN sent for the recalled delegation",
        ret_call.is_some(),
        format!("no DELEGRETURN for {}", ctx.delegation_stateid),
    );

    // Single retry: a DELAY reply means the server was recalling; the retry after the
    // return sequence is the attempt that counts.
    let (attempt, reply) = match first_reply {
        Some(r) if r.event.status == NFS4ERR_DELAY => {
            cursor.rewind(return_done.unwrap_or(recall_pos.next()));
            let retry = cursor.find_event(&conflicting, Some(peer), None);
            let retry_reply = retry.and_then(|c| cursor.find(&Filter::reply_to(c.event.xid, peer), None));
            v.note(format!(
                "first conflicting call got NFS4ERR_DELAY; {}",
                retry.map_or("no retry found".to_string(), |c| format!("retry {}", c.event.summary()))
            ));
            (retry, retry_reply)
        }
        other => (Some(first_attempt), other),
    };
    let succeeded_after = match (attempt, reply, ret_call) {
        (Some(_), Some(r), Some(ret)) => r.event.is_ok() && r.pos > ret.pos,
        _ => false,
    };
    v.check(
        format!("{} from the second client succeeds after DELEGRETURN", conflict.label()),
        succeeded_after,
        match reply {
            None => "no reply to the conflicting call".to_string(),
            Some(r) if !r.event.is_ok() => format!("reply status {}", r.event.status),
            Some(r) => format!("reply at {} is not after the DELEGRETURN", r.event.summary()),
        },
    );
    if conflict.is_open()
        && let Some(r) = reply.filter(|r| r.event.is_ok())
    {
        v.check(
            "Second client is not granted a delegation",
            !Term::Delegated.holds(r.event),
            "OPEN reply to the second client carries a delegation",
        );
    }

    RecallVerdict {
        verdicts: v,
        recalled: Some(true),
    }
}

/// Whether the peer's read OPEN before the conflict got a READ delegation.
fn peer_read_delegation(
    cursor: &mut TraceCursor<'_>,
    target: &ReplayTarget,
    ctx: &DelegationContext,
    peer: &str,
    from: TracePosition,
    to: TracePosition,
) -> Option<bool> {
    cursor.rewind(from);
    let call = cursor.find_event(
        &Filter::call()
            .op(OpKind::Open)
            .any_of(vec![
                Term::Name(target.file_name.clone()),
                Term::Fh(ctx.file_handle.clone()),
            ])
            .with(Term::Access(ShareAccess::Read)),
        Some(peer),
        Some(to),
    )?;
    let reply = cursor.find(&Filter::reply_to(call.event.xid, peer), None)?;
    Some(Term::Delegation(DelegationType::Read).holds(reply.event))
}

fn check_reclaim<'a>(
    v: &mut Verdicts,
    cursor: &mut TraceCursor<'a>,
    target: &ReplayTarget,
    ctx: &DelegationContext,
    client: &str,
    recall_pos: TracePosition,
    return_bound: TracePosition,
) -> Option<Hit<'a>> {
    cursor.rewind(recall_pos.next());
    let reclaim = cursor.find_event(
        &Filter::call()
            .op(OpKind::Open)
            .any_of(vec![
                Term::Claim(ClaimType::DelegateCur),
                Term::Claim(ClaimType::DelegCurFh),
            ])
            .any_of(vec![
                Term::Name(target.file_name.clone()),
                Term::Fh(ctx.file_handle.clone()),
            ]),
        Some(client),
        Some(return_bound),
    );
    let Some(call) = reclaim else {
        v.check(
            "Reclaim OPEN sent before DELEGRETURN",
            false,
            "no OPEN with CLAIM_DELEGATE_CUR between the recall and the return",
        );
        return None;
    };
    v.check("Reclaim OPEN sent before DELEGRETURN", true, call.event.summary());

    let Some(reply) = cursor.find(&Filter::reply_to(call.event.xid, client), None) else {
        v.check("Reclaim OPEN returns the original open stateid", false, "reclaim OPEN has no reply");
        return Some(call);
    };
    let (stateid, granted) = match reply.event.first_op(OpKind::Open) {
        Some(NfsOp::Open {
            stateid,
            delegation,
            ..
        }) => (stateid.clone(), delegation.is_some()),
        _ => (None, false),
    };
    v.check(
        "Reclaim OPEN returns the original open stateid",
        stateid.as_ref().is_some_and(|s| s.same_state(&ctx.open_stateid)),
        format!(
            "expected {}, got {}",
            ctx.open_stateid,
            stateid.map(|s| s.to_string()).unwrap_or_else(|| "-".into())
        ),
    );
    v.check(
        "Reclaim OPEN is not granted a new delegation",
        !granted,
        "reclaim OPEN reply carries a delegation",
    );
    Some(call)
}

/// Writes made under a write delegation must all reach the server before it is returned.
#[allow(clippy::too_many_arguments)]
fn check_flush(
    v: &mut Verdicts,
    cursor: &mut TraceCursor<'_>,
    target: &ReplayTarget,
    ctx: &DelegationContext,
    client: &str,
    recall_pos: TracePosition,
    reclaim_bound: TracePosition,
    return_bound: TracePosition,
) {
    let io = IoFacts::collect(cursor, ctx, client, OpKind::Write);
    // Only the first half is written before the conflict takes the delegation away.
    let total = target.file_size / 2;
    let before = io.completed_bytes(ctx.granted_at, recall_pos);
    let flushing_calls = io.between(recall_pos, reclaim_bound).count();
    let after = io.completed_bytes(recall_pos, return_bound);

    let passed = before >= total || (flushing_calls > 0 && before + after >= total);
    v.check(
        "Delegated writes are flushed before the delegation is returned",
        passed,
        format!(
            "written under delegation={total} flushed before recall={before} \
             flushed between recall and return={after} writes before reclaim={flushing_calls}"
        ),
    );

    // Until the reclaim OPEN the delegation stateid is the only state the writes may name.
    let (delegated, strays) = io
        .between(ctx.granted_at, reclaim_bound)
        .fold((0usize, 0usize), |(ok, bad), r| {
            if r.stateid.as_ref().is_some_and(|s| s.same_state(&ctx.delegation_stateid)) {
                (ok + 1, bad)
            } else {
                (ok, bad + 1)
            }
        });
    v.check(
        "WRITE before the reclaim OPEN uses the delegation stateid",
        delegated > 0 && strays == 0,
        if delegated == 0 {
            format!("no WRITE with the delegation stateid {} before the reclaim OPEN", ctx.delegation_stateid)
        } else {
            format!("{strays} WRITE call(s) before the reclaim OPEN use another stateid")
        },
    );
}
