//! Assertions for a single client holding a delegation while it and another local
//! process reopen the file.

use crate::{
    DelegationType, Filter, GrantMiss, IoFacts, OpKind, PacketEvent, ReplayTarget, ScenarioConfig,
    Term, TraceCursor, Verdicts, locate_grant,
};

pub fn verify_basic(events: &[PacketEvent], target: &ReplayTarget, config: &ScenarioConfig) -> Verdicts {
    let mut v = Verdicts::new();
    let mut cursor = TraceCursor::new(events);
    let client = target.client_addr.as_str();
    let deleg = config.delegation_type;

    let grant_name = format!("OPEN grants a {deleg} delegation for {}", target.file_name);
    let ctx = match locate_grant(&mut cursor, target, client, config.use_stat, deleg) {
        Ok(ctx) => {
            v.check(
                grant_name,
                true,
                format!("delegation stateid {}", ctx.delegation_stateid),
            );
            ctx
        }
        Err(miss) => {
            v.check(grant_name, false, miss.to_string());
            v.skip_rest(match miss {
                GrantMiss::NoOpen => "the file was never opened on the wire",
                _ => "no delegation was granted",
            });
            return v;
        }
    };

    // Every reopen, by this owner or another local process, must be served from the delegation.
    cursor.rewind(ctx.granted_at.next());
    let reopen = cursor.find_event(
        &Filter::call().op(OpKind::Open).any_of(vec![
            Term::Name(target.file_name.clone()),
            Term::Fh(ctx.file_handle.clone()),
        ]),
        Some(client),
        None,
    );
    v.check(
        "No OPEN sent for the file while the delegation is held",
        reopen.is_none(),
        reopen
            .map(|h| format!("unexpected OPEN at {}", h.event.summary()))
            .unwrap_or_default(),
    );

    let io_kind = match deleg {
        DelegationType::Read => OpKind::Read,
        DelegationType::Write => OpKind::Write,
    };
    let io = IoFacts::collect(&mut cursor, &ctx, client, io_kind);
    let label = io_kind.label();
    let where_to = if ctx.io_targets.len() == 1 && ctx.io_targets[0] == target.server_addr {
        "the server".to_string()
    } else {
        format!("data servers {}", ctx.io_targets.join(", "))
    };
    if v.check(
        format!("{label} sent to {where_to}"),
        !io.is_empty(),
        format!("no {label} for the file after the delegation was granted"),
    ) {
        let strays: Vec<String> = io
            .not_using(&ctx.delegation_stateid)
            .map(|r| {
                format!(
                    "xid={:#010x} offset={} stateid={}",
                    r.xid,
                    r.offset,
                    r.stateid.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into())
                )
            })
            .collect();
        v.check(
            format!("{label} uses the delegation stateid"),
            strays.is_empty(),
            format!("{} of {} calls use another stateid: {}", strays.len(), io.len(), strays.join("; ")),
        );
    }

    if deleg == DelegationType::Read {
        let dups = io.duplicate_offsets();
        v.check(
            "READ does not fetch cached data again",
            dups.is_empty(),
            dups.iter()
                .map(|(off, n)| format!("offset {off} read {n} times"))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    if config.use_lock {
        cursor.rewind_start();
        let lock = cursor.find_event(&Filter::call().op(OpKind::Lock), Some(client), None);
        v.check(
            "No LOCK sent while holding the delegation",
            lock.is_none(),
            lock.map(|h| format!("unexpected LOCK at {}", h.event.summary()))
                .unwrap_or_default(),
        );
    }

    v
}
