//! Locating the delegation-granting OPEN and building the context every later check reads.

use serde::{Deserialize, Serialize};

use crate::{
    DelegationType, FileHandle, Filter, Hit, NfsOp, OpKind, StateId, Term, TraceCursor,
    TracePosition,
};

/// Who is who on the wire, and which file the scenario is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayTarget {
    pub file_name: String,
    pub client_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
    pub server_addr: String,
    pub file_size: u64,
}

/// Delegation state handed out to one client for one file. Read-only once built.
#[derive(Debug, Clone)]
pub struct DelegationContext {
    pub file_handle: FileHandle,
    pub delegation_type: DelegationType,
    pub delegation_stateid: StateId,
    pub open_stateid: StateId,
    /// The file's handle plus any data-server handles from a pNFS layout.
    pub owner_file_handles: Vec<FileHandle>,
    /// Addresses that carry the file's I/O: the server, or every data server of the layout.
    pub io_targets: Vec<String>,
    /// Position of the granting OPEN reply.
    pub granted_at: TracePosition,
}

impl DelegationContext {
    pub fn handle_terms(&self) -> Vec<Term> {
        self.owner_file_handles.iter().cloned().map(Term::Fh).collect()
    }
}

/// The OPEN exchange for a file, whatever it granted.
#[derive(Debug, Clone)]
pub struct OpenExchange<'a> {
    pub call: Hit<'a>,
    pub reply: Hit<'a>,
    pub file_handle: Option<FileHandle>,
    pub open_stateid: Option<StateId>,
    pub delegation: Option<(DelegationType, StateId)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantMiss {
    NoOpen,
    NoReply { xid: u32 },
    OpenFailed { status: u32 },
    NotDelegated,
    WrongType { granted: DelegationType },
}

impl std::fmt::Display for GrantMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOpen => f.write_str("no OPEN call for the file found in the trace"),
            Self::NoReply { xid } => write!(f, "OPEN call xid={xid:#010x} has no reply"),
            Self::OpenFailed { status } => write!(f, "OPEN failed with status {status}"),
            Self::NotDelegated => f.write_str("OPEN reply carries no delegation"),
            Self::WrongType { granted } => write!(f, "OPEN granted a {granted} delegation instead"),
        }
    }
}

/// Handle the server gave out for `name` in the first LOOKUP of it by `client`.
///
/// Tie-break: the first GETFH that follows the LOOKUP in the same compound.
pub fn lookup_handle(cursor: &mut TraceCursor<'_>, name: &str, client: &str) -> Option<FileHandle> {
    let lookup = cursor.find_event(&Filter::call().op(OpKind::Lookup).name(name), Some(client), None)?;
    let reply = cursor.find(&Filter::reply_to(lookup.event.xid, client), None)?;
    reply.event.handle_after(OpKind::Lookup).cloned()
}

/// Finds `client`'s first OPEN of the file from the cursor position and its reply.
///
/// The call is matched by name, or by `handle` when the client already knew it (an OPEN by
/// filehandle after a LOOKUP).
pub fn find_open<'a>(
    cursor: &mut TraceCursor<'a>,
    name: &str,
    handle: Option<&FileHandle>,
    client: &str,
    extra: Option<Term>,
) -> Result<OpenExchange<'a>, GrantMiss> {
    let mut who = vec![Term::Name(name.to_string())];
    if let Some(fh) = handle {
        who.push(Term::Fh(fh.clone()));
    }
    let mut filter = Filter::call().op(OpKind::Open).any_of(who);
    if let Some(term) = extra {
        filter = filter.with(term);
    }
    let call = cursor.find_event(&filter, Some(client), None).ok_or(GrantMiss::NoOpen)?;
    let reply = cursor
        .find(&Filter::reply_to(call.event.xid, client), None)
        .ok_or(GrantMiss::NoReply { xid: call.event.xid })?;

    let (open_stateid, delegation) = match reply.event.first_op(OpKind::Open) {
        Some(NfsOp::Open {
            stateid,
            delegation,
            ..
        }) => (
            stateid.clone(),
            delegation.as_ref().map(|d| (d.kind, d.stateid.clone())),
        ),
        _ => (None, None),
    };
    let file_handle = reply
        .event
        .handle_after(OpKind::Open)
        .or_else(|| {
            // OPEN by filehandle: the current filehandle already is the file.
            call.event
                .first_op(OpKind::Open)
                .filter(|op| matches!(op, NfsOp::Open { name: None, .. }))
                .and_then(|_| call.event.put_handle())
        })
        .or(handle)
        .cloned();

    Ok(OpenExchange {
        call,
        reply,
        file_handle,
        open_stateid,
        delegation,
    })
}

/// Locates the OPEN that granted `client` a delegation of `expected` type for the target.
pub fn locate_grant(
    cursor: &mut TraceCursor<'_>,
    target: &ReplayTarget,
    client: &str,
    by_handle: bool,
    expected: DelegationType,
) -> Result<DelegationContext, GrantMiss> {
    cursor.rewind_start();
    let hint = if by_handle {
        lookup_handle(cursor, &target.file_name, client)
    } else {
        None
    };
    cursor.rewind_start();
    let open = find_open(cursor, &target.file_name, hint.as_ref(), client, None)?;
    if !open.reply.event.is_ok() {
        return Err(GrantMiss::OpenFailed {
            status: open.reply.event.status,
        });
    }
    let Some((granted, delegation_stateid)) = open.delegation.clone() else {
        return Err(GrantMiss::NotDelegated);
    };
    if granted != expected {
        return Err(GrantMiss::WrongType { granted });
    }
    let file_handle = open.file_handle.clone().ok_or(GrantMiss::NoOpen)?;
    let open_stateid = open.open_stateid.clone().unwrap_or_else(|| delegation_stateid.clone());
    let granted_at = open.reply.pos;

    let (owner_file_handles, io_targets) =
        io_layout(cursor, &file_handle, client, &target.server_addr, granted_at);
    cursor.rewind(granted_at.next());

    tracing::debug!(
        fh = %file_handle,
        deleg = %delegation_stateid,
        open = %open_stateid,
        at = %granted_at,
        targets = ?io_targets,
        "delegation granted"
    );

    Ok(DelegationContext {
        file_handle,
        delegation_type: granted,
        delegation_stateid,
        open_stateid,
        owner_file_handles,
        io_targets,
        granted_at,
    })
}

/// Resolves where the file's I/O goes. Without a layout that is the server itself; with one,
/// every data server named by the layout's devices, addressed by the layout's handles.
fn io_layout(
    cursor: &mut TraceCursor<'_>,
    fh: &FileHandle,
    client: &str,
    server: &str,
    from: TracePosition,
) -> (Vec<FileHandle>, Vec<String>) {
    let mut handles = vec![fh.clone()];
    let fallback = (handles.clone(), vec![server.to_string()]);

    cursor.rewind(from);
    let Some(call) = cursor.find_event(&Filter::call().op(OpKind::LayoutGet).fh(fh), Some(client), None) else {
        return fallback;
    };
    let Some(reply) = cursor.find(&Filter::reply_to(call.event.xid, client), None) else {
        return fallback;
    };
    let Some(NfsOp::LayoutGet { device_ids, fhs }) = reply.event.first_op(OpKind::LayoutGet) else {
        return fallback;
    };
    if !reply.event.is_ok() || device_ids.is_empty() {
        return fallback;
    }

    let mut addrs: Vec<String> = Vec::new();
    for id in device_ids {
        // Device info may have been fetched for an earlier file and cached, so scan it all.
        cursor.rewind_start();
        let found = cursor.find(
            &Filter::reply()
                .op(OpKind::GetDeviceInfo)
                .dst(client)
                .with(Term::DeviceId(id.clone())),
            None,
        );
        if let Some(NfsOp::GetDeviceInfo { addrs: ds, .. }) =
            found.and_then(|h| h.event.first_op(OpKind::GetDeviceInfo))
        {
            for a in ds {
                if !addrs.contains(a) {
                    addrs.push(a.clone());
                }
            }
        }
    }
    if addrs.is_empty() {
        return fallback;
    }
    for h in fhs {
        if !handles.iter().any(|x| x.matches(h)) {
            handles.push(h.clone());
        }
    }
    (handles, addrs)
}
