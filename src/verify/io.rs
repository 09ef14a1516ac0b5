//! I/O a client actually put on the wire for a delegated file.

use std::collections::BTreeMap;

use crate::{DelegationContext, Filter, NfsOp, OpKind, StateId, TraceCursor, TracePosition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRecord {
    pub pos: TracePosition,
    pub xid: u32,
    pub offset: u64,
    /// Bytes requested by the call, or acknowledged by the reply when it says so.
    pub count: u64,
    pub stateid: Option<StateId>,
    /// A successful reply was seen.
    pub completed: bool,
}

/// READ or WRITE calls for the file sent by one client after the delegation was granted.
#[derive(Debug, Clone, Default)]
pub struct IoFacts {
    records: Vec<IoRecord>,
}

impl IoFacts {
    pub fn collect(cursor: &mut TraceCursor<'_>, ctx: &DelegationContext, client: &str, kind: OpKind) -> Self {
        let mut records = Vec::new();
        for target in &ctx.io_targets {
            cursor.rewind(ctx.granted_at);
            let filter = Filter::call()
                .op(kind)
                .dst(target)
                .any_of(ctx.handle_terms());
            while let Some(call) = cursor.find_event(&filter, Some(client), None) {
                let reply = cursor.peek_find(&Filter::reply_to(call.event.xid, client), None);

                let completed = reply.is_some_and(|r| r.event.is_ok());
                let acked: Vec<u64> = reply
                    .map(|r| r.event.ops_of(kind).filter_map(io_count).collect())
                    .unwrap_or_default();
                for (i, op) in call.event.ops_of(kind).enumerate() {
                    let (stateid, offset, count) = match op {
                        NfsOp::Read { stateid, offset, count } | NfsOp::Write { stateid, offset, count } => {
                            (stateid.clone(), offset.unwrap_or(0), *count)
                        }
                        _ => continue,
                    };
                    let count = if kind == OpKind::Write && completed {
                        acked.get(i).copied().unwrap_or(count)
                    } else {
                        count
                    };
                    records.push(IoRecord {
                        pos: call.pos,
                        xid: call.event.xid,
                        offset,
                        count,
                        stateid,
                        completed,
                    });
                }
            }
        }
        records.sort_by_key(|r| (r.pos, r.offset));
        tracing::debug!(op = kind.label(), count = records.len(), "collected file I/O");
        Self { records }
    }

    pub fn records(&self) -> &[IoRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Records whose stateid is missing or names another state.
    pub fn not_using<'s>(&'s self, stateid: &'s StateId) -> impl Iterator<Item = &'s IoRecord> + 's {
        self.records
            .iter()
            .filter(move |r| !r.stateid.as_ref().is_some_and(|s| s.same_state(stateid)))
    }

    /// Offsets requested more than once, with how often.
    pub fn duplicate_offsets(&self) -> Vec<(u64, usize)> {
        let mut seen: BTreeMap<u64, usize> = BTreeMap::new();
        for r in &self.records {
            *seen.entry(r.offset).or_default() += 1;
        }
        seen.into_iter().filter(|(_, n)| *n > 1).collect()
    }

    /// I/O calls in the window `[from, to)`.
    pub fn between(&self, from: TracePosition, to: TracePosition) -> impl Iterator<Item = &IoRecord> {
        self.records.iter().filter(move |r| r.pos >= from && r.pos < to)
    }

    /// Bytes the server acknowledged for calls in `[from, to)`.
    pub fn completed_bytes(&self, from: TracePosition, to: TracePosition) -> u64 {
        self.between(from, to)
            .filter(|r| r.completed)
            .map(|r| r.count)
            .sum()
    }
}

fn io_count(op: &NfsOp) -> Option<u64> {
    match op {
        NfsOp::Read { count, .. } | NfsOp::Write { count, .. } => Some(*count),
        _ => None,
    }
}
