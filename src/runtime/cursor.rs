//! Bookmarkable forward cursor over an immutable event trace.

use serde::{Deserialize, Serialize};

use crate::{Filter, PacketEvent};

/// Index into a captured trace. Positions taken before a rewind stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TracePosition(usize);

impl TracePosition {
    pub const START: TracePosition = TracePosition(0);

    pub fn index(self) -> usize {
        self.0
    }

    /// Position just past this one.
    pub fn next(self) -> TracePosition {
        TracePosition(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for TracePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An event found by the cursor, with the position it was found at.
#[derive(Debug, Clone, Copy)]
pub struct Hit<'a> {
    pub pos: TracePosition,
    pub event: &'a PacketEvent,
}

#[derive(Debug, Clone)]
pub struct TraceCursor<'a> {
    events: &'a [PacketEvent],
    index: usize,
}

impl<'a> TraceCursor<'a> {
    pub fn new(events: &'a [PacketEvent]) -> Self {
        Self { events, index: 0 }
    }

    pub fn position(&self) -> TracePosition {
        TracePosition(self.index)
    }

    pub fn end(&self) -> TracePosition {
        TracePosition(self.events.len())
    }

    pub fn rewind(&mut self, pos: TracePosition) {
        self.index = pos.0.min(self.events.len());
    }

    pub fn rewind_start(&mut self) {
        self.index = 0;
    }

    pub fn event_at(&self, pos: TracePosition) -> Option<&'a PacketEvent> {
        self.events.get(pos.0)
    }

    /// Finds the next event matching `filter`, optionally sent by `source`, never looking at
    /// positions at or beyond `max`.
    ///
    /// On a hit the cursor lands just past the event; otherwise it lands on `max` (or the end
    /// of the trace when unbounded).
    pub fn find_event(
        &mut self,
        filter: &Filter,
        source: Option<&str>,
        max: Option<TracePosition>,
    ) -> Option<Hit<'a>> {
        let limit = max.map_or(self.events.len(), |m| m.0.min(self.events.len()));
        let events = self.events;
        let start = self.index;
        if start >= limit {
            self.index = self.index.max(limit);
            return None;
        }
        for (offset, event) in events[start..limit].iter().enumerate() {
            if source.is_some_and(|src| event.src != src) {
                continue;
            }
            if filter.matches(event) {
                let at = start + offset;
                self.index = at + 1;
                return Some(Hit {
                    pos: TracePosition(at),
                    event,
                });
            }
        }
        self.index = limit;
        None
    }

    pub fn find(&mut self, filter: &Filter, max: Option<TracePosition>) -> Option<Hit<'a>> {
        self.find_event(filter, None, max)
    }

    /// Like [`find`](Self::find) but leaves the cursor where it was.
    pub fn peek_find(&mut self, filter: &Filter, max: Option<TracePosition>) -> Option<Hit<'a>> {
        let mark = self.position();
        let hit = self.find(filter, max);
        self.rewind(mark);
        hit
    }
}
