//! Several traces read together as one time ordered event stream.

use crate::error::DecodeError;
use crate::error::TracefileError;
use crate::event::Event;
use crate::event::EventPosition;
use crate::event::TracefileId;
use crate::time::LttTime;
use crate::trace::Trace;
use crate::trace::TraceError;
use crate::tracefile::Tracefile;
use compact_str::CompactString;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

/// A trace shared between tracesets.
pub type SharedTrace = Rc<RefCell<Trace>>;

/// An ordered list of traces.
#[derive(Debug, Default, Clone)]
pub struct Traceset {
    traces: Vec<SharedTrace>,
}

/// Next event of one tracefile, waiting in the merge.
#[derive(Debug, Clone, Copy)]
struct Pending {
    time: LttTime,
    trace: usize,
    tracefile: TracefileId,
    cpu: u32,
    /// Index of the tracefile in its trace.
    index: usize,
    position: EventPosition,
}

impl Pending {
    fn key(&self) -> (LttTime, usize, TracefileId, u32) {
        (self.time, self.trace, self.tracefile, self.cpu)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Saved state of a merge: the next event of every tracefile that has one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracesetPosition {
    entries: Vec<(usize, usize, EventPosition)>,
}

impl TracesetPosition {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read the next event of `tracefile`, stepping over records of unknown
/// markers.
fn advance(tracefile: &mut Tracefile) -> Result<Option<(LttTime, EventPosition)>, TracefileError> {
    loop {
        match tracefile.read_next() {
            Ok(Some(event)) => return Ok(Some((event.time(), event.position()))),
            Ok(None) => return Ok(None),
            Err(TracefileError::Decode(err @ DecodeError::UnknownMarker { .. })) => {
                log::debug!("{}: {err}", tracefile.name());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Pull based, time ordered iteration over a traceset.
///
/// Events are handed to a closure because they borrow their tracefile,
/// which lives inside a shared trace. The closure must not borrow the
/// traces mutably.
#[derive(Debug)]
pub struct MergeCursor<'s> {
    traceset: &'s Traceset,
    heap: BinaryHeap<Reverse<Pending>>,
    /// Errors of tracefiles that left the merge.
    failures: Vec<TracefileError>,
}

impl<'s> MergeCursor<'s> {
    fn new(traceset: &'s Traceset) -> Self {
        Self {
            traceset,
            heap: BinaryHeap::new(),
            failures: Vec::new(),
        }
    }

    /// Queue the next event of `tracefile`. A tracefile that fails is left
    /// out of the merge, the others go on.
    fn push(&mut self, trace: usize, index: usize, tracefile: &mut Tracefile) {
        match advance(tracefile) {
            Ok(Some((time, position))) => self.heap.push(Reverse(Pending {
                time,
                trace,
                tracefile: tracefile.id(),
                cpu: tracefile.cpu(),
                index,
                position,
            })),
            Ok(None) => {}
            Err(err) => self.fail(tracefile, err),
        }
    }

    fn fail(&mut self, tracefile: &Tracefile, err: TracefileError) {
        log::error!("{}: dropped from the merge: {err}", tracefile.name());
        self.failures.push(err);
    }

    /// Time of the next event.
    pub fn peek_time(&self) -> Option<LttTime> {
        self.heap.peek().map(|Reverse(p)| p.time)
    }

    /// Hand the next event to `f`, then move its tracefile forward.
    /// `None` once every tracefile is exhausted or has failed.
    pub fn next_with<R>(&mut self, f: impl FnOnce(&Event<'_>) -> R) -> Option<R> {
        let Reverse(pending) = self.heap.pop()?;
        let traceset = self.traceset;
        let shared = &traceset.traces[pending.trace];
        let result = {
            let trace = shared.borrow();
            trace
                .tracefile(pending.index)
                .and_then(Tracefile::current)
                .map(|event| f(&event))
        };
        let mut trace = shared.borrow_mut();
        if let Some(tracefile) = trace.tracefile_mut(pending.index) {
            self.push(pending.trace, pending.index, tracefile);
        }
        result
    }

    /// Errors of the tracefiles that left the merge so far.
    pub fn failures(&self) -> &[TracefileError] {
        &self.failures
    }

    /// Position to come back to with [`Traceset::seek_position`].
    pub fn position(&self) -> TracesetPosition {
        let mut entries: Vec<_> = self
            .heap
            .iter()
            .map(|Reverse(p)| (p.trace, p.index, p.position))
            .collect();
        entries.sort_unstable();
        TracesetPosition { entries }
    }
}

/// Whether processing goes on after a hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop,
}

pub type EventHook<'h> = Box<dyn FnMut(&Event<'_>) -> HookAction + 'h>;

/// Callbacks run by [`Traceset::process`].
#[derive(Default)]
pub struct Hooks<'h> {
    all: Vec<EventHook<'h>>,
    by_marker: HashMap<(CompactString, CompactString), Vec<EventHook<'h>>>,
}

impl std::fmt::Debug for Hooks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("all", &self.all.len())
            .field("by_marker", &self.by_marker.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<'h> Hooks<'h> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` for every event.
    pub fn on_event(&mut self, hook: impl FnMut(&Event<'_>) -> HookAction + 'h) -> &mut Self {
        self.all.push(Box::new(hook));
        self
    }

    /// Run `hook` for events of one marker.
    pub fn on_marker(
        &mut self,
        channel: &str,
        name: &str,
        hook: impl FnMut(&Event<'_>) -> HookAction + 'h,
    ) -> &mut Self {
        self.by_marker
            .entry((channel.into(), name.into()))
            .or_default()
            .push(Box::new(hook));
        self
    }

    fn run(&mut self, event: &Event<'_>) -> HookAction {
        let mut action = HookAction::Continue;
        for hook in &mut self.all {
            if hook(event) == HookAction::Stop {
                action = HookAction::Stop;
            }
        }
        let key = (CompactString::from(event.channel()), CompactString::from(event.name()));
        if let Some(hooks) = self.by_marker.get_mut(&key) {
            for hook in hooks {
                if hook(event) == HookAction::Stop {
                    action = HookAction::Stop;
                }
            }
        }
        action
    }
}

impl Traceset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every trace directory in `paths`.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, TraceError> {
        let mut traceset = Self::new();
        for path in paths {
            traceset.add(Rc::new(RefCell::new(Trace::open(path.as_ref())?)));
        }
        Ok(traceset)
    }

    pub fn add(&mut self, trace: SharedTrace) {
        self.traces.push(trace);
    }

    pub fn remove(&mut self, index: usize) -> SharedTrace {
        self.traces.remove(index)
    }

    pub fn traces(&self) -> &[SharedTrace] {
        &self.traces
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Earliest start and latest end over all traces.
    pub fn time_span(&self) -> Result<Option<(LttTime, LttTime)>, TracefileError> {
        let mut span: Option<(LttTime, LttTime)> = None;
        for trace in &self.traces {
            if let Some((start, end)) = trace.borrow_mut().time_span()? {
                span = Some(match span {
                    Some((s, e)) => (s.min(start), e.max(end)),
                    None => (start, end),
                });
            }
        }
        Ok(span)
    }

    /// Build a cursor after positioning every tracefile with `position`.
    fn cursor(
        &self,
        mut position: impl FnMut(&mut Tracefile) -> Result<(), TracefileError>,
    ) -> MergeCursor<'_> {
        let mut cursor = MergeCursor::new(self);
        for (trace_index, trace) in self.traces.iter().enumerate() {
            let mut trace = trace.borrow_mut();
            for (index, tracefile) in trace.tracefiles_mut().enumerate() {
                match position(tracefile) {
                    Ok(()) => cursor.push(trace_index, index, tracefile),
                    Err(err) => cursor.fail(tracefile, err),
                }
            }
        }
        cursor
    }

    /// Merge from the first event of every tracefile.
    pub fn rewind(&self) -> MergeCursor<'_> {
        self.cursor(|tracefile| {
            tracefile.rewind();
            Ok(())
        })
    }

    /// Merge from the first event at or after `time`.
    pub fn seek_time(&self, time: LttTime) -> MergeCursor<'_> {
        log::debug!("Seeking traceset to {time}");
        self.cursor(|tracefile| tracefile.seek_time(time))
    }

    /// Merge from a saved position. Tracefiles that were exhausted stay
    /// exhausted. Fails only when `position` was not taken on this
    /// traceset.
    pub fn seek_position(
        &self,
        position: &TracesetPosition,
    ) -> Result<MergeCursor<'_>, TracefileError> {
        let mut cursor = MergeCursor::new(self);
        for &(trace_index, index, event_position) in &position.entries {
            let Some(trace) = self.traces.get(trace_index) else {
                return Err(TracefileError::ForeignPosition);
            };
            let mut trace = trace.borrow_mut();
            let tracefile = trace
                .tracefile_mut(index)
                .ok_or(TracefileError::ForeignPosition)?;
            match tracefile.seek_position(event_position) {
                Ok(()) => cursor.push(trace_index, index, tracefile),
                Err(err @ TracefileError::ForeignPosition) => return Err(err),
                Err(err) => cursor.fail(tracefile, err),
            }
        }
        Ok(cursor)
    }

    /// Run `hooks` on every event between `start` and `end` inclusive, in
    /// time order. Tracefiles that fail are logged and left out. Returns the
    /// number of events processed.
    pub fn process(&self, start: LttTime, end: LttTime, hooks: &mut Hooks<'_>) -> u64 {
        let mut cursor = self.seek_time(start);
        let mut count = 0;
        while cursor.peek_time().is_some_and(|time| time <= end) {
            let Some(action) = cursor.next_with(|event| hooks.run(event)) else {
                break;
            };
            count += 1;
            if action == HookAction::Stop {
                break;
            }
        }
        count
    }
}
