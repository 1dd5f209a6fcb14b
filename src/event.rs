//! Completion events.
//!
//! The forest never blocks: every wait is expressed as an `Event` that the
//! external scheduler triggers. Merged events trigger once all of their
//! preconditions have, and continuations registered with
//! [`EventTable::on_trigger`] resume deferred work.

use crate::{
    sync::Mutex,
    types::{HashMap, HashSet},
};
use derive_more::Display;
use smallvec::SmallVec;
use tracing::trace;

/// Handle of a completion event. `Event::NO_EVENT` has always triggered.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("e{_0}")]
pub struct Event(u64);

impl Event {
    /// The trivially triggered event.
    pub const NO_EVENT: Self = Self(0);

    /// Whether this is a real event.
    #[must_use]
    pub fn exists(self) -> bool {
        self != Self::NO_EVENT
    }

    /// Raw id, used on the wire.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }

    pub(crate) fn from_id(id: u64) -> Self {
        Self(id)
    }
}

type Continuation = Box<dyn FnOnce() + Send>;

/// Record count below which no pruning runs.
const PRUNE_MIN: usize = 4096;

#[derive(Default)]
struct EventRecord {
    /// Events this one was derived from.
    preconditions: SmallVec<[Event; 4]>,
    /// Merged events trigger automatically; user events need `trigger`.
    merged: bool,
    /// Preconditions of a merged event that have not triggered yet.
    pending: usize,
    triggered: bool,
    /// Merged events waiting on this one.
    dependents: SmallVec<[Event; 2]>,
    waiters: Vec<Continuation>,
}

/// Event records behind the table lock.
///
/// Triggered records are dropped once nothing pending derives from them.
/// A local id in `base..next` without a record was dropped that way, so it
/// has triggered; dropped foreign ids are remembered in `retired_foreign`.
struct Records {
    live: HashMap<Event, EventRecord>,
    base: u64,
    next: u64,
    retired_foreign: HashSet<Event>,
    prune_at: usize,
}

impl Records {
    fn allocate(&mut self) -> Event {
        let event = Event(self.next);
        self.next += 1;
        event
    }

    fn is_retired(&self, event: Event) -> bool {
        if (self.base..self.next).contains(&event.0) {
            !self.live.contains_key(&event)
        } else {
            self.retired_foreign.contains(&event)
        }
    }

    fn triggered(&self, event: Event) -> bool {
        !event.exists()
            || self
                .live
                .get(&event)
                .map_or_else(|| self.is_retired(event), |record| record.triggered)
    }

    fn insert(&mut self, event: Event, record: EventRecord) {
        self.live.insert(event, record);
        if self.live.len() >= self.prune_at {
            self.prune();
        }
    }

    /// Drop triggered records no pending record derives from.
    fn prune(&mut self) {
        let mut keep: HashSet<Event> = self
            .live
            .iter()
            .filter(|(_, record)| !record.triggered)
            .map(|(&event, _)| event)
            .collect();
        let mut stack: Vec<Event> = keep.iter().copied().collect();
        while let Some(event) = stack.pop() {
            if let Some(record) = self.live.get(&event) {
                for &pre in &record.preconditions {
                    if self.live.contains_key(&pre) && keep.insert(pre) {
                        stack.push(pre);
                    }
                }
            }
        }
        let before = self.live.len();
        let Self {
            live,
            base,
            next,
            retired_foreign,
            ..
        } = self;
        live.retain(|event, _| {
            let kept = keep.contains(event);
            if !kept && !(*base..*next).contains(&event.0) {
                retired_foreign.insert(*event);
            }
            kept
        });
        self.prune_at = (self.live.len() * 2).max(PRUNE_MIN);
        trace!(before, after = self.live.len(), "pruned events");
    }
}

/// Registry of every event the forest created or was handed.
pub struct EventTable {
    records: Mutex<Records>,
}

impl core::fmt::Debug for EventTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventTable")
            .field("events", &self.records.lock().live.len())
            .finish_non_exhaustive()
    }
}

impl EventTable {
    pub(crate) fn new(space: u16) -> Self {
        // Ids are partitioned per address space so remote events never
        // collide with local ones.
        let base = (u64::from(space) << 48) + 1;
        Self {
            records: Mutex::new(Records {
                live: HashMap::default(),
                base,
                next: base,
                retired_foreign: HashSet::default(),
                prune_at: PRUNE_MIN,
            }),
        }
    }

    /// Create an event that triggers only when `trigger` is called.
    pub fn create_user_event(&self) -> Event {
        self.create_dependent_event(core::iter::empty())
    }

    /// Create a user event that is ordered after `preconditions`.
    ///
    /// It still triggers only through `trigger`; the preconditions are kept
    /// so `depends_on` can see through it.
    pub fn create_dependent_event(&self, preconditions: impl IntoIterator<Item = Event>) -> Event {
        let preconditions = preconditions.into_iter().filter(|e| e.exists()).collect();
        let mut records = self.records.lock();
        let event = records.allocate();
        records.insert(
            event,
            EventRecord {
                preconditions,
                ..EventRecord::default()
            },
        );
        event
    }

    /// Record an event created elsewhere (e.g. received over the wire).
    pub fn import(&self, event: Event) {
        if event.exists() {
            let mut records = self.records.lock();
            if !records.is_retired(event) {
                records.live.entry(event).or_default();
            }
        }
    }

    /// Event that triggers once every input has triggered.
    ///
    /// Already triggered inputs are dropped; zero remaining inputs yield
    /// `NO_EVENT` and a single input is returned unchanged.
    pub fn merge_events(&self, events: impl IntoIterator<Item = Event>) -> Event {
        let mut records = self.records.lock();
        let mut inputs: SmallVec<[Event; 4]> = SmallVec::new();
        for event in events {
            if inputs.contains(&event) || records.triggered(event) {
                continue;
            }
            inputs.push(event);
        }
        match inputs.len() {
            0 => Event::NO_EVENT,
            1 => inputs[0],
            _ => {
                let merged = records.allocate();
                for &input in &inputs {
                    records.live.entry(input).or_default().dependents.push(merged);
                }
                records.insert(
                    merged,
                    EventRecord {
                        pending: inputs.len(),
                        preconditions: inputs,
                        merged: true,
                        ..EventRecord::default()
                    },
                );
                merged
            }
        }
    }

    /// Trigger a user event, cascading into merged events and running every
    /// continuation that becomes ready.
    pub fn trigger(&self, event: Event) {
        if !event.exists() {
            return;
        }
        let mut ready = Vec::new();
        {
            let mut records = self.records.lock();
            let mut worklist = vec![event];
            while let Some(current) = worklist.pop() {
                if records.is_retired(current) {
                    continue;
                }
                let record = records.live.entry(current).or_default();
                if record.triggered {
                    continue;
                }
                record.triggered = true;
                ready.append(&mut record.waiters);
                let dependents = core::mem::take(&mut record.dependents);
                for dependent in dependents {
                    if let Some(merged) = records.live.get_mut(&dependent) {
                        merged.pending = merged.pending.saturating_sub(1);
                        if merged.pending == 0 {
                            worklist.push(dependent);
                        }
                    }
                }
            }
        }
        trace!(%event, continuations = ready.len(), "event triggered");
        for continuation in ready {
            continuation();
        }
    }

    /// Whether the event has triggered. Unknown foreign events are treated
    /// as pending.
    pub fn has_triggered(&self, event: Event) -> bool {
        self.records.lock().triggered(event)
    }

    /// Run `continuation` once `event` triggers, or right away if it already
    /// has.
    pub fn on_trigger(&self, event: Event, continuation: impl FnOnce() + Send + 'static) {
        {
            let mut records = self.records.lock();
            if !records.triggered(event) {
                records
                    .live
                    .entry(event)
                    .or_default()
                    .waiters
                    .push(Box::new(continuation));
                return;
            }
        }
        continuation();
    }

    /// Whether `event` is ordered after `target`, directly or transitively.
    ///
    /// Chains are only known while some event along them is pending.
    pub fn depends_on(&self, event: Event, target: Event) -> bool {
        if !target.exists() {
            return true;
        }
        let records = self.records.lock();
        let mut stack = vec![event];
        let mut seen = Vec::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(record) = records.live.get(&current) {
                stack.extend(record.preconditions.iter().copied());
            }
        }
        false
    }

    /// Whether `event` is a merged event (as opposed to a user event).
    pub fn is_merged(&self, event: Event) -> bool {
        self.records.lock().live.get(&event).is_some_and(|r| r.merged)
    }

    /// Drop every triggered record nothing pending derives from.
    pub(crate) fn prune(&self) {
        self.records.lock().prune();
    }

    #[cfg(test)]
    fn live_records(&self) -> usize {
        self.records.lock().live.len()
    }
}
