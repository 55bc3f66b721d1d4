//! Delay-based event scheduler.
//!
//! Each scheduled entry relates a person, an event kind, and a remaining
//! delay. [`EventScheduler::tick`] decrements every delay by one;
//! [`EventScheduler::fire`] collects entries whose delay has reached zero
//! (or below) and hands them to the event's listeners.
//!
//! # Ordering
//!
//! Events fire in ascending [`EventId`] order, and listeners of one event run
//! in registration order. Within a fired batch persons appear in scheduling
//! order. A person with several ready entries for the same event appears once
//! per entry: batches are multisets, not sets.
//!
//! # Storage
//!
//! Entries live in a generational arena. Two indexes point into it: one list
//! per event (scheduling order) and one list per person. Clearing a person
//! removes its entries from the arena immediately; the per-event lists drop
//! stale keys lazily, compacting once stale keys outnumber live entries or
//! at the start of a fire pass.
//!
//! # Failure
//!
//! Each event's listeners commit as a unit. If a listener fails, events that
//! already fired in the pass keep their effects, the failing event's entries
//! stay scheduled, and the work its listeners staged is discarded.

use std::collections::{BTreeSet, HashMap};

use slotmap::SlotMap;
use tracing::trace;

use crate::context::{PendingOp, StepContext};
use crate::error::{ConfigError, SimError};
use crate::fixed::{Delay, Time};
use crate::id::{EntryId, EventId, PersonId};
use crate::population::PopulationStore;
use crate::rng::SimRng;
use crate::update_queue::UpdateQueue;

// ---------------------------------------------------------------------------
// Entries and listeners
// ---------------------------------------------------------------------------

/// A pending trigger for one person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScheduledEntry {
    pub person: PersonId,
    pub event: EventId,
    /// Steps remaining. Ready once this is zero or negative.
    pub delay: i64,
}

impl ScheduledEntry {
    pub fn is_ready(&self) -> bool {
        self.delay <= 0
    }
}

/// Invoked with the persons of a fired batch and the current time.
pub type Listener = Box<dyn FnMut(&mut StepContext<'_>, &[PersonId], Time) -> Result<(), SimError>>;

struct EventDef {
    label: String,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for EventDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDef")
            .field("label", &self.label)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Per-event batch sizes produced by one fire pass, in firing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireReport {
    pub fired: Vec<(EventId, usize)>,
}

impl FireReport {
    /// Total entries fired across all events.
    pub fn total(&self) -> usize {
        self.fired.iter().map(|(_, n)| n).sum()
    }
}

// ---------------------------------------------------------------------------
// EventScheduler
// ---------------------------------------------------------------------------

/// Owns every scheduled entry. Persons and events are referenced by handle.
#[derive(Debug, Default)]
pub struct EventScheduler {
    events: Vec<EventDef>,
    event_name_to_id: HashMap<String, EventId>,
    entries: SlotMap<EntryId, ScheduledEntry>,
    /// Entry keys per event in scheduling order. May hold stale keys.
    by_event: Vec<Vec<EntryId>>,
    by_person: HashMap<PersonId, Vec<EntryId>>,
    /// Upper bound on stale keys held in `by_event`.
    stale: usize,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Event registration
    // -----------------------------------------------------------------------

    /// Register an event kind. Returns its ID.
    pub fn register_event(&mut self, label: &str) -> Result<EventId, ConfigError> {
        if self.event_name_to_id.contains_key(label) {
            return Err(ConfigError::DuplicateEvent(label.to_string()));
        }
        let id = EventId(self.events.len() as u32);
        self.events.push(EventDef {
            label: label.to_string(),
            listeners: Vec::new(),
        });
        self.by_event.push(Vec::new());
        self.event_name_to_id.insert(label.to_string(), id);
        Ok(id)
    }

    /// Append a listener to an event. Listeners run in registration order.
    pub fn add_listener<F>(&mut self, event: EventId, listener: F) -> Result<(), ConfigError>
    where
        F: FnMut(&mut StepContext<'_>, &[PersonId], Time) -> Result<(), SimError> + 'static,
    {
        let def = self
            .events
            .get_mut(event.index())
            .ok_or(ConfigError::UnknownEvent(event.0))?;
        def.listeners.push(Box::new(listener));
        Ok(())
    }

    pub fn event_id(&self, label: &str) -> Option<EventId> {
        self.event_name_to_id.get(label).copied()
    }

    pub fn event_label(&self, event: EventId) -> Option<&str> {
        self.events.get(event.index()).map(|e| e.label.as_str())
    }

    pub fn event_labels(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn contains_event(&self, event: EventId) -> bool {
        event.index() < self.events.len()
    }

    pub fn listener_count(&self, event: EventId) -> usize {
        self.events
            .get(event.index())
            .map_or(0, |e| e.listeners.len())
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Create one entry per element of `persons`. Existing entries for the
    /// same persons are kept. An empty `persons` is a no-op.
    pub fn schedule(
        &mut self,
        persons: &[PersonId],
        delay: Delay,
        event: EventId,
    ) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        if !self.contains_event(event) {
            return Err(ConfigError::UnknownEvent(event.0).into());
        }
        for &person in persons {
            self.insert(ScheduledEntry {
                person,
                event,
                delay: delay as i64,
            });
        }
        Ok(persons.len())
    }

    fn insert(&mut self, entry: ScheduledEntry) -> EntryId {
        let key = self.entries.insert(entry);
        self.by_event[entry.event.index()].push(key);
        self.by_person.entry(entry.person).or_default().push(key);
        key
    }

    /// Re-insert an entry verbatim, keeping its remaining delay.
    pub(crate) fn restore_entry(&mut self, entry: ScheduledEntry) -> Result<(), SimError> {
        if !self.contains_event(entry.event) {
            return Err(ConfigError::UnknownEvent(entry.event.0).into());
        }
        self.insert(entry);
        Ok(())
    }

    /// Remove every entry belonging to any person in `persons`, whatever its
    /// event or remaining delay. Returns the number of entries removed.
    pub fn clear(&mut self, persons: &[PersonId]) -> usize {
        let mut removed = 0;
        for person in persons {
            if let Some(keys) = self.by_person.remove(person) {
                removed += keys
                    .into_iter()
                    .filter(|k| self.entries.remove(*k).is_some())
                    .count();
            }
        }
        self.stale += removed;
        if self.stale > self.entries.len() {
            self.compact();
        }
        removed
    }

    /// Drop stale keys from every per-event list.
    fn compact(&mut self) {
        let entries = &self.entries;
        for keys in &mut self.by_event {
            keys.retain(|k| entries.contains_key(*k));
        }
        self.stale = 0;
    }

    /// Remove every entry.
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.by_person.clear();
        for keys in &mut self.by_event {
            keys.clear();
        }
        self.stale = 0;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct persons with at least one entry (ready or pending) for `event`.
    pub fn scheduled_for(&self, event: EventId) -> BTreeSet<PersonId> {
        self.live_entries(event).map(|e| e.person).collect()
    }

    /// Entries of `event` in scheduling order.
    pub fn live_entries(&self, event: EventId) -> impl Iterator<Item = &ScheduledEntry> + '_ {
        self.by_event
            .get(event.index())
            .into_iter()
            .flatten()
            .filter_map(|k| self.entries.get(*k))
    }

    /// Every live entry, grouped by event in ascending order, each group in
    /// scheduling order.
    pub fn all_entries(&self) -> impl Iterator<Item = &ScheduledEntry> + '_ {
        (0..self.events.len()).flat_map(move |e| self.live_entries(EventId(e as u32)))
    }

    /// `(event, remaining delay)` for every entry of `person`.
    pub fn entries_for(&self, person: PersonId) -> Vec<(EventId, i64)> {
        self.by_person
            .get(&person)
            .into_iter()
            .flatten()
            .filter_map(|k| self.entries.get(*k))
            .map(|e| (e.event, e.delay))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Advancing
    // -----------------------------------------------------------------------

    /// Decrement every remaining delay by one.
    pub fn tick(&mut self) {
        for entry in self.entries.values_mut() {
            entry.delay -= 1;
        }
    }

    /// Fire every ready entry.
    ///
    /// For each event in ascending order, the ready batch is handed to each
    /// listener in registration order, then the fired entries are removed.
    /// Work staged by listeners is applied after the whole pass, so nothing
    /// scheduled here fires before the next call.
    ///
    /// On a listener error the events fired before it stay committed (their
    /// entries removed, their staged work applied) and the failing event's
    /// entries are left in place.
    pub fn fire(
        &mut self,
        time: Time,
        population: &PopulationStore,
        updates: &mut UpdateQueue,
        rng: &mut SimRng,
    ) -> Result<FireReport, SimError> {
        if self.stale > 0 {
            self.compact();
        }
        let mut committed = Vec::new();
        let mut report = FireReport::default();

        for idx in 0..self.events.len() {
            let ready: Vec<EntryId> = self.by_event[idx]
                .iter()
                .copied()
                .filter(|k| self.entries[*k].is_ready())
                .collect();
            if ready.is_empty() {
                continue;
            }
            let batch: Vec<PersonId> = ready.iter().map(|k| self.entries[*k].person).collect();

            let mut staged = Vec::new();
            let mut listeners = std::mem::take(&mut self.events[idx].listeners);
            let result = {
                let mut ctx = StepContext::new(time, population, self, &mut staged, rng);
                listeners
                    .iter_mut()
                    .try_for_each(|listener| listener(&mut ctx, &batch, time))
            };
            self.events[idx].listeners = listeners;
            if let Err(err) = result {
                self.apply_ops(updates, committed)?;
                return Err(err);
            }
            committed.append(&mut staged);

            for key in &ready {
                self.remove(*key);
            }
            let entries = &self.entries;
            self.by_event[idx].retain(|k| entries.contains_key(*k));

            trace!(time, event = %self.events[idx].label, fired = batch.len(), "fired event");
            report.fired.push((EventId(idx as u32), batch.len()));
        }

        self.apply_ops(updates, committed)?;
        Ok(report)
    }

    fn remove(&mut self, key: EntryId) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        if let Some(keys) = self.by_person.get_mut(&entry.person) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_person.remove(&entry.person);
            }
        }
    }

    /// Apply staged callback work in the order it was requested.
    pub(crate) fn apply_ops(
        &mut self,
        updates: &mut UpdateQueue,
        ops: Vec<PendingOp>,
    ) -> Result<(), SimError> {
        for op in ops {
            match op {
                PendingOp::Queue { persons, target } => {
                    updates.queue(&persons, target)?;
                }
                PendingOp::Schedule {
                    persons,
                    delay,
                    event,
                } => {
                    self.schedule(&persons, delay, event)?;
                }
                PendingOp::Clear { persons } => {
                    self.clear(&persons);
                }
            }
        }
        Ok(())
    }

    /// Verify that both indexes agree with the arena.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        let by_person: usize = self.by_person.values().map(Vec::len).sum();
        if by_person != self.entries.len() {
            return Err(SimError::Invariant(format!(
                "person index holds {by_person} keys for {} entries",
                self.entries.len()
            )));
        }
        for (key, entry) in &self.entries {
            let indexed = self
                .by_event
                .get(entry.event.index())
                .is_some_and(|keys| keys.contains(&key));
            if !indexed {
                return Err(SimError::Invariant(format!(
                    "entry for person {} missing from event {} index",
                    entry.person.0, entry.event.0
                )));
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type FireLog = Rc<RefCell<Vec<(String, Vec<PersonId>, Time)>>>;

    struct Harness {
        store: PopulationStore,
        updates: UpdateQueue,
        rng: SimRng,
        scheduler: EventScheduler,
        log: FireLog,
    }

    impl Harness {
        fn new(events: &[&str]) -> Self {
            let mut store = PopulationStore::new();
            store
                .initialize(["S", "I", "S", "I"], &["S", "I", "R"])
                .unwrap();
            let mut updates = UpdateQueue::new();
            updates.configure_for(&store);
            let log: FireLog = Rc::new(RefCell::new(Vec::new()));
            let mut scheduler = EventScheduler::new();
            for &label in events {
                let id = scheduler.register_event(label).unwrap();
                let log = Rc::clone(&log);
                let name = label.to_string();
                scheduler
                    .add_listener(id, move |_ctx, persons, t| {
                        log.borrow_mut().push((name.clone(), persons.to_vec(), t));
                        Ok(())
                    })
                    .unwrap();
            }
            Self {
                store,
                updates,
                rng: SimRng::new(1),
                scheduler,
                log,
            }
        }

        fn fire(&mut self, time: Time) -> FireReport {
            self.scheduler
                .fire(time, &self.store, &mut self.updates, &mut self.rng)
                .unwrap()
        }
    }

    fn p(ids: &[u32]) -> Vec<PersonId> {
        ids.iter().copied().map(PersonId).collect()
    }

    #[test]
    fn fires_after_delay_elapses() {
        let mut h = Harness::new(&["recover"]);
        let recover = h.scheduler.event_id("recover").unwrap();
        h.scheduler.schedule(&p(&[0]), 2, recover).unwrap();

        h.scheduler.tick();
        assert_eq!(h.fire(1).total(), 0);
        h.scheduler.tick();
        let report = h.fire(2);

        assert_eq!(report.fired, vec![(recover, 1)]);
        assert_eq!(h.log.borrow().len(), 1);
        assert_eq!(h.log.borrow()[0].1, p(&[0]));
        assert_eq!(h.log.borrow()[0].2, 2);
        assert!(!h.scheduler.scheduled_for(recover).contains(&PersonId(0)));
        assert!(h.scheduler.is_empty());
    }

    #[test]
    fn zero_delay_fires_without_tick() {
        let mut h = Harness::new(&["recover"]);
        let recover = EventId(0);
        h.scheduler.schedule(&p(&[1]), 0, recover).unwrap();
        h.fire(1);
        assert_eq!(h.log.borrow().len(), 1);
        assert!(h.scheduler.entries_for(PersonId(1)).is_empty());
    }

    #[test]
    fn negative_delay_counts_as_ready() {
        let mut h = Harness::new(&["recover"]);
        h.scheduler.schedule(&p(&[1]), 1, EventId(0)).unwrap();
        h.scheduler.tick();
        h.scheduler.tick();
        assert_eq!(h.scheduler.entries_for(PersonId(1)), vec![(EventId(0), -1)]);
        assert_eq!(h.fire(3).total(), 1);
    }

    #[test]
    fn events_fire_in_index_order() {
        let mut h = Harness::new(&["first", "second", "third"]);
        h.scheduler.schedule(&p(&[0]), 0, EventId(2)).unwrap();
        h.scheduler.schedule(&p(&[1]), 0, EventId(0)).unwrap();
        h.scheduler.schedule(&p(&[2]), 5, EventId(1)).unwrap();
        h.fire(1);

        let names: Vec<String> = h.log.borrow().iter().map(|e| e.0.clone()).collect();
        assert_eq!(names, vec!["first", "third"]);
        assert_eq!(h.scheduler.scheduled_for(EventId(1)), BTreeSet::from([PersonId(2)]));
    }

    #[test]
    fn duplicate_entries_fire_as_multiset() {
        let mut h = Harness::new(&["recover"]);
        h.scheduler.schedule(&p(&[3, 0]), 0, EventId(0)).unwrap();
        h.scheduler.schedule(&p(&[3]), 0, EventId(0)).unwrap();
        assert_eq!(h.scheduler.len(), 3);
        assert_eq!(h.scheduler.scheduled_for(EventId(0)).len(), 2);

        h.fire(1);
        assert_eq!(h.log.borrow()[0].1, p(&[3, 0, 3]));
    }

    #[test]
    fn schedule_accumulates() {
        let mut h = Harness::new(&["a", "b"]);
        h.scheduler.schedule(&p(&[0]), 3, EventId(0)).unwrap();
        h.scheduler.schedule(&p(&[0]), 1, EventId(1)).unwrap();
        assert_eq!(
            h.scheduler.entries_for(PersonId(0)),
            vec![(EventId(0), 3), (EventId(1), 1)]
        );
    }

    #[test]
    fn empty_target_is_noop_and_unknown_event_rejected() {
        let mut h = Harness::new(&["a"]);
        assert_eq!(h.scheduler.schedule(&[], 0, EventId(9)).unwrap(), 0);
        let err = h.scheduler.schedule(&p(&[0]), 0, EventId(9)).unwrap_err();
        assert_eq!(err, SimError::Config(ConfigError::UnknownEvent(9)));
        assert!(h.scheduler.is_empty());
    }

    #[test]
    fn clear_removes_every_entry_of_person() {
        let mut h = Harness::new(&["a", "b"]);
        h.scheduler.schedule(&p(&[0, 1]), 0, EventId(0)).unwrap();
        h.scheduler.schedule(&p(&[0]), 4, EventId(1)).unwrap();
        assert_eq!(h.scheduler.clear(&p(&[0])), 2);
        assert_eq!(h.scheduler.len(), 1);
        h.scheduler.check_invariants().unwrap();

        h.fire(1);
        assert_eq!(h.log.borrow().len(), 1);
        assert_eq!(h.log.borrow()[0].1, p(&[1]));
        h.scheduler.check_invariants().unwrap();
    }

    #[test]
    fn listener_effects_apply_after_pass() {
        let mut h = Harness::new(&[]);
        let chain = h.scheduler.register_event("chain").unwrap();
        h.scheduler
            .add_listener(chain, move |ctx, persons, _| {
                ctx.queue_label(persons, "R")?;
                ctx.schedule(persons, 0, chain)?;
                Ok(())
            })
            .unwrap();
        h.scheduler.schedule(&p(&[1]), 0, chain).unwrap();

        let report = h.fire(1);
        assert_eq!(report.total(), 1);
        // Rescheduled with zero delay but not fired again in the same pass.
        assert_eq!(h.scheduler.entries_for(PersonId(1)), vec![(chain, 0)]);
        assert_eq!(h.updates.pending_for(PersonId(1)), h.store.state_id("R"));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let mut h = Harness::new(&["a"]);
        let order = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::clone(&order);
        h.scheduler
            .add_listener(EventId(0), move |_, _, _| {
                second.borrow_mut().push("second");
                Ok(())
            })
            .unwrap();
        h.scheduler.schedule(&p(&[0]), 0, EventId(0)).unwrap();
        h.fire(1);
        assert_eq!(h.log.borrow().len(), 1);
        assert_eq!(*order.borrow(), vec!["second"]);
        assert_eq!(h.scheduler.listener_count(EventId(0)), 2);
    }

    #[test]
    fn listener_error_aborts_fire() {
        let mut h = Harness::new(&[]);
        let bad = h.scheduler.register_event("bad").unwrap();
        h.scheduler
            .add_listener(bad, |ctx, persons, _| {
                ctx.queue_label(persons, "nope")?;
                Ok(())
            })
            .unwrap();
        h.scheduler.schedule(&p(&[0]), 0, bad).unwrap();
        let err = h
            .scheduler
            .fire(1, &h.store, &mut h.updates, &mut h.rng)
            .unwrap_err();
        assert!(err.is_configuration());
        // Listener survives for later passes.
        assert_eq!(h.scheduler.listener_count(bad), 1);
    }

    #[test]
    fn duplicate_event_label_rejected() {
        let mut scheduler = EventScheduler::new();
        scheduler.register_event("a").unwrap();
        assert_eq!(
            scheduler.register_event("a").unwrap_err(),
            ConfigError::DuplicateEvent("a".into())
        );
        assert!(scheduler.add_listener(EventId(4), |_, _, _| Ok(())).is_err());
    }

    #[test]
    fn clear_compacts_event_index() {
        let mut h = Harness::new(&["a"]);
        for _ in 0..10_000 {
            h.scheduler.schedule(&p(&[0]), 5, EventId(0)).unwrap();
            h.scheduler.clear(&p(&[0]));
        }
        assert_eq!(h.scheduler.by_event[0].len(), h.scheduler.len());

        h.scheduler.schedule(&p(&[1, 2, 3]), 5, EventId(0)).unwrap();
        for _ in 0..100 {
            h.scheduler.schedule(&p(&[0]), 5, EventId(0)).unwrap();
            h.scheduler.clear(&p(&[0]));
        }
        let indexed: usize = h.scheduler.by_event.iter().map(Vec::len).sum();
        assert!(indexed <= 2 * h.scheduler.len() + 1, "{indexed} keys indexed");
        assert_eq!(h.scheduler.scheduled_for(EventId(0)), BTreeSet::from(
            [PersonId(1), PersonId(2), PersonId(3)]
        ));
        h.scheduler.check_invariants().unwrap();
    }

    #[test]
    fn clear_all_empties_indexes() {
        let mut h = Harness::new(&["a"]);
        h.scheduler.schedule(&p(&[0, 1, 2]), 2, EventId(0)).unwrap();
        h.scheduler.clear_all();
        assert!(h.scheduler.is_empty());
        assert!(h.scheduler.scheduled_for(EventId(0)).is_empty());
        h.scheduler.check_invariants().unwrap();
    }
}
