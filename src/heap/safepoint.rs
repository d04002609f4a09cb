//! Pause protocol.
//!
//! The first thread to claim a collection becomes the collector. It waits
//! until every other attached mutator is idle or parked at a safepoint, sets
//! the `stopped` flag, collects, and resumes everybody by bumping the pause
//! epoch. Threads that arrive at a safepoint while a collection is claimed
//! park until the epoch changes.
//!
//! Heap mutations, object guards and payload accesses run under the shared
//! side of a pause gate. The collector takes the exclusive side once every
//! attached mutator is stopped, so a thread never waits for the pause while
//! it holds an object lock, and no mutation overlaps marking or sweeping.

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::ThreadId,
    time::{Duration, Instant},
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thread_local::ThreadLocal;

use crate::sync::monitor::Monitor;

use super::{
    full_gc::GcStats,
    shared_vars::SharedFlag,
    thread::{Mutator, MutatorState},
};

/// Interval at which a collector still waiting for mutators logs a warning.
const STOP_WARN_INTERVAL: Duration = Duration::from_secs(1);

struct PauseState {
    collecting: bool,
    collector: Option<ThreadId>,
    epoch: u64,
    mutators: Vec<Arc<Mutator>>,
    last_stats: Option<GcStats>,
}

#[derive(Default)]
struct LocalGate {
    reads: Cell<usize>,
    guards: Cell<usize>,
    collecting: Cell<bool>,
}

pub struct Safepoint {
    requested: SharedFlag,
    stopped: SharedFlag,
    state: Monitor<PauseState>,
    gate: RwLock<()>,
    local: ThreadLocal<LocalGate>,
    violations: AtomicUsize,
}

/// Shared side of the pause gate. While one is alive the world cannot stop.
pub struct PauseGate<'a> {
    safepoint: &'a Safepoint,
    read: Option<RwLockReadGuard<'a, ()>>,
    guard: bool,
}

impl Drop for PauseGate<'_> {
    fn drop(&mut self) {
        let local = self.safepoint.local();
        if self.read.is_some() {
            local.reads.set(local.reads.get() - 1);
        }
        if self.guard {
            local.guards.set(local.guards.get() - 1);
        }
    }
}

pub enum StopOutcome<'a> {
    /// The calling thread is the collector and every other mutator is stopped.
    Stopped(WorldStopped<'a>),
    /// Another thread collected while the caller was parked.
    Joined(Option<GcStats>),
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            requested: SharedFlag::new(),
            stopped: SharedFlag::new(),
            state: Monitor::new(PauseState {
                collecting: false,
                collector: None,
                epoch: 0,
                mutators: Vec::new(),
                last_stats: None,
            }),
            gate: RwLock::new(()),
            local: ThreadLocal::new(),
            violations: AtomicUsize::new(0),
        }
    }

    /// Requests a collection. Returns false if one was already requested.
    pub fn request(&self) -> bool {
        self.requested.try_set()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_set()
    }

    /// True while the world is stopped for a collection.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    pub fn is_collecting(&self) -> bool {
        self.state.lock().collecting
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Number of heap mutations or tasklet runs observed during a pause.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::Acquire)
    }

    pub(crate) fn record_violation(&self, what: &str) {
        self.violations.fetch_add(1, Ordering::AcqRel);
        log::error!(target: "gc", "{} during a collection pause", what);
    }

    fn local(&self) -> &LocalGate {
        self.local.get_or_default()
    }

    /// Object guards held by the calling thread.
    pub fn held_guards(&self) -> usize {
        self.local().guards.get()
    }

    fn assert_no_guards(&self, what: &str) {
        let local = self.local();
        assert!(
            local.reads.get() == 0 && local.guards.get() == 0,
            "{} while holding {} object guard(s) or inside an object access",
            what,
            local.guards.get()
        );
    }

    pub(crate) fn register(&self, mutator: Arc<Mutator>) {
        self.assert_no_guards("Attaching a thread");
        let mut ml = self.state.lock();
        ml.wait_while(|s| s.collecting);
        mutator.set_state(MutatorState::Running);
        ml.mutators.push(mutator);
    }

    pub(crate) fn unregister(&self, mutator: &Mutator) {
        let mut ml = self.state.lock();
        ml.mutators.retain(|m| !std::ptr::eq(&**m, mutator));
    }

    pub fn mutators(&self) -> Vec<Arc<Mutator>> {
        self.state.lock().mutators.clone()
    }

    pub(crate) fn enter_idle(&self, mutator: &Mutator) -> MutatorState {
        self.assert_no_guards("Entering a safe region");
        let _ml = self.state.lock();
        mutator.set_state(MutatorState::Idle)
    }

    pub(crate) fn leave_idle(&self, mutator: &Mutator, previous: MutatorState) {
        let me = mutator.thread();
        let mut ml = self.state.lock();
        ml.wait_while(|s| s.collecting && s.collector != Some(me));
        mutator.set_state(previous);
    }

    /// Enters a heap mutation. Blocks while the world is stopped and keeps
    /// the pause from starting until the returned gate is dropped. A
    /// mutation by the collecting thread itself is counted as a violation.
    pub(crate) fn enter_mutation(&self) -> PauseGate<'_> {
        if self.local().collecting.get() && self.stopped.is_set() {
            self.record_violation("Heap mutation");
        }
        self.enter(false)
    }

    /// Like [`enter_mutation`](Self::enter_mutation) for accesses that only
    /// read the heap.
    pub(crate) fn enter_read(&self) -> PauseGate<'_> {
        self.enter(false)
    }

    /// Holds the pause off for the lifetime of an object guard.
    pub(crate) fn hold(&self) -> PauseGate<'_> {
        self.enter(true)
    }

    fn enter(&self, guard: bool) -> PauseGate<'_> {
        let local = self.local();
        let read = if local.collecting.get() {
            None
        } else if local.reads.get() > 0 {
            // Already inside the gate: a fair read would queue behind a
            // waiting collector that is itself waiting for us.
            Some(self.gate.read_recursive())
        } else {
            Some(self.gate.read())
        };
        if read.is_some() {
            local.reads.set(local.reads.get() + 1);
        }
        if guard {
            local.guards.set(local.guards.get() + 1);
        }
        PauseGate {
            safepoint: self,
            read,
            guard,
        }
    }

    /// Waits for a pause in progress to end.
    pub fn before_mutation(&self) {
        drop(self.enter_mutation());
    }

    /// Claims the collection or, if another thread already claimed it,
    /// parks until it is over.
    pub fn stop_the_world(&self, me: Option<&Mutator>) -> StopOutcome<'_> {
        self.assert_no_guards("Reaching a safepoint");
        let tid = std::thread::current().id();
        let mut ml = self.state.lock();

        if ml.collecting {
            assert!(
                ml.collector != Some(tid),
                "collection requested from inside a collection"
            );
            let epoch = ml.epoch;
            let previous = me.map(|m| m.set_state(MutatorState::GcPause));
            // Wake the collector waiting for this mutator to stop.
            self.state.notify_all();
            ml.wait_while(|s| s.epoch == epoch);
            if let (Some(m), Some(previous)) = (me, previous) {
                m.set_state(MutatorState::GcDraining);
                m.set_state(previous);
            }
            return StopOutcome::Joined(ml.last_stats.clone());
        }

        ml.collecting = true;
        ml.collector = Some(tid);
        self.local().collecting.set(true);
        let start = Instant::now();

        loop {
            let timed_out = ml.wait_while_for(
                |s| {
                    s.mutators
                        .iter()
                        .any(|m| m.thread() != tid && !m.state().is_stopped())
                },
                STOP_WARN_INTERVAL,
            );
            if !timed_out {
                break;
            }
            let running: Vec<&str> = ml
                .mutators
                .iter()
                .filter(|m| m.thread() != tid && !m.state().is_stopped())
                .map(|m| m.name())
                .collect();
            log::warn!(target: "gc", "Still waiting for {:?} to reach a safepoint after {}ms", running, start.elapsed().as_millis());
        }

        drop(ml);

        // Unattached threads may still be inside a mutation or hold guards.
        let gate = loop {
            if let Some(gate) = self.gate.try_write_for(STOP_WARN_INTERVAL) {
                break gate;
            }
            log::warn!(target: "gc", "Still waiting for object guards to be released after {}ms", start.elapsed().as_millis());
        };

        let ml = self.state.lock();
        self.stopped.set();
        let mutators = ml.mutators.clone();
        log::debug!(target: "gc", "Stopped the world ({} mutator(s)) in {}ms", mutators.len(), start.elapsed().as_micros() as f64 / 1000.0);
        StopOutcome::Stopped(WorldStopped {
            safepoint: self,
            mutators,
            stats: None,
            _gate: gate,
        })
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the collector while the world is stopped. Dropping it resumes
/// every parked mutator.
pub struct WorldStopped<'a> {
    safepoint: &'a Safepoint,
    mutators: Vec<Arc<Mutator>>,
    stats: Option<GcStats>,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl<'a> WorldStopped<'a> {
    /// Mutators attached when the world stopped, the collector included.
    pub fn mutators(&self) -> &[Arc<Mutator>] {
        &self.mutators
    }

    /// Publishes the statistics of this collection and resumes the world.
    pub fn finish(mut self, stats: GcStats) {
        self.stats = Some(stats);
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        let mut ml = self.safepoint.state.lock();
        self.safepoint.stopped.unset();
        self.safepoint.requested.unset();
        ml.collecting = false;
        ml.collector = None;
        ml.epoch = ml.epoch.wrapping_add(1);
        ml.last_stats = self.stats.take();
        self.safepoint.local().collecting.set(false);
    }
}
