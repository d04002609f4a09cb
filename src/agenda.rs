//! Prioritized tasklet queues shared by the worker pool.
//!
//! Tasklets are objects carrying a [`TaskletInfo`] payload. Three FIFO
//! queues, one per [`Priority`], are scanned from high to low. Tasklets
//! scheduled while the world is stopped go to a lock-free deferred queue and
//! reach their priority queue once the pause is over.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::{
    heap::{mark::Marker, safepoint::Safepoint},
    sync::monitor::Monitor,
    system::{object::ObjectRef, value::Value},
};

#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn from_index(index: usize) -> Self {
        Self::ALL[index]
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => f.write_str("high"),
            Priority::Normal => f.write_str("normal"),
            Priority::Low => f.write_str("low"),
        }
    }
}

/// Payload of tasklet objects.
pub struct TaskletInfo {
    closure: Value,
    obsolescence: Option<Instant>,
    permanent: bool,
}

impl TaskletInfo {
    pub fn new(closure: Value, obsolescence: Option<Instant>, permanent: bool) -> Self {
        Self {
            closure,
            obsolescence,
            permanent,
        }
    }

    pub fn closure(&self) -> &Value {
        &self.closure
    }

    pub fn obsolescence(&self) -> Option<Instant> {
        self.obsolescence
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolescence.map_or(false, |t| Instant::now() >= t)
    }
}

impl crate::system::payload::Payload for TaskletInfo {
    crate::payload_kind!("tasklet");

    fn mark(&self, marker: &mut Marker) {
        // An expired tasklet never runs again, so its closure is garbage.
        if !self.is_obsolete() {
            marker.mark_value(&self.closure);
        }
    }
}

struct Queues {
    levels: [VecDeque<ObjectRef>; 3],
    stopping: bool,
}

impl Queues {
    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn remove(&mut self, tasklet: &ObjectRef) -> Option<Priority> {
        for (index, level) in self.levels.iter_mut().enumerate() {
            if let Some(pos) = level.iter().position(|t| t == tasklet) {
                level.remove(pos);
                return Some(Priority::from_index(index));
            }
        }
        None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgendaStats {
    pub executed: usize,
    pub failed: usize,
    pub skipped_obsolete: usize,
    pub deferred: usize,
}

impl fmt::Display for AgendaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} executed, {} failed, {} obsolete, {} deferred",
            self.executed, self.failed, self.skipped_obsolete, self.deferred
        )
    }
}

pub struct Agenda {
    world: Arc<Safepoint>,
    queues: Monitor<Queues>,
    deferred: SegQueue<(Priority, ObjectRef)>,
    permanent: Mutex<HashSet<ObjectRef>>,
    executed: AtomicUsize,
    failed: AtomicUsize,
    skipped_obsolete: AtomicUsize,
    deferred_count: AtomicUsize,
}

impl Agenda {
    pub fn new(world: Arc<Safepoint>) -> Self {
        Self {
            world,
            queues: Monitor::new(Queues {
                levels: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                stopping: false,
            }),
            deferred: SegQueue::new(),
            permanent: Mutex::new(HashSet::new()),
            executed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped_obsolete: AtomicUsize::new(0),
            deferred_count: AtomicUsize::new(0),
        }
    }

    /// Appends `tasklet` to the queue of `priority`, moving it if it is
    /// already queued elsewhere. While the world is stopped the tasklet is
    /// deferred instead.
    pub fn push(&self, priority: Priority, tasklet: ObjectRef) {
        let mut queues = self.queues.lock();
        // Checked under the queue lock: the collector marks the queues under
        // the same lock after stopping the world.
        if self.world.is_stopped() {
            drop(queues);
            log::debug!(target: "agenda", "Deferring tasklet {} ({}) until the pause ends", tasklet.id(), priority);
            self.deferred_count.fetch_add(1, Ordering::Relaxed);
            self.deferred.push((priority, tasklet));
            return;
        }
        queues.remove(&tasklet);
        queues.levels[priority as usize].push_back(tasklet);
    }

    fn flush_locked(&self, queues: &mut Queues) -> usize {
        let mut moved = 0;
        while let Some((priority, tasklet)) = self.deferred.pop() {
            if tasklet.is_reclaimed() {
                log::warn!(target: "agenda", "Dropping deferred tasklet {}: reclaimed during the pause", tasklet.id());
                continue;
            }
            queues.remove(&tasklet);
            queues.levels[priority as usize].push_back(tasklet);
            moved += 1;
        }
        moved
    }

    /// Moves deferred tasklets into their priority queues. Does nothing
    /// while the world is stopped.
    pub fn flush_deferred(&self) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        let mut queues = self.queues.lock();
        if self.world.is_stopped() {
            return 0;
        }
        let moved = self.flush_locked(&mut queues);
        if moved > 0 {
            log::debug!(target: "agenda", "Moved {} deferred tasklet(s) to their queues", moved);
        }
        moved
    }

    /// Pops the oldest tasklet of the highest non-empty priority.
    pub fn fetch_next(&self) -> Option<ObjectRef> {
        let mut queues = self.queues.lock();
        if !self.deferred.is_empty() && !self.world.is_stopped() {
            self.flush_locked(&mut queues);
        }
        queues.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn remove(&self, tasklet: &ObjectRef) -> bool {
        let queued = self.queues.lock().remove(tasklet).is_some();
        let pinned = self.permanent.lock().remove(tasklet);

        let mut deferred = false;
        let mut keep = Vec::new();
        while let Some(entry) = self.deferred.pop() {
            if &entry.1 == tasklet {
                deferred = true;
            } else {
                keep.push(entry);
            }
        }
        for entry in keep {
            self.deferred.push(entry);
        }

        queued || pinned || deferred
    }

    pub fn priority_of(&self, tasklet: &ObjectRef) -> Option<Priority> {
        let queues = self.queues.lock();
        queues
            .levels
            .iter()
            .position(|level| level.contains(tasklet))
            .map(Priority::from_index)
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queues.lock().levels[priority as usize].len()
    }

    /// Tasklets waiting in any queue, deferred ones included.
    pub fn pending_count(&self) -> usize {
        self.queues.lock().len() + self.deferred.len()
    }

    pub(crate) fn pin(&self, tasklet: &ObjectRef) {
        self.permanent.lock().insert(tasklet.clone());
    }

    pub fn is_pinned(&self, tasklet: &ObjectRef) -> bool {
        self.permanent.lock().contains(tasklet)
    }

    /// Waits until work is queued, the agenda is stopping or `timeout`
    /// elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        let mut queues = self.queues.lock();
        if queues.len() == 0 && !queues.stopping {
            queues.wait_for(timeout);
        }
    }

    /// Wakes every waiting worker.
    pub fn wake_all(&self) {
        self.queues.notify_all();
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.queues.lock().stopping = stopping;
    }

    pub fn is_stopping(&self) -> bool {
        self.queues.lock().stopping
    }

    /// Marks every queued, deferred and pinned tasklet.
    pub fn mark(&self, marker: &mut Marker) {
        {
            let queues = self.queues.lock();
            for tasklet in queues.levels.iter().flatten() {
                marker.mark_object(tasklet);
            }
        }

        self.mark_deferred(marker);

        for tasklet in self.permanent.lock().iter() {
            marker.mark_object(tasklet);
        }
    }

    /// Marks tasklets deferred so far. The collector calls it again after
    /// tracing, since marking hooks may schedule tasklets.
    pub fn mark_deferred(&self, marker: &mut Marker) {
        let mut deferred = Vec::with_capacity(self.deferred.len());
        while let Some(entry) = self.deferred.pop() {
            marker.mark_object(&entry.1);
            deferred.push(entry);
        }
        for entry in deferred {
            self.deferred.push(entry);
        }
    }

    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_obsolete(&self) {
        self.skipped_obsolete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AgendaStats {
        AgendaStats {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_obsolete: self.skipped_obsolete.load(Ordering::Relaxed),
            deferred: self.deferred_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        heap::safepoint::StopOutcome,
        system::store::ObjectStore,
    };

    fn setup() -> (Arc<Safepoint>, ObjectStore, Agenda) {
        let sp = Arc::new(Safepoint::new());
        let store = ObjectStore::new(sp.clone());
        let agenda = Agenda::new(sp.clone());
        (sp, store, agenda)
    }

    #[test]
    fn test_fetch_order() {
        let (_sp, store, agenda) = setup();
        let low = store.create(None, None);
        let high = store.create(None, None);
        let normal = store.create(None, None);
        let normal2 = store.create(None, None);

        agenda.push(Priority::Low, low.clone());
        agenda.push(Priority::High, high.clone());
        agenda.push(Priority::Normal, normal.clone());
        agenda.push(Priority::Normal, normal2.clone());
        assert_eq!(agenda.pending_count(), 4);
        assert_eq!(agenda.queue_len(Priority::Normal), 2);

        assert_eq!(agenda.fetch_next(), Some(high));
        assert_eq!(agenda.fetch_next(), Some(normal));
        assert_eq!(agenda.fetch_next(), Some(normal2));
        assert_eq!(agenda.fetch_next(), Some(low));
        assert_eq!(agenda.fetch_next(), None);
    }

    #[test]
    fn test_reschedule_moves_tasklet() {
        let (_sp, store, agenda) = setup();
        let t = store.create(None, None);
        agenda.push(Priority::Low, t.clone());
        agenda.push(Priority::High, t.clone());
        assert_eq!(agenda.pending_count(), 1);
        assert_eq!(agenda.priority_of(&t), Some(Priority::High));

        assert!(agenda.remove(&t));
        assert!(!agenda.remove(&t));
        assert_eq!(agenda.priority_of(&t), None);
    }

    #[test]
    fn test_push_while_stopped_is_deferred() {
        let (sp, store, agenda) = setup();
        let t = store.create(None, None);

        match sp.stop_the_world(None) {
            StopOutcome::Stopped(world) => {
                agenda.push(Priority::Normal, t.clone());
                assert_eq!(agenda.queue_len(Priority::Normal), 0);
                assert_eq!(agenda.pending_count(), 1);
                assert_eq!(agenda.flush_deferred(), 0);
                assert_eq!(agenda.fetch_next(), None);

                let mut marker = Marker::new();
                agenda.mark(&mut marker);
                assert!(t.is_marked());
                drop(world);
            }
            StopOutcome::Joined(_) => unreachable!(),
        }

        assert_eq!(agenda.fetch_next(), Some(t));
        assert_eq!(agenda.stats().deferred, 1);
        assert_eq!(agenda.pending_count(), 0);
    }

    #[test]
    fn test_pinned_tasklets_are_marked() {
        let (_sp, store, agenda) = setup();
        let t = store.create(None, None);
        agenda.pin(&t);
        assert!(agenda.is_pinned(&t));

        let mut marker = Marker::new();
        agenda.mark(&mut marker);
        assert_eq!(marker.marked_objects(), 1);

        assert!(agenda.remove(&t));
        assert!(!agenda.is_pinned(&t));
    }
}
