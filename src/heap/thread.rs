use std::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU8, Ordering},
    thread::ThreadId,
};

use parking_lot::Mutex;

use crate::system::{object::ObjectRef, value::Value};

use super::{mark::Marker, safepoint::Safepoint};

/// Where a mutator stands with respect to the collector.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutatorState {
    /// Blocked outside the heap (waiting for work or inside a [`SafeRegion`]).
    /// The collector does not wait for idle mutators.
    Idle = 0,
    /// Running managed code. The collector waits until it reaches a safepoint.
    Running = 1,
    /// Parked at a safepoint while another thread collects.
    GcPause = 2,
    /// Resumed after a pause, not yet back in managed code.
    GcDraining = 3,
}

impl MutatorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MutatorState::Idle,
            1 => MutatorState::Running,
            2 => MutatorState::GcPause,
            3 => MutatorState::GcDraining,
            _ => unreachable!("corrupted mutator state {}", raw),
        }
    }

    /// True if the collector may proceed without waiting for this mutator.
    pub fn is_stopped(self) -> bool {
        matches!(self, MutatorState::Idle | MutatorState::GcPause)
    }
}

struct FrameRecord {
    descr: &'static str,
    locals: Vec<Value>,
}

/// A thread attached to a runtime: a worker or an external thread.
///
/// Mutators expose their frame chain to the collector. Locals kept in
/// frames survive collections; values held only in Rust locals of an
/// attached thread do not.
pub struct Mutator {
    name: String,
    thread: ThreadId,
    state: AtomicU8,
    frames: Mutex<Vec<FrameRecord>>,
}

impl Mutator {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thread: std::thread::current().id(),
            state: AtomicU8::new(MutatorState::Running as u8),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn state(&self) -> MutatorState {
        MutatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: MutatorState) -> MutatorState {
        MutatorState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Frame descriptions, innermost first.
    pub fn backtrace(&self) -> Vec<&'static str> {
        self.frames.lock().iter().rev().map(|f| f.descr).collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Marks every non-empty local of every frame.
    pub(crate) fn trace_frames(&self, marker: &mut Marker) -> usize {
        let frames = self.frames.lock();
        let mut count = 0;
        for frame in frames.iter() {
            for local in frame.locals.iter().filter(|v| !v.is_empty()) {
                marker.mark_value(local);
                count += 1;
            }
        }
        count
    }

    fn with_locals<R>(&self, index: usize, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        let mut frames = self.frames.lock();
        f(&mut frames[index].locals)
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("name", &self.name)
            .field("thread", &self.thread)
            .field("state", &self.state())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Stack-discipline record of local roots. Pops itself on drop; frames
/// must be dropped in reverse order of creation.
pub struct Frame<'m> {
    mutator: &'m Mutator,
    index: usize,
    _not_send: PhantomData<*const ()>,
}

impl<'m> Frame<'m> {
    pub fn new(mutator: &'m Mutator, descr: &'static str, slots: usize) -> Self {
        let mut frames = mutator.frames.lock();
        let index = frames.len();
        frames.push(FrameRecord {
            descr,
            locals: vec![Value::Empty; slots],
        });
        log::trace!(target: "gc", "{}: enter frame {} at depth {}", mutator.name, descr, index);
        Self {
            mutator,
            index,
            _not_send: PhantomData,
        }
    }

    pub fn mutator(&self) -> &'m Mutator {
        self.mutator
    }

    /// Stores `value` in slot `slot`, growing the frame if needed.
    pub fn set(&mut self, slot: usize, value: Value) {
        self.mutator.with_locals(self.index, |locals| {
            if slot >= locals.len() {
                locals.resize(slot + 1, Value::Empty);
            }
            locals[slot] = value;
        });
    }

    pub fn set_object(&mut self, slot: usize, object: &ObjectRef) {
        self.set(slot, Value::Object(object.clone()));
    }

    pub fn get(&self, slot: usize) -> Value {
        self.mutator
            .with_locals(self.index, |locals| locals.get(slot).cloned().unwrap_or_default())
    }

    /// Appends a new local and returns its slot.
    pub fn push(&mut self, value: Value) -> usize {
        self.mutator.with_locals(self.index, |locals| {
            locals.push(value);
            locals.len() - 1
        })
    }

    pub fn len(&self) -> usize {
        self.mutator.with_locals(self.index, |locals| locals.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let mut frames = self.mutator.frames.lock();
        if frames.len() != self.index + 1 && !std::thread::panicking() {
            let top = frames.last().map(|f| f.descr).unwrap_or("<none>");
            drop(frames);
            panic!(
                "frame popped out of order on {}: expected depth {}, top frame is {}",
                self.mutator.name,
                self.index + 1,
                top
            );
        }
        frames.truncate(self.index);
    }
}

/// Marks a mutator idle while it blocks outside the heap, so collections
/// can proceed without it. Leaving the region waits for a running
/// collection to finish.
pub struct SafeRegion<'a> {
    safepoint: &'a Safepoint,
    mutator: &'a Mutator,
    state: MutatorState,
}

impl<'a> SafeRegion<'a> {
    pub fn new(safepoint: &'a Safepoint, mutator: &'a Mutator) -> Self {
        let state = safepoint.enter_idle(mutator);
        Self {
            safepoint,
            mutator,
            state,
        }
    }
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.safepoint.leave_idle(self.mutator, self.state);
    }
}
