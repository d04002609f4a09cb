//! Collected heap: zones, the zone registry, the pause protocol and the
//! full collector.

use std::time::{Duration, Instant};

pub mod full_gc;
pub mod heuristics;
pub mod mark;
pub mod registry;
pub mod safepoint;
pub mod shared_vars;
pub mod thread;
pub mod zone;

/// Times one phase of a collection pause and logs it when dropped.
pub struct PausePhase {
    gc_id: usize,
    name: &'static str,
    start: Instant,
}

impl PausePhase {
    pub fn new(gc_id: usize, name: &'static str) -> Self {
        Self {
            gc_id,
            name,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
