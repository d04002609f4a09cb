use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::formatted_size;

/// Decides when the runtime requests a collection.
pub trait Heuristics: Send + Sync {
    /// Called on allocation with the bytes allocated since the last cycle.
    fn should_start_gc(&self, allocated: usize) -> bool;

    /// Called periodically by idle workers.
    fn should_start_periodic_gc(&self) -> bool {
        false
    }

    fn record_cycle_end(&self);

    fn time_since_last_gc(&self) -> Duration;
}

/// Fixed allocation threshold plus an optional guaranteed interval.
pub struct StaticHeuristics {
    threshold: usize,
    guaranteed_interval: Option<Duration>,
    last_cycle_end: Mutex<Instant>,
}

impl StaticHeuristics {
    pub fn new(threshold: usize, guaranteed_interval: Option<Duration>) -> Self {
        Self {
            threshold,
            guaranteed_interval,
            last_cycle_end: Mutex::new(Instant::now()),
        }
    }
}

impl Heuristics for StaticHeuristics {
    fn should_start_gc(&self, allocated: usize) -> bool {
        if allocated > self.threshold {
            log::info!(target: "gc", "Trigger: Allocated since last cycle ({}) is larger than threshold ({})", formatted_size(allocated), formatted_size(self.threshold));
            return true;
        }
        false
    }

    fn should_start_periodic_gc(&self) -> bool {
        if let Some(interval) = self.guaranteed_interval {
            let since = self.time_since_last_gc();
            if since > interval {
                log::info!(target: "gc", "Trigger: Time since last GC ({} ms) is larger than guaranteed interval ({} ms)", since.as_millis(), interval.as_millis());
                return true;
            }
        }
        false
    }

    fn record_cycle_end(&self) {
        *self.last_cycle_end.lock() = Instant::now();
    }

    fn time_since_last_gc(&self) -> Duration {
        self.last_cycle_end.lock().elapsed()
    }
}
