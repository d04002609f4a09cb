use std::{fmt, time::Duration};

use once_cell::sync::Lazy;

use crate::{formatted_size, read_uint_from_env, threading::MAX_WORKERS};

pub const DEFAULT_GC_THRESHOLD: usize = 64 * 1024 * 1024;
pub const DEFAULT_INITIAL_ZONES: usize = 1021;
pub const DEFAULT_PRINT_DEPTH: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RuntimeOptions {
    /// Worker threads started by `Runtime::run_pool(None)`.
    pub workers: usize,
    /// Bytes allocated in zones before a collection is requested.
    pub gc_threshold: usize,
    /// Initial capacity of the zone registry.
    pub initial_zones: usize,
    /// Guaranteed interval between collections in milliseconds; 0 disables it.
    pub gc_interval: usize,
    /// Nesting depth after which formatted values are elided.
    pub print_depth: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, MAX_WORKERS),
            gc_threshold: DEFAULT_GC_THRESHOLD,
            initial_zones: DEFAULT_INITIAL_ZONES,
            gc_interval: 0,
            print_depth: DEFAULT_PRINT_DEPTH,
        }
    }
}

static ENV_OPTIONS: Lazy<RuntimeOptions> = Lazy::new(RuntimeOptions::read_env);

impl RuntimeOptions {
    /// Process-wide options read from `REFRT_*` environment variables. The
    /// environment is parsed once.
    pub fn from_env() -> Self {
        *ENV_OPTIONS
    }

    fn read_env() -> Self {
        let mut opts = Self::default();

        opts.workers = match read_uint_from_env("REFRT_WORKERS") {
            Some(n) if n > 0 => n.min(MAX_WORKERS),
            _ => opts.workers,
        };

        opts.gc_threshold = match read_uint_from_env("REFRT_GC_THRESHOLD") {
            Some(size) if size > 0 => size,
            _ => DEFAULT_GC_THRESHOLD,
        };

        opts.initial_zones = match read_uint_from_env("REFRT_INITIAL_ZONES") {
            Some(n) if n >= 3 => n,
            _ => DEFAULT_INITIAL_ZONES,
        };

        opts.gc_interval = read_uint_from_env("REFRT_GC_INTERVAL").unwrap_or(0);

        opts.print_depth = match read_uint_from_env("REFRT_PRINT_DEPTH") {
            Some(depth) if depth > 0 => depth,
            _ => DEFAULT_PRINT_DEPTH,
        };

        opts
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = bytes;
        self
    }

    pub fn with_initial_zones(mut self, zones: usize) -> Self {
        self.initial_zones = zones.max(3);
        self
    }

    pub fn with_gc_interval(mut self, millis: usize) -> Self {
        self.gc_interval = millis;
        self
    }

    pub fn with_print_depth(mut self, depth: usize) -> Self {
        self.print_depth = depth;
        self
    }

    pub fn guaranteed_gc_interval(&self) -> Option<Duration> {
        match self.gc_interval {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }
}

impl fmt::Display for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("workers", &self.workers)
            .field("gc_threshold", &formatted_size(self.gc_threshold))
            .field("initial_zones", &self.initial_zones)
            .field("gc_interval", &self.gc_interval)
            .field("print_depth", &self.print_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_clamp() {
        let opts = RuntimeOptions::default()
            .with_workers(1000)
            .with_initial_zones(0)
            .with_gc_interval(250);
        assert_eq!(opts.workers, MAX_WORKERS);
        assert_eq!(opts.initial_zones, 3);
        assert_eq!(opts.guaranteed_gc_interval(), Some(Duration::from_millis(250)));
        assert_eq!(RuntimeOptions::default().guaranteed_gc_interval(), None);
    }
}
