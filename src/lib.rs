//! A persistent, reflective object runtime core: tagged values backed by
//! registered zones, a sharded object store with payloads, and a
//! priority-scheduled worker pool cooperating with a stop-the-world
//! mark-and-sweep collector.

pub mod agenda;
pub mod base;
pub mod error;
pub mod gc_roots;
pub mod heap;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod system;
pub mod threading;
pub mod weak_random;

pub use agenda::{AgendaStats, Priority, TaskletInfo};
pub use base::{clock_time, formatted_size, prime_above, read_uint_from_env, FormattedSize};
pub use error::{Result, RuntimeError};
pub use heap::{
    full_gc::GcStats,
    mark::Marker,
    thread::{Frame, Mutator, MutatorState, SafeRegion},
};
pub use options::RuntimeOptions;
pub use runtime::{MutatorHandle, Runtime};
pub use system::{
    Applyable, CallContext, ClassInfo, Environment, ExternalData, MagicGetter, MutableSet,
    MutableVector, NativeFn, ObjectId, ObjectRef, Payload, SymbolInfo, Value,
};

#[cfg(test)]
mod tests;
