use std::{fmt, time::Duration};

use crate::runtime::Runtime;

use super::{mark::Marker, safepoint::WorldStopped, PausePhase};

/// Outcome of one collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub gc_id: usize,
    pub marked_objects: usize,
    pub marked_zones: usize,
    pub reclaimed_objects: usize,
    pub reclaimed_zones: usize,
    pub live_objects: usize,
    pub live_zones: usize,
    pub pause: Duration,
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GC({}) marked {} object(s) and {} zone(s), reclaimed {} object(s) and {} zone(s), {} object(s) and {} zone(s) live, pause {}ms",
            self.gc_id,
            self.marked_objects,
            self.marked_zones,
            self.reclaimed_objects,
            self.reclaimed_zones,
            self.live_objects,
            self.live_zones,
            self.pause.as_micros() as f64 / 1000.0
        )
    }
}

/// Full stop-the-world mark and sweep. Must be called with the world
/// stopped by the calling thread.
pub fn run_collection(rt: &Runtime, world: &WorldStopped<'_>) -> GcStats {
    let gc_id = rt.next_gc_id();
    let total = PausePhase::new(gc_id, "Full");
    let mut marker = Marker::new();

    {
        let _phase = PausePhase::new(gc_id, "Clear Marks");
        rt.zones().clear_marks();
        rt.objects().clear_marks();
    }

    {
        let _phase = PausePhase::new(gc_id, "Mark Roots");
        rt.roots().mark(&mut marker);
        rt.predefined().mark(&mut marker);
    }

    {
        let _phase = PausePhase::new(gc_id, "Mark Agenda");
        rt.agenda().mark(&mut marker);
    }

    {
        let _phase = PausePhase::new(gc_id, "Mark Frames");
        let mut locals = 0;
        for mutator in world.mutators() {
            locals += mutator.trace_frames(&mut marker);
        }
        log::debug!(target: "gc", "GC({}) {} frame local(s) in {} mutator(s)", gc_id, locals, world.mutators().len());
    }

    {
        let _phase = PausePhase::new(gc_id, "Mark Transitive");
        loop {
            marker.drain();
            rt.agenda().mark_deferred(&mut marker);
            if marker.is_empty() {
                break;
            }
        }
    }

    let (reclaimed_objects, live_objects, reclaimed_zones, live_zones) = {
        let _phase = PausePhase::new(gc_id, "Sweep");
        let (reclaimed_objects, live_objects) = rt.objects().sweep();
        let (reclaimed_zones, live_zones) = rt.zones().sweep();
        rt.zones().reset_allocated();
        (reclaimed_objects, live_objects, reclaimed_zones, live_zones)
    };

    let pause = total.elapsed();
    drop(total);

    let stats = GcStats {
        gc_id,
        marked_objects: marker.marked_objects(),
        marked_zones: marker.marked_zones(),
        reclaimed_objects,
        reclaimed_zones,
        live_objects,
        live_zones,
        pause,
    };
    log::info!(target: "gc", "{}", stats);
    stats
}
