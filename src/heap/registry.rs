use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{base::utils::prime_above, formatted_size, weak_random::WeakRandom};

use super::zone::{AnyZone, Zone, ZoneData, ZoneRef, UNREGISTERED};

/// Random probes tried for a free rank before falling back to append.
pub const PROBE_ATTEMPTS: usize = 8;

struct Slots {
    slots: Vec<Option<Arc<dyn AnyZone>>>,
    capacity: usize,
    count: usize,
    random: WeakRandom,
}

impl Slots {
    fn grow_if_needed(&mut self) {
        if (self.count + 1) * 5 <= self.capacity * 4 {
            return;
        }
        let old = self.capacity;
        self.capacity = prime_above(old + old / 2);
        let additional = self.capacity.saturating_sub(self.slots.len());
        self.slots.reserve(additional);
        log::debug!(target: "zone", "Zone registry grown from {} to {} slots ({} live)", old, self.capacity, self.count);
    }

    fn free_rank(&mut self) -> usize {
        let len = self.slots.len();
        if len > 0 {
            for _ in 0..PROBE_ATTEMPTS {
                let rank = self.random.get_below(len);
                if self.slots[rank].is_none() {
                    return rank;
                }
            }
        }

        if len < self.capacity {
            self.slots.push(None);
            return len;
        }

        // Occupancy stays under 80% so a hole always exists here.
        match self.slots.iter().position(Option::is_none) {
            Some(rank) => rank,
            None => panic!(
                "zone registry corrupted: {} slots all occupied with count {}",
                len, self.count
            ),
        }
    }
}

/// Table of every live zone, indexed by rank.
pub struct ZoneRegistry {
    slots: Mutex<Slots>,
    allocated_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryStats {
    pub count: usize,
    pub capacity: usize,
    pub allocated_bytes: usize,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} zones in {} slots, {} allocated since last GC",
            self.count,
            self.capacity,
            formatted_size(self.allocated_bytes)
        )
    }
}

impl ZoneRegistry {
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(3);
        Self {
            slots: Mutex::new(Slots {
                slots: Vec::with_capacity(capacity),
                capacity,
                count: 0,
                random: WeakRandom::new(None),
            }),
            allocated_bytes: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
        }
    }

    /// Wraps `data` in a zone and registers it. Returns the zone and the
    /// allocation counter after accounting for it.
    pub fn allocate<T: ZoneData>(&self, data: T) -> (ZoneRef<T>, usize) {
        let zone = Arc::new(Zone::new(data));
        let size = zone.header().size_bytes();
        self.register(zone.clone());
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let allocated = self.allocated_bytes.fetch_add(size, Ordering::AcqRel) + size;
        (zone, allocated)
    }

    pub fn register(&self, zone: Arc<dyn AnyZone>) {
        let mut slots = self.slots.lock();
        assert!(
            zone.header().rank().is_none(),
            "zone of kind {} registered twice",
            zone.header().kind()
        );
        slots.grow_if_needed();
        let rank = slots.free_rank();
        zone.header().set_rank(rank);
        slots.slots[rank] = Some(zone);
        slots.count += 1;
    }

    /// Removes a zone from the registry. Returns false if it was not registered.
    pub fn deregister(&self, zone: &dyn AnyZone) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            let rank = match zone.header().rank() {
                Some(rank) => rank,
                None => return false,
            };
            let same = slots.slots.get(rank).and_then(|slot| slot.as_ref()).map_or(
                false,
                |registered| std::ptr::eq(registered.header(), zone.header()),
            );
            if !same {
                return false;
            }
            zone.header().set_rank(UNREGISTERED);
            slots.count -= 1;
            slots.slots[rank].take()
        };
        drop(removed);
        true
    }

    pub fn clear_marks(&self) {
        let slots = self.slots.lock();
        for zone in slots.slots.iter().flatten() {
            zone.header().clear_mark();
        }
    }

    /// Deregisters every unmarked zone. Returns `(reclaimed, live)`.
    pub fn sweep(&self) -> (usize, usize) {
        let dead = {
            let mut slots = self.slots.lock();
            let mut dead = Vec::new();
            for slot in slots.slots.iter_mut() {
                let unmarked = slot.as_ref().map_or(false, |zone| !zone.header().is_marked());
                if unmarked {
                    if let Some(zone) = slot.take() {
                        zone.header().set_rank(UNREGISTERED);
                        dead.push(zone);
                    }
                }
            }
            slots.count -= dead.len();
            while matches!(slots.slots.last(), Some(None)) {
                slots.slots.pop();
            }
            (dead, slots.count)
        };
        let (dead, live) = dead;
        let reclaimed = dead.len();
        // Zones are dropped outside the registry lock; dropping may release
        // nested zones.
        drop(dead);
        (reclaimed, live)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    pub fn reset_allocated(&self) {
        self.allocated_bytes.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> RegistryStats {
        let slots = self.slots.lock();
        RegistryStats {
            count: slots.count,
            capacity: slots.capacity,
            allocated_bytes: self.allocated_bytes(),
        }
    }
}
