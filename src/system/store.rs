use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::heap::safepoint::Safepoint;

use super::object::{ObjectId, ObjectRef};

pub const NUM_BUCKETS: usize = 64;

/// Attempts at drawing an unused random id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// Sharded map from ids to live objects.
pub struct ObjectStore {
    buckets: Box<[RwLock<HashMap<ObjectId, ObjectRef>>]>,
    world: Arc<Safepoint>,
}

impl ObjectStore {
    pub fn new(world: Arc<Safepoint>) -> Self {
        Self {
            buckets: (0..NUM_BUCKETS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            world,
        }
    }

    fn bucket(&self, id: ObjectId) -> &RwLock<HashMap<ObjectId, ObjectRef>> {
        &self.buckets[id.bucket(NUM_BUCKETS)]
    }

    /// Creates and registers an object under a fresh random id.
    ///
    /// # Panics
    ///
    /// Panics if no unused id is found after [`MAX_ID_ATTEMPTS`] draws.
    pub fn create(&self, class: Option<&ObjectRef>, space: Option<&ObjectRef>) -> ObjectRef {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = match ObjectId::new(rand::random::<u128>()) {
                Some(id) => id,
                None => continue,
            };
            let mut bucket = self.bucket(id).write();
            if bucket.contains_key(&id) {
                continue;
            }
            let object = ObjectRef::new(id, self.world.clone(), class.cloned(), space.cloned());
            bucket.insert(id, object.clone());
            return object;
        }
        panic!(
            "object id space exhausted: no free id after {} attempts",
            MAX_ID_ATTEMPTS
        );
    }

    pub fn find(&self, id: ObjectId) -> Option<ObjectRef> {
        self.bucket(id).read().get(&id).cloned()
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.bucket(object.id()).read().contains_key(&object.id())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_marks(&self) {
        for bucket in self.buckets.iter() {
            for object in bucket.read().values() {
                object.clear_mark();
            }
        }
    }

    /// Removes every unmarked object and clears its fields. Returns
    /// `(reclaimed, live)`.
    pub fn sweep(&self) -> (usize, usize) {
        let mut dead = Vec::new();
        let mut live = 0;
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.write();
            bucket.retain(|_, object| {
                if object.is_marked() {
                    true
                } else {
                    dead.push(object.clone());
                    false
                }
            });
            live += bucket.len();
        }

        let reclaimed = dead.len();
        for object in dead {
            if !object.reclaim() {
                log::warn!(target: "gc", "Object {} reclaimed while locked by another thread", object.id());
            }
        }
        (reclaimed, live)
    }

    /// Reclaims every object regardless of marks. Used when a runtime is torn
    /// down so that cycles through predefined objects are released.
    pub(crate) fn reclaim_all(&self) {
        let mut all = Vec::new();
        for bucket in self.buckets.iter() {
            all.extend(bucket.write().drain().map(|(_, object)| object));
        }
        for object in all {
            object.reclaim();
        }
    }
}
