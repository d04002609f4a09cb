//! Transitive marking with an explicit worklist.

use std::sync::Arc;

use crate::system::{object::ObjectRef, value::Value};

use super::zone::{AnyZone, ZoneData, ZoneRef};

enum Gray {
    Object(ObjectRef),
    Zone(Arc<dyn AnyZone>),
}

/// Gray set of the mark phase. Everything pushed here has already had its
/// mark flag set; [`Marker::drain`] traces the contents until the set is empty.
pub struct Marker {
    worklist: Vec<Gray>,
    marked_objects: usize,
    marked_zones: usize,
}

impl Marker {
    pub fn new() -> Self {
        Self {
            worklist: Vec::with_capacity(128),
            marked_objects: 0,
            marked_zones: 0,
        }
    }

    pub fn mark_value(&mut self, value: &Value) {
        match value {
            Value::Empty | Value::Int(_) => {}
            Value::Object(object) => self.mark_object(object),
            Value::String(zone) => self.mark_zone(zone),
            Value::Double(zone) => self.mark_zone(zone),
            Value::Set(zone) => self.mark_zone(zone),
            Value::Tuple(zone) => self.mark_zone(zone),
            Value::Closure(zone) => self.mark_zone(zone),
            Value::Instance(zone) => self.mark_zone(zone),
            Value::Json(zone) => self.mark_zone(zone),
            Value::Deque(zone) => self.mark_zone(zone),
            Value::External(zone) => self.mark_zone(zone),
        }
    }

    pub fn mark_values<'a>(&mut self, values: impl IntoIterator<Item = &'a Value>) {
        for value in values {
            self.mark_value(value);
        }
    }

    pub fn mark_object(&mut self, object: &ObjectRef) {
        assert!(
            !object.is_reclaimed(),
            "marking reclaimed object {}",
            object.id()
        );
        if object.try_mark() {
            self.marked_objects += 1;
            self.worklist.push(Gray::Object(object.clone()));
        }
    }

    pub fn mark_zone<T: ZoneData>(&mut self, zone: &ZoneRef<T>) {
        assert!(
            zone.header().rank().is_some(),
            "marking unregistered {} zone",
            zone.header().kind()
        );
        if zone.header().try_mark() {
            self.marked_zones += 1;
            self.worklist.push(Gray::Zone(zone.clone()));
        }
    }

    /// Traces gray entries until none are left.
    pub fn drain(&mut self) {
        while let Some(gray) = self.worklist.pop() {
            match gray {
                Gray::Object(object) => object.trace(self),
                Gray::Zone(zone) => zone.trace(self),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.worklist.is_empty()
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    pub fn marked_zones(&self) -> usize {
        self.marked_zones
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}
