//! Extension data attached to objects.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{heap::mark::Marker, runtime::Runtime};

use super::{object::ObjectRef, value::Value};

/// Polymorphic extension data of an object.
///
/// `mark` must mark every object and value the payload refers to. It must
/// never register roots or mutate the heap.
pub trait Payload: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn mark(&self, marker: &mut Marker) {
        let _ = marker;
    }

    /// Object this payload chains to, such as a superclass or a parent
    /// environment. Chains never contain cycles.
    fn link(&self) -> Option<&ObjectRef> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

static CHAIN_EDITS: Mutex<()> = parking_lot::const_mutex(());

/// Serializes every change of a payload link, so that two concurrent edits
/// cannot close a cycle together.
pub(crate) fn lock_chains() -> MutexGuard<'static, ()> {
    CHAIN_EDITS.lock()
}

/// True if following payload links from `start` reaches `target`.
pub(crate) fn chain_reaches(start: &ObjectRef, target: &ObjectRef) -> bool {
    let mut current = Some(start.clone());
    while let Some(object) = current {
        if &object == target {
            return true;
        }
        current = object.payload_link();
    }
    false
}

/// Implements the `kind`/`as_any` boilerplate of [`Payload`]. Use inside an
/// `impl Payload for T` block.
#[macro_export]
macro_rules! payload_kind {
    ($kind: literal) => {
        fn kind(&self) -> &'static str {
            $kind
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }
    };
}

/// Mutable set of objects, ordered by id.
#[derive(Default, Debug)]
pub struct MutableSet {
    members: BTreeSet<ObjectRef>,
}

impl MutableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `object` was not already a member.
    pub fn add(&mut self, object: ObjectRef) -> bool {
        self.members.insert(object)
    }

    pub fn remove(&mut self, object: &ObjectRef) -> bool {
        self.members.remove(object)
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.members.contains(object)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRef> {
        self.members.iter()
    }

    /// Immutable snapshot as a set value.
    pub fn to_value(&self, rt: &Runtime) -> Value {
        Value::set(rt, self.members.iter().cloned())
    }
}

impl Payload for MutableSet {
    payload_kind!("mutable_set");

    fn mark(&self, marker: &mut Marker) {
        for member in self.members.iter() {
            marker.mark_object(member);
        }
    }
}

/// Growable vector of values.
#[derive(Default, Debug)]
pub struct MutableVector {
    items: Vec<Value>,
}

impl MutableVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop()
    }

    pub fn get(&self, index: usize) -> Value {
        self.items.get(index).cloned().unwrap_or_default()
    }

    /// Replaces the value at `index`. Returns false if out of range.
    pub fn put(&mut self, index: usize, value: Value) -> bool {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.items
    }

    /// Immutable snapshot as a deque value.
    pub fn to_value(&self, rt: &Runtime) -> Value {
        Value::deque(rt, self.items.iter().cloned())
    }
}

impl Payload for MutableVector {
    payload_kind!("mutable_vector");

    fn mark(&self, marker: &mut Marker) {
        marker.mark_values(self.items.iter());
    }
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
}

impl Payload for SymbolInfo {
    payload_kind!("symbol");
}

/// Lexical environment: bindings keyed by objects plus an optional parent
/// environment object.
#[derive(Default)]
pub struct Environment {
    parent: Option<ObjectRef>,
    bindings: HashMap<ObjectRef, Value>,
}

impl Environment {
    pub fn new(parent: Option<ObjectRef>) -> Self {
        Self {
            parent,
            bindings: HashMap::new(),
        }
    }

    pub fn parent(&self) -> Option<&ObjectRef> {
        self.parent.as_ref()
    }

    pub fn bind(&mut self, key: ObjectRef, value: Value) -> Value {
        self.bindings.insert(key, value).unwrap_or_default()
    }

    pub fn unbind(&mut self, key: &ObjectRef) -> Value {
        self.bindings.remove(key).unwrap_or_default()
    }

    pub fn get_local(&self, key: &ObjectRef) -> Value {
        self.bindings.get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Looks `key` up in `env` and then in its parents.
    pub fn find(env: &ObjectRef, key: &ObjectRef) -> Value {
        let mut current = Some(env.clone());
        while let Some(object) = current {
            let step = object.payload_ref(|env: &Environment| {
                (env.bindings.get(key).cloned(), env.parent.clone())
            });
            match step {
                Some((Some(value), _)) => return value,
                Some((None, parent)) => current = parent,
                None => break,
            }
        }
        Value::Empty
    }
}

impl Payload for Environment {
    payload_kind!("environment");

    fn link(&self) -> Option<&ObjectRef> {
        self.parent.as_ref()
    }

    fn mark(&self, marker: &mut Marker) {
        if let Some(parent) = &self.parent {
            marker.mark_object(parent);
        }
        for (key, value) in self.bindings.iter() {
            marker.mark_object(key);
            marker.mark_value(value);
        }
    }
}
