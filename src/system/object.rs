//! Objects: mutable, identified, lockable records.
//!
//! Every field of an object is guarded by one re-entrant mutex, so a thread
//! holding [`ObjectRef::lock`] may keep calling accessors on the same object.
//! Accessors never hold the lock while running user code (magic getters,
//! appliers), but the closures passed to [`ObjectRef::payload_ref`] and
//! [`ObjectRef::payload_mut`] run under it and must not mutate the same
//! object again.
//!
//! Mutations, payload accesses and guards enter the pause gate before taking
//! the object lock, so they never wait for a collection while holding it.
//! Reaching a safepoint, entering a safe region or attaching the thread while
//! an object guard is alive panics: the collector would wait for the guard.

use std::{
    cell::{Ref, RefCell, RefMut},
    cmp::Ordering as CmpOrdering,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    base::utils::clock_time,
    error::{Result, RuntimeError},
    heap::{
        mark::Marker,
        safepoint::{PauseGate, Safepoint},
    },
};

use super::{
    closure::{Applyable, CallContext, MagicGetter},
    payload::Payload,
    value::Value,
};

/// Digits of the textual id form, indexed by digit value.
const BASE62_DIGITS: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of base-62 digits after the leading `_`.
pub const ID_DIGITS: usize = 22;

/// 128-bit object identity. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u128);

impl ObjectId {
    pub fn new(raw: u128) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    /// Shard used by the object store.
    pub(crate) fn bucket(self, buckets: usize) -> usize {
        ((self.0 ^ (self.0 >> 64)) as u64 % buckets as u64) as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [b'0'; ID_DIGITS + 1];
        buf[0] = b'_';
        let mut n = self.0;
        for slot in buf[1..].iter_mut().rev() {
            *slot = BASE62_DIGITS[(n % 62) as usize];
            n /= 62;
        }
        // Every byte comes from BASE62_DIGITS or is '_'.
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn digit_value(c: u8) -> Option<u128> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u128),
        b'a'..=b'z' => Some((c - b'a') as u128 + 10),
        b'A'..=b'Z' => Some((c - b'A') as u128 + 36),
        _ => None,
    }
}

impl FromStr for ObjectId {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RuntimeError::InvalidObjectId(s.to_string());
        let digits = s.strip_prefix('_').ok_or_else(invalid)?;
        if digits.len() != ID_DIGITS {
            return Err(invalid());
        }
        let mut n: u128 = 0;
        for c in digits.bytes() {
            let d = digit_value(c).ok_or_else(invalid)?;
            n = n
                .checked_mul(62)
                .and_then(|n| n.checked_add(d))
                .ok_or_else(invalid)?;
        }
        ObjectId::new(n).ok_or_else(invalid)
    }
}

/// Mutable state of an object, guarded by the object's lock.
pub struct ObjectFields {
    class: Option<ObjectRef>,
    space: Option<ObjectRef>,
    mtime: f64,
    attributes: HashMap<ObjectRef, Value>,
    components: Vec<Value>,
    payload: Option<Box<dyn Payload>>,
    magic_getter: Option<Arc<dyn MagicGetter>>,
    applier: Option<Arc<dyn Applyable>>,
}

impl ObjectFields {
    fn new(class: Option<ObjectRef>, space: Option<ObjectRef>) -> Self {
        Self {
            class,
            space,
            mtime: clock_time(),
            attributes: HashMap::new(),
            components: Vec::new(),
            payload: None,
            magic_getter: None,
            applier: None,
        }
    }

    fn touch(&mut self) {
        let now = clock_time();
        if now > self.mtime {
            self.mtime = now;
        }
    }

    fn clear(&mut self) -> Self {
        std::mem::replace(self, Self::new(None, None))
    }
}

pub struct ObjectData {
    id: ObjectId,
    marked: AtomicBool,
    reclaimed: AtomicBool,
    world: Arc<Safepoint>,
    fields: ReentrantMutex<RefCell<ObjectFields>>,
}

/// Shared handle to an object. Equality, ordering and hashing go by id.
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectData>);

/// Guard returned by [`ObjectRef::lock`]. While it lives, no other thread can
/// touch the object; the owning thread may keep using the object's methods.
pub struct ObjectGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<ObjectFields>>,
    _gate: PauseGate<'a>,
}

fn resolve_index(index: isize, len: usize) -> Option<usize> {
    if index < 0 {
        let back = index.unsigned_abs();
        if back <= len {
            Some(len - back)
        } else {
            None
        }
    } else if (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

impl ObjectRef {
    pub(crate) fn new(
        id: ObjectId,
        world: Arc<Safepoint>,
        class: Option<ObjectRef>,
        space: Option<ObjectRef>,
    ) -> Self {
        Self(Arc::new(ObjectData {
            id,
            marked: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            world,
            fields: ReentrantMutex::new(RefCell::new(ObjectFields::new(class, space))),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn read<R>(&self, f: impl FnOnce(&ObjectFields) -> R) -> R {
        let guard = self.0.fields.lock();
        let fields: Ref<'_, ObjectFields> = guard.borrow();
        f(&fields)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ObjectFields) -> R) -> R {
        let _gate = self.0.world.enter_mutation();
        let guard = self.0.fields.lock();
        let mut fields: RefMut<'_, ObjectFields> = guard.borrow_mut();
        f(&mut fields)
    }

    /// Locks the object for a multi-step sequence of operations.
    ///
    /// Collections wait until the guard is dropped. The holder must not reach
    /// a safepoint before that.
    pub fn lock(&self) -> ObjectGuard<'_> {
        let gate = self.0.world.hold();
        ObjectGuard {
            _guard: self.0.fields.lock(),
            _gate: gate,
        }
    }

    /// `None` only for an object already reclaimed by the collector.
    pub fn class(&self) -> Option<ObjectRef> {
        self.read(|f| f.class.clone())
    }

    pub fn set_class(&self, class: &ObjectRef) -> Result<()> {
        if !super::class::is_class(class) {
            return Err(RuntimeError::NotAClass(class.id()));
        }
        self.write(|f| {
            f.class = Some(class.clone());
            f.touch();
        });
        Ok(())
    }

    pub(crate) fn set_class_unchecked(&self, class: &ObjectRef) {
        self.write(|f| f.class = Some(class.clone()));
    }

    pub fn space(&self) -> Option<ObjectRef> {
        self.read(|f| f.space.clone())
    }

    pub fn set_space(&self, space: Option<&ObjectRef>) {
        self.write(|f| {
            f.space = space.cloned();
            f.touch();
        });
    }

    /// Last modification time in seconds since the epoch. Never decreases.
    pub fn mtime(&self) -> f64 {
        self.read(|f| f.mtime)
    }

    pub fn touch(&self) {
        self.write(|f| f.touch());
    }

    /// Attribute lookup honouring magic getters installed on `key`.
    pub fn get_attr(&self, key: &ObjectRef, cx: &CallContext<'_>) -> Value {
        match key.magic_getter() {
            Some(getter) => getter.get(&Value::Object(self.clone()), key, cx),
            None => self.attr(key),
        }
    }

    /// Raw attribute lookup in the attribute map. `Value::Empty` if absent.
    pub fn attr(&self, key: &ObjectRef) -> Value {
        self.read(|f| f.attributes.get(key).cloned().unwrap_or_default())
    }

    /// Stores `value` under `key`; `Value::Empty` erases the attribute.
    pub fn put_attr(&self, key: &ObjectRef, value: Value) -> Result<()> {
        if key.magic_getter().is_some() {
            return Err(RuntimeError::MagicAttribute(key.id()));
        }
        self.write(|f| {
            if value.is_empty() {
                f.attributes.remove(key);
            } else {
                f.attributes.insert(key.clone(), value);
            }
            f.touch();
        });
        Ok(())
    }

    /// Removes an attribute and returns its previous value.
    pub fn remove_attr(&self, key: &ObjectRef) -> Value {
        self.write(|f| {
            let old = f.attributes.remove(key);
            if old.is_some() {
                f.touch();
            }
            old.unwrap_or_default()
        })
    }

    pub fn nb_attrs(&self) -> usize {
        self.read(|f| f.attributes.len())
    }

    /// Attribute keys ordered by id.
    pub fn attr_key_list(&self) -> Vec<ObjectRef> {
        let mut keys = self.read(|f| f.attributes.keys().cloned().collect::<Vec<_>>());
        keys.sort_unstable();
        keys
    }

    pub fn append_component(&self, value: Value) {
        self.write(|f| {
            f.components.push(value);
            f.touch();
        });
    }

    /// Replaces the component at `index`; negative indexes count from the end.
    pub fn put_component(&self, index: isize, value: Value) -> Result<()> {
        self.write(|f| {
            let len = f.components.len();
            let slot = resolve_index(index, len).ok_or(RuntimeError::ComponentIndex { index, len })?;
            f.components[slot] = value;
            f.touch();
            Ok(())
        })
    }

    /// Component at `index`, negative from the end. `Value::Empty` if out of range.
    pub fn component(&self, index: isize) -> Value {
        self.read(|f| {
            resolve_index(index, f.components.len())
                .map(|i| f.components[i].clone())
                .unwrap_or_default()
        })
    }

    pub fn nb_components(&self) -> usize {
        self.read(|f| f.components.len())
    }

    pub fn components(&self) -> Vec<Value> {
        self.read(|f| f.components.clone())
    }

    pub fn reserve_components(&self, additional: usize) {
        self.write(|f| f.components.reserve(additional));
    }

    pub fn truncate_components(&self, len: usize) {
        self.write(|f| {
            if len < f.components.len() {
                f.components.truncate(len);
                f.touch();
            }
        });
    }

    /// Installs a payload, returning the previous one. A payload linking to
    /// an object whose chain leads back here is rejected.
    pub fn put_payload<P: Payload>(&self, payload: P) -> Result<Option<Box<dyn Payload>>> {
        self.put_boxed_payload(Box::new(payload))
    }

    pub fn put_boxed_payload(&self, payload: Box<dyn Payload>) -> Result<Option<Box<dyn Payload>>> {
        let link = match payload.link() {
            Some(link) => link.clone(),
            None => return Ok(self.install_payload(payload)),
        };
        self.edit_chain(|| {
            if super::payload::chain_reaches(&link, self) {
                return Err(RuntimeError::CyclicClass {
                    subclass: self.id(),
                    superclass: link.id(),
                });
            }
            Ok(self.install_payload(payload))
        })
    }

    /// Runs `f` with payload link edits serialized. The pause gate is entered
    /// first so that a thread waiting for the edit lock never holds off a
    /// collection that the lock holder is queued behind.
    pub(crate) fn edit_chain<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.0.world.enter_mutation();
        let _edits = super::payload::lock_chains();
        f()
    }

    /// Installs a payload without checking its link. Only for objects that
    /// nothing can link to yet.
    pub(crate) fn install_payload(&self, payload: Box<dyn Payload>) -> Option<Box<dyn Payload>> {
        self.write(|f| {
            f.touch();
            f.payload.replace(payload)
        })
    }

    /// Object the payload links to, if any.
    pub(crate) fn payload_link(&self) -> Option<ObjectRef> {
        let _gate = self.0.world.enter_read();
        self.read(|f| f.payload.as_ref().and_then(|p| p.link().cloned()))
    }

    pub fn remove_payload(&self) -> Option<Box<dyn Payload>> {
        self.write(|f| {
            let old = f.payload.take();
            if old.is_some() {
                f.touch();
            }
            old
        })
    }

    pub fn payload_kind(&self) -> Option<&'static str> {
        self.read(|f| f.payload.as_ref().map(|p| p.kind()))
    }

    pub fn has_payload<P: Payload>(&self) -> bool {
        self.read(|f| {
            f.payload
                .as_ref()
                .map_or(false, |p| p.as_any().is::<P>())
        })
    }

    /// Runs `f` on the payload if it is a `P`.
    pub fn payload_ref<P: Payload, R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        let _gate = self.0.world.enter_read();
        let guard = self.0.fields.lock();
        let fields = guard.borrow();
        let result = fields
            .payload
            .as_ref()
            .and_then(|p| p.as_any().downcast_ref::<P>())
            .map(f);
        result
    }

    /// Runs `f` on the payload mutably if it is a `P`. Updates mtime.
    pub fn payload_mut<P: Payload, R>(&self, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let _gate = self.0.world.enter_mutation();
        let guard = self.0.fields.lock();
        let mut fields = guard.borrow_mut();
        let result = fields
            .payload
            .as_mut()
            .and_then(|p| p.as_any_mut().downcast_mut::<P>())
            .map(f);
        if result.is_some() {
            fields.touch();
        }
        result
    }

    pub fn magic_getter(&self) -> Option<Arc<dyn MagicGetter>> {
        self.read(|f| f.magic_getter.clone())
    }

    /// Installs (or with `None` removes) the getter consulted whenever this
    /// object is used as an attribute key.
    pub fn set_magic_getter(&self, getter: Option<Arc<dyn MagicGetter>>) {
        self.write(|f| f.magic_getter = getter);
    }

    pub fn applier(&self) -> Option<Arc<dyn Applyable>> {
        self.read(|f| f.applier.clone())
    }

    /// Installs the function applied when a closure uses this object as
    /// its connector.
    pub fn set_applier(&self, applier: Option<Arc<dyn Applyable>>) {
        self.write(|f| f.applier = applier);
    }

    pub fn is_marked(&self) -> bool {
        self.0.marked.load(Ordering::Acquire)
    }

    pub(crate) fn try_mark(&self) -> bool {
        !self.0.marked.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_mark(&self) {
        self.0.marked.store(false, Ordering::Release);
    }

    pub fn is_reclaimed(&self) -> bool {
        self.0.reclaimed.load(Ordering::Acquire)
    }

    /// Marks everything this object refers to.
    pub(crate) fn trace(&self, marker: &mut Marker) {
        let guard = self.0.fields.lock();
        let fields = guard.borrow();
        if let Some(class) = &fields.class {
            marker.mark_object(class);
        }
        if let Some(space) = &fields.space {
            marker.mark_object(space);
        }
        for (key, value) in fields.attributes.iter() {
            marker.mark_object(key);
            marker.mark_value(value);
        }
        marker.mark_values(fields.components.iter());
        if let Some(payload) = &fields.payload {
            payload.mark(marker);
        }
    }

    /// Clears the fields of an object found unreachable so that cycles
    /// through it are released. Returns false if another thread holds its lock.
    pub(crate) fn reclaim(&self) -> bool {
        self.0.reclaimed.store(true, Ordering::Release);
        let old = {
            let guard = match self.0.fields.try_lock() {
                Some(guard) => guard,
                None => return false,
            };
            let cleared = match guard.try_borrow_mut() {
                Ok(mut fields) => fields.clear(),
                Err(_) => return false,
            };
            cleared
        };
        drop(old);
        true
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for ObjectRef {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectRef {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.id, f)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.0.id)
    }
}
