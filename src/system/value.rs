//! Tagged values.
//!
//! A [`Value`] is either an immediate (`Empty`, `Int`), an object reference,
//! or a reference to an immutable zone. Values are cheap to clone. Boxed
//! values compare and hash structurally, objects by identity.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    hash::{Hash, Hasher},
    mem::{discriminant, size_of},
    sync::Arc,
};

use crate::{
    error::{Result, RuntimeError},
    heap::{
        mark::Marker,
        zone::{words_for, ZoneData, ZoneKind, ZoneRef},
    },
    options::DEFAULT_PRINT_DEPTH,
    runtime::Runtime,
};

use super::{
    closure::{apply_closure, CallContext},
    object::ObjectRef,
};

/// Elision marker for values nested deeper than the formatting ceiling.
pub const ELISION: &str = "…";

const VALUE_WORDS: usize = words_for(size_of::<Value>());
const OBJECT_WORDS: usize = words_for(size_of::<ObjectRef>());

pub struct StringData(Box<str>);

impl ZoneData for StringData {
    const KIND: ZoneKind = ZoneKind::String;

    fn size_words(&self) -> usize {
        words_for(self.0.len())
    }
}

pub struct DoubleData(f64);

impl ZoneData for DoubleData {
    const KIND: ZoneKind = ZoneKind::Double;

    fn size_words(&self) -> usize {
        1
    }
}

/// Members ordered by id, without duplicates.
pub struct SetData(Box<[ObjectRef]>);

impl ZoneData for SetData {
    const KIND: ZoneKind = ZoneKind::Set;

    fn size_words(&self) -> usize {
        self.0.len() * OBJECT_WORDS
    }

    fn trace(&self, marker: &mut Marker) {
        for member in self.0.iter() {
            marker.mark_object(member);
        }
    }
}

pub struct TupleData(Box<[ObjectRef]>);

impl ZoneData for TupleData {
    const KIND: ZoneKind = ZoneKind::Tuple;

    fn size_words(&self) -> usize {
        self.0.len() * OBJECT_WORDS
    }

    fn trace(&self, marker: &mut Marker) {
        for component in self.0.iter() {
            marker.mark_object(component);
        }
    }
}

pub struct ClosureData {
    connector: ObjectRef,
    values: Box<[Value]>,
}

impl ZoneData for ClosureData {
    const KIND: ZoneKind = ZoneKind::Closure;

    fn size_words(&self) -> usize {
        OBJECT_WORDS + self.values.len() * VALUE_WORDS
    }

    fn trace(&self, marker: &mut Marker) {
        marker.mark_object(&self.connector);
        marker.mark_values(self.values.iter());
    }
}

pub struct InstanceData {
    class: ObjectRef,
    fields: Box<[Value]>,
}

impl ZoneData for InstanceData {
    const KIND: ZoneKind = ZoneKind::Instance;

    fn size_words(&self) -> usize {
        OBJECT_WORDS + self.fields.len() * VALUE_WORDS
    }

    fn trace(&self, marker: &mut Marker) {
        marker.mark_object(&self.class);
        marker.mark_values(self.fields.iter());
    }
}

pub struct JsonData {
    doc: serde_json::Value,
    words: usize,
}

fn json_words(doc: &serde_json::Value) -> usize {
    use serde_json::Value as Json;
    let node = words_for(size_of::<Json>());
    match doc {
        Json::Null | Json::Bool(_) | Json::Number(_) => node,
        Json::String(s) => node + words_for(s.len()),
        Json::Array(items) => node + items.iter().map(json_words).sum::<usize>(),
        Json::Object(map) => {
            node + map
                .iter()
                .map(|(k, v)| words_for(k.len()) + json_words(v))
                .sum::<usize>()
        }
    }
}

impl ZoneData for JsonData {
    const KIND: ZoneKind = ZoneKind::Json;

    fn size_words(&self) -> usize {
        self.words
    }
}

pub struct DequeData(VecDeque<Value>);

impl ZoneData for DequeData {
    const KIND: ZoneKind = ZoneKind::Deque;

    fn size_words(&self) -> usize {
        self.0.len() * VALUE_WORDS
    }

    fn trace(&self, marker: &mut Marker) {
        marker.mark_values(self.0.iter());
    }
}

/// Opaque data boxed into an external value.
pub trait ExternalData: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    /// Marks the objects and values this data refers to.
    fn mark(&self, marker: &mut Marker) {
        let _ = marker;
    }

    fn size_words(&self) -> usize {
        1
    }

    fn as_any(&self) -> &dyn Any;

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "external<{}>", self.type_name())
    }
}

pub struct ExternalBox(Box<dyn ExternalData>);

impl ZoneData for ExternalBox {
    const KIND: ZoneKind = ZoneKind::External;

    fn size_words(&self) -> usize {
        self.0.size_words()
    }

    fn trace(&self, marker: &mut Marker) {
        self.0.mark(marker);
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Int(i64),
    Object(ObjectRef),
    String(ZoneRef<StringData>),
    Double(ZoneRef<DoubleData>),
    Set(ZoneRef<SetData>),
    Tuple(ZoneRef<TupleData>),
    Closure(ZoneRef<ClosureData>),
    Instance(ZoneRef<InstanceData>),
    Json(ZoneRef<JsonData>),
    Deque(ZoneRef<DequeData>),
    External(ZoneRef<ExternalBox>),
}

fn resolve(index: isize, len: usize) -> Option<usize> {
    if index < 0 {
        len.checked_sub(index.unsigned_abs())
    } else if (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

fn sorted_members(members: impl IntoIterator<Item = ObjectRef>) -> Box<[ObjectRef]> {
    let mut members: Vec<ObjectRef> = members.into_iter().collect();
    members.sort_unstable();
    members.dedup();
    members.into_boxed_slice()
}

impl Value {
    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn object(object: &ObjectRef) -> Self {
        Value::Object(object.clone())
    }

    pub fn string(rt: &Runtime, s: &str) -> Self {
        Value::String(rt.allocate(StringData(s.into())))
    }

    /// String from raw bytes. Fails with the offset of the first invalid
    /// byte if they are not UTF-8.
    pub fn string_from_bytes(rt: &Runtime, bytes: &[u8]) -> Result<Self> {
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Value::string(rt, s)),
            Err(e) => Err(RuntimeError::InvalidUtf8(e.valid_up_to())),
        }
    }

    pub fn double(rt: &Runtime, d: f64) -> Result<Self> {
        if d.is_nan() {
            return Err(RuntimeError::NanDouble);
        }
        Ok(Value::Double(rt.allocate(DoubleData(d))))
    }

    /// Set of the given objects; absent entries are dropped and duplicates
    /// merged.
    pub fn set<I>(rt: &Runtime, members: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Option<ObjectRef>>,
    {
        let members = sorted_members(members.into_iter().filter_map(Into::into));
        Value::Set(rt.allocate(SetData(members)))
    }

    /// Tuple of the given objects in order; absent entries are dropped.
    pub fn tuple<I>(rt: &Runtime, components: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Option<ObjectRef>>,
    {
        let components: Vec<ObjectRef> = components.into_iter().filter_map(Into::into).collect();
        Value::Tuple(rt.allocate(TupleData(components.into_boxed_slice())))
    }

    pub fn closure(rt: &Runtime, connector: &ObjectRef, values: Vec<Value>) -> Self {
        Value::Closure(rt.allocate(ClosureData {
            connector: connector.clone(),
            values: values.into_boxed_slice(),
        }))
    }

    pub fn instance(rt: &Runtime, class: &ObjectRef, fields: Vec<Value>) -> Self {
        Value::Instance(rt.allocate(InstanceData {
            class: class.clone(),
            fields: fields.into_boxed_slice(),
        }))
    }

    pub fn json(rt: &Runtime, doc: serde_json::Value) -> Self {
        let words = json_words(&doc);
        Value::Json(rt.allocate(JsonData { doc, words }))
    }

    pub fn deque(rt: &Runtime, items: impl IntoIterator<Item = Value>) -> Self {
        Value::Deque(rt.allocate(DequeData(items.into_iter().collect())))
    }

    pub fn external(rt: &Runtime, data: Box<dyn ExternalData>) -> Self {
        Value::External(rt.allocate(ExternalBox(data)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Int(_) => "int",
            Value::Object(_) => "object",
            Value::String(z) => z.header().kind().name(),
            Value::Double(z) => z.header().kind().name(),
            Value::Set(z) => z.header().kind().name(),
            Value::Tuple(z) => z.header().kind().name(),
            Value::Closure(z) => z.header().kind().name(),
            Value::Instance(z) => z.header().kind().name(),
            Value::Json(z) => z.header().kind().name(),
            Value::Deque(z) => z.header().kind().name(),
            Value::External(z) => z.header().kind().name(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(&s.0),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(d.0),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(&j.doc),
            _ => None,
        }
    }

    pub fn as_external<T: ExternalData>(&self) -> Option<&T> {
        match self {
            Value::External(e) => e.0.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Connector object of a closure.
    pub fn connector(&self) -> Option<&ObjectRef> {
        match self {
            Value::Closure(c) => Some(&c.connector),
            _ => None,
        }
    }

    /// Captured values of a closure; empty for anything else.
    pub fn closed_values(&self) -> &[Value] {
        match self {
            Value::Closure(c) => &c.values,
            _ => &[],
        }
    }

    pub fn instance_class(&self) -> Option<&ObjectRef> {
        match self {
            Value::Instance(i) => Some(&i.class),
            _ => None,
        }
    }

    pub fn fields(&self) -> &[Value] {
        match self {
            Value::Instance(i) => &i.fields,
            _ => &[],
        }
    }

    fn members(&self) -> &[ObjectRef] {
        match self {
            Value::Set(s) => &s.0,
            Value::Tuple(t) => &t.0,
            _ => &[],
        }
    }

    /// Element count of sets, tuples, deques, closures (captured values) and
    /// instances (fields). Zero for everything else.
    pub fn len(&self) -> usize {
        match self {
            Value::Set(s) => s.0.len(),
            Value::Tuple(t) => t.0.len(),
            Value::Deque(d) => d.0.len(),
            Value::Closure(c) => c.values.len(),
            Value::Instance(i) => i.fields.len(),
            _ => 0,
        }
    }

    /// Element at `index`; negative indexes count from the end. Set and
    /// tuple members come back as object values. `Value::Empty` when out of
    /// range.
    pub fn nth(&self, index: isize) -> Value {
        let len = self.len();
        let i = match resolve(index, len) {
            Some(i) => i,
            None => return Value::Empty,
        };
        match self {
            Value::Set(_) | Value::Tuple(_) => Value::Object(self.members()[i].clone()),
            Value::Deque(d) => d.0[i].clone(),
            Value::Closure(c) => c.values[i].clone(),
            Value::Instance(inst) => inst.fields[i].clone(),
            _ => Value::Empty,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len() as isize).map(move |i| self.nth(i))
    }

    /// Membership test for sets and tuples.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        match self {
            Value::Set(s) => s.0.binary_search(object).is_ok(),
            Value::Tuple(t) => t.0.contains(object),
            _ => false,
        }
    }

    // Set algebra. Non-set operands behave as the empty set.

    pub fn union(&self, rt: &Runtime, other: &Value) -> Value {
        let (a, b) = (self.set_members(), other.set_members());
        Value::set(rt, a.iter().chain(b.iter()).cloned())
    }

    pub fn intersection(&self, rt: &Runtime, other: &Value) -> Value {
        let b = other.set_members();
        Value::set(
            rt,
            self.set_members()
                .iter()
                .filter(|m| b.binary_search(*m).is_ok())
                .cloned(),
        )
    }

    pub fn difference(&self, rt: &Runtime, other: &Value) -> Value {
        let b = other.set_members();
        Value::set(
            rt,
            self.set_members()
                .iter()
                .filter(|m| b.binary_search(*m).is_err())
                .cloned(),
        )
    }

    fn set_members(&self) -> &[ObjectRef] {
        match self {
            Value::Set(s) => &s.0,
            _ => &[],
        }
    }

    // Persistent deque operations. Non-deque values behave as the empty
    // deque; the receiver is never modified.

    fn deque_items(&self) -> VecDeque<Value> {
        match self {
            Value::Deque(d) => d.0.clone(),
            _ => VecDeque::new(),
        }
    }

    pub fn push_back(&self, rt: &Runtime, value: Value) -> Value {
        let mut items = self.deque_items();
        items.push_back(value);
        Value::Deque(rt.allocate(DequeData(items)))
    }

    pub fn push_front(&self, rt: &Runtime, value: Value) -> Value {
        let mut items = self.deque_items();
        items.push_front(value);
        Value::Deque(rt.allocate(DequeData(items)))
    }

    /// Returns the last element and the deque without it.
    pub fn pop_back(&self, rt: &Runtime) -> Option<(Value, Value)> {
        let mut items = self.deque_items();
        let last = items.pop_back()?;
        Some((last, Value::Deque(rt.allocate(DequeData(items)))))
    }

    /// Returns the first element and the deque without it.
    pub fn pop_front(&self, rt: &Runtime) -> Option<(Value, Value)> {
        let mut items = self.deque_items();
        let first = items.pop_front()?;
        Some((first, Value::Deque(rt.allocate(DequeData(items)))))
    }

    pub fn front(&self) -> Value {
        match self {
            Value::Deque(d) => d.0.front().cloned().unwrap_or_default(),
            _ => Value::Empty,
        }
    }

    pub fn back(&self) -> Value {
        match self {
            Value::Deque(d) => d.0.back().cloned().unwrap_or_default(),
            _ => Value::Empty,
        }
    }

    /// Applies a closure value to `args`.
    pub fn apply(&self, cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        apply_closure(cx, self, args)
    }

    /// Formats with an explicit nesting ceiling.
    pub fn display(&self, depth: usize) -> ValueDisplay<'_> {
        ValueDisplay { value: self, depth }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let composite = !matches!(
            self,
            Value::Empty | Value::Int(_) | Value::Object(_) | Value::String(_) | Value::Double(_)
        );
        if composite && depth == 0 {
            return f.write_str(ELISION);
        }
        match self {
            Value::Empty => f.write_str("__"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Object(object) => write!(f, "{}", object.id()),
            Value::String(s) => write!(f, "{:?}", &*s.0),
            Value::Double(d) => write!(f, "{:?}", d.0),
            Value::Set(s) => {
                f.write_str("{")?;
                write_objects(f, &s.0)?;
                f.write_str("}")
            }
            Value::Tuple(t) => {
                f.write_str("[")?;
                write_objects(f, &t.0)?;
                f.write_str("]")
            }
            Value::Closure(c) => {
                write!(f, "closure<{}>(", c.connector.id())?;
                write_values(f, c.values.iter(), depth - 1)?;
                f.write_str(")")
            }
            Value::Instance(i) => {
                write!(f, "instance<{}>(", i.class.id())?;
                write_values(f, i.fields.iter(), depth - 1)?;
                f.write_str(")")
            }
            Value::Json(j) => write!(f, "json {}", j.doc),
            Value::Deque(d) => {
                f.write_str("deque[")?;
                write_values(f, d.0.iter(), depth - 1)?;
                f.write_str("]")
            }
            Value::External(e) => e.0.describe(f),
        }
    }
}

fn write_objects(f: &mut fmt::Formatter<'_>, objects: &[ObjectRef]) -> fmt::Result {
    for (i, object) in objects.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", object.id())?;
    }
    Ok(())
}

fn write_values<'a>(
    f: &mut fmt::Formatter<'_>,
    values: impl Iterator<Item = &'a Value>,
    depth: usize,
) -> fmt::Result {
    for (i, value) in values.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        value.fmt_depth(f, depth)?;
    }
    Ok(())
}

pub struct ValueDisplay<'a> {
    value: &'a Value,
    depth: usize,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt_depth(f, self.depth)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, DEFAULT_PRINT_DEPTH)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, DEFAULT_PRINT_DEPTH)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b) || a.0 == b.0,
            // -0.0 == 0.0 and NaN is never boxed.
            (Value::Double(a), Value::Double(b)) => a.0 == b.0,
            (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b) || a.0 == b.0,
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b) || a.0 == b.0,
            (Value::Closure(a), Value::Closure(b)) => {
                Arc::ptr_eq(a, b) || (a.connector == b.connector && a.values == b.values)
            }
            (Value::Instance(a), Value::Instance(b)) => {
                Arc::ptr_eq(a, b) || (a.class == b.class && a.fields == b.fields)
            }
            (Value::Json(a), Value::Json(b)) => Arc::ptr_eq(a, b) || a.doc == b.doc,
            (Value::Deque(a), Value::Deque(b)) => Arc::ptr_eq(a, b) || a.0 == b.0,
            (Value::External(a), Value::External(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            Value::Empty => {}
            Value::Int(n) => n.hash(state),
            Value::Object(object) => object.hash(state),
            Value::String(s) => s.0.hash(state),
            Value::Double(d) => {
                let d = if d.0 == 0.0 { 0.0f64 } else { d.0 };
                d.to_bits().hash(state)
            }
            Value::Set(s) => s.0.hash(state),
            Value::Tuple(t) => t.0.hash(state),
            Value::Closure(c) => {
                c.connector.hash(state);
                c.values.hash(state);
            }
            Value::Instance(i) => {
                i.class.hash(state);
                i.fields.hash(state);
            }
            Value::Json(j) => j.doc.to_string().hash(state),
            Value::Deque(d) => d.0.hash(state),
            Value::External(e) => (Arc::as_ptr(e) as *const () as usize).hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

impl From<&ObjectRef> for Value {
    fn from(object: &ObjectRef) -> Self {
        Value::Object(object.clone())
    }
}
