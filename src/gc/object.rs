//! Managed objects - identity, fields and generation tags
//!
//! Objects never point at each other directly. A strong reference is a
//! `Value::Ref(ObjectId)` stored in a named field; the reference table turns
//! those fields into edges when counting and tracing.

use super::finalize::{Finalizer, FinalizerContext, FinalizerError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Field holding the human-readable label used in diagnostics
pub const LABEL_FIELD: &str = "name";

/// Field name to value mapping, ordered for stable output
pub type Fields = BTreeMap<String, Value>;

/// Opaque, stable object identity (unique within one heap)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Generation bucket an object currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Generation {
    Gen0,
    Gen1,
    Gen2,
}

impl Generation {
    pub const ALL: [Generation; 3] = [Generation::Gen0, Generation::Gen1, Generation::Gen2];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Bucket a survivor moves to (the oldest bucket is terminal)
    #[inline]
    pub fn next(self) -> Self {
        match self {
            Generation::Gen0 => Generation::Gen1,
            Generation::Gen1 | Generation::Gen2 => Generation::Gen2,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.index())
    }
}

/// Field value: a scalar, or a strong reference to another object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(ObjectId),
}

impl Value {
    /// Target of a strong reference, if this value is one
    #[inline]
    pub fn target(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Ref(id) => write!(f, "{}", id),
        }
    }
}

/// Allocation request: initial fields plus an optional finalizer
///
/// ```ignore
/// let a = heap.allocate(ObjectSpec::labeled("A").field("size", 3))?;
/// let b = heap.allocate(ObjectSpec::labeled("B").field("other", a))?;
/// ```
#[derive(Default)]
pub struct ObjectSpec {
    pub(crate) fields: Fields,
    pub(crate) finalizer: Option<Finalizer>,
}

impl ObjectSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Object carrying a diagnostic label in its `name` field
    pub fn labeled(label: impl Into<String>) -> Self {
        Self::new().field(LABEL_FIELD, Value::Str(label.into()))
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce(&mut FinalizerContext<'_>) -> Result<(), FinalizerError> + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

impl fmt::Debug for ObjectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSpec")
            .field("fields", &self.fields)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// A live node in the managed heap
///
/// Presence in the reference table is the liveness flag: reclaimed objects
/// are removed outright, and their ids are never reissued.
pub(crate) struct Object {
    pub(crate) id: ObjectId,
    pub(crate) fields: Fields,
    /// Incoming strong edges plus external holds (root set, garbage list)
    pub(crate) refcount: usize,
    pub(crate) generation: Generation,
    pub(crate) finalizer: Option<Finalizer>,
}

impl Object {
    pub(crate) fn new(id: ObjectId, fields: Fields, finalizer: Option<Finalizer>) -> Self {
        Self {
            id,
            fields,
            refcount: 0,
            generation: Generation::Gen0,
            finalizer,
        }
    }

    /// Outgoing strong edges, one per referencing field
    #[inline]
    pub(crate) fn targets(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.fields.values().filter_map(Value::target)
    }

    #[inline]
    pub(crate) fn has_targets(&self) -> bool {
        self.targets().next().is_some()
    }

    pub(crate) fn label(&self) -> Option<&str> {
        match self.fields.get(LABEL_FIELD) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("fields", &self.fields)
            .field("refcount", &self.refcount)
            .field("generation", &self.generation)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Read-only view of a live object, handed to harness formatters
#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    object: &'a Object,
    rooted: bool,
}

impl<'a> ObjectView<'a> {
    pub(crate) fn new(object: &'a Object, rooted: bool) -> Self {
        Self { object, rooted }
    }

    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    pub fn label(&self) -> Option<&'a str> {
        self.object.label()
    }

    pub fn field(&self, name: &str) -> Option<&'a Value> {
        self.object.fields.get(name)
    }

    pub fn fields(&self) -> &'a Fields {
        &self.object.fields
    }

    pub fn refcount(&self) -> usize {
        self.object.refcount
    }

    pub fn generation(&self) -> Generation {
        self.object.generation
    }

    pub fn is_rooted(&self) -> bool {
        self.rooted
    }

    pub fn has_finalizer(&self) -> bool {
        self.object.finalizer.is_some()
    }
}

impl fmt::Display for ObjectView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({}", self.id())?;
        for (name, value) in self.fields() {
            write!(f, " {}={}", name, value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_promotion_saturates() {
        assert_eq!(Generation::Gen0.next(), Generation::Gen1);
        assert_eq!(Generation::Gen1.next(), Generation::Gen2);
        assert_eq!(Generation::Gen2.next(), Generation::Gen2);
        assert_eq!(Generation::from_index(3), None);
    }

    #[test]
    fn builder_collects_fields() {
        let spec = ObjectSpec::labeled("A").field("size", 3i64).field("next", ObjectId(7));
        assert_eq!(spec.fields().get("name"), Some(&Value::Str("A".into())));
        assert_eq!(spec.fields().get("next").and_then(Value::target), Some(ObjectId(7)));
        assert!(spec.finalizer.is_none());
    }

    #[test]
    fn targets_count_each_field() {
        let target = ObjectId(1);
        let mut fields = Fields::new();
        fields.insert("left".into(), Value::Ref(target));
        fields.insert("right".into(), Value::Ref(target));
        fields.insert("name".into(), Value::from("pair"));

        let obj = Object::new(ObjectId(2), fields, None);
        assert_eq!(obj.targets().count(), 2);
        assert_eq!(obj.label(), Some("pair"));
    }
}
