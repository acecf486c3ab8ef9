//! Reference table - object arena, strong edges and reference counts
//!
//! Edges are not stored separately: every `Value::Ref` field of a live object
//! is one edge, so the field map is the edge set and multiplicity falls out
//! of it for free. Objects are keyed by id; ids are issued monotonically and
//! never reused, which lets the table tell a reclaimed id from a bogus one.

use super::finalize::Finalizer;
use super::object::{Fields, Object, ObjectId, Value};
use crate::error::{HeapError, HeapResult};
use crate::logging::trace;
use std::collections::{HashMap, HashSet};

pub(crate) struct ReferenceTable {
    objects: HashMap<ObjectId, Object>,
    next_id: u64,
}

impl ReferenceTable {
    pub(crate) fn new() -> Self {
        Self {
            objects: HashMap::with_capacity(256),
            next_id: 1,
        }
    }

    /// Insert a new object, counting the edges of its initial fields
    ///
    /// Targets must already have been validated as live. The new object
    /// starts with no holders; the caller adds its root reference.
    pub(crate) fn insert(&mut self, fields: Fields, finalizer: Option<Finalizer>) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;

        let object = Object::new(id, fields, finalizer);
        let targets: Vec<ObjectId> = object.targets().collect();
        self.objects.insert(id, object);

        for target in targets {
            self.incref(target);
        }

        trace!(event = "object_insert", object = %id);
        id
    }

    #[inline]
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Whether `id` was ever handed out by this table
    #[inline]
    pub(crate) fn was_issued(&self, id: ObjectId) -> bool {
        id.0 > 0 && id.0 < self.next_id
    }

    #[inline]
    pub(crate) fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    /// Object about to be mutated: reclaimed ids are a use-after-free
    pub(crate) fn owner(&self, id: ObjectId) -> HeapResult<&Object> {
        match self.objects.get(&id) {
            Some(object) => Ok(object),
            None if self.was_issued(id) => Err(HeapError::UseAfterFree(id)),
            None => Err(HeapError::UnknownObject(id)),
        }
    }

    /// Object used as a reference target or weak referent
    pub(crate) fn live(&self, id: ObjectId) -> HeapResult<&Object> {
        self.objects.get(&id).ok_or(HeapError::UnknownObject(id))
    }

    /// Validate every strong reference held by `fields`
    pub(crate) fn check_targets<'v>(&self, values: impl IntoIterator<Item = &'v Value>) -> HeapResult<()> {
        for target in values.into_iter().filter_map(Value::target) {
            self.live(target)?;
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn incref(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.get_mut(&id) {
            object.refcount += 1;
        }
    }

    /// Decrement and return the new count (0 for unknown ids)
    #[inline]
    pub(crate) fn decref(&mut self, id: ObjectId) -> usize {
        match self.objects.get_mut(&id) {
            Some(object) => {
                debug_assert!(object.refcount > 0, "refcount underflow on {}", id);
                object.refcount = object.refcount.saturating_sub(1);
                object.refcount
            }
            None => 0,
        }
    }

    #[inline]
    pub(crate) fn refcount(&self, id: ObjectId) -> Option<usize> {
        self.objects.get(&id).map(|o| o.refcount)
    }

    /// Overwrite a field, returning the previous value
    pub(crate) fn replace_field(&mut self, owner: ObjectId, field: String, value: Value) -> Option<Value> {
        self.objects
            .get_mut(&owner)
            .and_then(|object| object.fields.insert(field, value))
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<Object> {
        self.objects.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Number of strong edges between live objects
    pub(crate) fn edge_count(&self) -> usize {
        self.objects.values().map(|o| o.targets().count()).sum()
    }

    /// Everything a reference-count cascade starting at `zeroed` would free
    ///
    /// Simulates the decrements instead of applying them, so finalizers can
    /// still run against an untouched graph and a resurrecting batch can be
    /// retained without undoing anything. Objects in `zeroed` must already
    /// have a count of zero.
    pub(crate) fn doomed_closure(&self, zeroed: &[ObjectId]) -> Vec<ObjectId> {
        let mut doomed: Vec<ObjectId> = Vec::with_capacity(zeroed.len());
        let mut seen: HashSet<ObjectId> = HashSet::with_capacity(zeroed.len());
        let mut released: HashMap<ObjectId, usize> = HashMap::new();
        let mut worklist: Vec<ObjectId> = Vec::with_capacity(zeroed.len());

        for &id in zeroed {
            if self.refcount(id) == Some(0) && seen.insert(id) {
                worklist.push(id);
            }
        }

        while let Some(id) = worklist.pop() {
            doomed.push(id);
            let Some(object) = self.objects.get(&id) else {
                continue;
            };

            for target in object.targets() {
                if seen.contains(&target) {
                    continue;
                }
                let Some(count) = self.refcount(target) else {
                    continue;
                };
                let dropped = released.entry(target).or_insert(0);
                *dropped += 1;
                if *dropped >= count {
                    seen.insert(target);
                    worklist.push(target);
                }
            }
        }

        doomed
    }
}

impl Default for ReferenceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn insert_counts_initial_edges() {
        let mut table = ReferenceTable::new();
        let leaf = table.insert(Fields::new(), None);
        let parent = table.insert(fields(&[("a", Value::Ref(leaf)), ("b", Value::Ref(leaf))]), None);

        assert_eq!(table.refcount(leaf), Some(2));
        assert_eq!(table.refcount(parent), Some(0));
        assert_eq!(table.edge_count(), 2);
    }

    #[test]
    fn owner_distinguishes_reclaimed_from_unknown() {
        let mut table = ReferenceTable::new();
        let id = table.insert(Fields::new(), None);
        table.remove(id);

        assert_eq!(table.owner(id).unwrap_err(), HeapError::UseAfterFree(id));
        assert_eq!(table.live(id).unwrap_err(), HeapError::UnknownObject(id));
        let bogus = ObjectId(999);
        assert_eq!(table.owner(bogus).unwrap_err(), HeapError::UnknownObject(bogus));
    }

    #[test]
    fn doomed_closure_follows_chain() {
        let mut table = ReferenceTable::new();
        let c = table.insert(Fields::new(), None);
        let b = table.insert(fields(&[("next", Value::Ref(c))]), None);
        let a = table.insert(fields(&[("next", Value::Ref(b))]), None);

        let mut doomed = table.doomed_closure(&[a]);
        doomed.sort();
        assert_eq!(doomed, vec![c, b, a]);
        // Simulation leaves counts untouched
        assert_eq!(table.refcount(b), Some(1));
    }

    #[test]
    fn doomed_closure_stops_at_shared_objects() {
        let mut table = ReferenceTable::new();
        let shared = table.insert(Fields::new(), None);
        let a = table.insert(fields(&[("x", Value::Ref(shared))]), None);
        let _b = table.insert(fields(&[("x", Value::Ref(shared))]), None);

        assert_eq!(table.doomed_closure(&[a]), vec![a]);
    }

    #[test]
    fn doomed_closure_counts_multiplicity() {
        let mut table = ReferenceTable::new();
        let target = table.insert(Fields::new(), None);
        let a = table.insert(fields(&[("l", Value::Ref(target)), ("r", Value::Ref(target))]), None);

        let doomed = table.doomed_closure(&[a]);
        assert_eq!(doomed.len(), 2);
        assert!(doomed.contains(&target));
    }

    #[test]
    fn doomed_closure_ignores_live_counts() {
        let mut table = ReferenceTable::new();
        let a = table.insert(Fields::new(), None);
        table.incref(a);
        assert!(table.doomed_closure(&[a]).is_empty());
    }
}
