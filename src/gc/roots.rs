//! Root set and garbage hold list - the heap's external references
//!
//! Both contribute exactly one strong reference to each member:
//! - Root set: objects the harness holds directly ("local variables")
//! - Garbage list: uncollectable or saved batches retained for inspection

use super::object::ObjectId;
use std::collections::BTreeSet;

/// Objects directly reachable from the harness
#[derive(Debug, Default)]
pub(crate) struct RootSet {
    roots: BTreeSet<ObjectId>,
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns false if the object was already rooted
    #[inline]
    pub(crate) fn add(&mut self, id: ObjectId) -> bool {
        self.roots.insert(id)
    }

    /// Returns false if the object was not rooted
    #[inline]
    pub(crate) fn remove(&mut self, id: ObjectId) -> bool {
        self.roots.remove(&id)
    }

    #[inline]
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.roots.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.roots.iter().copied()
    }
}

/// Retained batches, in the order they were withheld
#[derive(Debug, Default)]
pub(crate) struct GarbageList {
    held: Vec<ObjectId>,
    members: BTreeSet<ObjectId>,
}

impl GarbageList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns false if the object is already held
    pub(crate) fn hold(&mut self, id: ObjectId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.held.push(id);
        true
    }

    #[inline]
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.members.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }

    pub(crate) fn as_slice(&self) -> &[ObjectId] {
        &self.held
    }

    /// Release every hold at once
    pub(crate) fn take_all(&mut self) -> Vec<ObjectId> {
        self.members.clear();
        std::mem::take(&mut self.held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_are_a_set() {
        let mut roots = RootSet::new();
        let id = ObjectId(1);

        assert!(roots.add(id));
        assert!(!roots.add(id));
        assert_eq!(roots.len(), 1);

        assert!(roots.remove(id));
        assert!(!roots.remove(id));
        assert!(!roots.contains(id));
    }

    #[test]
    fn garbage_keeps_insertion_order() {
        let mut garbage = GarbageList::new();
        for raw in [5, 2, 9, 2] {
            garbage.hold(ObjectId(raw));
        }

        assert_eq!(garbage.as_slice(), &[ObjectId(5), ObjectId(2), ObjectId(9)]);
        assert!(garbage.contains(ObjectId(9)));

        let released = garbage.take_all();
        assert_eq!(released.len(), 3);
        assert_eq!(garbage.len(), 0);
        assert!(!garbage.contains(ObjectId(5)));
    }
}
