//! Weak reference registry - liveness observers that own nothing
//!
//! A weak handle never touches its referent's count. Each handle flips to
//! `Gone` exactly once, inside the operation that reclaims the referent, and
//! never comes back.

use super::object::ObjectId;
use crate::logging::trace;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Handle returned by `Heap::create_weak`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WeakId(pub(crate) u64);

impl fmt::Display for WeakId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weak#{}", self.0)
    }
}

/// Result of resolving a weak handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolved {
    Alive(ObjectId),
    Gone,
}

impl Resolved {
    pub fn object(self) -> Option<ObjectId> {
        match self {
            Resolved::Alive(id) => Some(id),
            Resolved::Gone => None,
        }
    }

    pub fn is_gone(self) -> bool {
        self == Resolved::Gone
    }
}

#[derive(Debug, Default)]
pub(crate) struct WeakRegistry {
    /// `None` once the referent has been reclaimed
    entries: HashMap<WeakId, Option<ObjectId>>,
    by_referent: HashMap<ObjectId, Vec<WeakId>>,
    next_id: u64,
    invalidated: usize,
}

impl WeakRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a handle; the referent must already be known to be live
    pub(crate) fn create(&mut self, referent: ObjectId) -> WeakId {
        self.next_id += 1;
        let id = WeakId(self.next_id);
        self.entries.insert(id, Some(referent));
        self.by_referent.entry(referent).or_default().push(id);
        trace!(event = "weak_create", weak = %id, object = %referent);
        id
    }

    /// `None` for handles this registry never issued
    pub(crate) fn resolve(&self, id: WeakId) -> Option<Resolved> {
        self.entries.get(&id).map(|slot| match slot {
            Some(object) => Resolved::Alive(*object),
            None => Resolved::Gone,
        })
    }

    /// Mark every handle to `referent` as gone, returning how many flipped
    pub(crate) fn invalidate(&mut self, referent: ObjectId) -> usize {
        let Some(handles) = self.by_referent.remove(&referent) else {
            return 0;
        };

        for handle in &handles {
            if let Some(slot) = self.entries.get_mut(handle) {
                *slot = None;
            }
        }

        self.invalidated += handles.len();
        trace!(event = "weak_invalidate", object = %referent, handles = handles.len());
        handles.len()
    }

    /// Live handles currently observing `referent`
    pub(crate) fn count_for(&self, referent: ObjectId) -> usize {
        self.by_referent.get(&referent).map_or(0, Vec::len)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn invalidated(&self) -> usize {
        self.invalidated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_until_invalidated() {
        let mut registry = WeakRegistry::new();
        let object = ObjectId(3);
        let weak = registry.create(object);

        assert_eq!(registry.resolve(weak), Some(Resolved::Alive(object)));
        assert_eq!(registry.invalidate(object), 1);
        assert_eq!(registry.resolve(weak), Some(Resolved::Gone));

        // Invalidation happens once
        assert_eq!(registry.invalidate(object), 0);
        assert_eq!(registry.resolve(weak), Some(Resolved::Gone));
        assert_eq!(registry.invalidated(), 1);
    }

    #[test]
    fn several_handles_per_referent() {
        let mut registry = WeakRegistry::new();
        let a = ObjectId(1);
        let b = ObjectId(2);
        let wa1 = registry.create(a);
        let wa2 = registry.create(a);
        let wb = registry.create(b);

        assert_eq!(registry.count_for(a), 2);
        assert_eq!(registry.invalidate(a), 2);
        assert!(registry.resolve(wa1).unwrap().is_gone());
        assert!(registry.resolve(wa2).unwrap().is_gone());
        assert_eq!(registry.resolve(wb).and_then(Resolved::object), Some(b));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_handle_is_none() {
        let registry = WeakRegistry::new();
        assert_eq!(registry.resolve(WeakId(42)), None);
    }
}
