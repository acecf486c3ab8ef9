//! Cycle detection via generational trial deletion
//!
//! Rare operation for groups of objects that keep each other alive after the
//! harness has let go of them. Based on CPython's `gc_refs` scheme:
//! 1. Copy every in-scope object's reference count
//! 2. Subtract references whose source is also in scope
//! 3. Whatever is still positive is held from outside; it and everything it
//!    reaches inside the scope survives
//! 4. The rest is unreachable, cycles included

use super::object::ObjectId;
use super::refcount::ReferenceTable;
use crate::error::{HeapError, HeapResult};
use crate::logging::{debug, trace};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Survivors and garbage of one trial-deletion pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Partition {
    pub(crate) reachable: Vec<ObjectId>,
    pub(crate) unreachable: Vec<ObjectId>,
}

/// Collector state (at most one pass at a time)
#[derive(Debug, Default)]
pub(crate) struct CycleCollector {
    in_progress: bool,
    passes: usize,
}

impl CycleCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enter a pass; re-entrant requests are refused
    pub(crate) fn begin(&mut self) -> HeapResult<()> {
        if self.in_progress {
            return Err(HeapError::CollectionInProgress);
        }
        self.in_progress = true;
        self.passes += 1;
        Ok(())
    }

    pub(crate) fn end(&mut self) {
        self.in_progress = false;
    }

    #[inline]
    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub(crate) fn passes(&self) -> usize {
        self.passes
    }
}

/// Split `scope` into objects held from outside it and unreachable garbage
///
/// Both halves come back in ascending id order.
pub(crate) fn partition(table: &ReferenceTable, scope: &BTreeSet<ObjectId>) -> Partition {
    if scope.is_empty() {
        return Partition::default();
    }

    // Step 1: working counts start at the true counts
    let mut gc_refs: HashMap<ObjectId, usize> = scope
        .iter()
        .filter_map(|&id| table.refcount(id).map(|count| (id, count)))
        .collect();

    // Step 2: drop contributions made from inside the scope
    for &id in scope {
        let Some(object) = table.get(id) else {
            continue;
        };
        for target in object.targets() {
            if let Some(refs) = gc_refs.get_mut(&target) {
                *refs = refs.saturating_sub(1);
            }
        }
    }

    // Step 3: externally held objects and everything they reach survive
    let mut reachable: HashSet<ObjectId> = HashSet::with_capacity(scope.len());
    let mut worklist: Vec<ObjectId> = Vec::new();
    for (&id, &refs) in &gc_refs {
        if refs > 0 {
            reachable.insert(id);
            worklist.push(id);
        }
    }

    while let Some(id) = worklist.pop() {
        let Some(object) = table.get(id) else {
            continue;
        };
        for target in object.targets() {
            if gc_refs.contains_key(&target) && reachable.insert(target) {
                worklist.push(target);
            }
        }
    }

    // Step 4: the remainder is garbage
    let mut result = Partition::default();
    for &id in scope {
        if !gc_refs.contains_key(&id) {
            continue;
        }
        if reachable.contains(&id) {
            result.reachable.push(id);
        } else {
            trace!(event = "unreachable", object = %id);
            result.unreachable.push(id);
        }
    }

    debug!(
        event = "gc_partition",
        scope = scope.len(),
        reachable = result.reachable.len(),
        unreachable = result.unreachable.len()
    );

    result
}
