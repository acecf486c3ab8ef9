//! Garbage collector - reference counting + generational cycle detection
//!
//! Design: Hybrid approach modelled on CPython's collector:
//! 1. Reference counting (fast path, deterministic, synchronous)
//! 2. Trial deletion over generation buckets (rare, cycles only)
//! 3. Threshold-triggered passes (amortized cost)

mod cycles;
mod finalize;
mod object;
mod refcount;
mod roots;
mod weak;


pub use finalize::{finalizer, Finalizer, FinalizerContext, FinalizerError, FinalizerFailure};
pub use object::{Fields, Generation, ObjectId, ObjectSpec, ObjectView, Value, LABEL_FIELD};
pub use weak::{Resolved, WeakId};

pub(crate) use cycles::{partition, CycleCollector};
pub(crate) use finalize::{panic_message, FinalizationQueue, PendingStore};
pub(crate) use refcount::ReferenceTable;
pub(crate) use roots::{GarbageList, RootSet};
pub(crate) use weak::WeakRegistry;

use crate::error::{HeapError, HeapResult};
use serde::Serialize;
use std::collections::BTreeSet;

/// What started a collection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    /// Explicit `Heap::collect`
    Manual,
    /// Allocation threshold exceeded
    Automatic,
    /// Requested by a finalizer during a reference-count cascade
    Deferred,
}

/// Objects affected by one reclamation (cascade or collection batch)
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Reclamation {
    /// Storage released, in reclamation order
    pub reclaimed: Vec<ObjectId>,
    /// Finalizers invoked
    pub finalized: Vec<ObjectId>,
    /// Withheld because a finalizer resurrected part of the batch
    pub uncollectable: Vec<ObjectId>,
    /// Withheld because `save_all` is set
    pub saved: Vec<ObjectId>,
    pub finalizer_errors: Vec<FinalizerFailure>,
}

impl Reclamation {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
            && self.finalized.is_empty()
            && self.uncollectable.is_empty()
            && self.saved.is_empty()
            && self.finalizer_errors.is_empty()
    }
}

/// Outcome of a single collection pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Oldest generation examined (younger ones are always included)
    pub generation: Generation,
    pub trigger: Trigger,
    /// Objects traced during the pass
    pub examined: usize,
    /// Survivors moved to an older bucket
    pub promoted: usize,
    pub reclaimed: Vec<ObjectId>,
    pub finalized: Vec<ObjectId>,
    pub uncollectable: Vec<ObjectId>,
    pub saved: Vec<ObjectId>,
    pub finalizer_errors: Vec<FinalizerFailure>,
    pub duration_us: u64,
}

impl CollectionReport {
    pub(crate) fn new(
        generation: Generation,
        trigger: Trigger,
        examined: usize,
        promoted: usize,
        outcome: Reclamation,
        duration_us: u64,
    ) -> Self {
        Self {
            generation,
            trigger,
            examined,
            promoted,
            reclaimed: outcome.reclaimed,
            finalized: outcome.finalized,
            uncollectable: outcome.uncollectable,
            saved: outcome.saved,
            finalizer_errors: outcome.finalizer_errors,
            duration_us,
        }
    }

    /// Objects found unreachable (freed or saved), as CPython counts them
    pub fn collected(&self) -> usize {
        self.reclaimed.len() + self.saved.len()
    }

    /// Surface finalizer failures and uncollectable batches as errors
    pub fn check(&self) -> HeapResult<()> {
        if !self.uncollectable.is_empty() {
            return Err(HeapError::Uncollectable(self.uncollectable.clone()));
        }
        match self.finalizer_errors.first() {
            Some(failure) => Err(HeapError::FinalizerFailed(failure.clone())),
            None => Ok(()),
        }
    }
}

/// Per-generation counters and configuration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationStats {
    /// Passes that examined this generation as their oldest
    pub collections: usize,
    pub collected: usize,
    pub uncollectable: usize,
    pub threshold: usize,
    /// Trigger counter: allocations (gen0) or promotions into this bucket
    pub count: usize,
    /// Objects currently in the bucket
    pub objects: usize,
}

/// Snapshot returned by `Heap::stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatistics {
    pub generations: [GenerationStats; 3],
    pub enabled: bool,
    pub live_objects: usize,
    /// Objects currently retained in the garbage list
    pub garbage: usize,
}

impl CollectionStatistics {
    pub fn total_collections(&self) -> usize {
        self.generations.iter().map(|g| g.collections).sum()
    }

    pub fn total_collected(&self) -> usize {
        self.generations.iter().map(|g| g.collected).sum()
    }

    pub fn total_uncollectable(&self) -> usize {
        self.generations.iter().map(|g| g.uncollectable).sum()
    }
}

/// Generation buckets plus their trigger counters and accumulated stats
#[derive(Debug)]
pub(crate) struct Generations {
    buckets: [BTreeSet<ObjectId>; 3],
    counts: [usize; 3],
    thresholds: [usize; 3],
    stats: [GenerationStats; 3],
}

impl Generations {
    pub(crate) fn new(thresholds: [usize; 3]) -> Self {
        Self {
            buckets: Default::default(),
            counts: [0; 3],
            thresholds,
            stats: Default::default(),
        }
    }

    /// Start tracking a freshly allocated object in gen0
    pub(crate) fn track(&mut self, id: ObjectId) {
        self.buckets[0].insert(id);
        self.counts[0] += 1;
    }

    pub(crate) fn untrack(&mut self, id: ObjectId, generation: Generation) {
        self.buckets[generation.index()].remove(&id);
    }

    /// Move a survivor one bucket older; returns false if already in gen2
    pub(crate) fn promote(&mut self, id: ObjectId, from: Generation) -> bool {
        let to = from.next();
        if to == from {
            return false;
        }
        self.buckets[from.index()].remove(&id);
        self.buckets[to.index()].insert(id);
        self.counts[to.index()] += 1;
        true
    }

    /// Members of generations `0..=generation`
    pub(crate) fn members_up_to(&self, generation: Generation) -> impl Iterator<Item = ObjectId> + '_ {
        self.buckets[..=generation.index()].iter().flat_map(|b| b.iter().copied())
    }

    pub(crate) fn bucket(&self, generation: Generation) -> &BTreeSet<ObjectId> {
        &self.buckets[generation.index()]
    }

    pub(crate) fn counts(&self) -> [usize; 3] {
        self.counts
    }

    pub(crate) fn set_thresholds(&mut self, thresholds: [usize; 3]) {
        self.thresholds = thresholds;
    }

    /// Whether allocations since the last young pass exceed the gen0 threshold
    pub(crate) fn gen0_exceeded(&self) -> bool {
        self.counts[0] > self.thresholds[0]
    }

    /// Oldest generation whose counter exceeds its threshold (gen0 otherwise)
    pub(crate) fn pick_automatic(&self) -> Generation {
        for generation in [Generation::Gen2, Generation::Gen1] {
            if self.counts[generation.index()] > self.thresholds[generation.index()] {
                return generation;
            }
        }
        Generation::Gen0
    }

    /// A pass over `0..=generation` starts: their counters restart
    pub(crate) fn reset_counts(&mut self, generation: Generation) {
        for count in &mut self.counts[..=generation.index()] {
            *count = 0;
        }
    }

    pub(crate) fn record(&mut self, generation: Generation, collected: usize, uncollectable: usize) {
        let stats = &mut self.stats[generation.index()];
        stats.collections += 1;
        stats.collected += collected;
        stats.uncollectable += uncollectable;
    }

    pub(crate) fn reset_stats(&mut self) {
        for stats in &mut self.stats {
            stats.collections = 0;
            stats.collected = 0;
            stats.uncollectable = 0;
        }
    }

    pub(crate) fn snapshot(&self) -> [GenerationStats; 3] {
        let mut out = self.stats;
        for (index, stats) in out.iter_mut().enumerate() {
            stats.threshold = self.thresholds[index];
            stats.count = self.counts[index];
            stats.objects = self.buckets[index].len();
        }
        out
    }
}
