//! Heap manager - the facade the harness talks to
//!
//! Owns the reference table, root set, weak registry, finalization queue,
//! cycle collector and generation buckets of one heap. Nothing is global:
//! independent heaps never observe each other.
//!
//! Every public operation runs to completion before returning, including any
//! reclamation cascade it starts. Multi-threaded embedders wrap the heap in a
//! [`SharedHeap`], which serializes all access behind one mutex.

use crate::config::GcConfig;
use crate::error::{HeapError, HeapResult};
use crate::gc::{
    panic_message, partition, CollectionReport, CollectionStatistics, CycleCollector, FinalizationQueue,
    GarbageList, Generation, Generations, ObjectId, ObjectSpec, ObjectView, PendingStore, Reclamation,
    ReferenceTable, Resolved, RootSet, Trigger, Value, WeakId, WeakRegistry,
};
use crate::logging::{
    debug, info, log_gc_complete, log_gc_mark, log_gc_start, log_gc_sweep, log_reclaim, log_threshold_exceeded,
    log_uncollectable, perf, trace, warn,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Receives reports for display; the heap never prints anything itself
pub trait ReportSink: Send {
    fn on_collection(&mut self, report: &CollectionReport);

    fn on_stats(&mut self, _stats: &CollectionStatistics) {}
}

/// Default sink: reports become structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn on_collection(&mut self, report: &CollectionReport) {
        info!(
            event = "collection_report",
            generation = report.generation.index(),
            trigger = ?report.trigger,
            examined = report.examined,
            collected = report.collected(),
            uncollectable = report.uncollectable.len(),
            finalizer_errors = report.finalizer_errors.len(),
            "Collection report"
        );
    }

    fn on_stats(&mut self, stats: &CollectionStatistics) {
        for (generation, s) in stats.generations.iter().enumerate() {
            info!(
                event = "generation_stats",
                generation,
                collections = s.collections,
                collected = s.collected,
                uncollectable = s.uncollectable,
                objects = s.objects
            );
        }
    }
}

/// How a batch came to be unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    /// Reference-count cascade
    Counted,
    /// Cycle collection pass
    Traced,
}

pub struct Heap {
    table: ReferenceTable,
    roots: RootSet,
    garbage: GarbageList,
    weak: WeakRegistry,
    finalizers: FinalizationQueue,
    collector: CycleCollector,
    generations: Generations,
    config: GcConfig,
    sink: Box<dyn ReportSink>,
    deferred: Option<Generation>,
}

impl Heap {
    pub fn new() -> Self {
        let config = GcConfig::default();
        Self {
            table: ReferenceTable::new(),
            roots: RootSet::new(),
            garbage: GarbageList::new(),
            weak: WeakRegistry::new(),
            finalizers: FinalizationQueue::new(),
            collector: CycleCollector::new(),
            generations: Generations::new(config.thresholds()),
            config,
            sink: Box::new(TracingSink),
            deferred: None,
        }
    }

    pub fn with_config(config: GcConfig) -> HeapResult<Self> {
        let mut heap = Self::new();
        heap.configure(config)?;
        Ok(heap)
    }

    /// Replace the reporting sink, returning the previous one
    pub fn set_sink(&mut self, sink: Box<dyn ReportSink>) -> Box<dyn ReportSink> {
        std::mem::replace(&mut self.sink, sink)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Create an object in gen0, held by the root set
    ///
    /// May run an automatic gen0 (or older) pass when the allocation counter
    /// crosses its threshold; that report goes to the sink.
    pub fn allocate(&mut self, spec: ObjectSpec) -> HeapResult<ObjectId> {
        self.table.check_targets(spec.fields.values())?;

        let id = self.table.insert(spec.fields, spec.finalizer);
        self.roots.add(id);
        self.table.incref(id);
        self.generations.track(id);
        trace!(event = "allocate", object = %id, live = self.table.len());

        self.maybe_collect();
        Ok(id)
    }

    /// `owner.field = value`, reclaiming whatever the old value kept alive
    pub fn set_field(&mut self, owner: ObjectId, field: &str, value: impl Into<Value>) -> HeapResult<Reclamation> {
        let value = value.into();
        self.table.owner(owner)?;
        if let Some(target) = value.target() {
            self.table.live(target)?;
        }

        let mut sweep = Reclamation::default();
        self.store(owner, field.to_string(), value, &mut sweep);
        self.run_deferred();
        Ok(sweep)
    }

    /// The harness lets go of `object` (a local going out of scope)
    pub fn drop_root(&mut self, object: ObjectId) -> HeapResult<Reclamation> {
        self.table.owner(object)?;
        if !self.roots.remove(object) {
            return Err(HeapError::NotRooted(object));
        }

        let mut sweep = Reclamation::default();
        if self.table.decref(object) == 0 {
            self.release(vec![object], &mut sweep);
        }
        self.run_deferred();
        Ok(sweep)
    }

    /// Apply a validated store; the new target is counted before the old one
    /// is released so self-assignment never frees anything
    fn store(&mut self, owner: ObjectId, field: String, value: Value, sweep: &mut Reclamation) {
        if let Some(target) = value.target() {
            self.table.incref(target);
        }

        let previous = self.table.replace_field(owner, field, value);
        if let Some(old) = previous.as_ref().and_then(Value::target) {
            if self.table.decref(old) == 0 {
                self.release(vec![old], sweep);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Reference-count cascade from objects whose count just reached zero
    fn release(&mut self, zeroed: Vec<ObjectId>, sweep: &mut Reclamation) {
        let batch = self.table.doomed_closure(&zeroed);
        if !batch.is_empty() {
            self.dispose(batch, Disposal::Counted, sweep);
        }
    }

    /// Finalize a batch, then free it or withhold it
    ///
    /// Finalizers run while the whole batch is still intact. If any of them
    /// stores a batch member into an object outside the batch, the batch is
    /// resurrected and retained in the garbage list instead.
    fn dispose(&mut self, batch: Vec<ObjectId>, disposal: Disposal, sweep: &mut Reclamation) {
        let members: HashSet<ObjectId> = batch.iter().copied().collect();

        // Weak handles flip before any finalizer runs, whether or not the
        // batch is freed in the end
        for &id in &batch {
            self.weak.invalidate(id);
        }

        for &id in &batch {
            if let Some(finalizer) = self.table.get_mut(id).and_then(|o| o.finalizer.take()) {
                self.finalizers.enqueue(id, finalizer);
            }
        }
        let outcome = self.finalizers.run(&self.table, self.collector.in_progress());

        sweep.finalized.extend(outcome.finalized);
        sweep.finalizer_errors.extend(outcome.failures);
        if let Some(generation) = outcome.requested {
            self.deferred = Some(self.deferred.map_or(generation, |g| g.max(generation)));
        }

        let resurrected = outcome.stores.iter().any(|store| {
            !members.contains(&store.owner) && store.value.target().map_or(false, |t| members.contains(&t))
        });
        let save = disposal == Disposal::Traced && self.config.save_all;

        if resurrected || save {
            for &id in &batch {
                if self.garbage.hold(id) {
                    self.table.incref(id);
                }
            }
            if resurrected {
                log_uncollectable(batch.len(), "finalizer resurrected a batch member");
                sweep.uncollectable.extend(batch);
            } else {
                log_uncollectable(batch.len(), "save_all");
                sweep.saved.extend(batch);
            }
            self.apply_stores(outcome.stores, sweep);
            return;
        }

        let reason = match disposal {
            Disposal::Counted => "refcount",
            Disposal::Traced => "cycle",
        };

        let mut removed = Vec::with_capacity(batch.len());
        for &id in &batch {
            if let Some(object) = self.table.remove(id) {
                self.generations.untrack(id, object.generation);
                log_reclaim(id, reason);
                removed.push(object);
            }
        }
        sweep.reclaimed.extend(batch);

        // Edges leaving the batch may free objects outside it
        let mut zeroed = Vec::new();
        for object in &removed {
            for target in object.targets() {
                if !members.contains(&target) && self.table.contains(target) && self.table.decref(target) == 0 {
                    zeroed.push(target);
                }
            }
        }
        drop(removed);
        if !zeroed.is_empty() {
            self.release(zeroed, sweep);
        }

        let (stores, dropped): (Vec<PendingStore>, Vec<PendingStore>) =
            outcome.stores.into_iter().partition(|store| !members.contains(&store.owner));
        for store in dropped {
            let message = format!("store into {} dropped: reclaimed in the same batch", store.owner);
            crate::logging::log_finalizer_failure(store.requested_by, &message);
            sweep.finalizer_errors.push(crate::gc::FinalizerFailure {
                object: store.requested_by,
                message,
            });
        }
        self.apply_stores(stores, sweep);
    }

    /// Apply stores queued by finalizers; invalid ones are finalizer failures
    fn apply_stores(&mut self, stores: Vec<PendingStore>, sweep: &mut Reclamation) {
        for store in stores {
            let check = self.table.owner(store.owner).map(|_| ()).and_then(|()| match store.value.target() {
                Some(target) => self.table.live(target).map(|_| ()),
                None => Ok(()),
            });

            match check {
                Ok(()) => self.store(store.owner, store.field, store.value, sweep),
                Err(err) => {
                    let message = format!("deferred store into {} failed: {}", store.owner, err);
                    crate::logging::log_finalizer_failure(store.requested_by, &message);
                    sweep.finalizer_errors.push(crate::gc::FinalizerFailure {
                        object: store.requested_by,
                        message,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Cycle collection
    // ------------------------------------------------------------------

    /// Collect `generation` and every younger generation
    pub fn collect(&mut self, generation: usize) -> HeapResult<CollectionReport> {
        let generation = Generation::from_index(generation).ok_or(HeapError::InvalidGeneration(generation))?;
        let report = self.run_collection(generation, Trigger::Manual)?;
        self.run_deferred();
        Ok(report)
    }

    fn run_collection(&mut self, generation: Generation, trigger: Trigger) -> HeapResult<CollectionReport> {
        self.collector.begin()?;
        let timer = perf::track("collect");

        let scope = self.scope(generation);
        log_gc_start(generation.index(), scope.len());

        let split = partition(&self.table, &scope);
        log_gc_mark(split.reachable.len());

        self.generations.reset_counts(generation);

        let mut sweep = Reclamation::default();
        if !split.unreachable.is_empty() {
            self.dispose(split.unreachable, Disposal::Traced, &mut sweep);
        }
        log_gc_sweep(sweep.reclaimed.len());

        // Survivors that a finalizer store did not free in the meantime
        let mut promoted = 0;
        for id in split.reachable {
            let Some(object) = self.table.get_mut(id) else {
                continue;
            };
            let from = object.generation;
            if self.generations.promote(id, from) {
                object.generation = from.next();
                promoted += 1;
            }
        }

        let report = CollectionReport::new(generation, trigger, scope.len(), promoted, sweep, timer.elapsed_us());
        self.generations
            .record(generation, report.collected(), report.uncollectable.len());
        self.collector.end();

        log_gc_complete(generation.index(), report.duration_us, report.collected(), self.table.len());
        self.sink.on_collection(&report);
        Ok(report)
    }

    /// Objects a pass over `0..=generation` examines
    ///
    /// Objects with no strong edges in either direction are left to
    /// reference counting.
    fn scope(&self, generation: Generation) -> BTreeSet<ObjectId> {
        self.generations
            .members_up_to(generation)
            .filter(|&id| {
                self.table.get(id).map_or(false, |object| {
                    object.has_targets() || object.refcount > self.external_refs(id)
                })
            })
            .collect()
    }

    /// Contributions from the root set and the garbage list
    fn external_refs(&self, id: ObjectId) -> usize {
        usize::from(self.roots.contains(id)) + usize::from(self.garbage.contains(id))
    }

    fn maybe_collect(&mut self) {
        if !self.config.enabled || self.collector.in_progress() || !self.generations.gen0_exceeded() {
            return;
        }

        let generation = self.generations.pick_automatic();
        let counts = self.generations.counts();
        log_threshold_exceeded(counts[0], self.config.gen0_threshold, generation.index());

        if let Err(err) = self.run_collection(generation, Trigger::Automatic) {
            warn!(event = "auto_collect_failed", error = %err);
        }
        self.run_deferred();
    }

    /// Passes requested by finalizers that ran outside a collection
    fn run_deferred(&mut self) {
        while let Some(generation) = self.deferred.take() {
            debug!(event = "deferred_collect", generation = generation.index());
            if let Err(err) = self.run_collection(generation, Trigger::Deferred) {
                warn!(event = "deferred_collect_failed", error = %err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Weak references
    // ------------------------------------------------------------------

    pub fn create_weak(&mut self, object: ObjectId) -> HeapResult<WeakId> {
        self.table.live(object)?;
        Ok(self.weak.create(object))
    }

    pub fn resolve_weak(&self, weak: WeakId) -> HeapResult<Resolved> {
        self.weak.resolve(weak).ok_or(HeapError::UnknownWeakRef(weak))
    }

    /// Live weak handles observing `object`
    pub fn weak_count(&self, object: ObjectId) -> usize {
        self.weak.count_for(object)
    }

    // ------------------------------------------------------------------
    // Configuration and statistics
    // ------------------------------------------------------------------

    /// Validate and apply; on error nothing changes
    pub fn configure(&mut self, config: GcConfig) -> HeapResult<()> {
        config.validate()?;
        self.generations.set_thresholds(config.thresholds());
        debug!(
            event = "configure",
            thresholds = ?config.thresholds(),
            enabled = config.enabled,
            save_all = config.save_all
        );
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn stats(&self) -> CollectionStatistics {
        CollectionStatistics {
            generations: self.generations.snapshot(),
            enabled: self.config.enabled,
            live_objects: self.table.len(),
            garbage: self.garbage.len(),
        }
    }

    /// Send the current statistics to the sink
    pub fn publish_stats(&mut self) {
        let stats = self.stats();
        self.sink.on_stats(&stats);
    }

    /// Zero the per-generation pass / collected / uncollectable counters
    pub fn reset_stats(&mut self) {
        self.generations.reset_stats();
    }

    /// Trigger counters per generation
    pub fn counts(&self) -> [usize; 3] {
        self.generations.counts()
    }

    // ------------------------------------------------------------------
    // Retained garbage
    // ------------------------------------------------------------------

    /// Uncollectable and saved objects, oldest first
    pub fn garbage(&self) -> &[ObjectId] {
        self.garbage.as_slice()
    }

    /// Drop the garbage list's holds
    ///
    /// Acyclic members are reclaimed right away; cyclic ones wait for the
    /// next pass. Their finalizers have already run and never run again.
    pub fn clear_garbage(&mut self) -> Reclamation {
        let mut sweep = Reclamation::default();
        let zeroed: Vec<ObjectId> = self
            .garbage
            .take_all()
            .into_iter()
            .filter(|&id| self.table.contains(id) && self.table.decref(id) == 0)
            .collect();
        if !zeroed.is_empty() {
            self.release(zeroed, &mut sweep);
        }
        self.run_deferred();
        sweep
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_alive(&self, object: ObjectId) -> bool {
        self.table.contains(object)
    }

    pub fn live_objects(&self) -> usize {
        self.table.len()
    }

    /// Every live object, ascending by id
    pub fn objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.table.ids().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_rooted(&self, object: ObjectId) -> bool {
        self.roots.contains(object)
    }

    pub fn roots(&self) -> Vec<ObjectId> {
        self.roots.iter().collect()
    }

    pub fn refcount(&self, object: ObjectId) -> HeapResult<usize> {
        Ok(self.table.live(object)?.refcount)
    }

    pub fn generation(&self, object: ObjectId) -> HeapResult<Generation> {
        Ok(self.table.live(object)?.generation)
    }

    pub fn field(&self, object: ObjectId, name: &str) -> HeapResult<Option<&Value>> {
        Ok(self.table.live(object)?.fields.get(name))
    }

    pub fn label(&self, object: ObjectId) -> Option<&str> {
        self.table.get(object).and_then(|o| o.label())
    }

    /// Objects currently in one generation bucket, ascending by id
    pub fn objects_in(&self, generation: Generation) -> Vec<ObjectId> {
        self.generations.bucket(generation).iter().copied().collect()
    }

    pub fn view(&self, object: ObjectId) -> HeapResult<ObjectView<'_>> {
        let target = self.table.live(object)?;
        Ok(ObjectView::new(target, self.roots.contains(object)))
    }

    /// Format an object with a harness-supplied function
    ///
    /// The formatter sees a read-only view; an error or panic from it yields
    /// a placeholder string and leaves the heap untouched.
    pub fn repr_with<F, E>(&self, object: ObjectId, format: F) -> String
    where
        F: FnOnce(&ObjectView<'_>) -> Result<String, E>,
        E: fmt::Display,
    {
        let view = match self.view(object) {
            Ok(view) => view,
            Err(_) => return format!("<reclaimed object {}>", object),
        };

        match catch_unwind(AssertUnwindSafe(|| format(&view))) {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => format!("<object {} repr failed: {}>", object, err),
            Err(payload) => format!("<object {} repr panicked: {}>", object, panic_message(payload.as_ref())),
        }
    }

    /// Strong edges between live objects
    pub fn edge_count(&self) -> usize {
        self.table.edge_count()
    }

    /// Total finalizers invoked over the heap's lifetime
    pub fn finalizers_run(&self) -> usize {
        self.finalizers.total_run()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.table.len())
            .field("roots", &self.roots.len())
            .field("garbage", &self.garbage.len())
            .field("weak_refs", &self.weak.len())
            .field("weak_invalidated", &self.weak.invalidated())
            .field("pending_finalizers", &self.finalizers.len())
            .field("collections", &self.collector.passes())
            .field("config", &self.config)
            .finish()
    }
}

/// A heap shared between threads; every operation takes the one lock
#[derive(Clone, Default)]
pub struct SharedHeap {
    inner: Arc<Mutex<Heap>>,
}

impl SharedHeap {
    pub fn new(heap: Heap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(heap)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access to the heap
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        f(&mut *self.inner.lock())
    }
}

impl fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The mutex is not reentrant; a holder on this thread must not deadlock
        match self.inner.try_lock() {
            Some(heap) => f.debug_tuple("SharedHeap").field(&*heap).finish(),
            None => f.write_str("SharedHeap(<locked>)"),
        }
    }
}
