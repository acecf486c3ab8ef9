//! Finalization queue - every finalizer runs exactly once
//!
//! Finalizers are `FnOnce` boxes taken out of their object before they are
//! queued, so a second invocation is impossible by construction. A failing
//! finalizer (an `Err` or a panic) is recorded against its object and never
//! interrupts the rest of the batch.

use super::object::{Fields, Generation, ObjectId, Value, LABEL_FIELD};
use super::refcount::ReferenceTable;
use crate::error::{HeapError, HeapResult};
use crate::logging::{log_finalizer_failure, trace, warn};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Side-effecting action attached to an object at allocation
pub type Finalizer =
    Box<dyn FnOnce(&mut FinalizerContext<'_>) -> Result<(), FinalizerError> + Send + 'static>;

/// Box a closure as a [`Finalizer`]
pub fn finalizer<F>(action: F) -> Finalizer
where
    F: FnOnce(&mut FinalizerContext<'_>) -> Result<(), FinalizerError> + Send + 'static,
{
    Box::new(action)
}

/// Error raised by a finalizer action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerError {
    message: String,
}

impl FinalizerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FinalizerError {}

impl From<&str> for FinalizerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FinalizerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A finalizer failure, recorded per object in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizerFailure {
    pub object: ObjectId,
    pub message: String,
}

impl fmt::Display for FinalizerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "finalizer of {} failed: {}", self.object, self.message)
    }
}

/// Field store requested by a finalizer, applied once its batch is disposed
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingStore {
    pub(crate) requested_by: ObjectId,
    pub(crate) owner: ObjectId,
    pub(crate) field: String,
    pub(crate) value: Value,
}

/// What a running finalizer may see and request
///
/// The object being finalized is still intact while its finalizer runs.
/// Stores are queued rather than applied, which is what makes resurrection
/// detectable before any storage is released.
pub struct FinalizerContext<'a> {
    object: ObjectId,
    fields: &'a Fields,
    in_collection: bool,
    stores: &'a mut Vec<PendingStore>,
    requested: &'a mut Option<Generation>,
}

impl<'a> FinalizerContext<'a> {
    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn label(&self) -> Option<&'a str> {
        match self.fields.get(LABEL_FIELD) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'a Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &'a Fields {
        self.fields
    }

    /// Queue `owner.field = value`
    ///
    /// Storing a reference to any object of the batch being reclaimed into
    /// an object outside it resurrects the batch, which is then retained as
    /// uncollectable instead of freed. A store whose owner is freed along
    /// with the batch, or was already reclaimed, is not applied and is
    /// reported as a failure of this finalizer.
    pub fn set_field(&mut self, owner: ObjectId, field: impl Into<String>, value: impl Into<Value>) {
        self.stores.push(PendingStore {
            requested_by: self.object,
            owner,
            field: field.into(),
            value: value.into(),
        });
    }

    /// Ask for a collection once the current heap operation completes
    ///
    /// Fails with `CollectionInProgress` when this finalizer runs as part of
    /// a collection pass.
    pub fn request_collection(&mut self, generation: Generation) -> HeapResult<()> {
        if self.in_collection {
            return Err(HeapError::CollectionInProgress);
        }
        *self.requested = Some(match *self.requested {
            Some(previous) => previous.max(generation),
            None => generation,
        });
        Ok(())
    }
}

/// Everything a batch of finalizers produced
#[derive(Debug, Default)]
pub(crate) struct FinalizeOutcome {
    pub(crate) finalized: Vec<ObjectId>,
    pub(crate) failures: Vec<FinalizerFailure>,
    pub(crate) stores: Vec<PendingStore>,
    pub(crate) requested: Option<Generation>,
}

/// Objects whose finalizers are due, in reclamation order
#[derive(Default)]
pub(crate) struct FinalizationQueue {
    pending: VecDeque<(ObjectId, Finalizer)>,
    total_run: usize,
}

impl FinalizationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, object: ObjectId, finalizer: Finalizer) {
        trace!(event = "finalizer_enqueued", object = %object);
        self.pending.push_back((object, finalizer));
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Number of finalizers invoked over the queue's lifetime
    pub(crate) fn total_run(&self) -> usize {
        self.total_run
    }

    /// Drain the queue, running every finalizer against its still-intact object
    pub(crate) fn run(&mut self, table: &ReferenceTable, in_collection: bool) -> FinalizeOutcome {
        let mut outcome = FinalizeOutcome::default();

        while let Some((object, finalizer)) = self.pending.pop_front() {
            let Some(target) = table.get(object) else {
                // Only reachable if an object vanished between enqueue and run
                warn!(event = "finalizer_orphaned", object = %object, "finalizer target missing");
                continue;
            };

            let mut ctx = FinalizerContext {
                object,
                fields: &target.fields,
                in_collection,
                stores: &mut outcome.stores,
                requested: &mut outcome.requested,
            };

            self.total_run += 1;
            outcome.finalized.push(object);

            let message = match catch_unwind(AssertUnwindSafe(|| finalizer(&mut ctx))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.message,
                Err(payload) => format!("finalizer panicked: {}", panic_message(payload.as_ref())),
            };

            log_finalizer_failure(object, &message);
            outcome.failures.push(FinalizerFailure { object, message });
        }

        outcome
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn table_with(count: usize) -> (ReferenceTable, Vec<ObjectId>) {
        let mut table = ReferenceTable::new();
        let ids = (0..count)
            .map(|i| {
                let mut fields = Fields::new();
                fields.insert(LABEL_FIELD.into(), Value::Str(format!("obj{}", i)));
                table.insert(fields, None)
            })
            .collect();
        (table, ids)
    }

    #[test]
    fn runs_each_queued_finalizer_once() {
        let (table, ids) = table_with(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut queue = FinalizationQueue::new();

        for &id in &ids {
            let calls = Arc::clone(&calls);
            queue.enqueue(
                id,
                finalizer(move |_ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let outcome = queue.run(&table, false);
        assert_eq!(outcome.finalized, ids);
        assert!(outcome.failures.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 0);

        // Draining again is a no-op
        let again = queue.run(&table, false);
        assert!(again.finalized.is_empty());
        assert_eq!(queue.total_run(), 2);
    }

    #[test]
    fn failures_do_not_stop_the_batch() {
        let (table, ids) = table_with(3);
        let mut queue = FinalizationQueue::new();

        queue.enqueue(ids[0], finalizer(|_ctx| Err("boom".into())));
        queue.enqueue(ids[1], finalizer(|_ctx| panic!("finalizer exploded")));
        queue.enqueue(ids[2], finalizer(|_ctx| Ok(())));

        let outcome = queue.run(&table, true);
        assert_eq!(outcome.finalized.len(), 3);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].object, ids[0]);
        assert_eq!(outcome.failures[0].message, "boom");
        assert!(outcome.failures[1].message.contains("finalizer exploded"));
    }

    #[test]
    fn context_exposes_fields_and_queues_stores() {
        let (table, ids) = table_with(2);
        let (dying, survivor) = (ids[0], ids[1]);
        let mut queue = FinalizationQueue::new();

        queue.enqueue(
            dying,
            finalizer(move |ctx| {
                assert_eq!(ctx.label(), Some("obj0"));
                ctx.set_field(survivor, "saved", ctx.object());
                Ok(())
            }),
        );

        let outcome = queue.run(&table, false);
        assert_eq!(outcome.stores.len(), 1);
        assert_eq!(outcome.stores[0].owner, survivor);
        assert_eq!(outcome.stores[0].value, Value::Ref(dying));
        assert_eq!(outcome.stores[0].requested_by, dying);
    }

    #[test]
    fn collection_request_rejected_inside_a_pass() {
        let (table, ids) = table_with(2);
        let mut queue = FinalizationQueue::new();

        queue.enqueue(
            ids[0],
            finalizer(|ctx| match ctx.request_collection(Generation::Gen0) {
                Err(HeapError::CollectionInProgress) => Ok(()),
                other => Err(format!("unexpected: {:?}", other).into()),
            }),
        );
        let outcome = queue.run(&table, true);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.requested, None);

        queue.enqueue(ids[1], finalizer(|ctx| ctx.request_collection(Generation::Gen1).map_err(|e| e.to_string().into())));
        let outcome = queue.run(&table, false);
        assert_eq!(outcome.requested, Some(Generation::Gen1));
    }
}
