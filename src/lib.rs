//! refcycle - an observable memory manager
//!
//! Reference counting reclaims acyclic objects the moment their last strong
//! reference goes away. A generational trial-deletion collector finds the
//! cycles counting can never free. Weak references observe liveness without
//! extending it, and every finalizer runs exactly once.
//!
//! ```ignore
//! use refcycle::{Heap, ObjectSpec};
//!
//! let mut heap = Heap::new();
//! let a = heap.allocate(ObjectSpec::labeled("A"))?;
//! let b = heap.allocate(ObjectSpec::labeled("B").field("other", a))?;
//! heap.set_field(a, "other", b)?;
//! heap.drop_root(a)?;
//! heap.drop_root(b)?;
//! assert_eq!(heap.collect(0)?.collected(), 2);
//! ```

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod logging;

pub use config::GcConfig;
pub use error::{HeapError, HeapResult};
pub use gc::{
    finalizer, CollectionReport, CollectionStatistics, Fields, Finalizer, FinalizerContext, FinalizerError,
    FinalizerFailure, Generation, GenerationStats, ObjectId, ObjectSpec, ObjectView, Reclamation, Resolved,
    Trigger, Value, WeakId, LABEL_FIELD,
};
pub use heap::{Heap, ReportSink, SharedHeap, TracingSink};
