//! Heap errors
//!
//! Structural errors are detected before anything is mutated, so a failed
//! call never leaves the heap half-updated. Finalizer failures and
//! uncollectable batches are normally carried in reports; the variants here
//! let callers escalate them with `?`.

use crate::gc::{FinalizerFailure, ObjectId, WeakId};
use std::fmt;

pub type HeapResult<T> = Result<T, HeapError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Id never issued by this heap, or a reclaimed object used as a target
    UnknownObject(ObjectId),
    /// Mutation of an object that has already been reclaimed
    UseAfterFree(ObjectId),
    UnknownWeakRef(WeakId),
    /// `drop_root` on an object the harness no longer holds
    NotRooted(ObjectId),
    /// Collection requested while a pass is running
    CollectionInProgress,
    InvalidGeneration(usize),
    InvalidConfiguration(String),
    FinalizerFailed(FinalizerFailure),
    /// Batch withheld because a finalizer resurrected one of its members
    Uncollectable(Vec<ObjectId>),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownObject(id) => write!(f, "Unknown object: {}", id),
            Self::UseAfterFree(id) => write!(f, "Use after free: object {} was already reclaimed", id),
            Self::UnknownWeakRef(id) => write!(f, "Unknown weak reference: {}", id),
            Self::NotRooted(id) => write!(f, "Object {} is not in the root set", id),
            Self::CollectionInProgress => write!(f, "A collection is already in progress"),
            Self::InvalidGeneration(generation) => {
                write!(f, "Invalid generation {}: expected 0, 1 or 2", generation)
            }
            Self::InvalidConfiguration(reason) => write!(f, "Invalid configuration: {}", reason),
            Self::FinalizerFailed(failure) => write!(f, "{}", failure),
            Self::Uncollectable(objects) => {
                let ids: Vec<String> = objects.iter().map(ToString::to_string).collect();
                write!(f, "Uncollectable batch retained: [{}]", ids.join(", "))
            }
        }
    }
}

impl std::error::Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_object() {
        let id = ObjectId(4);
        assert_eq!(HeapError::UnknownObject(id).to_string(), "Unknown object: #4");
        assert!(HeapError::UseAfterFree(id).to_string().contains("#4"));
        assert_eq!(
            HeapError::Uncollectable(vec![ObjectId(1), ObjectId(2)]).to_string(),
            "Uncollectable batch retained: [#1, #2]"
        );
    }

    #[test]
    fn finalizer_failure_message_passes_through() {
        let err = HeapError::FinalizerFailed(FinalizerFailure {
            object: ObjectId(9),
            message: "boom".into(),
        });
        assert_eq!(err.to_string(), "finalizer of #9 failed: boom");
    }
}
