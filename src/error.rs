//! Error types for the task engine.
//!
//! Two kinds of failure exist here and they never mix:
//! - `TaskError`: lifecycle misuse (starting twice, starting while cancelled).
//!   Returned synchronously from engine calls.
//! - Work errors: failures raised *inside* a unit of work. These never escape
//!   the pool thread; they are captured into an [`ErrorAggregate`] and become
//!   observable task state.

use std::error::Error as StdError;
use std::fmt;

/// Boxed error raised by a unit of work.
pub type WorkError = Box<dyn StdError + Send + Sync>;

/// Outcome of a unit of work.
pub type WorkResult<T> = Result<T, WorkError>;

/// Errors surfaced by task lifecycle operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task has already been started")]
    AlreadyStarted,

    #[error("operation was cancelled")]
    Cancelled,
}

/// Ordered collection of errors captured when a task faults.
///
/// # Invariants
/// - Immutable after construction.
/// - Member order is the order in which the errors were captured.
#[derive(Debug)]
pub struct ErrorAggregate {
    errors: Vec<WorkError>,
}

impl ErrorAggregate {
    /// Create an aggregate from an ordered list of errors.
    pub fn new(errors: Vec<WorkError>) -> Self {
        Self { errors }
    }

    /// Create a single-error aggregate (the common fault path).
    pub fn from_error(error: WorkError) -> Self {
        Self::new(vec![error])
    }

    /// The captured errors, in capture order.
    pub fn errors(&self) -> &[WorkError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ErrorAggregate {
    /// Each member's own textual form, in order, separated by a blank line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n\n")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl StdError for ErrorAggregate {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors
            .first()
            .map(|error| &**error as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_preserves_identity_and_order() {
        let aggregate = ErrorAggregate::new(vec![
            "first failure".into(),
            "second failure".into(),
            "third failure".into(),
        ]);
        assert_eq!(
            aggregate.to_string(),
            "first failure\n\nsecond failure\n\nthird failure"
        );
    }

    #[test]
    fn test_single_error_has_no_separator() {
        let aggregate = ErrorAggregate::from_error("lonely".into());
        assert_eq!(aggregate.to_string(), "lonely");
        assert_eq!(aggregate.len(), 1);
        assert!(!aggregate.is_empty());
    }

    #[test]
    fn test_source_is_first_member() {
        let aggregate = ErrorAggregate::new(vec!["head".into(), "tail".into()]);
        let source = aggregate.source().expect("source should exist");
        assert_eq!(source.to_string(), "head");
    }

    #[test]
    fn test_empty_aggregate() {
        let aggregate = ErrorAggregate::new(Vec::new());
        assert!(aggregate.is_empty());
        assert_eq!(aggregate.to_string(), "");
        assert!(aggregate.source().is_none());
    }
}
