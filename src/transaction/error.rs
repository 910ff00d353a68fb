use super::outcome::Abort;
use crate::core::DbError;
use std::error::Error as StdError;
use std::fmt;

/// Lifecycle step of a unit-of-work, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Acquire,
    ConfigureIsolation,
    Body,
    Commit,
    Rollback,
    RestoreIsolation,
    Close,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Acquire => "acquire",
            Step::ConfigureIsolation => "configure isolation",
            Step::Body => "body",
            Step::Commit => "commit",
            Step::Rollback => "rollback",
            Step::RestoreIsolation => "restore isolation",
            Step::Close => "close",
        };
        f.write_str(name)
    }
}

/// A database-level failure attributed to one lifecycle step
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub source: DbError,
}

impl StepFailure {
    pub fn new(step: Step, source: DbError) -> Self {
        Self { step, source }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.source)
    }
}

impl StdError for StepFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

/// Primary cause of a failed unit-of-work
#[derive(Debug)]
pub enum Failure<E> {
    /// The body returned an error. `committed` is true when the error asked
    /// for commit-despite-failure and that commit went through.
    Body { error: E, committed: bool },
    /// The body did not fail (or never ran) but a lifecycle step did
    Step(StepFailure),
}

/// Composed failure of a unit-of-work.
///
/// The primary cause is the body's own error whenever there is one. Failures
/// of later steps (rollback, commit-override, isolation restore, close) are
/// never dropped: they are kept, in order, as suppressed causes.
#[derive(Debug)]
pub struct TransactionError<E = anyhow::Error> {
    primary: Failure<E>,
    suppressed: Vec<StepFailure>,
}

impl<E> TransactionError<E> {
    pub fn body(error: E) -> Self {
        Self {
            primary: Failure::Body {
                error,
                committed: false,
            },
            suppressed: Vec::new(),
        }
    }

    pub fn step(step: Step, source: DbError) -> Self {
        Self {
            primary: Failure::Step(StepFailure::new(step, source)),
            suppressed: Vec::new(),
        }
    }

    /// Attach a secondary failure
    pub fn suppress(&mut self, step: Step, source: DbError) {
        self.suppressed.push(StepFailure::new(step, source));
    }

    pub(crate) fn mark_committed(&mut self) {
        if let Failure::Body { committed, .. } = &mut self.primary {
            *committed = true;
        }
    }

    /// Step the primary cause belongs to
    pub fn failed_step(&self) -> Step {
        match &self.primary {
            Failure::Body { .. } => Step::Body,
            Failure::Step(failure) => failure.step,
        }
    }

    pub fn primary(&self) -> &Failure<E> {
        &self.primary
    }

    pub fn body_error(&self) -> Option<&E> {
        match &self.primary {
            Failure::Body { error, .. } => Some(error),
            Failure::Step(_) => None,
        }
    }

    pub fn into_body_error(self) -> Option<E> {
        match self.primary {
            Failure::Body { error, .. } => Some(error),
            Failure::Step(_) => None,
        }
    }

    /// Primary database failure, when the body itself did not fail
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match &self.primary {
            Failure::Step(failure) => Some(failure),
            Failure::Body { .. } => None,
        }
    }

    pub fn suppressed(&self) -> &[StepFailure] {
        &self.suppressed
    }

    /// Secondary failure recorded for `step`, if any
    pub fn suppressed_at(&self, step: Step) -> Option<&DbError> {
        self.suppressed
            .iter()
            .find(|f| f.step == step)
            .map(|f| &f.source)
    }

    /// True when the body failed with a commit-override and the commit succeeded
    pub fn was_committed(&self) -> bool {
        matches!(self.primary, Failure::Body { committed: true, .. })
    }

    /// Transform the body error type, keeping every recorded cause
    pub fn map_body<F, M>(self, f: M) -> TransactionError<F>
    where
        M: FnOnce(E) -> F,
    {
        let primary = match self.primary {
            Failure::Body { error, committed } => Failure::Body {
                error: f(error),
                committed,
            },
            Failure::Step(failure) => Failure::Step(failure),
        };
        TransactionError {
            primary,
            suppressed: self.suppressed,
        }
    }

    pub fn into_parts(self) -> (Failure<E>, Vec<StepFailure>) {
        (self.primary, self.suppressed)
    }
}

impl<E: fmt::Display> fmt::Display for TransactionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.primary {
            Failure::Body { error, committed } => {
                write!(f, "transaction body failed: {}", error)?;
                if *committed {
                    write!(f, " (committed anyway)")?;
                }
            }
            Failure::Step(failure) => write!(f, "transaction {}", failure)?,
        }
        if !self.suppressed.is_empty() {
            write!(f, "; suppressed: ")?;
            for (i, failure) in self.suppressed.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", failure)?;
            }
        }
        Ok(())
    }
}

/// Body error types that can stand as the `source` of a [`TransactionError`].
///
/// Implemented for the error types bodies return in this crate. A domain error
/// deriving `std::error::Error` implements it with `Some(self)`.
pub trait ErrorCause {
    fn as_cause(&self) -> Option<&(dyn StdError + 'static)>;
}

impl ErrorCause for anyhow::Error {
    fn as_cause(&self) -> Option<&(dyn StdError + 'static)> {
        let cause: &(dyn StdError + Send + Sync + 'static) = self.as_ref();
        Some(cause)
    }
}

impl ErrorCause for DbError {
    fn as_cause(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self)
    }
}

impl<E: ErrorCause> ErrorCause for Abort<E> {
    fn as_cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.error().as_cause()
    }
}

impl<E: fmt::Debug + fmt::Display + ErrorCause> StdError for TransactionError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.primary {
            Failure::Step(failure) => Some(&failure.source),
            Failure::Body { error, .. } => error.as_cause(),
        }
    }
}

impl From<TransactionError<DbError>> for DbError {
    /// Collapse to the primary database error, dropping suppressed causes
    fn from(err: TransactionError<DbError>) -> Self {
        match err.primary {
            Failure::Body { error, .. } => error,
            Failure::Step(failure) => failure.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_failure_keeps_suppressed_in_order() {
        let mut err: TransactionError<DbError> =
            TransactionError::body(DbError::ExecutionError("insert failed".into()));
        err.suppress(Step::Rollback, DbError::ExecutionError("network".into()));
        err.suppress(Step::Close, DbError::ExecutionError("socket".into()));

        assert_eq!(err.failed_step(), Step::Body);
        assert!(err.body_error().is_some());
        assert_eq!(err.suppressed().len(), 2);
        assert_eq!(err.suppressed()[0].step, Step::Rollback);
        assert!(err.suppressed_at(Step::Close).is_some());
        assert!(err.suppressed_at(Step::Commit).is_none());

        let text = err.to_string();
        assert!(text.starts_with("transaction body failed: Execution error: insert failed"));
        assert!(text.contains("rollback failed: Execution error: network"));
        assert!(text.contains("close failed"));
    }

    #[test]
    fn test_step_failure_is_error_source() {
        let err: TransactionError = TransactionError::step(
            Step::Close,
            DbError::ExecutionError("socket".into()),
        );
        assert_eq!(err.failed_step(), Step::Close);
        assert!(err.body_error().is_none());
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "transaction close failed: Execution error: socket");
    }

    #[test]
    fn test_body_error_is_error_source() {
        let err: TransactionError =
            TransactionError::body(anyhow::Error::new(DbError::ExecutionError("insert failed".into())));
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Execution error: insert failed");
        assert!(source.downcast_ref::<DbError>().is_some());

        let wrapped = anyhow::Error::new(err);
        let chain: Vec<String> = wrapped.chain().map(|e| e.to_string()).collect();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], "Execution error: insert failed");

        let typed: TransactionError<Abort<DbError>> =
            TransactionError::body(Abort::commit(DbError::ConstraintViolation("dup".into())));
        assert!(typed.source().unwrap().to_string().contains("dup"));
    }

    #[test]
    fn test_committed_flag_and_map_body() {
        let mut err = TransactionError::body("expected");
        err.mark_committed();
        assert!(err.was_committed());
        assert!(err.to_string().contains("committed anyway"));

        let mapped = err.map_body(|e| e.len());
        assert!(mapped.was_committed());
        assert_eq!(mapped.into_body_error(), Some(8));
    }

    #[test]
    fn test_collapse_into_db_error() {
        let err: TransactionError<DbError> =
            TransactionError::step(Step::Acquire, DbError::PoolTimeout("busy".into()));
        let db: DbError = err.into();
        assert!(matches!(db, DbError::PoolTimeout(_)));
    }
}
