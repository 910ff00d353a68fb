// ============================================================================
// Commit-Override Signal
// ============================================================================
//
// A failing unit-of-work rolls back unless its failure says otherwise.
// The executor asks exactly once, through FailureDisposition::commit_anyway.
//
// ============================================================================

use crate::core::DbError;
use std::error::Error as StdError;
use std::fmt;

/// How the executor finalizes a unit-of-work that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Rollback,
    Commit,
}

/// Classifies body failures into rollback (default) or commit-despite-failure.
pub trait FailureDisposition {
    fn commit_anyway(&self) -> bool {
        false
    }
}

impl FailureDisposition for DbError {}

/// Any `NoRollback` in the error chain asks for a commit.
impl FailureDisposition for anyhow::Error {
    fn commit_anyway(&self) -> bool {
        self.chain().any(|cause| cause.is::<NoRollback>())
    }
}

/// Marker failure: "this outcome is expected, persist the work done so far".
///
/// Raise it from a body running under [`Database::transaction`]:
///
/// ```
/// use txscope::NoRollback;
///
/// fn reserve(seats_left: u32) -> anyhow::Result<()> {
///     if seats_left == 0 {
///         return Err(NoRollback::new("sold out").into());
///     }
///     Ok(())
/// }
/// # assert!(reserve(0).is_err());
/// ```
///
/// [`Database::transaction`]: crate::Database::transaction
#[derive(Debug)]
pub struct NoRollback {
    reason: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl NoRollback {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    /// Mark an existing error as expected
    pub fn wrap<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            reason: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for NoRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl StdError for NoRollback {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// A body failure tagged with an explicit [`Disposition`].
///
/// `From<E>` defaults to rollback, so `?` keeps working for the common case.
#[derive(Debug)]
pub struct Abort<E> {
    error: E,
    disposition: Disposition,
}

impl<E> Abort<E> {
    pub fn rollback(error: E) -> Self {
        Self {
            error,
            disposition: Disposition::Rollback,
        }
    }

    pub fn commit(error: E) -> Self {
        Self {
            error,
            disposition: Disposition::Commit,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E> From<E> for Abort<E> {
    fn from(error: E) -> Self {
        Self::rollback(error)
    }
}

impl<E> FailureDisposition for Abort<E> {
    fn commit_anyway(&self) -> bool {
        self.disposition == Disposition::Commit
    }
}

impl<E: fmt::Display> fmt::Display for Abort<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

/// Tag the error side of a `Result` for commit-despite-failure.
pub trait ResultExt<T, E> {
    fn commit_anyway(self) -> Result<T, Abort<E>>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn commit_anyway(self) -> Result<T, Abort<E>> {
        self.map_err(Abort::commit)
    }
}
