pub mod error;
pub mod executor;
pub mod outcome;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorCause, Failure, Step, StepFailure, TransactionError};
pub use executor::{Database, TxScope};
pub use outcome::{Abort, Disposition, FailureDisposition, NoRollback, ResultExt};
