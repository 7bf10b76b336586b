//! Error taxonomy for the theme life-cycle numerical core.
//!
//! Every fallible entry point in this crate returns [`ThemeResult`].
//! Failures are typed rather than opaque so a driver binary can match
//! on the kind of failure and decide its own exit code or retry
//! policy, instead of parsing an error string.

use thiserror::Error;

/// Everything that can go wrong inside the theme life-cycle core.
#[derive(Debug, Error)]
pub enum ThemeError {
    /// An out-of-range or internally inconsistent configuration
    /// parameter (e.g. `K == 0`, `lambda_background` outside `(0,1)`).
    /// Fatal: the call that produced it cannot be retried without a
    /// different configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A time partition was handed to the EM fitter with no
    /// documents (or no documents with any words). Fatal for that
    /// partition, but does not abort a multi-partition run.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A normalization denominator was `<= 0` even after the
    /// configured epsilon floor. The iteration that produced it is
    /// discarded and the previous parameters are retained.
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// Three (configurable) consecutive [`ThemeError::NumericalDegeneracy`]
    /// events occurred; the fit is abandoned.
    #[error("fit diverged after {consecutive_degeneracies} consecutive numerical degeneracies")]
    Diverged { consecutive_degeneracies: u32 },

    /// A cooperative cancellation request was observed between
    /// iterations.
    #[error("run cancelled")]
    Cancelled,

    /// The configured wall-clock budget elapsed; the run returns the
    /// best parameters found through the last completed iteration.
    #[error("run timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// A block's observation slice does not cover the indices the
    /// coordinator expected. Indicates a bug upstream of this crate
    /// (e.g. a mis-sliced `ScanBlock`), never a data problem.
    #[error("block size mismatch: expected block to cover [{expected_start}, {expected_end}), got {actual_len} observations")]
    BlockSizeMismatch {
        expected_start: usize,
        expected_end: usize,
        actual_len: usize,
    },
}

/// Convenience alias used throughout the crate.
pub type ThemeResult<T> = Result<T, ThemeError>;
