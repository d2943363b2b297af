//! Error type

use thiserror::Error;

/// Possible sky model and retrieval errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkyError {
    /// A physical parameter is out of range, or parallel inputs disagree in
    /// length
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The spectral window or channel does not exist in the atmosphere model
    #[error("no channel {channel} in spectral window {spectral_window}")]
    InvalidChannel {
        /// Spectral window identifier
        spectral_window: usize,
        /// Channel index within the spectral window
        channel: usize,
    },
    /// The fit used up its iteration budget without meeting the tolerance
    #[error("fit did not converge after {iterations} iterations (parameter {parameter}, sigma {sigma})")]
    NotConverged {
        /// Number of iterations performed
        iterations: usize,
        /// Last accepted value of the fitted parameter
        parameter: f64,
        /// Fit sigma at the last accepted parameter
        sigma: f64,
    },
    /// The inputs to the atmosphere model don't have the expected shape(s)
    #[error("atmosphere inputs have the wrong shape")]
    InconsistentInputs,
    /// An array is not contiguous when it was assumed to be
    #[error("array slice not contiguous in memory")]
    NotContiguous,
    /// A batch was interrupted before all of it was processed
    #[error("computation cancelled")]
    Cancelled,
}

impl SkyError {
    /// Whether this error reports an exhausted iteration budget (as opposed to
    /// bad input).
    pub fn is_not_converged(&self) -> bool {
        matches!(self, SkyError::NotConverged { .. })
    }
}
