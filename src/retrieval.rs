//! Water vapor retrievals
//!
//! Three families of measurements constrain the water vapor column: zenith
//! transmission spectra ([`fts`]), sky brightness temperatures of one or more
//! spectral windows ([`tebb`]) and multi-channel radiometer readings
//! ([`wvr`]). All of them fit the ratio of the water vapor column to a
//! reference column with the damped least squares fitter.
//!
//! Retrievals take `&self` and return what they found. Adopting the result as
//! the new user water vapor column is a separate, explicit
//! [`SkyState::commit`].

pub mod fts;
pub mod tebb;
pub mod wvr;

use std::ops::Range;

use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::sky::SkyState;

/// Outcome of a converged water vapor retrieval.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Retrieval {
    /// Retrieved zenith water vapor column in mm
    pub water_column: f64,
    /// Formal error of the water vapor column in mm
    pub water_column_error: f64,
    /// RMS of the fit residuals, in the units of the measurements
    pub sigma: f64,
    /// Model values at the retrieved column, one per fitted measurement
    pub fitted: Vec<f64>,
    /// Number of fitter iterations
    pub iterations: usize,
}

impl<A: AtmosphereModel> SkyState<A> {
    /// Adopt a retrieved water vapor column as the user column, and return
    /// the column now in use.
    ///
    /// A retrieval that did not give a positive column leaves the session
    /// unchanged.
    pub fn commit(&mut self, retrieval: &Retrieval) -> f64 {
        if retrieval.water_column > 0.0 {
            self.set_user_water_column(retrieval.water_column)
        } else {
            self.user_water_column()
        }
    }
}

/// Check that `range` is a non-empty range of a slice of length `len`.
pub(crate) fn check_range(range: &Range<usize>, len: usize) -> Result<(), SkyError> {
    if range.start >= range.end {
        return Err(SkyError::InvalidInput("empty measurement range"));
    }
    if range.end > len {
        return Err(SkyError::InvalidInput("measurement range out of bounds"));
    }
    Ok(())
}

/// Root mean square of `values`, which must not be empty.
pub(crate) fn rms(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v * v, n + 1));
    (sum / n as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_atmosphere;

    #[test]
    fn commit_adopts_positive_columns() {
        let mut sky = SkyState::new(synthetic_atmosphere());
        let mut retrieval = Retrieval {
            water_column: 2.5,
            water_column_error: 0.1,
            sigma: 0.2,
            fitted: vec![],
            iterations: 3,
        };
        assert_eq!(sky.commit(&retrieval), 2.5);
        assert_eq!(sky.user_water_column(), 2.5);

        retrieval.water_column = 0.0;
        assert_eq!(sky.commit(&retrieval), 2.5);

        // Still clamped to what the humidity allows
        retrieval.water_column = 50.0;
        assert_eq!(sky.commit(&retrieval), 10.0);
    }

    #[test]
    fn ranges() {
        assert!(check_range(&(2..5), 6).is_ok());
        assert!(check_range(&(2..2), 6).is_err());
        assert!(check_range(&(4..7), 6).is_err());
        assert_eq!(rms([3.0, 4.0].into_iter()), (12.5f64).sqrt());
    }
}
