//! Sky coupling calibration against a batch of radiometer measurements
//!
//! The radiometer sky coupling is rescaled by the factor that makes the
//! retrieved water vapor columns fit the measurements best, i.e. the factor
//! minimising the RMS of the per-measurement fit sigmas. Each evaluation of
//! that RMS retrieves the whole batch, so a calibration costs up to
//! `max_iterations` squared radiometer fits per measurement.

use std::ops::Range;

use log::{info, warn};
use rayon::prelude::*;

use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::fit::{fit, FitProblem};
use crate::radiometer::{WaterVaporRadiometer, WvrMeasurement};
use crate::retrieval::{check_range, rms};
use crate::retrieval::wvr::CouplingScale;
use crate::sky::SkyState;

/// Outcome of a sky coupling calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CouplingCalibration {
    /// Factor the sky coupling was multiplied by
    pub factor: f64,
    /// RMS of the radiometer fit sigmas (K) at the calibrated coupling
    pub sigma: f64,
    /// Number of fitter iterations
    pub iterations: usize,
}

/// RMS of the radiometer fit sigmas as a function of the coupling factor.
/// The target is zero.
struct CouplingFit<'a, A> {
    sky: &'a SkyState<A>,
    radiometer: &'a WaterVaporRadiometer,
    measurements: &'a [WvrMeasurement],
    channel: Option<usize>,
    max_factor: f64,
}

impl<A> CouplingFit<'_, A> {
    fn scale(&self, factor: f64) -> CouplingScale {
        match self.channel {
            Some(channel) => CouplingScale::Channel(channel, factor),
            None => CouplingScale::All(factor),
        }
    }
}

impl<A: AtmosphereModel + Sync> FitProblem for CouplingFit<'_, A> {
    fn measured(&self) -> &[f64] {
        &[0.0]
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        let scale = self.scale(parameter);
        let sigmas = self
            .measurements
            .par_iter()
            .map(|m| {
                self.sky
                    .solve_wvr(self.radiometer, scale, m)
                    .map(|solution| solution.sigma)
            })
            .collect::<Result<Vec<f64>, SkyError>>()?;
        out[0] = rms(sigmas.into_iter());
        Ok(())
    }

    fn bound(&self, proposal: f64, current: f64) -> f64 {
        let proposal = if proposal < 0.0 { 0.9 * current } else { proposal };
        proposal.min(self.max_factor)
    }
}

impl<A: AtmosphereModel + Sync> SkyState<A> {
    /// Rescale the sky coupling of every radiometer channel to best fit the
    /// measurements in `range`.
    ///
    /// The factor starts at 1 and is capped so that no channel coupling
    /// exceeds 1. On success the radiometer coupling is multiplied by the
    /// factor and the measurements in `range` are retrieved again with it.
    /// On failure the radiometer and the measurements are left unchanged.
    pub fn calibrate_sky_coupling(
        &mut self,
        measurements: &mut [WvrMeasurement],
        range: Range<usize>,
    ) -> Result<CouplingCalibration, SkyError> {
        self.calibrate(measurements, range, None)
    }

    /// Rescale the sky coupling of one radiometer channel, as
    /// [`calibrate_sky_coupling`](Self::calibrate_sky_coupling) does for all
    /// of them.
    pub fn calibrate_channel_sky_coupling(
        &mut self,
        channel: usize,
        measurements: &mut [WvrMeasurement],
        range: Range<usize>,
    ) -> Result<CouplingCalibration, SkyError> {
        self.calibrate(measurements, range, Some(channel))
    }

    fn calibrate(
        &mut self,
        measurements: &mut [WvrMeasurement],
        range: Range<usize>,
        channel: Option<usize>,
    ) -> Result<CouplingCalibration, SkyError> {
        let radiometer = self
            .radiometer()
            .ok_or(SkyError::InvalidInput("no water vapor radiometer configured"))?;
        check_range(&range, measurements.len())?;
        let coupling = match channel {
            Some(channel) => *radiometer
                .sky_coupling()
                .get(channel)
                .ok_or(SkyError::InvalidInput("no such radiometer channel"))?,
            None => radiometer.max_sky_coupling(),
        };
        let batch = &measurements[range.clone()];
        batch
            .iter()
            .try_for_each(|m| self.check_wvr_measurement(radiometer, m))?;

        let max_factor = if coupling > 0.0 { 1.0 / coupling } else { f64::INFINITY };
        let problem = CouplingFit {
            sky: &*self,
            radiometer,
            measurements: batch,
            channel,
            max_factor,
        };
        let outcome = match fit(&problem, max_factor.min(1.0), self.fit_settings()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("sky coupling calibration failed, coupling left unchanged: {e}");
                return Err(e);
            }
        };

        let radiometer = self
            .radiometer_mut()
            .ok_or(SkyError::InvalidInput("no water vapor radiometer configured"))?;
        match channel {
            Some(channel) => radiometer.multiply_channel_sky_coupling(channel, outcome.parameter)?,
            None => radiometer.multiply_sky_coupling(outcome.parameter),
        }
        info!(
            "sky coupling {} multiplied by {:.5}, fit sigma {:.4} K after {} iterations",
            channel.map_or_else(|| "of all channels".to_string(), |c| format!("of channel {c}")),
            outcome.parameter,
            outcome.sigma,
            outcome.iterations
        );
        self.retrieve_wvr_batch(measurements, range)?;

        Ok(CouplingCalibration {
            factor: outcome.parameter,
            sigma: outcome.sigma,
            iterations: outcome.iterations,
        })
    }
}
