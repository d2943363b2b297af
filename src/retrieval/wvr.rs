//! Retrieval from water vapor radiometer measurements

use std::ops::Range;

use log::debug;
use rayon::prelude::*;
use smallvec::SmallVec;

use super::{check_range, rms, Retrieval};
use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::fit::{fit, FitProblem};
use crate::radiometer::{ChannelValues, WaterVaporRadiometer, WvrMeasurement};
use crate::rtm::{Beam, RadiativeTransfer, TemperatureScale};
use crate::sky::SkyState;

/// Sky coupling adjustment applied on top of the radiometer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CouplingScale {
    /// Every channel scaled by the same factor
    All(f64),
    /// One channel scaled, the others as configured
    Channel(usize, f64),
}

impl CouplingScale {
    fn factor(self, channel: usize) -> f64 {
        match self {
            CouplingScale::All(factor) => factor,
            CouplingScale::Channel(c, factor) if c == channel => factor,
            CouplingScale::Channel(..) => 1.0,
        }
    }
}

/// Band averaged brightness of each radiometer channel.
struct WvrFit<'a, A: ?Sized> {
    rtm: RadiativeTransfer<'a, A>,
    beams: SmallVec<[Beam; 8]>,
    radiometer: &'a WaterVaporRadiometer,
    air_mass: f64,
    measured: &'a [f64],
}

impl<A: AtmosphereModel + ?Sized> FitProblem for WvrFit<'_, A> {
    fn measured(&self) -> &[f64] {
        self.measured
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        let channels = self
            .radiometer
            .spectral_windows()
            .iter()
            .zip(self.radiometer.signal_gain())
            .zip(&self.beams);
        for (o, ((&spectral_window, &signal_gain), &beam)) in out.iter_mut().zip(channels) {
            *o = self.rtm.band_brightness(
                TemperatureScale::Tebb,
                parameter,
                beam,
                self.air_mass,
                spectral_window,
                None,
                signal_gain,
            )?;
        }
        Ok(())
    }
}

/// What a radiometer fit found, whether it converged or not.
#[derive(Debug, Clone)]
pub(crate) struct WvrSolution {
    /// Retrieved column in mm, or the reason the fit stopped
    pub water_column: Result<f64, SkyError>,
    pub water_column_error: f64,
    pub sigma: f64,
    pub fitted: ChannelValues,
    pub iterations: usize,
}

impl WvrSolution {
    fn record(self, measurement: &mut WvrMeasurement) {
        measurement.fitted_brightness = self.fitted;
        measurement.fit_sigma = Some(self.sigma);
        measurement.retrieved_water_column = Some(self.water_column);
    }
}

impl<A: AtmosphereModel> SkyState<A> {
    fn require_radiometer(&self) -> Result<&WaterVaporRadiometer, SkyError> {
        self.radiometer()
            .ok_or(SkyError::InvalidInput("no water vapor radiometer configured"))
    }

    pub(crate) fn check_wvr_measurement(
        &self,
        radiometer: &WaterVaporRadiometer,
        measurement: &WvrMeasurement,
    ) -> Result<(), SkyError> {
        if measurement.measured_brightness.len() != radiometer.num_channels() {
            return Err(SkyError::InvalidInput(
                "measurement does not have one brightness per radiometer channel",
            ));
        }
        if !(measurement.elevation > 0.0 && measurement.elevation <= 90.0) {
            return Err(SkyError::InvalidInput("elevation must be in (0, 90] degrees"));
        }
        Ok(())
    }

    /// Fit one measurement, with the radiometer sky coupling adjusted by
    /// `scale`. Input errors are returned, running out of iterations is part
    /// of the solution.
    pub(crate) fn solve_wvr(
        &self,
        radiometer: &WaterVaporRadiometer,
        scale: CouplingScale,
        measurement: &WvrMeasurement,
    ) -> Result<WvrSolution, SkyError> {
        self.check_wvr_measurement(radiometer, measurement)?;
        let problem = WvrFit {
            rtm: self.rtm(),
            beams: (0..radiometer.num_channels())
                .map(|channel| radiometer.beam(channel, scale.factor(channel)))
                .collect(),
            radiometer,
            air_mass: measurement.air_mass(),
            measured: &measurement.measured_brightness,
        };

        let ground = self.ground_water_column();
        match fit(&problem, self.user_water_ratio(), self.fit_settings()) {
            Ok(outcome) => Ok(WvrSolution {
                water_column: Ok(outcome.parameter * ground),
                water_column_error: outcome.parameter_error * ground,
                sigma: outcome.sigma,
                fitted: ChannelValues::from_vec(outcome.fitted),
                iterations: outcome.iterations,
            }),
            Err(e @ SkyError::NotConverged { iterations, parameter, sigma }) => {
                let mut fitted = vec![0.0; radiometer.num_channels()];
                problem.model(parameter, &mut fitted)?;
                Ok(WvrSolution {
                    water_column: Err(e),
                    water_column_error: f64::NAN,
                    sigma,
                    fitted: ChannelValues::from_vec(fitted),
                    iterations,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Retrieve the water vapor column from one radiometer measurement, with
    /// the attached radiometer.
    ///
    /// The fit starts from the user water vapor column, and the retrieved
    /// column is relative to the ground column.
    pub fn water_vapor_from_wvr(
        &self,
        measurement: &WvrMeasurement,
    ) -> Result<Retrieval, SkyError> {
        let radiometer = self.require_radiometer()?;
        let solution = self.solve_wvr(radiometer, CouplingScale::All(1.0), measurement)?;
        let water_column = solution.water_column?;
        debug!(
            "water vapor from radiometer at {:.1} deg elevation: {water_column:.4} mm",
            measurement.elevation
        );
        Ok(Retrieval {
            water_column,
            water_column_error: solution.water_column_error,
            sigma: solution.sigma,
            fitted: solution.fitted.into_vec(),
            iterations: solution.iterations,
        })
    }

    /// Retrieve one measurement in place.
    ///
    /// Invalid input is returned and leaves the measurement untouched. A fit
    /// that runs out of iterations is recorded in the measurement, with the
    /// fitted brightness and sigma of its last step.
    pub fn retrieve_wvr(&self, measurement: &mut WvrMeasurement) -> Result<(), SkyError> {
        let radiometer = self.require_radiometer()?;
        self.solve_wvr(radiometer, CouplingScale::All(1.0), measurement)?
            .record(measurement);
        Ok(())
    }

    /// Retrieve the measurements in `range` in place, leaving the others
    /// untouched.
    ///
    /// Every measurement of the range is checked before any is fitted. The
    /// fits are independent and run in parallel.
    pub fn retrieve_wvr_batch(
        &self,
        measurements: &mut [WvrMeasurement],
        range: Range<usize>,
    ) -> Result<(), SkyError>
    where
        A: Sync,
    {
        self.retrieve_wvr_scaled(measurements, range, CouplingScale::All(1.0))
    }

    pub(crate) fn retrieve_wvr_scaled(
        &self,
        measurements: &mut [WvrMeasurement],
        range: Range<usize>,
        scale: CouplingScale,
    ) -> Result<(), SkyError>
    where
        A: Sync,
    {
        let radiometer = self.require_radiometer()?;
        check_range(&range, measurements.len())?;
        let batch = &mut measurements[range];
        batch
            .iter()
            .try_for_each(|m| self.check_wvr_measurement(radiometer, m))?;

        let solutions = batch
            .par_iter()
            .map(|m| self.solve_wvr(radiometer, scale, m))
            .collect::<Result<Vec<_>, SkyError>>()?;
        let converged = solutions.iter().filter(|s| s.water_column.is_ok()).count();
        for (measurement, solution) in batch.iter_mut().zip(solutions) {
            solution.record(measurement);
        }
        debug!(
            "retrieved {} radiometer measurements, {converged} converged",
            batch.len()
        );
        Ok(())
    }
}

/// RMS of the fit sigmas (K) of the measurements in `range`.
///
/// Every measurement of the range must have been retrieved. The range must
/// not be empty; `n..n + 1` gives the sigma of measurement `n`.
pub fn wvr_average_sigma(
    measurements: &[WvrMeasurement],
    range: Range<usize>,
) -> Result<f64, SkyError> {
    check_range(&range, measurements.len())?;
    let sigmas = measurements[range]
        .iter()
        .map(|m| {
            m.fit_sigma
                .ok_or(SkyError::InvalidInput("measurement has not been retrieved"))
        })
        .collect::<Result<Vec<f64>, SkyError>>()?;
    Ok(rms(sigmas.into_iter()))
}

/// RMS of measured minus fitted brightness (K) of one radiometer channel over
/// the measurements in `range`.
pub fn wvr_channel_sigma(
    measurements: &[WvrMeasurement],
    channel: usize,
    range: Range<usize>,
) -> Result<f64, SkyError> {
    check_range(&range, measurements.len())?;
    let residuals = measurements[range]
        .iter()
        .map(|m| {
            match (
                m.measured_brightness.get(channel),
                m.fitted_brightness.get(channel),
            ) {
                (Some(measured), Some(fitted)) => Ok(measured - fitted),
                (None, _) => Err(SkyError::InvalidInput("no such radiometer channel")),
                (_, None) => Err(SkyError::InvalidInput("measurement has not been retrieved")),
            }
        })
        .collect::<Result<Vec<f64>, SkyError>>()?;
    Ok(rms(residuals.into_iter()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sky::Conditions;
    use crate::testing::{radiometer, synthetic_atmosphere, WVR_WINDOWS};
    use approx::assert_relative_eq;

    /// Brightness the test radiometer would see.
    fn observe(
        sky: &SkyState<impl AtmosphereModel>,
        water_column: f64,
        elevation: f64,
    ) -> WvrMeasurement {
        let probe = WvrMeasurement::new(elevation, &[]);
        let conditions = Conditions::default()
            .with_water_column(water_column)
            .with_air_mass(probe.air_mass())
            .with_beam(0.97, 275.);
        let measured: Vec<f64> = WVR_WINDOWS
            .iter()
            .map(|&spw| sky.average_tebb_sky(spw, &conditions).unwrap())
            .collect();
        WvrMeasurement::new(elevation, &measured)
    }

    fn session() -> SkyState<crate::atmosphere::LayeredAtmosphere> {
        SkyState::new(synthetic_atmosphere())
            .with_radiometer(radiometer())
            .unwrap()
    }

    #[test]
    fn needs_a_radiometer() {
        let sky = SkyState::new(synthetic_atmosphere());
        let m = observe(&sky, 1.0, 60.);
        assert!(matches!(
            sky.water_vapor_from_wvr(&m),
            Err(SkyError::InvalidInput(_))
        ));
    }

    #[test]
    fn single_measurement() {
        let sky = session();
        let m = observe(&sky, 1.8, 45.);
        let retrieval = sky.water_vapor_from_wvr(&m).unwrap();
        assert_relative_eq!(retrieval.water_column, 1.8, max_relative = 1e-2);
        assert_eq!(retrieval.fitted.len(), 4);
        assert!(retrieval.sigma < 0.1);

        let exact = observe(&sky, 1.0, 45.);
        let retrieval = sky.water_vapor_from_wvr(&exact).unwrap();
        assert_eq!(retrieval.iterations, 1);
        assert_eq!(retrieval.water_column, 1.0);
        assert_eq!(retrieval.sigma, 0.0);
    }

    #[test]
    fn bad_measurements() {
        let sky = session();
        let mut short = WvrMeasurement::new(45., &[100., 120.]);
        assert!(sky.retrieve_wvr(&mut short).is_err());
        assert!(!short.is_retrieved());

        let mut m = observe(&sky, 1.0, 45.);
        m.elevation = 0.0;
        assert!(sky.water_vapor_from_wvr(&m).is_err());
        m.elevation = 95.0;
        assert!(sky.water_vapor_from_wvr(&m).is_err());
    }

    #[test]
    fn retrieve_in_place() {
        let sky = session();
        let mut m = observe(&sky, 0.6, 70.);
        sky.retrieve_wvr(&mut m).unwrap();
        let column = m.retrieved_water_column.clone().unwrap().unwrap();
        assert_relative_eq!(column, 0.6, max_relative = 1e-2);
        assert_eq!(m.fitted_brightness.len(), 4);
        assert!(m.fit_sigma.unwrap() < 0.1);
        // Retrieving does not change the session
        assert_eq!(sky.user_water_column(), 1.0);
    }

    #[test]
    fn batch_only_touches_range() {
        let sky = session();
        let mut batch: Vec<WvrMeasurement> = [1.0, 1.2, 1.4, 1.6, 1.8, 2.0]
            .iter()
            .zip([30., 40., 50., 60., 70., 80.])
            .map(|(&w, e)| observe(&sky, w, e))
            .collect();
        sky.retrieve_wvr_batch(&mut batch, 1..4).unwrap();

        assert!(!batch[0].is_retrieved());
        assert!(batch[1..4].iter().all(WvrMeasurement::is_retrieved));
        assert!(!batch[4].is_retrieved() && !batch[5].is_retrieved());
        let column = batch[2].retrieved_water_column.clone().unwrap().unwrap();
        assert_relative_eq!(column, 1.4, max_relative = 1e-2);

        assert!(sky.retrieve_wvr_batch(&mut batch, 4..9).is_err());
        assert!(sky.retrieve_wvr_batch(&mut batch, 3..3).is_err());
        assert!(!batch[4].is_retrieved());
    }

    #[test]
    fn sigma_diagnostics() {
        let sky = session();
        let mut batch: Vec<WvrMeasurement> = (0..4)
            .map(|i| observe(&sky, 1.0, 30. + 10. * i as f64))
            .collect();
        assert!(wvr_average_sigma(&batch, 0..2).is_err());
        assert!(wvr_channel_sigma(&batch, 0, 0..2).is_err());

        sky.retrieve_wvr_batch(&mut batch, 0..4).unwrap();
        batch[0].fit_sigma = Some(3.0);
        batch[1].fit_sigma = Some(4.0);
        assert_relative_eq!(wvr_average_sigma(&batch, 0..2).unwrap(), (12.5f64).sqrt());
        assert_eq!(wvr_average_sigma(&batch, 1..2).unwrap(), 4.0);
        assert!(wvr_average_sigma(&batch, 2..2).is_err());

        batch[3].fitted_brightness[1] += 2.0;
        assert_relative_eq!(
            wvr_channel_sigma(&batch, 1, 3..4).unwrap(),
            2.0,
            max_relative = 1e-9
        );
        assert_eq!(wvr_channel_sigma(&batch, 1, 2..3).unwrap(), 0.0);
        assert!(wvr_channel_sigma(&batch, 4, 0..4).is_err());
    }
}
