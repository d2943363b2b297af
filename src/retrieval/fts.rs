//! Retrieval from zenith transmission spectra

use log::debug;

use super::{rms, Retrieval};
use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::fit::{fit, FitProblem};
use crate::rtm::Absorber;
use crate::sky::SkyState;

/// A measured zenith transmission spectrum of one spectral window.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FtsRetrieval {
    /// Spectral window the spectrum was measured in
    pub spectral_window: usize,
    /// Transmission of each channel of the window
    pub transmission: Vec<f64>,
    /// Only fit the channels within these frequencies (GHz, inclusive)
    pub band: Option<(f64, f64)>,
}

impl FtsRetrieval {
    /// Fit the whole spectrum.
    pub fn new(spectral_window: usize, transmission: Vec<f64>) -> Self {
        Self {
            spectral_window,
            transmission,
            band: None,
        }
    }

    /// Only fit the channels between `low` and `high` GHz.
    pub fn with_band(self, low: f64, high: f64) -> Self {
        Self {
            band: Some((low, high)),
            ..self
        }
    }
}

/// `exp(-(dry + p wet))` for the channels in the band.
struct TransmissionFit {
    measured: Vec<f64>,
    dry: Vec<f64>,
    wet: Vec<f64>,
}

impl FitProblem for TransmissionFit {
    fn measured(&self) -> &[f64] {
        &self.measured
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        for ((o, dry), wet) in out.iter_mut().zip(&self.dry).zip(&self.wet) {
            *o = f64::exp(-(dry + parameter * wet));
        }
        Ok(())
    }
}

impl<A: AtmosphereModel> SkyState<A> {
    /// Channels of a transmission spectrum to use, after checking the spectrum
    /// covers the whole window and the band is the right way round.
    fn fts_channels(
        &self,
        spectral_window: usize,
        transmission: &[f64],
        band: Option<(f64, f64)>,
    ) -> Result<Vec<usize>, SkyError> {
        if let Some((low, high)) = band {
            if low > high {
                return Err(SkyError::InvalidInput(
                    "band lower frequency above the upper one",
                ));
            }
        }
        let atm = self.atmosphere();
        if !atm.is_valid_channel(spectral_window, 0) {
            return Err(SkyError::InvalidChannel {
                spectral_window,
                channel: 0,
            });
        }
        let num_channels = atm.num_channels(spectral_window);
        if transmission.len() != num_channels {
            return Err(SkyError::InvalidInput(
                "transmission spectrum length does not match the spectral window",
            ));
        }

        let channels: Vec<usize> = (0..num_channels)
            .filter(|&channel| {
                band.map_or(true, |(low, high)| {
                    let freq = atm.channel_frequency(spectral_window, channel);
                    freq >= low && freq <= high
                })
            })
            .collect();
        if channels.is_empty() {
            return Err(SkyError::InvalidInput("no channel within the band"));
        }
        Ok(channels)
    }

    /// Retrieve the water vapor column from a zenith transmission spectrum.
    ///
    /// The wet opacity is scaled from the current user water vapor column, so
    /// the retrieved column is relative to it rather than to the ground
    /// column.
    pub fn water_vapor_from_fts(&self, request: &FtsRetrieval) -> Result<Retrieval, SkyError> {
        let spw = request.spectral_window;
        let channels = self.fts_channels(spw, &request.transmission, request.band)?;

        let rtm = self.rtm();
        let ratio = self.user_water_ratio();
        let mut problem = TransmissionFit {
            measured: Vec::with_capacity(channels.len()),
            dry: Vec::with_capacity(channels.len()),
            wet: Vec::with_capacity(channels.len()),
        };
        for &channel in &channels {
            problem.measured.push(request.transmission[channel]);
            problem.dry.push(rtm.opacity(Absorber::Dry, spw, channel, ratio)?);
            problem.wet.push(rtm.opacity(Absorber::Wet, spw, channel, ratio)?);
        }

        let outcome = fit(&problem, 1.0, self.fit_settings())?;
        let user = self.user_water_column();
        let retrieval = Retrieval {
            water_column: outcome.parameter * user,
            water_column_error: outcome.parameter_error * user,
            sigma: outcome.sigma,
            fitted: outcome.fitted,
            iterations: outcome.iterations,
        };
        debug!(
            "water vapor from transmission in spectral window {spw}: {:.4} mm over {} channels",
            retrieval.water_column,
            channels.len()
        );
        Ok(retrieval)
    }

    /// RMS difference between a measured transmission spectrum and the model
    /// at the user water vapor column, along a path of `air_mass`.
    pub fn sigma_transmission_fit(
        &self,
        spectral_window: usize,
        transmission: &[f64],
        air_mass: f64,
        band: Option<(f64, f64)>,
    ) -> Result<f64, SkyError> {
        if !(air_mass >= 1.0) {
            return Err(SkyError::InvalidInput("air mass must be at least 1"));
        }
        let channels = self.fts_channels(spectral_window, transmission, band)?;
        let rtm = self.rtm();
        let ratio = self.user_water_ratio();

        let residuals = channels
            .iter()
            .map(|&channel| -> Result<f64, SkyError> {
                let tau = rtm.opacity(Absorber::Total, spectral_window, channel, ratio)?;
                Ok(transmission[channel] - f64::exp(-air_mass * tau))
            })
            .collect::<Result<Vec<f64>, SkyError>>()?;
        Ok(rms(residuals.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{synthetic_atmosphere, FTS_WINDOW};
    use approx::assert_relative_eq;

    fn spectrum(
        sky: &SkyState<impl AtmosphereModel>,
        water_column: f64,
        air_mass: f64,
    ) -> Vec<f64> {
        let ratio = sky.water_ratio(water_column);
        (0..8)
            .map(|c| {
                let tau = sky.rtm().opacity(Absorber::Total, FTS_WINDOW, c, ratio).unwrap();
                f64::exp(-air_mass * tau)
            })
            .collect()
    }

    #[test]
    fn exact_spectrum_needs_one_iteration() {
        let sky = SkyState::new(synthetic_atmosphere());
        let measured: Vec<f64> = (0..8)
            .map(|c| {
                let dry = sky.opacity(Absorber::Dry, FTS_WINDOW, c).unwrap();
                let wet = sky.opacity(Absorber::Wet, FTS_WINDOW, c).unwrap();
                f64::exp(-(dry + 1.0 * wet))
            })
            .collect();
        let retrieval = sky
            .water_vapor_from_fts(&FtsRetrieval::new(FTS_WINDOW, measured))
            .unwrap();
        assert_eq!(retrieval.iterations, 1);
        assert_eq!(retrieval.water_column, 1.0);
        assert_eq!(retrieval.sigma, 0.0);
    }

    #[test]
    fn relative_to_user_column() {
        let sky = SkyState::new(synthetic_atmosphere()).with_water_column(2.0);
        let measured = spectrum(&sky, 1.5, 1.0);
        let retrieval = sky
            .water_vapor_from_fts(&FtsRetrieval::new(FTS_WINDOW, measured))
            .unwrap();
        assert_relative_eq!(retrieval.water_column, 1.5, max_relative = 2e-2);
        assert!(retrieval.water_column_error >= 0.);
        assert_eq!(retrieval.fitted.len(), 8);
    }

    #[test]
    fn band_selects_channels() {
        let sky = SkyState::new(synthetic_atmosphere());
        let measured = spectrum(&sky, 0.8, 1.0);
        let request = FtsRetrieval::new(FTS_WINDOW, measured).with_band(230., 290.);
        let retrieval = sky.water_vapor_from_fts(&request).unwrap();
        // 240, 260 and 280 GHz
        assert_eq!(retrieval.fitted.len(), 3);
        assert_relative_eq!(retrieval.water_column, 0.8, max_relative = 2e-2);
    }

    #[test]
    fn rejects_bad_requests() {
        let sky = SkyState::new(synthetic_atmosphere());
        let measured = spectrum(&sky, 1.0, 1.0);

        let inverted = FtsRetrieval::new(FTS_WINDOW, measured.clone()).with_band(300., 250.);
        assert!(matches!(
            sky.water_vapor_from_fts(&inverted),
            Err(SkyError::InvalidInput(_))
        ));
        let empty = FtsRetrieval::new(FTS_WINDOW, measured.clone()).with_band(201., 219.);
        assert!(sky.water_vapor_from_fts(&empty).is_err());
        let short = FtsRetrieval::new(FTS_WINDOW, measured[..5].to_vec());
        assert!(sky.water_vapor_from_fts(&short).is_err());
        let missing = FtsRetrieval::new(42, measured);
        assert!(matches!(
            sky.water_vapor_from_fts(&missing),
            Err(SkyError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn transmission_sigma() {
        let sky = SkyState::new(synthetic_atmosphere());
        let measured = spectrum(&sky, 1.0, 1.5);
        assert_eq!(
            sky.sigma_transmission_fit(FTS_WINDOW, &measured, 1.5, None).unwrap(),
            0.0
        );

        let offset: Vec<f64> = measured.iter().map(|t| t + 0.01).collect();
        assert_relative_eq!(
            sky.sigma_transmission_fit(FTS_WINDOW, &offset, 1.5, Some((200., 260.)))
                .unwrap(),
            0.01,
            max_relative = 1e-9
        );
        assert!(sky
            .sigma_transmission_fit(FTS_WINDOW, &measured, 0.5, None)
            .is_err());
        assert!(sky
            .sigma_transmission_fit(FTS_WINDOW, &measured, 1.5, Some((260., 200.)))
            .is_err());
    }
}
