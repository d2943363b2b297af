//! Retrieval from sky brightness temperatures

use log::debug;

use super::{rms, Retrieval};
use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::fit::{fit, FitProblem, FitSettings};
use crate::rtm::{Beam, RadiativeTransfer, TemperatureScale};
use crate::sky::{check_observation, check_sky_coupling, Conditions, SkyState};

/// How a set of spectral windows was observed.
///
/// The vectors are parallel, one entry per spectral window.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TebbRetrieval {
    /// Spectral windows the measurements belong to
    pub spectral_windows: Vec<usize>,
    /// Sky coupling of each spectral window
    pub sky_coupling: Vec<f64>,
    /// Spillover temperature in K of each spectral window
    pub spillover_temperature: Vec<f64>,
    /// Signal sideband gain of each spectral window, 1 if not given
    #[cfg_attr(feature = "serde", serde(default))]
    pub signal_gain: Option<Vec<f64>>,
    /// Channel weights of each spectral window, all 1 if not given
    #[cfg_attr(feature = "serde", serde(default))]
    pub filters: Option<Vec<Vec<f64>>>,
    /// Air mass of the observation, the session air mass if not given
    #[cfg_attr(feature = "serde", serde(default))]
    pub air_mass: Option<f64>,
}

impl TebbRetrieval {
    /// One spectral window seen with the given sky coupling and spillover
    /// temperature (K).
    pub fn single(spectral_window: usize, sky_coupling: f64, spillover_temperature: f64) -> Self {
        Self {
            spectral_windows: vec![spectral_window],
            sky_coupling: vec![sky_coupling],
            spillover_temperature: vec![spillover_temperature],
            ..Default::default()
        }
    }

    /// Add another spectral window.
    pub fn and(
        mut self,
        spectral_window: usize,
        sky_coupling: f64,
        spillover_temperature: f64,
    ) -> Self {
        self.spectral_windows.push(spectral_window);
        self.sky_coupling.push(sky_coupling);
        self.spillover_temperature.push(spillover_temperature);
        self
    }

    /// Set the signal sideband gain of each spectral window.
    pub fn with_signal_gain(self, signal_gain: Vec<f64>) -> Self {
        Self {
            signal_gain: Some(signal_gain),
            ..self
        }
    }

    /// Set the channel weights of each spectral window.
    pub fn with_filters(self, filters: Vec<Vec<f64>>) -> Self {
        Self {
            filters: Some(filters),
            ..self
        }
    }

    /// Set the air mass.
    pub fn with_air_mass(self, air_mass: f64) -> Self {
        Self {
            air_mass: Some(air_mass),
            ..self
        }
    }

    fn len(&self) -> usize {
        self.spectral_windows.len()
    }

    fn signal_gain(&self, window: usize) -> f64 {
        self.signal_gain.as_ref().map_or(1.0, |g| g[window])
    }

    fn filter(&self, window: usize) -> Option<&[f64]> {
        self.filters.as_ref().map(|f| f[window].as_slice())
    }

    fn beam(&self, window: usize, coupling_factor: f64) -> Beam {
        Beam {
            sky_coupling: self.sky_coupling[window] * coupling_factor,
            spillover_temperature: self.spillover_temperature[window],
        }
    }

    /// Weight of every channel of a window, or `None` for the channels that
    /// are left out.
    ///
    /// Each weight is normalized so that the weights of the window average to
    /// one over the channels used.
    fn channel_weights(&self, window: usize, num_channels: usize) -> Vec<Option<f64>> {
        let raw = |channel: usize| self.filter(window).map_or(1.0, |f| f[channel]);
        let (norm, used) = (0..num_channels)
            .map(raw)
            .filter(|&w| w > 0.0)
            .fold((0.0, 0usize), |(norm, used), w| (norm + w, used + 1));
        (0..num_channels)
            .map(|channel| {
                let w = raw(channel);
                (w > 0.0).then(|| w * used as f64 / norm)
            })
            .collect()
    }
}

/// One band averaged brightness temperature per spectral window.
struct AverageFit<'a, A: ?Sized> {
    rtm: RadiativeTransfer<'a, A>,
    request: &'a TebbRetrieval,
    air_mass: f64,
    measured: &'a [f64],
}

impl<A: AtmosphereModel + ?Sized> FitProblem for AverageFit<'_, A> {
    fn measured(&self) -> &[f64] {
        self.measured
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        for (window, o) in out.iter_mut().enumerate() {
            *o = self.rtm.band_brightness(
                TemperatureScale::Tebb,
                parameter,
                self.request.beam(window, 1.0),
                self.air_mass,
                self.request.spectral_windows[window],
                self.request.filter(window),
                self.request.signal_gain(window),
            )?;
        }
        Ok(())
    }
}

/// Weighted per-channel brightness temperatures of every spectral window.
struct SpectraFit<'a, A: ?Sized> {
    rtm: RadiativeTransfer<'a, A>,
    request: &'a TebbRetrieval,
    air_mass: f64,
    /// (window, channel, weight) of each fitted value
    channels: Vec<(usize, usize, f64)>,
    /// Weighted measurements
    measured: Vec<f64>,
}

impl<'a, A: AtmosphereModel + ?Sized> SpectraFit<'a, A> {
    fn new(
        rtm: RadiativeTransfer<'a, A>,
        request: &'a TebbRetrieval,
        air_mass: f64,
        spectra: &[Vec<f64>],
    ) -> Self {
        let mut channels = Vec::new();
        let mut measured = Vec::new();
        for (window, spectrum) in spectra.iter().enumerate() {
            let weights = request.channel_weights(window, spectrum.len());
            for (channel, weight) in weights.into_iter().enumerate() {
                if let Some(weight) = weight {
                    channels.push((window, channel, weight));
                    measured.push(spectrum[channel] * weight);
                }
            }
        }
        Self {
            rtm,
            request,
            air_mass,
            channels,
            measured,
        }
    }

    /// Weighted model brightness with the sky coupling of every window
    /// multiplied by `coupling_factor`.
    fn brightness(
        &self,
        water_ratio: f64,
        coupling_factor: f64,
        out: &mut [f64],
    ) -> Result<(), SkyError> {
        for (o, &(window, channel, weight)) in out.iter_mut().zip(&self.channels) {
            let t = self.rtm.sideband_brightness(
                TemperatureScale::Tebb,
                water_ratio,
                self.request.beam(window, coupling_factor),
                self.air_mass,
                self.request.spectral_windows[window],
                channel,
                self.request.signal_gain(window),
            )?;
            *o = t * weight;
        }
        Ok(())
    }

    /// The sum of squares is divided by the number of spectral windows less
    /// one, not by the number of channels.
    fn window_divisor(&self) -> f64 {
        let n = self.request.len();
        if n > 1 {
            (n - 1) as f64
        } else {
            1.0
        }
    }
}

impl<A: AtmosphereModel + ?Sized> FitProblem for SpectraFit<'_, A> {
    fn measured(&self) -> &[f64] {
        &self.measured
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        self.brightness(parameter, 1.0, out)
    }

    fn chi_square_divisor(&self) -> f64 {
        self.window_divisor()
    }
}

/// Water vapor fit of borrowed spectra at a scaled sky coupling.
struct ScaledSpectraFit<'s, 'a, A: ?Sized> {
    spectra: &'s SpectraFit<'a, A>,
    coupling_factor: f64,
}

impl<A: AtmosphereModel + ?Sized> FitProblem for ScaledSpectraFit<'_, '_, A> {
    fn measured(&self) -> &[f64] {
        &self.spectra.measured
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        self.spectra.brightness(parameter, self.coupling_factor, out)
    }

    fn chi_square_divisor(&self) -> f64 {
        self.spectra.window_divisor()
    }
}

/// Fit one multiplier of the sky coupling so the water vapor fit of the
/// spectra is as good as possible.
struct CouplingFit<'a, A: ?Sized> {
    spectra: SpectraFit<'a, A>,
    initial: f64,
    settings: &'a FitSettings,
}

impl<A: AtmosphereModel + ?Sized> FitProblem for CouplingFit<'_, A> {
    fn measured(&self) -> &[f64] {
        &[0.0]
    }

    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
        let inner = ScaledSpectraFit {
            spectra: &self.spectra,
            coupling_factor: parameter,
        };
        out[0] = match fit(&inner, self.initial, self.settings) {
            Ok(outcome) => outcome.sigma,
            Err(SkyError::NotConverged { sigma, .. }) => sigma,
            Err(e) => return Err(e),
        };
        Ok(())
    }
}

/// Result of fitting the sky coupling of a spectral window.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CouplingRetrieval {
    /// Fitted sky coupling
    pub sky_coupling: f64,
    /// Water vapor fit sigma in K at the fitted sky coupling
    pub sigma: f64,
    /// Number of fitter iterations
    pub iterations: usize,
}

impl<A: AtmosphereModel> SkyState<A> {
    /// Check a brightness temperature request before doing any radiative
    /// transfer, and return the air mass to use.
    fn check_tebb_request(
        &self,
        request: &TebbRetrieval,
        num_measurements: usize,
    ) -> Result<f64, SkyError> {
        let n = request.len();
        if n == 0 {
            return Err(SkyError::InvalidInput("no spectral window to fit"));
        }
        let parallel = [
            request.sky_coupling.len(),
            request.spillover_temperature.len(),
            request.signal_gain.as_ref().map_or(n, Vec::len),
            request.filters.as_ref().map_or(n, Vec::len),
            num_measurements,
        ];
        if parallel.iter().any(|&len| len != n) {
            return Err(SkyError::InvalidInput(
                "spectral window, measurement, coupling, spillover, gain and filter lengths differ",
            ));
        }

        let air_mass = request.air_mass.unwrap_or(self.air_mass());
        for window in 0..n {
            check_observation(
                self.user_water_column(),
                air_mass,
                request.spillover_temperature[window],
            )?;
            let signal_gain = request.signal_gain(window);
            if !(0.0..=1.0).contains(&signal_gain) {
                return Err(SkyError::InvalidInput("signal gain must be in [0, 1]"));
            }

            let spectral_window = request.spectral_windows[window];
            if !self.atmosphere().is_valid_channel(spectral_window, 0) {
                return Err(SkyError::InvalidChannel {
                    spectral_window,
                    channel: 0,
                });
            }
            if signal_gain < 1.0 && self.atmosphere().image_sideband(spectral_window).is_none() {
                return Err(SkyError::InvalidInput(
                    "signal gain below 100% needs an image sideband window",
                ));
            }
            let num_channels = self.atmosphere().num_channels(spectral_window);
            if request.filter(window).is_some_and(|f| f.len() != num_channels) {
                return Err(SkyError::InvalidInput(
                    "channel filter length does not match the spectral window",
                ));
            }
        }
        Ok(air_mass)
    }

    fn check_spectra(
        &self,
        request: &TebbRetrieval,
        spectra: &[Vec<f64>],
    ) -> Result<f64, SkyError> {
        let air_mass = self.check_tebb_request(request, spectra.len())?;
        let atm = self.atmosphere();
        if spectra
            .iter()
            .zip(&request.spectral_windows)
            .any(|(s, &spw)| s.len() != atm.num_channels(spw))
        {
            return Err(SkyError::InvalidInput(
                "brightness spectrum length does not match the spectral window",
            ));
        }
        Ok(air_mass)
    }

    /// Retrieve the water vapor column from the band averaged brightness
    /// temperature (K) of each spectral window of `request`.
    ///
    /// The sky coupling is not range checked here. The fit starts from the
    /// user water vapor column and converges ten times more tightly than the
    /// per-channel retrievals.
    pub fn water_vapor_from_average_tebb(
        &self,
        request: &TebbRetrieval,
        measured: &[f64],
    ) -> Result<Retrieval, SkyError> {
        let air_mass = self.check_tebb_request(request, measured.len())?;
        let problem = AverageFit {
            rtm: self.rtm(),
            request,
            air_mass,
            measured,
        };
        let settings = self
            .fit_settings()
            .with_tolerance(self.fit_settings().tolerance / 10.0);
        let outcome = fit(&problem, self.user_water_ratio(), &settings)?;

        let ground = self.ground_water_column();
        let retrieval = Retrieval {
            water_column: outcome.parameter * ground,
            water_column_error: outcome.parameter_error * ground,
            sigma: outcome.sigma,
            fitted: outcome.fitted,
            iterations: outcome.iterations,
        };
        debug!(
            "water vapor from average brightness of {} spectral windows: {:.4} mm, sigma {:.4} K",
            request.len(),
            retrieval.water_column,
            retrieval.sigma
        );
        Ok(retrieval)
    }

    /// Retrieve the water vapor column from the brightness temperature (K) of
    /// every channel of each spectral window of `request`.
    ///
    /// Channels with a non-positive filter weight are left out. The fitted
    /// values are the modelled brightness temperatures of the channels used,
    /// window after window.
    pub fn water_vapor_from_tebb_spectra(
        &self,
        request: &TebbRetrieval,
        spectra: &[Vec<f64>],
    ) -> Result<Retrieval, SkyError> {
        let air_mass = self.check_spectra(request, spectra)?;
        let problem = SpectraFit::new(self.rtm(), request, air_mass, spectra);
        let outcome = fit(&problem, self.user_water_ratio(), self.fit_settings())?;

        let ground = self.ground_water_column();
        let fitted = outcome
            .fitted
            .iter()
            .zip(&problem.channels)
            .map(|(f, &(_, _, weight))| f / weight)
            .collect();
        let retrieval = Retrieval {
            water_column: outcome.parameter * ground,
            water_column_error: outcome.parameter_error * ground,
            sigma: outcome.sigma,
            fitted,
            iterations: outcome.iterations,
        };
        debug!(
            "water vapor from brightness spectra of {} spectral windows: {:.4} mm, sigma {:.4} K",
            request.len(),
            retrieval.water_column,
            retrieval.sigma
        );
        Ok(retrieval)
    }

    /// Fit the sky coupling of a single spectral window from its brightness
    /// spectrum, with the water vapor column as a free parameter of the inner
    /// fit.
    ///
    /// The multiplier of the coupling in `request` starts at 1. When the inner
    /// water vapor fit runs out of iterations its last sigma is used.
    pub fn sky_coupling_from_tebb(
        &self,
        request: &TebbRetrieval,
        spectrum: &[f64],
    ) -> Result<CouplingRetrieval, SkyError> {
        if request.len() != 1 {
            return Err(SkyError::InvalidInput(
                "sky coupling is fitted for one spectral window at a time",
            ));
        }
        let spectra = [spectrum.to_vec()];
        let air_mass = self.check_spectra(request, &spectra)?;
        let problem = CouplingFit {
            spectra: SpectraFit::new(self.rtm(), request, air_mass, &spectra),
            initial: self.user_water_ratio(),
            settings: self.fit_settings(),
        };
        let outcome = fit(&problem, 1.0, self.fit_settings())?;
        let sky_coupling = outcome.parameter * request.sky_coupling[0];
        debug!(
            "sky coupling of spectral window {}: {sky_coupling:.4}",
            request.spectral_windows[0]
        );
        Ok(CouplingRetrieval {
            sky_coupling,
            sigma: outcome.sigma,
            iterations: outcome.iterations,
        })
    }

    /// RMS difference in K between a measured brightness spectrum and the
    /// model under `conditions`, for instance at a retrieved water vapor
    /// column.
    ///
    /// Only channels with a positive measurement count. The sky coupling must
    /// be in [0, 1].
    pub fn sigma_fit(
        &self,
        spectral_window: usize,
        spectrum: &[f64],
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        if !self.atmosphere().is_valid_channel(spectral_window, 0) {
            return Err(SkyError::InvalidChannel {
                spectral_window,
                channel: 0,
            });
        }
        if spectrum.len() != self.atmosphere().num_channels(spectral_window) {
            return Err(SkyError::InvalidInput(
                "brightness spectrum length does not match the spectral window",
            ));
        }
        let resolved = self.resolve(conditions)?;
        check_sky_coupling(resolved.beam.sky_coupling)?;
        if !spectrum.iter().any(|&t| t > 0.0) {
            return Err(SkyError::InvalidInput("no positive brightness temperature"));
        }

        let residuals = spectrum
            .iter()
            .enumerate()
            .filter(|(_, &t)| t > 0.0)
            .map(|(channel, &t)| -> Result<f64, SkyError> {
                Ok(t - self.tebb_sky(spectral_window, channel, conditions)?)
            })
            .collect::<Result<Vec<f64>, SkyError>>()?;
        Ok(rms(residuals.into_iter()))
    }
}
