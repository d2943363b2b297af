//! Water vapor radiometer configuration and measurements

use smallvec::SmallVec;

use crate::error::SkyError;
use crate::rtm::Beam;

/// Per-channel values of a radiometer. Real instruments have a handful of
/// channels, so they stay inline.
pub type ChannelValues = SmallVec<[f64; 8]>;

/// A multi-channel water vapor radiometer.
///
/// Each radiometer channel is a spectral window of the atmosphere model, seen
/// through its own sky coupling and signal sideband gain. All channels share
/// one spillover temperature.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WaterVaporRadiometer {
    spectral_windows: SmallVec<[usize; 8]>,
    sky_coupling: ChannelValues,
    signal_gain: ChannelValues,
    spillover_temperature: f64,
}

impl WaterVaporRadiometer {
    /// Configure the radiometer.
    ///
    /// `spectral_windows`, `sky_coupling` and `signal_gain` (a fraction in
    /// [0, 1]) have one entry per channel. The sky coupling is nominally in
    /// [0, 1] but is not checked, since calibration may push it slightly out.
    /// The spillover temperature is in K, in [0, 350].
    pub fn new(
        spectral_windows: &[usize],
        sky_coupling: &[f64],
        signal_gain: &[f64],
        spillover_temperature: f64,
    ) -> Result<Self, SkyError> {
        if spectral_windows.is_empty() {
            return Err(SkyError::InvalidInput("radiometer needs at least one channel"));
        }
        let num_channels = spectral_windows.len();
        if sky_coupling.len() != num_channels || signal_gain.len() != num_channels {
            return Err(SkyError::InvalidInput(
                "radiometer channel, coupling and gain lengths differ",
            ));
        }
        if signal_gain.iter().any(|g| !(0.0..=1.0).contains(g)) {
            return Err(SkyError::InvalidInput("signal gain must be in [0, 1]"));
        }
        if !(0.0..=350.0).contains(&spillover_temperature) {
            return Err(SkyError::InvalidInput(
                "spillover temperature must be in [0, 350] K",
            ));
        }

        Ok(Self {
            spectral_windows: SmallVec::from_slice(spectral_windows),
            sky_coupling: SmallVec::from_slice(sky_coupling),
            signal_gain: SmallVec::from_slice(signal_gain),
            spillover_temperature,
        })
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.spectral_windows.len()
    }

    /// Spectral window observed by each channel.
    pub fn spectral_windows(&self) -> &[usize] {
        &self.spectral_windows
    }

    /// Sky coupling of each channel.
    pub fn sky_coupling(&self) -> &[f64] {
        &self.sky_coupling
    }

    /// Signal sideband gain of each channel.
    pub fn signal_gain(&self) -> &[f64] {
        &self.signal_gain
    }

    /// Spillover temperature in K.
    pub fn spillover_temperature(&self) -> f64 {
        self.spillover_temperature
    }

    /// Beam of one channel, with the sky coupling scaled by `coupling_factor`.
    pub(crate) fn beam(&self, channel: usize, coupling_factor: f64) -> Beam {
        Beam {
            sky_coupling: self.sky_coupling[channel] * coupling_factor,
            spillover_temperature: self.spillover_temperature,
        }
    }

    /// Largest sky coupling over all channels.
    pub(crate) fn max_sky_coupling(&self) -> f64 {
        self.sky_coupling.iter().copied().fold(0.0, f64::max)
    }

    /// Scale the sky coupling of every channel.
    pub fn multiply_sky_coupling(&mut self, factor: f64) {
        self.sky_coupling.iter_mut().for_each(|c| *c *= factor);
    }

    /// Scale the sky coupling of one channel.
    pub fn multiply_channel_sky_coupling(
        &mut self,
        channel: usize,
        factor: f64,
    ) -> Result<(), SkyError> {
        let coupling = self
            .sky_coupling
            .get_mut(channel)
            .ok_or(SkyError::InvalidInput("no such radiometer channel"))?;
        *coupling *= factor;
        Ok(())
    }
}

/// One radiometer observation, and what the retrieval made of it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WvrMeasurement {
    /// Elevation of the line of sight in degrees
    pub elevation: f64,
    /// Measured sky brightness temperature of each channel in K
    pub measured_brightness: ChannelValues,
    /// Modelled brightness temperature of each channel in K at the retrieved
    /// water vapor column. Empty until retrieved.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fitted_brightness: ChannelValues,
    /// Retrieved zenith water vapor column in mm, or why the retrieval failed.
    /// `None` until retrieved.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub retrieved_water_column: Option<Result<f64, SkyError>>,
    /// RMS of measured minus fitted brightness in K, also set when the fit ran
    /// out of iterations.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fit_sigma: Option<f64>,
}

impl WvrMeasurement {
    /// A measurement at `elevation` degrees that has not been retrieved yet.
    pub fn new(elevation: f64, measured_brightness: &[f64]) -> Self {
        Self {
            elevation,
            measured_brightness: SmallVec::from_slice(measured_brightness),
            fitted_brightness: SmallVec::new(),
            retrieved_water_column: None,
            fit_sigma: None,
        }
    }

    /// Air mass of the line of sight, `1 / sin(elevation)`.
    pub fn air_mass(&self) -> f64 {
        1.0 / self.elevation.to_radians().sin()
    }

    /// Whether a retrieval has been attempted.
    pub fn is_retrieved(&self) -> bool {
        self.retrieved_water_column.is_some()
    }
}
