//! The layered atmosphere seen by the sky model.
//!
//! Building the pressure/temperature/humidity profile and computing the
//! absorption coefficients happens elsewhere. This module only describes the
//! already-computed quantities the radiative transfer and the retrievals read:
//! layer geometry, channel frequencies and per-layer complex absorption
//! coefficients, where the imaginary part is the absorption (Np/m) and the
//! real part is the phase (rad/m).

use std::num::NonZeroUsize;

use log::debug;
use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::error::SkyError;

/// Read-only view of a layered atmosphere and its spectral setup.
///
/// Layers are ordered from the ground upward. Absorption coefficients
/// correspond to the ground water vapor column of the profile; the sky model
/// scales the wet part to other columns.
pub trait AtmosphereModel {
    /// Number of layers in the profile.
    fn num_layers(&self) -> usize;

    /// Thickness of `layer` in m.
    fn layer_thickness(&self, layer: usize) -> f64;

    /// Physical temperature of `layer` in K.
    fn layer_temperature(&self, layer: usize) -> f64;

    /// Number of spectral windows.
    fn num_spectral_windows(&self) -> usize;

    /// Number of channels in `spectral_window`, or 0 if it does not exist.
    fn num_channels(&self, spectral_window: usize) -> usize;

    /// Frequency of a channel in GHz.
    fn channel_frequency(&self, spectral_window: usize, channel: usize) -> f64;

    /// Water vapor line absorption coefficient of a layer.
    fn h2o_lines_absorption(&self, spectral_window: usize, channel: usize, layer: usize)
        -> Complex64;

    /// Water vapor continuum absorption coefficient of a layer.
    fn h2o_continuum_absorption(
        &self,
        spectral_window: usize,
        channel: usize,
        layer: usize,
    ) -> Complex64;

    /// Dry (all species other than water vapor) absorption coefficient of a
    /// layer.
    fn dry_absorption(&self, spectral_window: usize, channel: usize, layer: usize) -> Complex64;

    /// Total wet absorption coefficient of a layer.
    fn wet_absorption(&self, spectral_window: usize, channel: usize, layer: usize) -> Complex64 {
        self.h2o_lines_absorption(spectral_window, channel, layer)
            + self.h2o_continuum_absorption(spectral_window, channel, layer)
    }

    /// Zenith water vapor column of the profile in mm.
    fn ground_water_column(&self) -> f64;

    /// Ground pressure in hPa.
    fn ground_pressure(&self) -> f64;

    /// Ground temperature in K.
    fn ground_temperature(&self) -> f64;

    /// Ground relative humidity in percent.
    fn relative_humidity(&self) -> f64;

    /// Altitude of the base of the first layer in m.
    fn altitude(&self) -> f64;

    /// Spectral window of the image sideband associated with
    /// `spectral_window`, if any.
    fn image_sideband(&self, spectral_window: usize) -> Option<usize>;

    /// Whether `channel` exists in `spectral_window`.
    fn is_valid_channel(&self, spectral_window: usize, channel: usize) -> bool {
        spectral_window < self.num_spectral_windows()
            && channel < self.num_channels(spectral_window)
    }
}

/// Ground-level parameters the profile was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundConditions {
    /// Altitude of the site in m
    pub altitude: f64,
    /// Ground pressure in hPa
    pub pressure: f64,
    /// Ground temperature in K
    pub temperature: f64,
    /// Relative humidity in percent
    pub relative_humidity: f64,
    /// Zenith water vapor column of the profile in mm
    pub water_column: f64,
}

/// Channels of one spectral window and their absorption coefficient tables.
///
/// The tables have shape (`num_channels`, `num_layers`).
#[derive(Debug, Clone)]
pub struct SpectralWindow {
    /// Channel frequencies in GHz.
    frequency: Array1<f64>,
    h2o_lines: Array2<Complex64>,
    h2o_continuum: Array2<Complex64>,
    dry: Array2<Complex64>,
    /// Associated image sideband window.
    image_sideband: Option<usize>,
}

impl SpectralWindow {
    /// Bundle the channel frequencies (GHz) with their absorption tables.
    ///
    /// All three tables must have one row per channel and the same number of
    /// columns (layers).
    pub fn new(
        frequency: &[f64],
        h2o_lines: Array2<Complex64>,
        h2o_continuum: Array2<Complex64>,
        dry: Array2<Complex64>,
    ) -> Result<Self, SkyError> {
        if frequency.is_empty() || frequency.iter().any(|&f| !(f > 0.)) {
            return Err(SkyError::InconsistentInputs);
        }
        let shape = h2o_lines.dim();
        if shape.0 != frequency.len()
            || h2o_continuum.dim() != shape
            || dry.dim() != shape
        {
            return Err(SkyError::InconsistentInputs);
        }
        Ok(Self {
            frequency: Array1::from(frequency.to_vec()),
            h2o_lines,
            h2o_continuum,
            dry,
            image_sideband: None,
        })
    }

    /// Associate an image sideband spectral window.
    pub fn with_image_sideband(mut self, spectral_window: usize) -> Self {
        self.image_sideband = Some(spectral_window);
        self
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    /// Always false, a window has at least one channel.
    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    /// Channel frequencies in GHz.
    pub fn frequency(&self) -> &[f64] {
        // The array was built from a Vec so it is always contiguous
        self.frequency.as_slice().unwrap_or(&[])
    }

    fn num_layers(&self) -> usize {
        self.h2o_lines.ncols()
    }
}

/// An [`AtmosphereModel`] holding precomputed tables in memory.
#[derive(Debug, Clone)]
pub struct LayeredAtmosphere {
    num_layers: NonZeroUsize,
    /// Layer thickness in m, ground first.
    thickness: Array1<f64>,
    /// Layer temperature in K, ground first.
    temperature: Array1<f64>,
    ground: GroundConditions,
    windows: Vec<SpectralWindow>,
}

impl LayeredAtmosphere {
    /// Prepare and check the tables.
    ///
    /// `thickness` (m) and `temperature` (K) must have the same length, which
    /// is also the number of columns of every spectral window table.
    pub fn new(
        thickness: &[f64],
        temperature: &[f64],
        ground: GroundConditions,
        windows: Vec<SpectralWindow>,
    ) -> Result<Self, SkyError> {
        let num_layers: NonZeroUsize = thickness
            .len()
            .try_into()
            .or(Err(SkyError::InconsistentInputs))?;

        if temperature.len() != num_layers.get() {
            return Err(SkyError::InconsistentInputs);
        }
        if thickness.iter().any(|&dz| !(dz > 0.)) || temperature.iter().any(|&t| !(t > 0.)) {
            return Err(SkyError::InvalidInput(
                "layer thickness and temperature must be positive",
            ));
        }
        if !(ground.water_column > 0.) {
            return Err(SkyError::InvalidInput(
                "ground water vapor column must be positive",
            ));
        }
        if windows.is_empty() || windows.iter().any(|w| w.num_layers() != num_layers.get()) {
            return Err(SkyError::InconsistentInputs);
        }
        // An image sideband must exist and pair channels one to one
        for window in &windows {
            if let Some(image) = window.image_sideband {
                match windows.get(image) {
                    Some(other) if other.len() == window.len() => {}
                    _ => return Err(SkyError::InconsistentInputs),
                }
            }
        }
        debug!(
            "atmosphere with {} layers and {} spectral windows",
            num_layers,
            windows.len()
        );

        Ok(Self {
            num_layers,
            thickness: Array1::from(thickness.to_vec()),
            temperature: Array1::from(temperature.to_vec()),
            ground,
            windows,
        })
    }

    /// Ground-level parameters.
    pub fn ground(&self) -> &GroundConditions {
        &self.ground
    }

    /// Access one spectral window.
    pub fn spectral_window(&self, spectral_window: usize) -> Option<&SpectralWindow> {
        self.windows.get(spectral_window)
    }
}

impl AtmosphereModel for LayeredAtmosphere {
    fn num_layers(&self) -> usize {
        self.num_layers.get()
    }

    fn layer_thickness(&self, layer: usize) -> f64 {
        self.thickness[layer]
    }

    fn layer_temperature(&self, layer: usize) -> f64 {
        self.temperature[layer]
    }

    fn num_spectral_windows(&self) -> usize {
        self.windows.len()
    }

    fn num_channels(&self, spectral_window: usize) -> usize {
        self.windows.get(spectral_window).map_or(0, SpectralWindow::len)
    }

    fn channel_frequency(&self, spectral_window: usize, channel: usize) -> f64 {
        self.windows[spectral_window].frequency[channel]
    }

    fn h2o_lines_absorption(
        &self,
        spectral_window: usize,
        channel: usize,
        layer: usize,
    ) -> Complex64 {
        self.windows[spectral_window].h2o_lines[[channel, layer]]
    }

    fn h2o_continuum_absorption(
        &self,
        spectral_window: usize,
        channel: usize,
        layer: usize,
    ) -> Complex64 {
        self.windows[spectral_window].h2o_continuum[[channel, layer]]
    }

    fn dry_absorption(&self, spectral_window: usize, channel: usize, layer: usize) -> Complex64 {
        self.windows[spectral_window].dry[[channel, layer]]
    }

    fn ground_water_column(&self) -> f64 {
        self.ground.water_column
    }

    fn ground_pressure(&self) -> f64 {
        self.ground.pressure
    }

    fn ground_temperature(&self) -> f64 {
        self.ground.temperature
    }

    fn relative_humidity(&self) -> f64 {
        self.ground.relative_humidity
    }

    fn altitude(&self) -> f64 {
        self.ground.altitude
    }

    fn image_sideband(&self, spectral_window: usize) -> Option<usize> {
        self.windows.get(spectral_window)?.image_sideband
    }
}
