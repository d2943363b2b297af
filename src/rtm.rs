//! Sky radiative transfer model
//!
//! Forward computation of brightness temperatures, opacities and phase delays
//! through an [`AtmosphereModel`], for a water vapor column given as a ratio
//! `water_ratio` to the ground column of the model.

pub(crate) mod core;


use log::trace;
use num_complex::Complex64;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;

/// Temperature scale used to express the sky radiance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureScale {
    /// Planck-corrected equivalent blackbody temperature
    #[default]
    Tebb,
    /// Rayleigh-Jeans brightness temperature
    Trj,
}

/// Part of the absorption to integrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorber {
    /// Water vapor lines (dispersive)
    H2OLines,
    /// Water vapor continuum (non-dispersive)
    H2OContinuum,
    /// Water vapor lines and continuum
    Wet,
    /// Everything except water vapor
    Dry,
    /// Wet and dry
    Total,
}

/// How the receiver beam couples to the sky.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Beam {
    /// Fraction of the beam that sees the sky, nominally in [0, 1]
    pub sky_coupling: f64,
    /// Temperature seen by the rest of the beam, in K
    pub spillover_temperature: f64,
}

impl Beam {
    /// A beam fully coupled to the sky.
    pub fn perfect() -> Self {
        Self {
            sky_coupling: 1.0,
            spillover_temperature: 0.0,
        }
    }
}

/// Radiative transfer through an atmosphere, with a given sky background.
#[derive(Debug)]
pub struct RadiativeTransfer<'a, A: ?Sized> {
    atmosphere: &'a A,
    /// Cosmic background temperature in K.
    background_temperature: f64,
}

// Manual impls: deriving would require `A: Clone`
impl<A: ?Sized> Clone for RadiativeTransfer<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: ?Sized> Copy for RadiativeTransfer<'_, A> {}

impl<'a, A: AtmosphereModel + ?Sized> RadiativeTransfer<'a, A> {
    /// Create the model for `atmosphere` seen against a background at
    /// `background_temperature` K.
    pub fn new(atmosphere: &'a A, background_temperature: f64) -> Self {
        Self {
            atmosphere,
            background_temperature,
        }
    }

    /// The atmosphere the model integrates through.
    pub fn atmosphere(&self) -> &'a A {
        self.atmosphere
    }

    fn check_channel(&self, spectral_window: usize, channel: usize) -> Result<(), SkyError> {
        if self.atmosphere.is_valid_channel(spectral_window, channel) {
            Ok(())
        } else {
            Err(SkyError::InvalidChannel {
                spectral_window,
                channel,
            })
        }
    }

    fn check_window(&self, spectral_window: usize) -> Result<usize, SkyError> {
        self.check_channel(spectral_window, 0)?;
        Ok(self.atmosphere.num_channels(spectral_window))
    }

    /// Absorption coefficient of one layer, with the wet part scaled by
    /// `water_ratio`.
    fn coefficient(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        layer: usize,
        water_ratio: f64,
    ) -> Complex64 {
        let atm = self.atmosphere;
        match absorber {
            Absorber::H2OLines => {
                atm.h2o_lines_absorption(spectral_window, channel, layer) * water_ratio
            }
            Absorber::H2OContinuum => {
                atm.h2o_continuum_absorption(spectral_window, channel, layer) * water_ratio
            }
            Absorber::Wet => atm.wet_absorption(spectral_window, channel, layer) * water_ratio,
            Absorber::Dry => atm.dry_absorption(spectral_window, channel, layer),
            Absorber::Total => {
                atm.wet_absorption(spectral_window, channel, layer) * water_ratio
                    + atm.dry_absorption(spectral_window, channel, layer)
            }
        }
    }

    /// Per-layer (thickness, value) pairs from the ground upward, where the
    /// value is computed from the layer thickness and absorption coefficient.
    fn layer_values(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        water_ratio: f64,
        value: impl Fn(f64, Complex64) -> f64,
    ) -> SmallVec<[(f64, f64); 64]> {
        (0..self.atmosphere.num_layers())
            .map(|layer| {
                let thickness = self.atmosphere.layer_thickness(layer);
                let n = self.coefficient(absorber, spectral_window, channel, layer, water_ratio);
                (thickness, value(thickness, n))
            })
            .collect()
    }

    /// Sky radiance (as an occupation number) for one channel, for a channel
    /// that is already known to be valid.
    fn radiance(
        &self,
        water_ratio: f64,
        beam: Beam,
        air_mass: f64,
        spectral_window: usize,
        channel: usize,
    ) -> f64 {
        let freq = self.atmosphere.channel_frequency(spectral_window, channel);
        let layers = (0..self.atmosphere.num_layers()).map(|layer| {
            let tau = self
                .coefficient(Absorber::Total, spectral_window, channel, layer, water_ratio)
                .im
                * self.atmosphere.layer_thickness(layer);
            (tau, self.atmosphere.layer_temperature(layer))
        });
        let (radiance, _opacity) = core::sky_radiance(
            freq,
            layers,
            air_mass,
            self.background_temperature,
            beam.sky_coupling,
            beam.spillover_temperature,
        );
        radiance
    }

    fn to_temperature(&self, scale: TemperatureScale, freq: f64, radiance: f64) -> f64 {
        match scale {
            TemperatureScale::Tebb => core::tebb(freq, radiance),
            TemperatureScale::Trj => core::trj(freq, radiance),
        }
    }

    /// Sky brightness temperature in K of one channel.
    pub fn brightness(
        &self,
        scale: TemperatureScale,
        water_ratio: f64,
        beam: Beam,
        air_mass: f64,
        spectral_window: usize,
        channel: usize,
    ) -> Result<f64, SkyError> {
        self.check_channel(spectral_window, channel)?;
        let freq = self.atmosphere.channel_frequency(spectral_window, channel);
        let radiance = self.radiance(water_ratio, beam, air_mass, spectral_window, channel);
        Ok(self.to_temperature(scale, freq, radiance))
    }

    /// Sky brightness temperature in K of one channel as seen by a receiver
    /// with a fraction `signal_gain` of its response in the signal sideband.
    ///
    /// When `signal_gain` is below 1, the rest of the response comes from the
    /// same channel of the associated image sideband window.
    #[allow(clippy::too_many_arguments)]
    pub fn sideband_brightness(
        &self,
        scale: TemperatureScale,
        water_ratio: f64,
        beam: Beam,
        air_mass: f64,
        spectral_window: usize,
        channel: usize,
        signal_gain: f64,
    ) -> Result<f64, SkyError> {
        let signal = self.brightness(scale, water_ratio, beam, air_mass, spectral_window, channel)?;
        if signal_gain >= 1.0 {
            return Ok(signal);
        }
        let image_window = self
            .atmosphere
            .image_sideband(spectral_window)
            .ok_or(SkyError::InvalidInput(
                "signal gain below 100% needs an image sideband window",
            ))?;
        let image = self.brightness(scale, water_ratio, beam, air_mass, image_window, channel)?;
        Ok(signal_gain * signal + (1.0 - signal_gain) * image)
    }

    /// Weighted average sky brightness temperature in K over the channels of a
    /// spectral window.
    ///
    /// Channels with a positive weight in `filter` contribute, normalized by
    /// the sum of those weights; without a filter all channels weigh the same.
    /// A filter with no positive weight gives zero.
    #[allow(clippy::too_many_arguments)]
    pub fn band_brightness(
        &self,
        scale: TemperatureScale,
        water_ratio: f64,
        beam: Beam,
        air_mass: f64,
        spectral_window: usize,
        filter: Option<&[f64]>,
        signal_gain: f64,
    ) -> Result<f64, SkyError> {
        let num_channels = self.check_window(spectral_window)?;
        let weight = |channel: usize| filter.map_or(1.0, |f| f[channel]);
        if filter.is_some_and(|f| f.len() != num_channels) {
            return Err(SkyError::InvalidInput(
                "channel filter length does not match the spectral window",
            ));
        }

        let norm: f64 = (0..num_channels)
            .map(weight)
            .filter(|&w| w > 0.)
            .sum();
        if norm == 0. {
            return Ok(0.);
        }

        (0..num_channels)
            .filter(|&channel| weight(channel) > 0.)
            .try_fold(0., |average, channel| {
                let t = self.sideband_brightness(
                    scale,
                    water_ratio,
                    beam,
                    air_mass,
                    spectral_window,
                    channel,
                    signal_gain,
                )?;
                Ok(average + t * weight(channel) / norm)
            })
    }

    /// Zenith opacity in Np of one channel.
    pub fn opacity(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        water_ratio: f64,
    ) -> Result<f64, SkyError> {
        self.check_channel(spectral_window, channel)?;
        Ok(self
            .layer_values(absorber, spectral_window, channel, water_ratio, |dz, n| n.im * dz)
            .iter()
            .map(|&(_, tau)| tau)
            .sum())
    }

    /// Zenith opacity in Np of one channel, from the ground up to
    /// `ref_altitude` m.
    ///
    /// Zero at or below the base of the atmosphere.
    pub fn opacity_up_to(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        water_ratio: f64,
        ref_altitude: f64,
    ) -> Result<f64, SkyError> {
        self.check_channel(spectral_window, channel)?;
        let layers =
            self.layer_values(absorber, spectral_window, channel, water_ratio, |dz, n| n.im * dz);
        Ok(core::integrate_up_to(
            self.atmosphere.altitude(),
            ref_altitude,
            layers.into_iter(),
        ))
    }

    /// Zenith phase delay in degrees of one channel.
    pub fn phase_delay(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        water_ratio: f64,
    ) -> Result<f64, SkyError> {
        self.check_channel(spectral_window, channel)?;
        let radians: f64 = self
            .layer_values(absorber, spectral_window, channel, water_ratio, |dz, n| n.re * dz)
            .iter()
            .map(|&(_, phase)| phase)
            .sum();
        Ok(radians.to_degrees())
    }

    /// Zenith path length in mm of one channel.
    pub fn path_length(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        water_ratio: f64,
    ) -> Result<f64, SkyError> {
        let phase = self.phase_delay(absorber, spectral_window, channel, water_ratio)?;
        let freq = self.atmosphere.channel_frequency(spectral_window, channel);
        Ok(core::path_length(freq, phase))
    }

    /// Average of a per-channel quantity over a spectral window.
    pub fn window_average(
        &self,
        spectral_window: usize,
        per_channel: impl Fn(usize) -> Result<f64, SkyError>,
    ) -> Result<f64, SkyError> {
        let num_channels = self.check_window(spectral_window)?;
        let sum = (0..num_channels)
            .try_fold(0., |sum, channel| Ok::<_, SkyError>(sum + per_channel(channel)?))?;
        Ok(sum / num_channels as f64)
    }

    /// Band-averaged brightness temperatures of a spectral window for each
    /// air mass in `air_masses` (a "sky dip").
    ///
    /// The air masses are independent and evaluated in parallel.
    pub fn sky_dip(
        &self,
        scale: TemperatureScale,
        water_ratio: f64,
        beam: Beam,
        spectral_window: usize,
        air_masses: &[f64],
    ) -> Result<Vec<f64>, SkyError>
    where
        A: Sync,
    {
        self.check_window(spectral_window)?;
        if air_masses.iter().any(|&a| !(a >= 1.0)) {
            return Err(SkyError::InvalidInput("air mass must be at least 1"));
        }
        trace!(
            "sky dip over {} air masses in spectral window {spectral_window}",
            air_masses.len()
        );
        air_masses
            .par_iter()
            .map(|&air_mass| {
                self.band_brightness(
                    scale,
                    water_ratio,
                    beam,
                    air_mass,
                    spectral_window,
                    None,
                    1.0,
                )
            })
            .collect()
    }
}
