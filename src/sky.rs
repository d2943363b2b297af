//! Sky session state and forward model accessors
//!
//! [`SkyState`] owns an atmosphere model together with the observing state
//! the retrievals work from: the air mass, the cosmic background, the water
//! vapor column currently assumed for the sky, and the radiometer setup.

use log::{debug, warn};

use crate::atmosphere::AtmosphereModel;
use crate::error::SkyError;
use crate::fit::FitSettings;
use crate::radiometer::WaterVaporRadiometer;
use crate::rtm::{Absorber, Beam, RadiativeTransfer, TemperatureScale};

/// Air mass of a new session (zenith).
pub const DEFAULT_AIR_MASS: f64 = 1.0;

/// Cosmic background temperature of a new session in K.
pub const DEFAULT_BACKGROUND_TEMPERATURE: f64 = 2.73;

/// Water vapor column in mm assumed when none (or a non-physical one) is
/// given.
pub const DEFAULT_WATER_COLUMN: f64 = 1.0;

/// Highest accepted spillover temperature in K.
pub(crate) const MAX_SPILLOVER_TEMPERATURE: f64 = 350.0;

/// Per-call overrides of the session state for the forward model.
///
/// Anything left as `None` falls back to the session: the user water vapor
/// column and air mass, a sky coupling of 1, the ground temperature as the
/// spillover temperature, and a signal gain of 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Conditions {
    /// Zenith water vapor column in mm
    pub water_column: Option<f64>,
    /// Air mass of the line of sight
    pub air_mass: Option<f64>,
    /// Fraction of the beam on the sky
    pub sky_coupling: Option<f64>,
    /// Temperature of the rest of the beam in K
    pub spillover_temperature: Option<f64>,
    /// Fraction of the receiver response in the signal sideband
    pub signal_gain: Option<f64>,
}

impl Conditions {
    /// Use this water vapor column (mm).
    pub fn with_water_column(self, water_column: f64) -> Self {
        Self {
            water_column: Some(water_column),
            ..self
        }
    }

    /// Use this air mass.
    pub fn with_air_mass(self, air_mass: f64) -> Self {
        Self {
            air_mass: Some(air_mass),
            ..self
        }
    }

    /// Use this sky coupling and spillover temperature (K).
    pub fn with_beam(self, sky_coupling: f64, spillover_temperature: f64) -> Self {
        Self {
            sky_coupling: Some(sky_coupling),
            spillover_temperature: Some(spillover_temperature),
            ..self
        }
    }

    /// Use this signal sideband gain.
    pub fn with_signal_gain(self, signal_gain: f64) -> Self {
        Self {
            signal_gain: Some(signal_gain),
            ..self
        }
    }
}

/// Conditions after applying the session defaults and checking ranges.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolved {
    pub water_ratio: f64,
    pub air_mass: f64,
    pub beam: Beam,
    pub signal_gain: f64,
}

/// Check the ranges shared by every brightness temperature computation.
pub(crate) fn check_observation(
    water_column: f64,
    air_mass: f64,
    spillover_temperature: f64,
) -> Result<(), SkyError> {
    if !(water_column >= 0.0) {
        return Err(SkyError::InvalidInput("water vapor column must not be negative"));
    }
    if !(air_mass >= 1.0) {
        return Err(SkyError::InvalidInput("air mass must be at least 1"));
    }
    if !(0.0..=MAX_SPILLOVER_TEMPERATURE).contains(&spillover_temperature) {
        return Err(SkyError::InvalidInput(
            "spillover temperature must be in [0, 350] K",
        ));
    }
    Ok(())
}

/// Check a sky coupling is a fraction.
pub(crate) fn check_sky_coupling(sky_coupling: f64) -> Result<(), SkyError> {
    if (0.0..=1.0).contains(&sky_coupling) {
        Ok(())
    } else {
        Err(SkyError::InvalidInput("sky coupling must be in [0, 1]"))
    }
}

/// The state of the sky for one observing session.
#[derive(Debug, Clone)]
pub struct SkyState<A> {
    atmosphere: A,
    air_mass: f64,
    background_temperature: f64,
    /// Zenith water vapor column in mm currently assumed for the sky
    user_water_column: f64,
    radiometer: Option<WaterVaporRadiometer>,
    fit_settings: FitSettings,
}

impl<A: AtmosphereModel> SkyState<A> {
    /// Start a session at zenith, against the default cosmic background, with
    /// the default water vapor column and no radiometer.
    pub fn new(atmosphere: A) -> Self {
        let user_water_column = enforce_water_column(&atmosphere, DEFAULT_WATER_COLUMN);
        debug!(
            "new sky state with {} layers, ground water vapor column {} mm",
            atmosphere.num_layers(),
            atmosphere.ground_water_column()
        );
        Self {
            atmosphere,
            air_mass: DEFAULT_AIR_MASS,
            background_temperature: DEFAULT_BACKGROUND_TEMPERATURE,
            user_water_column,
            radiometer: None,
            fit_settings: FitSettings::default(),
        }
    }

    /// Override the air mass (at least 1).
    pub fn with_air_mass(mut self, air_mass: f64) -> Result<Self, SkyError> {
        self.set_air_mass(air_mass)?;
        Ok(self)
    }

    /// Override the cosmic background temperature (K, positive).
    pub fn with_background_temperature(mut self, temperature: f64) -> Result<Self, SkyError> {
        self.set_background_temperature(temperature)?;
        Ok(self)
    }

    /// Override the user water vapor column (mm). Non-physical values are
    /// brought back in range.
    pub fn with_water_column(mut self, water_column: f64) -> Self {
        self.set_user_water_column(water_column);
        self
    }

    /// Attach a water vapor radiometer.
    pub fn with_radiometer(mut self, radiometer: WaterVaporRadiometer) -> Result<Self, SkyError> {
        self.set_radiometer(radiometer)?;
        Ok(self)
    }

    /// Override the fitter constants used by the retrievals.
    pub fn with_fit_settings(mut self, fit_settings: FitSettings) -> Self {
        self.fit_settings = fit_settings;
        self
    }

    /// The atmosphere model.
    pub fn atmosphere(&self) -> &A {
        &self.atmosphere
    }

    /// Air mass of the session.
    pub fn air_mass(&self) -> f64 {
        self.air_mass
    }

    /// Cosmic background temperature in K.
    pub fn background_temperature(&self) -> f64 {
        self.background_temperature
    }

    /// Zenith water vapor column in mm currently assumed for the sky.
    pub fn user_water_column(&self) -> f64 {
        self.user_water_column
    }

    /// Zenith water vapor column in mm of the atmosphere model.
    pub fn ground_water_column(&self) -> f64 {
        self.atmosphere.ground_water_column()
    }

    /// The attached radiometer, if any.
    pub fn radiometer(&self) -> Option<&WaterVaporRadiometer> {
        self.radiometer.as_ref()
    }

    pub(crate) fn radiometer_mut(&mut self) -> Option<&mut WaterVaporRadiometer> {
        self.radiometer.as_mut()
    }

    /// Fitter constants used by the retrievals.
    pub fn fit_settings(&self) -> &FitSettings {
        &self.fit_settings
    }

    /// Change the air mass (at least 1).
    pub fn set_air_mass(&mut self, air_mass: f64) -> Result<(), SkyError> {
        if !(air_mass >= 1.0) {
            return Err(SkyError::InvalidInput("air mass must be at least 1"));
        }
        self.air_mass = air_mass;
        Ok(())
    }

    /// Change the cosmic background temperature (K, positive).
    pub fn set_background_temperature(&mut self, temperature: f64) -> Result<(), SkyError> {
        if !(temperature > 0.0) {
            return Err(SkyError::InvalidInput(
                "background temperature must be positive",
            ));
        }
        self.background_temperature = temperature;
        Ok(())
    }

    /// Change the user water vapor column (mm) and return the value adopted.
    ///
    /// A column that is not positive is replaced by the default, one above
    /// what the ground relative humidity allows is clamped to that maximum.
    pub fn set_user_water_column(&mut self, water_column: f64) -> f64 {
        self.user_water_column = enforce_water_column(&self.atmosphere, water_column);
        self.user_water_column
    }

    /// Replace the radiometer. Every channel must observe an existing
    /// spectral window, with an image sideband when its signal gain is below
    /// 1.
    pub fn set_radiometer(&mut self, radiometer: WaterVaporRadiometer) -> Result<(), SkyError> {
        let windows = radiometer.spectral_windows();
        for (&spectral_window, &gain) in windows.iter().zip(radiometer.signal_gain()) {
            if !self.atmosphere.is_valid_channel(spectral_window, 0) {
                return Err(SkyError::InvalidChannel {
                    spectral_window,
                    channel: 0,
                });
            }
            if gain < 1.0 && self.atmosphere.image_sideband(spectral_window).is_none() {
                return Err(SkyError::InvalidInput(
                    "signal gain below 100% needs an image sideband window",
                ));
            }
        }
        debug!("radiometer with {} channels", radiometer.num_channels());
        self.radiometer = Some(radiometer);
        Ok(())
    }

    /// Replace the atmosphere model, for example after the ground conditions
    /// changed, keeping the user water vapor column in range for it.
    pub fn set_atmosphere(&mut self, atmosphere: A) {
        self.atmosphere = atmosphere;
        self.user_water_column = enforce_water_column(&self.atmosphere, self.user_water_column);
    }

    pub(crate) fn rtm(&self) -> RadiativeTransfer<'_, A> {
        RadiativeTransfer::new(&self.atmosphere, self.background_temperature)
    }

    /// Ratio of a water vapor column (mm) to the ground column.
    pub(crate) fn water_ratio(&self, water_column: f64) -> f64 {
        water_column / self.atmosphere.ground_water_column()
    }

    pub(crate) fn user_water_ratio(&self) -> f64 {
        self.water_ratio(self.user_water_column)
    }

    pub(crate) fn resolve(&self, conditions: &Conditions) -> Result<Resolved, SkyError> {
        let water_column = conditions.water_column.unwrap_or(self.user_water_column);
        let air_mass = conditions.air_mass.unwrap_or(self.air_mass);
        let spillover_temperature = conditions
            .spillover_temperature
            .unwrap_or_else(|| self.atmosphere.ground_temperature());
        check_observation(water_column, air_mass, spillover_temperature)?;

        let signal_gain = conditions.signal_gain.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&signal_gain) {
            return Err(SkyError::InvalidInput("signal gain must be in [0, 1]"));
        }

        Ok(Resolved {
            water_ratio: self.water_ratio(water_column),
            air_mass,
            beam: Beam {
                sky_coupling: conditions.sky_coupling.unwrap_or(1.0),
                spillover_temperature,
            },
            signal_gain,
        })
    }

    fn channel_brightness(
        &self,
        scale: TemperatureScale,
        spectral_window: usize,
        channel: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        let r = self.resolve(conditions)?;
        check_sky_coupling(r.beam.sky_coupling)?;
        self.rtm().sideband_brightness(
            scale,
            r.water_ratio,
            r.beam,
            r.air_mass,
            spectral_window,
            channel,
            r.signal_gain,
        )
    }

    fn band_brightness(
        &self,
        scale: TemperatureScale,
        spectral_window: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        let r = self.resolve(conditions)?;
        self.rtm().band_brightness(
            scale,
            r.water_ratio,
            r.beam,
            r.air_mass,
            spectral_window,
            None,
            r.signal_gain,
        )
    }

    /// Equivalent blackbody temperature of the sky in K for one channel.
    ///
    /// The sky coupling must be in [0, 1].
    pub fn tebb_sky(
        &self,
        spectral_window: usize,
        channel: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        self.channel_brightness(TemperatureScale::Tebb, spectral_window, channel, conditions)
    }

    /// Rayleigh-Jeans temperature of the sky in K for one channel.
    ///
    /// The sky coupling must be in [0, 1].
    pub fn trj_sky(
        &self,
        spectral_window: usize,
        channel: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        self.channel_brightness(TemperatureScale::Trj, spectral_window, channel, conditions)
    }

    /// Equivalent blackbody temperature of the sky in K averaged over a
    /// spectral window.
    ///
    /// Unlike [`tebb_sky`](Self::tebb_sky) the sky coupling is not range
    /// checked.
    pub fn average_tebb_sky(
        &self,
        spectral_window: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        self.band_brightness(TemperatureScale::Tebb, spectral_window, conditions)
    }

    /// Rayleigh-Jeans temperature of the sky in K averaged over a spectral
    /// window. The sky coupling is not range checked.
    pub fn average_trj_sky(
        &self,
        spectral_window: usize,
        conditions: &Conditions,
    ) -> Result<f64, SkyError> {
        self.band_brightness(TemperatureScale::Trj, spectral_window, conditions)
    }

    /// Average equivalent blackbody temperature of a spectral window at each
    /// of `air_masses`. The air mass in `conditions` is ignored.
    pub fn sky_dip(
        &self,
        spectral_window: usize,
        air_masses: &[f64],
        conditions: &Conditions,
    ) -> Result<Vec<f64>, SkyError>
    where
        A: Sync,
    {
        let r = self.resolve(&Conditions {
            air_mass: None,
            ..*conditions
        })?;
        self.rtm().sky_dip(
            TemperatureScale::Tebb,
            r.water_ratio,
            r.beam,
            spectral_window,
            air_masses,
        )
    }

    /// Zenith opacity in Np of one channel at the user water vapor column.
    pub fn opacity(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
    ) -> Result<f64, SkyError> {
        self.rtm()
            .opacity(absorber, spectral_window, channel, self.user_water_ratio())
    }

    /// Zenith opacity in Np averaged over a spectral window.
    pub fn average_opacity(
        &self,
        absorber: Absorber,
        spectral_window: usize,
    ) -> Result<f64, SkyError> {
        let rtm = self.rtm();
        rtm.window_average(spectral_window, |channel| {
            rtm.opacity(absorber, spectral_window, channel, self.user_water_ratio())
        })
    }

    /// Zenith opacity in Np of one channel from the ground up to `altitude`
    /// m. Zero at or below the base of the atmosphere.
    pub fn opacity_up_to(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
        altitude: f64,
    ) -> Result<f64, SkyError> {
        self.rtm().opacity_up_to(
            absorber,
            spectral_window,
            channel,
            self.user_water_ratio(),
            altitude,
        )
    }

    /// Zenith phase delay in degrees of one channel at the user water vapor
    /// column.
    ///
    /// Use [`Absorber::H2OLines`] for the dispersive and
    /// [`Absorber::H2OContinuum`] for the non-dispersive water vapor part.
    pub fn phase_delay(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
    ) -> Result<f64, SkyError> {
        self.rtm()
            .phase_delay(absorber, spectral_window, channel, self.user_water_ratio())
    }

    /// Zenith phase delay in degrees averaged over a spectral window.
    pub fn average_phase_delay(
        &self,
        absorber: Absorber,
        spectral_window: usize,
    ) -> Result<f64, SkyError> {
        let rtm = self.rtm();
        rtm.window_average(spectral_window, |channel| {
            rtm.phase_delay(absorber, spectral_window, channel, self.user_water_ratio())
        })
    }

    /// Zenith path length in mm of one channel at the user water vapor
    /// column.
    pub fn path_length(
        &self,
        absorber: Absorber,
        spectral_window: usize,
        channel: usize,
    ) -> Result<f64, SkyError> {
        self.rtm()
            .path_length(absorber, spectral_window, channel, self.user_water_ratio())
    }

    /// Zenith path length in mm averaged over a spectral window.
    pub fn average_path_length(
        &self,
        absorber: Absorber,
        spectral_window: usize,
    ) -> Result<f64, SkyError> {
        let rtm = self.rtm();
        rtm.window_average(spectral_window, |channel| {
            rtm.path_length(absorber, spectral_window, channel, self.user_water_ratio())
        })
    }
}

/// Bring a water vapor column (mm) back into the range the atmosphere allows.
fn enforce_water_column<A: AtmosphereModel>(atmosphere: &A, water_column: f64) -> f64 {
    let relative_humidity = atmosphere.relative_humidity();
    let max = if relative_humidity > 0.0 {
        atmosphere.ground_water_column() * 200.0 / relative_humidity
    } else {
        f64::INFINITY
    };

    if !(water_column > 0.0) {
        let column = DEFAULT_WATER_COLUMN.min(max);
        warn!("water vapor column {water_column} mm is not physical, using {column} mm");
        column
    } else if water_column > max {
        warn!("water vapor column {water_column} mm is above the {max} mm maximum");
        max
    } else {
        water_column
    }
}
