//! Atmospheric radiative transfer and water vapor retrieval
//!
//! Given a layered atmosphere with precomputed absorption coefficients (an
//! [`AtmosphereModel`]), this crate computes forward quantities for an
//! assumed zenith water vapor column (sky brightness temperature, opacity,
//! phase delay and path length) and inverts instrument measurements to
//! retrieve the water vapor column:
//!
//! - zenith transmission spectra ([`FtsRetrieval`])
//! - sky brightness temperatures of one or more spectral windows
//!   ([`TebbRetrieval`])
//! - multi-channel water vapor radiometer readings ([`WvrMeasurement`]),
//!   singly or in batches
//!
//! The radiometer sky coupling can itself be calibrated against a batch of
//! radiometer measurements.
//!
//! Everything hangs off a [`SkyState`], which owns the atmosphere and the
//! session defaults. Retrievals leave it unchanged and return what they
//! found; [`SkyState::commit`] adopts a retrieved column.
//!
//! Units are fixed: water vapor columns in mm, lengths in m, temperatures in
//! K, frequencies in GHz, angles in degrees, and signal gains as fractions.
//!
//! With the `python` feature, the crate also builds a Python extension
//! module (see the `python` module).

pub mod atmosphere;
pub mod calibration;
pub mod error;
pub mod fit;
pub mod radiometer;
pub mod retrieval;
pub mod rtm;
pub mod sky;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod testing;

pub use atmosphere::{AtmosphereModel, GroundConditions, LayeredAtmosphere, SpectralWindow};
pub use calibration::CouplingCalibration;
pub use error::SkyError;
pub use fit::FitSettings;
pub use radiometer::{ChannelValues, WaterVaporRadiometer, WvrMeasurement};
pub use retrieval::fts::FtsRetrieval;
pub use retrieval::tebb::{CouplingRetrieval, TebbRetrieval};
pub use retrieval::wvr::{wvr_average_sigma, wvr_channel_sigma};
pub use retrieval::Retrieval;
pub use rtm::{Absorber, Beam, TemperatureScale};
pub use sky::{Conditions, SkyState};
