//! Invalid requests are turned down before any absorption coefficient or
//! channel frequency is read.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use atmos_wvr::{
    AtmosphereModel, Conditions, FtsRetrieval, LayeredAtmosphere, SkyState, TebbRetrieval,
    WvrMeasurement,
};
use common::{SINGLE_CHANNEL, WVR_WINDOWS};
use num_complex::Complex64;

/// Atmosphere that counts the reads of its spectral tables.
struct Counting {
    inner: LayeredAtmosphere,
    reads: AtomicUsize,
}

impl Counting {
    fn new() -> Self {
        Self {
            inner: common::atmosphere(),
            reads: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}

impl AtmosphereModel for Counting {
    fn num_layers(&self) -> usize {
        self.inner.num_layers()
    }

    fn layer_thickness(&self, layer: usize) -> f64 {
        self.inner.layer_thickness(layer)
    }

    fn layer_temperature(&self, layer: usize) -> f64 {
        self.inner.layer_temperature(layer)
    }

    fn num_spectral_windows(&self) -> usize {
        self.inner.num_spectral_windows()
    }

    fn num_channels(&self, spectral_window: usize) -> usize {
        self.inner.num_channels(spectral_window)
    }

    fn channel_frequency(&self, spectral_window: usize, channel: usize) -> f64 {
        self.hit();
        self.inner.channel_frequency(spectral_window, channel)
    }

    fn h2o_lines_absorption(
        &self,
        spectral_window: usize,
        channel: usize,
        layer: usize,
    ) -> Complex64 {
        self.hit();
        self.inner.h2o_lines_absorption(spectral_window, channel, layer)
    }

    fn h2o_continuum_absorption(
        &self,
        spectral_window: usize,
        channel: usize,
        layer: usize,
    ) -> Complex64 {
        self.hit();
        self.inner.h2o_continuum_absorption(spectral_window, channel, layer)
    }

    fn dry_absorption(&self, spectral_window: usize, channel: usize, layer: usize) -> Complex64 {
        self.hit();
        self.inner.dry_absorption(spectral_window, channel, layer)
    }

    fn ground_water_column(&self) -> f64 {
        self.inner.ground_water_column()
    }

    fn ground_pressure(&self) -> f64 {
        self.inner.ground_pressure()
    }

    fn ground_temperature(&self) -> f64 {
        self.inner.ground_temperature()
    }

    fn relative_humidity(&self) -> f64 {
        self.inner.relative_humidity()
    }

    fn altitude(&self) -> f64 {
        self.inner.altitude()
    }

    fn image_sideband(&self, spectral_window: usize) -> Option<usize> {
        self.inner.image_sideband(spectral_window)
    }
}

fn session() -> SkyState<Counting> {
    let sky = SkyState::new(Counting::new())
        .with_radiometer(common::radiometer(0.95))
        .unwrap();
    sky.atmosphere().reads.store(0, Ordering::Relaxed);
    sky
}

fn reads(sky: &SkyState<Counting>) -> usize {
    sky.atmosphere().reads.load(Ordering::Relaxed)
}

/// A plausible reading, one brightness per radiometer channel.
fn reading(elevation: f64) -> WvrMeasurement {
    WvrMeasurement::new(elevation, &[250., 180., 110., 60.])
}

#[test]
fn valid_requests_read_the_tables() {
    let sky = session();
    sky.average_tebb_sky(WVR_WINDOWS[0], &Conditions::default()).unwrap();
    assert!(reads(&sky) > 0);
}

#[test]
fn bad_observations_are_not_evaluated() {
    let sky = session();
    let spw = WVR_WINDOWS[1];

    let wet = Conditions::default().with_water_column(-1.0);
    assert!(sky.average_tebb_sky(spw, &wet).is_err());
    assert!(sky.tebb_sky(spw, 0, &wet).is_err());
    assert!(sky.trj_sky(spw, 0, &wet).is_err());

    let grazing = Conditions::default().with_air_mass(0.5);
    assert!(sky.average_tebb_sky(spw, &grazing).is_err());
    assert!(sky.tebb_sky(spw, 1, &grazing).is_err());

    let hot = Conditions::default().with_beam(0.9, 400.);
    assert!(sky.average_tebb_sky(spw, &hot).is_err());
    assert!(sky.tebb_sky(spw, 2, &hot).is_err());
    let request = TebbRetrieval::single(spw, 0.9, 400.);
    assert!(sky.water_vapor_from_average_tebb(&request, &[150.]).is_err());

    assert_eq!(reads(&sky), 0);
}

#[test]
fn mismatched_radiometer_readings_are_not_evaluated() {
    let mut sky = session();
    let short = WvrMeasurement::new(45., &[250., 180., 110.]);
    assert!(sky.water_vapor_from_wvr(&short).is_err());

    let mut batch = vec![reading(30.), short, reading(60.)];
    let untouched = batch.clone();
    assert!(sky.retrieve_wvr_batch(&mut batch, 0..3).is_err());
    assert!(sky.calibrate_sky_coupling(&mut batch, 0..3).is_err());
    assert_eq!(batch, untouched);

    assert_eq!(reads(&sky), 0);
}

#[test]
fn inverted_band_is_not_evaluated() {
    let sky = session();
    let request = FtsRetrieval::new(SINGLE_CHANNEL, vec![0.9]).with_band(300., 200.);
    assert!(sky.water_vapor_from_fts(&request).is_err());
    assert!(sky
        .sigma_transmission_fit(SINGLE_CHANNEL, &[0.9], 1.0, Some((300., 200.)))
        .is_err());
    assert_eq!(reads(&sky), 0);
}

#[test]
fn out_of_range_batch_is_not_evaluated() {
    let mut sky = session();
    let mut batch = vec![reading(30.), reading(60.)];
    let untouched = batch.clone();

    assert!(sky.retrieve_wvr_batch(&mut batch, 0..5).is_err());
    assert!(sky.retrieve_wvr_batch(&mut batch, 1..1).is_err());
    assert!(sky.calibrate_sky_coupling(&mut batch, 1..3).is_err());
    assert!(sky
        .calibrate_channel_sky_coupling(0, &mut batch, 0..4)
        .is_err());
    assert_eq!(batch, untouched);
    assert_eq!(sky.radiometer().unwrap().sky_coupling(), &[0.95; 4]);

    assert_eq!(reads(&sky), 0);
}
