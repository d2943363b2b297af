//! Synthetic site shared by the integration tests: ten 500 m layers above a
//! 4000 m site with a 1 mm ground water vapor column.

#![allow(dead_code)]

use atmos_wvr::{GroundConditions, LayeredAtmosphere, SpectralWindow, WaterVaporRadiometer};
use ndarray::Array2;
use num_complex::Complex64;

pub const WVR_WINDOWS: [usize; 4] = [0, 1, 2, 3];
/// A single channel window at 225 GHz.
pub const SINGLE_CHANNEL: usize = 4;
pub const BASE_ALTITUDE: f64 = 4000.;

const NUM_LAYERS: usize = 10;
const THICKNESS: f64 = 500.;

fn profile(layer: usize, scale_height: f64) -> f64 {
    (-(layer as f64 + 0.5) * THICKNESS / scale_height).exp()
}

/// Window whose channels have the given zenith wet opacities (Np).
fn window(freqs: &[f64], wet_opacity: &[f64], dry_opacity: f64) -> SpectralWindow {
    let wet_norm: f64 = (0..NUM_LAYERS).map(|l| THICKNESS * profile(l, 1500.)).sum();
    let dry_norm: f64 = (0..NUM_LAYERS).map(|l| THICKNESS * profile(l, 8000.)).sum();
    let shape = (freqs.len(), NUM_LAYERS);

    let lines = Array2::from_shape_fn(shape, |(c, l)| {
        let im = 0.9 * wet_opacity[c] * profile(l, 1500.) / wet_norm;
        Complex64::new(0.3 * im, im)
    });
    let continuum = Array2::from_shape_fn(shape, |(c, l)| {
        let im = 0.1 * wet_opacity[c] * profile(l, 1500.) / wet_norm;
        Complex64::new(25. * im, im)
    });
    let dry = Array2::from_shape_fn(shape, |(_, l)| {
        let im = dry_opacity * profile(l, 8000.) / dry_norm;
        Complex64::new(5. * im, im)
    });
    SpectralWindow::new(freqs, lines, continuum, dry).unwrap()
}

pub fn atmosphere() -> LayeredAtmosphere {
    let windows = vec![
        window(&[183.9, 184.0, 184.1], &[2.5, 2.3, 2.1], 0.03),
        window(&[185.9, 186.0, 186.1], &[1.1, 1.05, 1.0], 0.03),
        window(&[188.9, 189.0, 189.1], &[0.5, 0.48, 0.46], 0.03),
        window(&[192.9, 193.0, 193.1], &[0.2, 0.19, 0.18], 0.03),
        window(&[225.0], &[0.06], 0.02),
    ];
    let temperature: Vec<f64> = (0..NUM_LAYERS)
        .map(|l| 273. - 6.5e-3 * (l as f64 + 0.5) * THICKNESS)
        .collect();
    let ground = GroundConditions {
        altitude: BASE_ALTITUDE,
        pressure: 620.,
        temperature: 273.,
        relative_humidity: 15.,
        water_column: 1.0,
    };
    LayeredAtmosphere::new(&[THICKNESS; NUM_LAYERS], &temperature, ground, windows).unwrap()
}

pub fn radiometer(sky_coupling: f64) -> WaterVaporRadiometer {
    WaterVaporRadiometer::new(&WVR_WINDOWS, &[sky_coupling; 4], &[1.0; 4], 280.).unwrap()
}
