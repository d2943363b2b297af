//! Synthetic atmosphere shared by the unit tests.
//!
//! Twelve 400 m layers above a 5000 m site, a 1 mm ground water vapor column,
//! four radiometer-like windows on the wing of the 183 GHz line, an eight
//! channel window for transmission spectra and a double sideband pair.

use ndarray::Array2;
use num_complex::Complex64;

use crate::atmosphere::{GroundConditions, LayeredAtmosphere, SpectralWindow};
use crate::radiometer::WaterVaporRadiometer;

pub(crate) const WVR_WINDOWS: [usize; 4] = [0, 1, 2, 3];
pub(crate) const FTS_WINDOW: usize = 4;
/// Signal sideband window; its image is `DSB_WINDOW + 1`.
pub(crate) const DSB_WINDOW: usize = 5;
pub(crate) const BASE_ALTITUDE: f64 = 5000.;

const NUM_LAYERS: usize = 12;
const THICKNESS: f64 = 400.;
const WET_SCALE_HEIGHT: f64 = 2000.;
const DRY_SCALE_HEIGHT: f64 = 8000.;

fn layer_mid(layer: usize) -> f64 {
    (layer as f64 + 0.5) * THICKNESS
}

/// Build a window whose channels have the given zenith wet and dry opacities
/// at the ground water column.
fn window(freqs: &[f64], wet_opacity: &[f64], dry_opacity: f64) -> SpectralWindow {
    let wet_shape: f64 = (0..NUM_LAYERS)
        .map(|l| THICKNESS * (-layer_mid(l) / WET_SCALE_HEIGHT).exp())
        .sum();
    let dry_shape: f64 = (0..NUM_LAYERS)
        .map(|l| THICKNESS * (-layer_mid(l) / DRY_SCALE_HEIGHT).exp())
        .sum();
    let wet = |c: usize, l: usize| {
        wet_opacity[c] / wet_shape * (-layer_mid(l) / WET_SCALE_HEIGHT).exp()
    };

    let shape = (freqs.len(), NUM_LAYERS);
    let lines = Array2::from_shape_fn(shape, |(c, l)| {
        let im = 0.85 * wet(c, l);
        Complex64::new(0.5 * im, im)
    });
    let continuum = Array2::from_shape_fn(shape, |(c, l)| {
        let im = 0.15 * wet(c, l);
        Complex64::new(40. * im, im)
    });
    let dry = Array2::from_shape_fn(shape, |(_, l)| {
        let im = dry_opacity / dry_shape * (-layer_mid(l) / DRY_SCALE_HEIGHT).exp();
        Complex64::new(10. * im, im)
    });
    SpectralWindow::new(freqs, lines, continuum, dry).unwrap()
}

pub(crate) fn synthetic_atmosphere() -> LayeredAtmosphere {
    let fts_freqs: Vec<f64> = (0..8).map(|i| 200. + 20. * i as f64).collect();
    let fts_wet: Vec<f64> = (0..8).map(|i| 0.05 + 0.08 * i as f64).collect();

    let windows = vec![
        window(&[184.21, 184.31, 184.41], &[2.2, 2.0, 1.8], 0.02),
        window(&[186.2, 186.3, 186.4], &[1.0, 0.95, 0.9], 0.02),
        window(&[188.2, 188.3, 188.4], &[0.45, 0.42, 0.40], 0.02),
        window(&[191.2, 191.3, 191.4], &[0.15, 0.14, 0.13], 0.02),
        window(&fts_freqs, &fts_wet, 0.04),
        window(&[345.0, 345.5], &[0.6, 0.62], 0.1).with_image_sideband(6),
        window(&[357.0, 357.5], &[0.9, 0.95], 0.12),
    ];

    let thickness = [THICKNESS; NUM_LAYERS];
    let temperature: Vec<f64> = (0..NUM_LAYERS)
        .map(|l| 268. - 6.5e-3 * layer_mid(l))
        .collect();
    let ground = GroundConditions {
        altitude: BASE_ALTITUDE,
        pressure: 555.,
        temperature: 268.,
        relative_humidity: 20.,
        water_column: 1.0,
    };
    LayeredAtmosphere::new(&thickness, &temperature, ground, windows).unwrap()
}

pub(crate) fn radiometer() -> WaterVaporRadiometer {
    WaterVaporRadiometer::new(&WVR_WINDOWS, &[0.97; 4], &[1.0; 4], 275.).unwrap()
}
