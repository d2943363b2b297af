//! Python bindings
//!
//! NOTE: this module is the interface between Rust and Python. The real work
//! happens in the other modules, which do not use `pyo3`.
//!
//! The atmosphere is handed in as numpy arrays: layer thickness and
//! temperature of shape (`num_layers`, ), channel frequencies of shape
//! (`num_windows`, `num_freq`), and complex absorption coefficient tables of
//! shape (`num_windows`, `num_freq`, `num_layers`). Every spectral window
//! therefore has the same number of channels.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use num_complex::Complex64;
use numpy::prelude::*;
use numpy::{
    PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray3, ToPyArray,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use rayon::prelude::*;

use crate::atmosphere::{GroundConditions, LayeredAtmosphere, SpectralWindow};
use crate::error::SkyError;
use crate::radiometer::{WaterVaporRadiometer, WvrMeasurement};
use crate::sky::{Conditions, SkyState};

impl From<SkyError> for PyErr {
    fn from(e: SkyError) -> Self {
        PyValueError::new_err(e.to_string())
    }
}

/// Absorption tables of the atmosphere, as borrowed numpy views.
struct Tables<'a> {
    frequency: ArrayView2<'a, f64>,
    h2o_lines: ArrayView3<'a, Complex64>,
    h2o_continuum: ArrayView3<'a, Complex64>,
    dry: ArrayView3<'a, Complex64>,
}

fn build_atmosphere(
    thickness: &[f64],
    temperature: &[f64],
    ground: GroundConditions,
    tables: &Tables<'_>,
    image_sideband: Option<&[Option<usize>]>,
) -> Result<LayeredAtmosphere, SkyError> {
    let (num_windows, num_freq) = tables.frequency.dim();
    let shape = tables.h2o_lines.dim();
    if shape.0 != num_windows
        || shape.1 != num_freq
        || tables.h2o_continuum.dim() != shape
        || tables.dry.dim() != shape
    {
        return Err(SkyError::InconsistentInputs);
    }
    if image_sideband.is_some_and(|images| images.len() != num_windows) {
        return Err(SkyError::InconsistentInputs);
    }

    let windows = (0..num_windows)
        .map(|w| -> Result<_, SkyError> {
            let window = SpectralWindow::new(
                tables
                    .frequency
                    .index_axis(Axis(0), w)
                    .as_slice()
                    .ok_or(SkyError::NotContiguous)?,
                tables.h2o_lines.index_axis(Axis(0), w).to_owned(),
                tables.h2o_continuum.index_axis(Axis(0), w).to_owned(),
                tables.dry.index_axis(Axis(0), w).to_owned(),
            )?;
            Ok(match image_sideband.and_then(|images| images[w]) {
                Some(image) => window.with_image_sideband(image),
                None => window,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    LayeredAtmosphere::new(thickness, temperature, ground, windows)
}

/// Outcome of a batch of radiometer retrievals.
///
/// Each property is a numpy array with one row per measurement. Water vapor
/// columns of fits that did not converge are NaN.
#[pyclass]
struct WvrResults {
    water_column: Array1<f64>,
    sigma: Array1<f64>,
    fitted_brightness: Array2<f64>,
}

#[pymethods]
impl WvrResults {
    #[getter]
    fn water_column<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.water_column.to_pyarray(py)
    }

    #[getter]
    fn sigma<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.sigma.to_pyarray(py)
    }

    #[getter]
    fn fitted_brightness<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        self.fitted_brightness.to_pyarray(py)
    }
}

impl WvrResults {
    fn new(num_measurements: usize, num_channels: usize) -> Self {
        Self {
            water_column: Array1::from_elem(num_measurements, f64::NAN),
            sigma: Array1::from_elem(num_measurements, f64::NAN),
            fitted_brightness: Array2::from_elem([num_measurements, num_channels], f64::NAN),
        }
    }
}

/// Average sky brightness temperature (Tebb, in K) of one spectral window
/// over a range of air masses.
///
/// `thickness` (m) and `temperature` (K) describe the layers, ground first.
/// The ground parameters are `altitude` (m), `ground_pressure` (hPa),
/// `ground_temperature` (K), `relative_humidity` (%) and
/// `ground_water_column` (mm). See the module documentation for the shapes of
/// the frequency and absorption tables.
///
/// `water_column` (mm) is the water vapor column to evaluate, and
/// `sky_coupling` and `spillover_temperature` (K) describe the beam.
///
/// The number of worker threads is controlled by `num_threads`. It must be a
/// positive integer, or `None` to automatically choose the number of threads.
#[pyfunction]
#[pyo3(signature = (thickness, temperature, altitude, ground_pressure, ground_temperature, relative_humidity, ground_water_column, frequency, h2o_lines, h2o_continuum, dry, spectral_window, air_mass, water_column, sky_coupling, spillover_temperature, num_threads))]
#[allow(clippy::too_many_arguments)]
fn sky_dip<'py>(
    py: Python<'py>,
    thickness: PyReadonlyArray1<'_, f64>,
    temperature: PyReadonlyArray1<'_, f64>,
    altitude: f64,
    ground_pressure: f64,
    ground_temperature: f64,
    relative_humidity: f64,
    ground_water_column: f64,
    frequency: PyReadonlyArray2<'_, f64>,
    h2o_lines: PyReadonlyArray3<'_, Complex64>,
    h2o_continuum: PyReadonlyArray3<'_, Complex64>,
    dry: PyReadonlyArray3<'_, Complex64>,
    spectral_window: usize,
    air_mass: PyReadonlyArray1<'_, f64>,
    water_column: f64,
    sky_coupling: f64,
    spillover_temperature: f64,
    num_threads: Option<usize>,
) -> PyResult<Bound<'py, PyArray1<f64>>> {
    let ground = GroundConditions {
        altitude,
        pressure: ground_pressure,
        temperature: ground_temperature,
        relative_humidity,
        water_column: ground_water_column,
    };
    let tables = Tables {
        frequency: frequency.as_array(),
        h2o_lines: h2o_lines.as_array(),
        h2o_continuum: h2o_continuum.as_array(),
        dry: dry.as_array(),
    };
    let atmosphere = build_atmosphere(
        thickness.as_slice()?,
        temperature.as_slice()?,
        ground,
        &tables,
        None,
    )?;
    let sky = SkyState::new(atmosphere);
    let conditions = Conditions::default()
        .with_water_column(water_column)
        .with_beam(sky_coupling, spillover_temperature);
    let air_mass = air_mass.as_slice()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    debug!("sky dip over {} air masses", air_mass.len());
    let tebb = py.allow_threads(|| {
        pool.install(|| sky.sky_dip(spectral_window, air_mass, &conditions))
    })?;

    Ok(Array1::from(tebb).to_pyarray(py))
}

/// Retrieve the water vapor column from a batch of radiometer measurements.
///
/// The atmosphere is described as for `sky_dip`, with the optional
/// `image_sideband` giving the image sideband window (or `None`) of every
/// spectral window.
///
/// The radiometer channels observe `channel_windows`, with one
/// `sky_coupling` and `signal_gain` (fraction, default 1) per channel and a
/// shared `spillover_temperature` (K). `elevation` (degrees) has shape
/// (`num_measurements`, ) and `brightness` (K) has shape
/// (`num_measurements`, `num_channels`). The fits start from `water_column`
/// (mm).
///
/// The number of worker threads is controlled by `num_threads`. It must be a
/// positive integer, or `None` to automatically choose the number of threads.
#[pyfunction]
#[pyo3(signature = (thickness, temperature, altitude, ground_pressure, ground_temperature, relative_humidity, ground_water_column, frequency, h2o_lines, h2o_continuum, dry, channel_windows, sky_coupling, spillover_temperature, elevation, brightness, water_column, num_threads, signal_gain=None, image_sideband=None))]
#[allow(clippy::too_many_arguments)]
fn retrieve_wvr(
    py: Python<'_>,
    thickness: PyReadonlyArray1<'_, f64>,
    temperature: PyReadonlyArray1<'_, f64>,
    altitude: f64,
    ground_pressure: f64,
    ground_temperature: f64,
    relative_humidity: f64,
    ground_water_column: f64,
    frequency: PyReadonlyArray2<'_, f64>,
    h2o_lines: PyReadonlyArray3<'_, Complex64>,
    h2o_continuum: PyReadonlyArray3<'_, Complex64>,
    dry: PyReadonlyArray3<'_, Complex64>,
    channel_windows: Vec<usize>,
    sky_coupling: PyReadonlyArray1<'_, f64>,
    spillover_temperature: f64,
    elevation: PyReadonlyArray1<'_, f64>,
    brightness: PyReadonlyArray2<'_, f64>,
    water_column: f64,
    num_threads: Option<usize>,
    signal_gain: Option<PyReadonlyArray1<'_, f64>>,
    image_sideband: Option<Vec<Option<usize>>>,
) -> PyResult<WvrResults> {
    let num_measurements = elevation.len();
    let num_channels = channel_windows.len();
    if brightness.dims() != [num_measurements, num_channels] {
        return Err(SkyError::InconsistentInputs.into());
    }

    let ground = GroundConditions {
        altitude,
        pressure: ground_pressure,
        temperature: ground_temperature,
        relative_humidity,
        water_column: ground_water_column,
    };
    let tables = Tables {
        frequency: frequency.as_array(),
        h2o_lines: h2o_lines.as_array(),
        h2o_continuum: h2o_continuum.as_array(),
        dry: dry.as_array(),
    };
    let atmosphere = build_atmosphere(
        thickness.as_slice()?,
        temperature.as_slice()?,
        ground,
        &tables,
        image_sideband.as_deref(),
    )?;

    let signal_gain = match &signal_gain {
        Some(gain) => gain.as_slice()?.to_vec(),
        None => vec![1.0; num_channels],
    };
    let radiometer = WaterVaporRadiometer::new(
        &channel_windows,
        sky_coupling.as_slice()?,
        &signal_gain,
        spillover_temperature,
    )?;
    let sky = SkyState::new(atmosphere)
        .with_water_column(water_column)
        .with_radiometer(radiometer)?;

    let brightness = brightness.as_array();
    let mut measurements = elevation
        .as_slice()?
        .iter()
        .zip(brightness.outer_iter())
        .map(|(&elevation, measured)| -> Result<_, SkyError> {
            Ok(WvrMeasurement::new(
                elevation,
                measured.as_slice().ok_or(SkyError::NotContiguous)?,
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!("input shapes are consistent");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    // These atomics keep track of how many measurements have finished and
    // whether it's time to cancel the retrieval or not
    let num_completed = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);
    let mut outcomes = Vec::new();

    info!("Retrieving water vapor for {num_measurements} radiometer measurements");

    pool.in_place_scope(|s| -> Result<(), PyErr> {
        s.spawn(|_| {
            measurements
                .par_iter_mut()
                .map(|measurement| -> Result<(), SkyError> {
                    if cancelled.load(Ordering::Relaxed) {
                        return Err(SkyError::Cancelled);
                    }
                    sky.retrieve_wvr(measurement)
                })
                .inspect(|_| {
                    num_completed.fetch_add(1, Ordering::Relaxed);
                })
                .collect_into_vec(&mut outcomes);
        });

        // The work is done in the thread pool, but back here in the main
        // thread, handle progress reporting and checking for early
        // cancellation
        while !cancelled.load(Ordering::Relaxed) {
            if let Err(e) = py.check_signals() {
                cancelled.store(true, Ordering::Relaxed);
                return Err(e);
            }

            let num_completed = num_completed.load(Ordering::Relaxed);
            let progress = num_completed as f32 / num_measurements as f32 * 100.;
            info!("Retrieved {num_completed}/{num_measurements} measurements ({progress:0.2}%)");

            // All finished without cancelling early
            if num_completed == num_measurements {
                break;
            }

            py.allow_threads(|| {
                std::thread::sleep(Duration::from_millis(500));
            });
        }

        Ok(())
    })?;
    outcomes.into_iter().collect::<Result<(), SkyError>>()?;

    // Copy the retrieved values to the output arrays
    debug!("copying retrieval output");
    let mut output = WvrResults::new(num_measurements, num_channels);
    for (index, measurement) in measurements.iter().enumerate() {
        if let Some(Ok(column)) = &measurement.retrieved_water_column {
            output.water_column[index] = *column;
        }
        if let Some(sigma) = measurement.fit_sigma {
            output.sigma[index] = sigma;
        }
        output
            .fitted_brightness
            .index_axis_mut(Axis(0), index)
            .assign(&ArrayView1::from(measurement.fitted_brightness.as_slice()));
    }

    Ok(output)
}

/// A Python module implemented in Rust.
#[pymodule]
fn atmos_wvr(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    m.add_function(wrap_pyfunction!(sky_dip, m)?)?;
    m.add_function(wrap_pyfunction!(retrieve_wvr, m)?)?;
    m.add_class::<WvrResults>()?;
    Ok(())
}
