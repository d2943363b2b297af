//! Core sky radiative transfer functions.

/// Planck constant divided by the Boltzmann constant, in K/GHz.
#[allow(clippy::excessive_precision)]
pub(crate) const H_DIV_K: f64 = 0.04799274551;

/// Speed of light in m/s.
pub(crate) const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Planck occupation number.
///
/// For a frequency `freq` in GHz and a temperature `t` in K, compute
/// `1 / (exp(h ν / k T) - 1)`. A temperature of zero gives zero.
pub(crate) fn planck(freq: f64, t: f64) -> f64 {
    1.0 / f64::exp_m1(H_DIV_K * freq / t)
}

/// Integrate the sky emission along a slanted path.
///
/// `layers` yields (`tau`, `t`) for each layer from the ground upward, where
/// `tau` is the zenith layer opacity in Np and `t` the layer temperature in K.
/// The path has an air mass of `air_mass`. A fraction `sky_coupling` of the
/// beam sees the sky (plus the cosmic background at `t_background`) and the
/// rest sees the spillover at `t_spill`.
///
/// Returns the total radiance as an occupation number, and the total zenith
/// opacity.
pub(crate) fn sky_radiance(
    freq: f64,
    layers: impl Iterator<Item = (f64, f64)>,
    air_mass: f64,
    t_background: f64,
    sky_coupling: f64,
    t_spill: f64,
) -> (f64, f64) {
    // Each layer is attenuated by the opacity of all the layers below it
    let (radiance, opacity) = layers.fold((0., 0.), |(radiance, opacity), (tau, t)| {
        let emission = planck(freq, t) * (1.0 - f64::exp(-air_mass * tau));
        (
            radiance + emission * f64::exp(-opacity * air_mass),
            opacity + tau,
        )
    });

    let radiance = sky_coupling
        * (radiance + planck(freq, t_background) * f64::exp(-opacity * air_mass))
        + (1.0 - sky_coupling) * planck(freq, t_spill);

    (radiance, opacity)
}

/// Equivalent blackbody temperature in K of a radiance (occupation number) at
/// `freq` GHz.
pub(crate) fn tebb(freq: f64, radiance: f64) -> f64 {
    H_DIV_K * freq / f64::ln_1p(1.0 / radiance)
}

/// Rayleigh-Jeans brightness temperature in K of a radiance (occupation
/// number) at `freq` GHz.
pub(crate) fn trj(freq: f64, radiance: f64) -> f64 {
    H_DIV_K * freq * radiance
}

/// Integrate per-layer values from the ground up to an altitude.
///
/// `base` is the altitude of the bottom of the first layer and `ref_altitude`
/// the top of the integration, both in m. `layers` yields (`thickness`,
/// `value`) from the ground upward. The layer straddling `ref_altitude`
/// contributes linearly with the fraction of it that lies below. Returns zero
/// when `ref_altitude` is at or below `base`, and the full sum when it is
/// above the top of the profile.
pub(crate) fn integrate_up_to(
    base: f64,
    ref_altitude: f64,
    layers: impl Iterator<Item = (f64, f64)>,
) -> f64 {
    if ref_altitude <= base {
        return 0.;
    }

    let mut bottom = base;
    let mut sum = 0.;
    for (thickness, value) in layers {
        let top = bottom + thickness;
        if top >= ref_altitude {
            let fraction = (ref_altitude - bottom) / thickness;
            return sum + fraction * value;
        }
        sum += value;
        bottom = top;
    }
    sum
}

/// Convert a phase delay in degrees at `freq` GHz into a path length in mm.
pub(crate) fn path_length(freq: f64, phase_delay: f64) -> f64 {
    // wavelength in m
    let wavelength = SPEED_OF_LIGHT / (freq * 1e9);
    (wavelength / 360.0) * phase_delay * 1e3
}
