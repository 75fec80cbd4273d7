//! Coil and pickup physics shared by the regulator and the sweeps.
//!
//! All functions are pure and operate in SI units (farad, henry, hertz,
//! tesla, metre); callers convert to the bench-facing units (pF, mH, kHz,
//! mT, mm) at the edges.

use std::f64::consts::PI;

/// Resonance frequency of a series LC tank in hertz.
///
/// `f = 1 / (2π·√(L·C))`
pub fn resonance_frequency(c_farad: f64, l_henry: f64) -> f64 {
    1.0 / (2.0 * PI * (l_henry * c_farad).sqrt())
}

/// Capacitance that places the LC resonance at `f_hz`, in farad.
///
/// Inverse of [`resonance_frequency`]: `C = 1 / ((2π·f)²·L)`.
pub fn capacitance_for_resonance(f_hz: f64, l_henry: f64) -> f64 {
    let omega = 2.0 * PI * f_hz;
    1.0 / (omega * omega * l_henry)
}

/// Magnetic flux density amplitude seen by a pickup coil, in tesla.
///
/// From Faraday's law for a sinusoidal field of frequency `f_hz` inducing a
/// peak voltage `v_peak` across a coil with `windings` turns of radius
/// `radius_m`:
///
/// `B = V̂ / (N · π·r² · 2π·f)`
pub fn field_from_induced_voltage(windings: f64, radius_m: f64, v_peak: f64, f_hz: f64) -> f64 {
    v_peak / (windings * PI * radius_m * radius_m * 2.0 * PI * f_hz)
}

/// Trailing moving average with a running sum.
///
/// The window grows from one sample at the start of the slice until it
/// reaches `window`, so the output has the same length as the input and no
/// start-up samples are dropped. A window of 0 or 1 returns the input
/// unchanged.
pub fn moving_average(data: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || data.is_empty() {
        return data.to_vec();
    }
    let mut smoothed = Vec::with_capacity(data.len());
    let mut sum = 0.0;
    for (i, &value) in data.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= data[i - window];
        }
        let len = (i + 1).min(window) as f64;
        smoothed.push(sum / len);
    }
    smoothed
}
