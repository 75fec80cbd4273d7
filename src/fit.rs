//! Resonance-curve fitting for the capacitance scan.
//!
//! The series LCR current response is modeled as
//!
//! `I(f; f0, Q) = V0 / sqrt(R² + Q²·R²·(f²−f0²)² / (f·f0)²)`
//!
//! with `V0 = I_peak·R` fixed from the data and `(f0, Q)` free. The detuning
//! term `(f²−f0²)/(f·f0)` is invariant under uniform scaling of the
//! frequency axis, so the fit runs directly in kHz and `f0` is reported in
//! kHz. A small damped Gauss-Newton (Levenberg-Marquardt) loop with a
//! numeric Jacobian is sufficient for two parameters.

use crate::error::{BenchError, Result};

/// Lower bound for the fitted resonance frequency in kHz.
pub const F0_MIN_KHZ: f64 = 50.0;
/// Upper bound for the fitted resonance frequency in kHz.
pub const F0_MAX_KHZ: f64 = 1000.0;
/// Upper bound for the fitted quality factor.
pub const Q_MAX: f64 = 1000.0;
/// Initial quality-factor guess.
pub const Q_INITIAL: f64 = 120.0;

const MAX_ITERATIONS: usize = 100;
const COST_TOLERANCE: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

/// Result of a successful resonance fit.
#[derive(Debug, Clone, Copy)]
pub struct ResonanceFit {
    /// Fitted resonance frequency in kHz.
    pub f0_khz: f64,
    /// Fitted quality factor.
    pub q: f64,
    /// Peak current implied by the fit window, in ampere.
    pub i_peak: f64,
    /// Parameter covariance estimate, ordered `[[f0f0, f0q], [qf0, qq]]`.
    pub covariance: [[f64; 2]; 2],
}

impl ResonanceFit {
    /// Model current at `f_khz` for the fitted parameters. Used to draw
    /// the fitted curve next to the measured trace.
    pub fn current_at(&self, f_khz: f64) -> f64 {
        let detune = (f_khz * f_khz - self.f0_khz * self.f0_khz) / (f_khz * self.f0_khz);
        self.i_peak / (1.0 + self.q * self.q * detune * detune).sqrt()
    }
}

/// Series-LCR current model with amplitude and resistance pinned.
#[derive(Debug, Clone, Copy)]
struct ResonanceModel {
    r: f64,
    v0: f64,
}

impl ResonanceModel {
    fn current(&self, f_khz: f64, f0_khz: f64, q: f64) -> f64 {
        let detune = (f_khz * f_khz - f0_khz * f0_khz) / (f_khz * f0_khz);
        self.v0 / (self.r * self.r * (1.0 + q * q * detune * detune)).sqrt()
    }
}

/// Fit the resonance model to `(freq_khz, current_a)` samples.
///
/// `circuit_resistance` is the series resistance in ohm from the global
/// settings. Fails with [`BenchError::FitFailure`] when the data is too
/// short, contains non-finite samples, or the iteration does not converge.
pub fn fit_resonance(
    freq_khz: &[f64],
    current_a: &[f64],
    circuit_resistance: f64,
) -> Result<ResonanceFit> {
    if freq_khz.len() != current_a.len() {
        return Err(BenchError::FitFailure(format!(
            "axis and data length differ ({} vs {})",
            freq_khz.len(),
            current_a.len()
        )));
    }
    if freq_khz.len() < 3 {
        return Err(BenchError::FitFailure(format!(
            "need at least 3 samples, got {}",
            freq_khz.len()
        )));
    }
    if freq_khz
        .iter()
        .chain(current_a.iter())
        .any(|v| !v.is_finite())
    {
        return Err(BenchError::FitFailure("non-finite sample in input".into()));
    }
    if circuit_resistance <= 0.0 {
        return Err(BenchError::FitFailure(format!(
            "circuit resistance must be positive, got {circuit_resistance}"
        )));
    }

    // Peak current pins the model amplitude; its frequency seeds f0.
    let (peak_idx, &i_peak) = current_a
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| BenchError::FitFailure("empty input".into()))?;
    if i_peak <= 0.0 {
        return Err(BenchError::FitFailure(
            "peak current must be positive".into(),
        ));
    }
    let model = ResonanceModel {
        r: circuit_resistance,
        v0: i_peak * circuit_resistance,
    };

    let mut params = [
        freq_khz[peak_idx].clamp(F0_MIN_KHZ, F0_MAX_KHZ),
        Q_INITIAL,
    ];
    let mut cost = sum_squares(&model, freq_khz, current_a, params);
    let mut lambda = 1e-3;
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(&model, freq_khz, current_a, params);

        // Damped normal equations: (JᵀJ + λ·diag(JᵀJ))·δ = −Jᵀr
        let a = [
            [jtj[0][0] * (1.0 + lambda), jtj[0][1]],
            [jtj[1][0], jtj[1][1] * (1.0 + lambda)],
        ];
        let delta = match solve_2x2(a, [-jtr[0], -jtr[1]]) {
            Some(d) => d,
            None => {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    return Err(BenchError::FitFailure("singular normal equations".into()));
                }
                continue;
            }
        };

        let trial = clamp_params([params[0] + delta[0], params[1] + delta[1]]);
        let trial_cost = sum_squares(&model, freq_khz, current_a, trial);

        if trial_cost.is_finite() && trial_cost < cost {
            let improvement = cost - trial_cost;
            params = trial;
            cost = trial_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if improvement <= COST_TOLERANCE * (1.0 + cost) {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break;
            }
        }
    }

    if !converged {
        return Err(BenchError::FitFailure(format!(
            "no convergence after {MAX_ITERATIONS} iterations (cost {cost:.3e})"
        )));
    }

    let covariance = covariance_estimate(&model, freq_khz, current_a, params, cost);
    Ok(ResonanceFit {
        f0_khz: params[0],
        q: params[1],
        i_peak,
        covariance,
    })
}

fn clamp_params(p: [f64; 2]) -> [f64; 2] {
    [p[0].clamp(F0_MIN_KHZ, F0_MAX_KHZ), p[1].clamp(0.0, Q_MAX)]
}

fn sum_squares(model: &ResonanceModel, freq: &[f64], data: &[f64], p: [f64; 2]) -> f64 {
    freq.iter()
        .zip(data)
        .map(|(&f, &y)| {
            let r = model.current(f, p[0], p[1]) - y;
            r * r
        })
        .sum()
}

/// Accumulate JᵀJ and Jᵀr with a central-difference Jacobian.
fn normal_equations(
    model: &ResonanceModel,
    freq: &[f64],
    data: &[f64],
    p: [f64; 2],
) -> ([[f64; 2]; 2], [f64; 2]) {
    let mut jtj = [[0.0; 2]; 2];
    let mut jtr = [0.0; 2];
    for (&f, &y) in freq.iter().zip(data) {
        let residual = model.current(f, p[0], p[1]) - y;
        let mut row = [0.0; 2];
        for k in 0..2 {
            let step = (p[k].abs() * 1e-6).max(1e-8);
            let mut hi = p;
            let mut lo = p;
            hi[k] += step;
            lo[k] -= step;
            row[k] = (model.current(f, hi[0], hi[1]) - model.current(f, lo[0], lo[1]))
                / (2.0 * step);
        }
        for i in 0..2 {
            jtr[i] += row[i] * residual;
            for j in 0..2 {
                jtj[i][j] += row[i] * row[j];
            }
        }
    }
    (jtj, jtr)
}

fn solve_2x2(a: [[f64; 2]; 2], b: [f64; 2]) -> Option<[f64; 2]> {
    let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
    if !det.is_finite() || det.abs() < 1e-300 {
        return None;
    }
    Some([
        (b[0] * a[1][1] - b[1] * a[0][1]) / det,
        (b[1] * a[0][0] - b[0] * a[1][0]) / det,
    ])
}

/// `σ²·(JᵀJ)⁻¹` with `σ² = SSE / (n − 2)`.
fn covariance_estimate(
    model: &ResonanceModel,
    freq: &[f64],
    data: &[f64],
    p: [f64; 2],
    sse: f64,
) -> [[f64; 2]; 2] {
    let (jtj, _) = normal_equations(model, freq, data, p);
    let dof = (freq.len().saturating_sub(2)).max(1) as f64;
    let sigma2 = sse / dof;
    let det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
    if !det.is_finite() || det.abs() < 1e-300 {
        return [[f64::NAN; 2]; 2];
    }
    [
        [sigma2 * jtj[1][1] / det, -sigma2 * jtj[0][1] / det],
        [-sigma2 * jtj[1][0] / det, sigma2 * jtj[0][0] / det],
    ]
}
