//! PERT three-point duration estimates.
//!
//! - Optimistic (O): best case
//! - Most likely (M): normal conditions
//! - Pessimistic (P): worst case
//!
//! Mean = (O + 4M + P) / 6, StdDev = (P - O) / 6. All values are working hours.
//!
//! # References
//!
//! Malcolm et al. (1959), "Application of a technique for R&D program evaluation"

use serde::{Deserialize, Serialize};

/// PERT duration estimate in working hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PertEstimate {
    pub optimistic: f64,
    pub most_likely: f64,
    pub pessimistic: f64,
}

impl PertEstimate {
    /// Creates a new estimate.
    pub fn new(optimistic: f64, most_likely: f64, pessimistic: f64) -> Self {
        Self {
            optimistic,
            most_likely,
            pessimistic,
        }
    }

    /// Symmetric estimate around `most_likely`.
    pub fn symmetric(most_likely: f64, spread: f64) -> Self {
        Self::new(most_likely - spread, most_likely, most_likely + spread)
    }

    /// Expected duration `(O + 4M + P) / 6`.
    pub fn mean(&self) -> f64 {
        (self.optimistic + 4.0 * self.most_likely + self.pessimistic) / 6.0
    }

    /// Standard deviation `(P - O) / 6`.
    pub fn std_dev(&self) -> f64 {
        (self.pessimistic - self.optimistic) / 6.0
    }

    /// Variance.
    pub fn variance(&self) -> f64 {
        let sd = self.std_dev();
        sd * sd
    }

    /// Whether O ≤ M ≤ P and O ≥ 0.
    pub fn is_consistent(&self) -> bool {
        self.optimistic >= 0.0
            && self.optimistic <= self.most_likely
            && self.most_likely <= self.pessimistic
    }
}

/// Probability that a normally distributed total with the given mean and
/// standard deviation finishes within `target`.
///
/// A zero standard deviation degenerates to a step function.
pub fn probability_of_completion(mean: f64, std_dev: f64, target: f64) -> f64 {
    if std_dev <= 0.0 {
        return if target >= mean { 1.0 } else { 0.0 };
    }
    standard_normal_cdf((target - mean) / std_dev)
}

/// Φ(z) via the Abramowitz & Stegun 7.1.26 erf approximation (|ε| < 1.5e-7).
fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
