/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Likelihood families and link functions for surveillance observations.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Link functions, likelihood families and numerical-stability helpers.
//!
//! Every family is parameterized by its mean on the data scale and a
//! precision. `score_and_information` returns the derivative of the
//! log-density with respect to the mean together with a strictly positive
//! curvature used to build Newton/IWLS proposals.

use statrs::function::erf::erfc;
use statrs::function::gamma::{digamma, ln_gamma};

const EPS_PROBABILITY: f64 = 1.0e-12;
const LN_SQRT_TAU: f64 = 0.918_938_533_204_672_8;

/// Stable logistic transform.
#[must_use]
pub fn logistic_stable(value: f64) -> f64 {
    if value >= 0.0 {
        let z = (-value).exp();
        1.0 / (1.0 + z)
    } else {
        let z = value.exp();
        z / (1.0 + z)
    }
}

/// Bound probability away from exact 0 and 1.
#[must_use]
pub fn clamp_probability(probability: f64) -> f64 {
    probability.clamp(EPS_PROBABILITY, 1.0 - EPS_PROBABILITY)
}

/// Log-density of standard normal.
#[must_use]
pub fn log_standard_normal_pdf(value: f64) -> f64 {
    (-0.5 * value).mul_add(value, -LN_SQRT_TAU)
}

/// Upper tail `1 - Φ(x)`, exact at infinite arguments.
fn standard_normal_upper_tail(value: f64) -> f64 {
    if value == f64::INFINITY {
        0.0
    } else if value == f64::NEG_INFINITY {
        1.0
    } else {
        0.5 * erfc(value / std::f64::consts::SQRT_2)
    }
}

/// `ln(Φ(b) - Φ(a))` for `a < b`, computed in the tail that avoids cancellation.
///
/// Floored at `ln(f64::MIN_POSITIVE)`.
#[must_use]
pub fn log_standard_normal_interval(a: f64, b: f64) -> f64 {
    let mass = if a > 0.0 {
        standard_normal_upper_tail(a) - standard_normal_upper_tail(b)
    } else {
        standard_normal_upper_tail(-b) - standard_normal_upper_tail(-a)
    };
    mass.max(f64::MIN_POSITIVE).ln()
}

/// Trigamma function `ψ₁(x)` for `x > 0`.
#[must_use]
pub fn trigamma(value: f64) -> f64 {
    if !(value > 0.0) {
        return f64::NAN;
    }
    let mut x = value;
    let mut total = 0.0;
    while x < 10.0 {
        total += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let series = inv2.mul_add(
        inv2.mul_add(inv2.mul_add(inv2.mul_add(-1.0 / 30.0, 1.0 / 42.0), -1.0 / 30.0), 1.0 / 6.0),
        1.0,
    );
    total + inv * 0.5f64.mul_add(inv, series)
}

/// Inverse link `g⁻¹` mapping the linear predictor to the data scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkFunction {
    /// `μ = z`.
    #[default]
    Identity,
    /// `μ = 1 / (1 + e^{-z})`.
    Logistic,
    /// `μ = e^z`.
    Log,
}

impl LinkFunction {
    #[must_use]
    pub fn inverse(self, value: f64) -> f64 {
        match self {
            Self::Identity => value,
            Self::Logistic => logistic_stable(value),
            Self::Log => value.exp(),
        }
    }

    /// `d g⁻¹(z) / dz`.
    #[must_use]
    pub fn inverse_derivative(self, value: f64) -> f64 {
        match self {
            Self::Identity => 1.0,
            Self::Logistic => {
                let p = logistic_stable(value);
                p * (1.0 - p)
            }
            Self::Log => value.exp(),
        }
    }
}

/// Observation distribution given a mean and a precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LikelihoodFamily {
    /// Normal with precision `p`, truncated to `[lower, upper]`.
    TruncatedNormal { lower: f64, upper: f64 },
    /// Beta with mean `μ` and precision `φ` (`α = μφ`, `β = (1 - μ)φ`).
    Beta,
    /// Untruncated normal with precision `p`.
    Gaussian,
}

impl Default for LikelihoodFamily {
    fn default() -> Self {
        Self::TruncatedNormal {
            lower: 0.0,
            upper: f64::INFINITY,
        }
    }
}

impl LikelihoodFamily {
    /// Whether the family's own parameters are valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::TruncatedNormal { lower, upper } => {
                !lower.is_nan() && !upper.is_nan() && lower < upper
            }
            Self::Beta | Self::Gaussian => true,
        }
    }

    /// Whether `value` is a finite point of the support.
    #[must_use]
    pub fn supports(self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Self::TruncatedNormal { lower, upper } => (lower..=upper).contains(&value),
            Self::Beta => value > 0.0 && value < 1.0,
            Self::Gaussian => true,
        }
    }

    #[must_use]
    pub fn log_density(self, value: f64, mean: f64, precision: f64) -> f64 {
        if !(precision > 0.0 && mean.is_finite() && self.supports(value)) {
            return f64::NEG_INFINITY;
        }
        match self {
            Self::Gaussian => gaussian_log_density(value, mean, precision),
            Self::TruncatedNormal { lower, upper } => {
                let scale = precision.sqrt();
                gaussian_log_density(value, mean, precision)
                    - log_standard_normal_interval((lower - mean) * scale, (upper - mean) * scale)
            }
            Self::Beta => {
                if !(mean > 0.0 && mean < 1.0) {
                    return f64::NEG_INFINITY;
                }
                let alpha = mean * precision;
                let beta = (1.0 - mean) * precision;
                ln_gamma(precision) - ln_gamma(alpha) - ln_gamma(beta)
                    + (alpha - 1.0).mul_add(value.ln(), (beta - 1.0) * (-value).ln_1p())
            }
        }
    }

    /// Derivative of the log-density in the mean and a positive curvature.
    #[must_use]
    pub fn score_and_information(self, value: f64, mean: f64, precision: f64) -> (f64, f64) {
        match self {
            Self::Gaussian => (precision * (value - mean), precision),
            Self::TruncatedNormal { lower, upper } => {
                let scale = precision.sqrt();
                let a = (lower - mean) * scale;
                let b = (upper - mean) * scale;
                let log_mass = log_standard_normal_interval(a, b);
                let density_at = |point: f64| {
                    if point.is_finite() {
                        (log_standard_normal_pdf(point) - log_mass).exp()
                    } else {
                        0.0
                    }
                };
                let normalizer_slope = scale * (density_at(a) - density_at(b));
                (precision.mul_add(value - mean, -normalizer_slope), precision)
            }
            Self::Beta => {
                let mean = clamp_probability(mean);
                let alpha = mean * precision;
                let beta = (1.0 - mean) * precision;
                let logit_value = value.ln() - (-value).ln_1p();
                let score = precision * (logit_value - digamma(alpha) + digamma(beta));
                let information = precision * precision * (trigamma(alpha) + trigamma(beta));
                (score, information)
            }
        }
    }
}

fn gaussian_log_density(value: f64, mean: f64, precision: f64) -> f64 {
    let residual = value - mean;
    0.5f64.mul_add(precision.ln(), -LN_SQRT_TAU) - 0.5 * precision * residual * residual
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logistic_is_bounded() {
        let low = logistic_stable(-1_000.0);
        let high = logistic_stable(1_000.0);
        assert!(low >= 0.0);
        assert!(high <= 1.0);
    }

    #[test]
    fn link_derivatives_match_finite_differences() {
        let step = 1.0e-6;
        for link in [LinkFunction::Identity, LinkFunction::Logistic, LinkFunction::Log] {
            let z = 0.3;
            let numeric = (link.inverse(z + step) - link.inverse(z - step)) / (2.0 * step);
            assert_relative_eq!(link.inverse_derivative(z), numeric, epsilon = 1.0e-8);
        }
    }

    #[test]
    fn trigamma_matches_known_values() {
        let pi_sq_over_six = std::f64::consts::PI * std::f64::consts::PI / 6.0;
        assert_relative_eq!(trigamma(1.0), pi_sq_over_six, epsilon = 1.0e-10);
        assert_relative_eq!(trigamma(0.5), 3.0 * pi_sq_over_six, epsilon = 1.0e-10);
    }

    #[test]
    fn untruncated_normal_has_unit_mass() {
        assert_relative_eq!(
            log_standard_normal_interval(f64::NEG_INFINITY, f64::INFINITY),
            0.0,
            epsilon = 1.0e-14
        );
        assert_relative_eq!(
            log_standard_normal_interval(0.0, f64::INFINITY),
            0.5f64.ln(),
            epsilon = 1.0e-12
        );
    }

    #[test]
    fn deep_tail_mass_stays_finite() {
        let log_mass = log_standard_normal_interval(30.0, f64::INFINITY);
        assert!(log_mass.is_finite());
        assert!(log_mass < -400.0);
    }

    #[test]
    fn truncated_normal_at_zero_mean_doubles_density() {
        let family = LikelihoodFamily::default();
        let truncated = family.log_density(0.4, 0.0, 2.0);
        let full = LikelihoodFamily::Gaussian.log_density(0.4, 0.0, 2.0);
        assert_relative_eq!(truncated - full, std::f64::consts::LN_2, epsilon = 1.0e-12);
        assert!(!family.log_density(-0.1, 0.0, 2.0).is_finite());
    }

    #[test]
    fn scores_match_finite_differences() {
        let step = 1.0e-6;
        let cases = [
            (LikelihoodFamily::Gaussian, 0.2, 0.5, 3.0),
            (LikelihoodFamily::default(), 0.2, 0.1, 25.0),
            (LikelihoodFamily::Beta, 0.3, 0.4, 12.0),
        ];
        for (family, value, mean, precision) in cases {
            let numeric = (family.log_density(value, mean + step, precision)
                - family.log_density(value, mean - step, precision))
                / (2.0 * step);
            let (score, information) = family.score_and_information(value, mean, precision);
            assert_relative_eq!(score, numeric, epsilon = 1.0e-5, max_relative = 1.0e-5);
            assert!(information > 0.0);
        }
    }

    #[test]
    fn beta_support_excludes_endpoints() {
        assert!(!LikelihoodFamily::Beta.supports(0.0));
        assert!(!LikelihoodFamily::Beta.supports(1.0));
        assert!(LikelihoodFamily::Beta.supports(0.5));
        assert!(!LikelihoodFamily::Beta.log_density(0.5, 1.2, 3.0).is_finite());
    }

    #[test]
    fn inverted_truncation_bounds_are_invalid() {
        let family = LikelihoodFamily::TruncatedNormal {
            lower: 1.0,
            upper: 0.0,
        };
        assert!(!family.is_valid());
    }
}
