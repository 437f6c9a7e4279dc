/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Gamma hyperpriors and sparse Gaussian priors for the GMRF model.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Prior specifications and log-density helpers.

use faer::sparse::SparseColMat;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::utils::{LinalgError, SparseCholesky, sparse_mul_vec, sparse_quadratic_form};

/// Smallest multiplier returned by a conditional mode.
pub const MIN_MULTIPLIER: f64 = 1.0e-8;

/// `Gamma(shape, rate)` hyperprior on a precision multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaHyperprior {
    pub shape: f64,
    pub rate: f64,
}

impl GammaHyperprior {
    #[must_use]
    pub const fn new(shape: f64, rate: f64) -> Self {
        Self { shape, rate }
    }

    /// Shape and rate matching a target mean and variance.
    ///
    /// `rate = mean / variance` and `shape = mean * rate`.
    #[must_use]
    pub fn from_mean_variance(mean: f64, variance: f64) -> Self {
        let rate = mean / variance;
        Self {
            shape: mean * rate,
            rate,
        }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.shape.is_finite() && self.rate.is_finite() && self.shape > 0.0 && self.rate > 0.0
    }

    #[must_use]
    pub fn mean(self) -> f64 {
        self.shape / self.rate
    }

    #[must_use]
    pub fn variance(self) -> f64 {
        self.shape / (self.rate * self.rate)
    }

    /// Conjugate update after observing a Gaussian vector of effective rank
    /// `rank` whose scaled quadratic form is `quadratic`.
    #[must_use]
    pub fn posterior(self, rank: f64, quadratic: f64) -> Self {
        Self {
            shape: 0.5f64.mul_add(rank, self.shape),
            rate: 0.5f64.mul_add(quadratic, self.rate),
        }
    }

    /// Mode of the distribution, floored at [`MIN_MULTIPLIER`].
    #[must_use]
    pub fn mode(self) -> f64 {
        ((self.shape - 1.0) / self.rate).max(MIN_MULTIPLIER)
    }

    #[must_use]
    pub fn log_density(self, value: f64) -> f64 {
        log_gamma_density(value, self.shape, self.rate)
    }
}

/// Prior on a random-effect precision multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Hyperprior {
    /// Multiplier stays at 1.
    Fixed,
    /// Multiplier is sampled from its conjugate Gamma conditional.
    Gamma(GammaHyperprior),
}

impl Hyperprior {
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::Fixed => true,
            Self::Gamma(gamma) => gamma.is_valid(),
        }
    }

    /// Starting multiplier: the prior mean, or 1 when fixed.
    #[must_use]
    pub fn initial_multiplier(self) -> f64 {
        match self {
            Self::Fixed => 1.0,
            Self::Gamma(gamma) => gamma.mean(),
        }
    }

    #[must_use]
    pub const fn is_fixed(self) -> bool {
        matches!(self, Self::Fixed)
    }
}

/// Multivariate Gaussian prior in sparse precision form.
#[derive(Debug, Clone)]
pub struct GaussianPrior {
    pub mean: Vec<f64>,
    pub precision: SparseColMat<usize, f64>,
}

impl GaussianPrior {
    #[must_use]
    pub const fn new(mean: Vec<f64>, precision: SparseColMat<usize, f64>) -> Self {
        Self { mean, precision }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// `-½ (θ - m)ᵀ P (θ - m)`, dropping the normalizing constant.
    #[must_use]
    pub fn log_kernel(&self, theta: &[f64]) -> f64 {
        let centered: Vec<f64> = theta
            .iter()
            .zip(&self.mean)
            .map(|(value, mean)| value - mean)
            .collect();
        -0.5 * sparse_quadratic_form(&self.precision, &centered)
    }

    /// `P (θ - m)`.
    #[must_use]
    pub fn precision_times_centered(&self, theta: &[f64]) -> Vec<f64> {
        let centered: Vec<f64> = theta
            .iter()
            .zip(&self.mean)
            .map(|(value, mean)| value - mean)
            .collect();
        sparse_mul_vec(&self.precision, &centered)
    }

    /// Full log-density, including `½ log |P|`.
    ///
    /// # Errors
    ///
    /// Returns `LinalgError` if the precision is not positive definite.
    pub fn log_density(&self, theta: &[f64]) -> Result<f64, LinalgError> {
        let factor = SparseCholesky::new(&self.precision)?;
        let dim = crate::utils::usize_to_f64(self.dim());
        Ok(0.5f64.mul_add(
            factor.log_determinant(),
            -0.5 * dim * std::f64::consts::TAU.ln(),
        ) + self.log_kernel(theta))
    }
}

/// Log-density for `Gamma(shape, rate)`.
#[must_use]
pub fn log_gamma_density(value: f64, shape: f64, rate: f64) -> f64 {
    if !(value > 0.0 && shape > 0.0 && rate > 0.0) {
        return f64::NEG_INFINITY;
    }
    shape.mul_add(rate.ln(), -ln_gamma(shape)) + (shape - 1.0).mul_add(value.ln(), -rate * value)
}
