/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Fixed-effect covariate term of the node linear predictor.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Fixed-effect (covariate) term of the linear predictor.

use faer::Mat;

use crate::models::glmm::{ConfigError, GlmmError};
use crate::models::priors::GaussianPrior;
use crate::utils::{dense_mul_vec, matrix_is_finite, sparse_diagonal};

/// Covariate effects `Xβ` with an independent Gaussian prior on `β`.
#[derive(Debug, Clone, Default)]
pub enum FixedEffectTerm {
    /// No covariates; contributes zero.
    #[default]
    Absent,
    /// Coefficients estimated with a Gaussian block update.
    Estimated {
        /// Nodes × covariates design matrix.
        covariates: Mat<f64>,
        prior_mean: Vec<f64>,
        /// Diagonal prior precision, one entry per covariate.
        prior_precision: Vec<f64>,
    },
}

impl FixedEffectTerm {
    /// Estimated term with the same prior mean and precision for every coefficient.
    #[must_use]
    pub fn estimated(covariates: Mat<f64>, prior_mean: f64, prior_precision: f64) -> Self {
        let count = covariates.ncols();
        Self::Estimated {
            covariates,
            prior_mean: vec![prior_mean; count],
            prior_precision: vec![prior_precision; count],
        }
    }

    /// Number of coefficients; zero when absent.
    #[must_use]
    pub fn coefficient_count(&self) -> usize {
        match self {
            Self::Absent => 0,
            Self::Estimated { covariates, .. } => covariates.ncols(),
        }
    }

    #[must_use]
    pub const fn covariates(&self) -> Option<&Mat<f64>> {
        match self {
            Self::Absent => None,
            Self::Estimated { covariates, .. } => Some(covariates),
        }
    }

    /// # Errors
    ///
    /// Returns `GlmmError` for empty or non-finite covariates, mis-sized
    /// priors, or non-positive prior precision.
    pub fn validate(&self, node_count: usize) -> Result<(), GlmmError> {
        let Self::Estimated {
            covariates,
            prior_mean,
            prior_precision,
        } = self
        else {
            return Ok(());
        };
        if covariates.ncols() == 0 {
            return Err(ConfigError::EmptyCovariates.into());
        }
        if covariates.nrows() != node_count {
            return Err(GlmmError::dimension_mismatch(
                "covariate rows",
                node_count,
                covariates.nrows(),
            ));
        }
        if prior_mean.len() != covariates.ncols() {
            return Err(GlmmError::dimension_mismatch(
                "fixed-effect prior mean",
                covariates.ncols(),
                prior_mean.len(),
            ));
        }
        if prior_precision.len() != covariates.ncols() {
            return Err(GlmmError::dimension_mismatch(
                "fixed-effect prior precision",
                covariates.ncols(),
                prior_precision.len(),
            ));
        }
        if !matrix_is_finite(covariates) {
            return Err(ConfigError::NonFiniteCovariates.into());
        }
        let prior_ok = prior_mean.iter().all(|value| value.is_finite())
            && prior_precision
                .iter()
                .all(|value| value.is_finite() && *value > 0.0);
        if !prior_ok {
            return Err(ConfigError::InvalidCoefficientPrior.into());
        }
        Ok(())
    }

    /// Starting coefficients: the prior mean.
    #[must_use]
    pub fn initial_coefficients(&self) -> Vec<f64> {
        match self {
            Self::Absent => Vec::new(),
            Self::Estimated { prior_mean, .. } => prior_mean.clone(),
        }
    }

    /// `Xβ` over all nodes; zero when absent.
    #[must_use]
    pub fn contribution(&self, coefficients: &[f64], node_count: usize) -> Vec<f64> {
        match self {
            Self::Absent => vec![0.0; node_count],
            Self::Estimated { covariates, .. } => dense_mul_vec(covariates, coefficients),
        }
    }

    #[must_use]
    pub fn prior(&self) -> Option<GaussianPrior> {
        match self {
            Self::Absent => None,
            Self::Estimated {
                prior_mean,
                prior_precision,
                ..
            } => sparse_diagonal(prior_precision)
                .ok()
                .map(|precision| GaussianPrior::new(prior_mean.clone(), precision)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn design() -> Mat<f64> {
        Mat::from_fn(3, 2, |row, col| if col == 0 { 1.0 } else { row as f64 })
    }

    #[test]
    fn absent_term_contributes_zero() {
        let term = FixedEffectTerm::Absent;
        assert_eq!(term.coefficient_count(), 0);
        assert_eq!(term.contribution(&[], 4), vec![0.0; 4]);
        assert!(term.validate(4).is_ok());
        assert!(term.prior().is_none());
    }

    #[test]
    fn estimated_contribution_is_design_times_coefficients() {
        let term = FixedEffectTerm::estimated(design(), 0.0, 0.5);
        let contribution = term.contribution(&[1.0, 2.0], 3);
        assert_relative_eq!(contribution[0], 1.0);
        assert_relative_eq!(contribution[2], 5.0);
        assert_eq!(term.initial_coefficients(), vec![0.0, 0.0]);
    }

    #[test]
    fn validation_rejects_bad_configuration() {
        let empty = FixedEffectTerm::estimated(Mat::zeros(3, 0), 0.0, 1.0);
        assert!(matches!(
            empty.validate(3),
            Err(GlmmError::Configuration(ConfigError::EmptyCovariates))
        ));

        let wrong_rows = FixedEffectTerm::estimated(design(), 0.0, 1.0);
        assert!(matches!(
            wrong_rows.validate(4),
            Err(GlmmError::DimensionMismatch { expected: 4, found: 3, .. })
        ));

        let zero_precision = FixedEffectTerm::estimated(design(), 0.0, 0.0);
        assert!(matches!(
            zero_precision.validate(3),
            Err(GlmmError::Configuration(ConfigError::InvalidCoefficientPrior))
        ));

        let short_mean = FixedEffectTerm::Estimated {
            covariates: design(),
            prior_mean: vec![0.0],
            prior_precision: vec![1.0, 1.0],
        };
        assert!(matches!(
            short_mean.validate(3),
            Err(GlmmError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
    }
}
