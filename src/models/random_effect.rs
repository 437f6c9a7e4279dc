/////////////////////////////////////////////////////////////////////////////////////////////\
//
// GMRF random-effect terms built from Kronecker sums of structural matrices.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Random-effect terms
//!
//! A GMRF latent field over the model nodes. The prior precision is
//! `τ · Σ_d w_d · (I ⊗ … ⊗ Q_d ⊗ … ⊗ I)` where `Q_d` is the structural matrix
//! of dimension `d` and `τ = base_precision × multiplier`. Node indices are
//! row-major over the dimensions, the first dimension varying slowest.

use std::sync::Arc;

use faer::sparse::SparseColMat;
use rand::rngs::StdRng;

use crate::inference::sample_gamma;
use crate::models::glmm::{ConfigError, GlmmError};
use crate::models::priors::{GaussianPrior, Hyperprior};
use crate::models::structure::StructuralMatrix;
use crate::utils::{
    for_each_sparse_entry, sparse_from_entries, sparse_mul_vec, usize_to_f64,
};

/// One GMRF random effect.
#[derive(Debug, Clone)]
pub struct RandomEffectTerm {
    dimensions: Vec<Arc<StructuralMatrix>>,
    weights: Vec<f64>,
    base_precision: f64,
    hyperprior: Hyperprior,
    structure: SparseColMat<usize, f64>,
}

impl RandomEffectTerm {
    /// Term with unit weights on every dimension.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError` if the Kronecker-sum structure cannot be assembled.
    pub fn new(
        dimensions: Vec<Arc<StructuralMatrix>>,
        base_precision: f64,
        hyperprior: Hyperprior,
    ) -> Result<Self, GlmmError> {
        let weights = vec![1.0; dimensions.len()];
        Self::weighted(dimensions, weights, base_precision, hyperprior)
    }

    /// Term with an explicit weight per dimension.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError::DimensionMismatch` if there is not one weight per dimension.
    pub fn weighted(
        dimensions: Vec<Arc<StructuralMatrix>>,
        weights: Vec<f64>,
        base_precision: f64,
        hyperprior: Hyperprior,
    ) -> Result<Self, GlmmError> {
        if weights.len() != dimensions.len() {
            return Err(GlmmError::dimension_mismatch(
                "random-effect dimension weights",
                dimensions.len(),
                weights.len(),
            ));
        }
        let structure = kronecker_sum(&dimensions, &weights)?;
        Ok(Self {
            dimensions,
            weights,
            base_precision,
            hyperprior,
            structure,
        })
    }

    /// Checks parameters and the node count implied by the dimensions.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError` describing the first invalid setting.
    pub fn validate(&self, term: usize, node_count: usize) -> Result<(), GlmmError> {
        if self.dimensions.is_empty() {
            return Err(ConfigError::NoDimensions { term }.into());
        }
        for (dimension, &weight) in self.weights.iter().enumerate() {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(ConfigError::InvalidDimensionWeight {
                    term,
                    dimension,
                    weight,
                }
                .into());
            }
        }
        if !(self.base_precision.is_finite() && self.base_precision > 0.0) {
            return Err(ConfigError::InvalidBasePrecision {
                term,
                value: self.base_precision,
            }
            .into());
        }
        if !self.hyperprior.is_valid() {
            return Err(ConfigError::InvalidHyperprior { term }.into());
        }
        if self.node_count() != node_count {
            return Err(GlmmError::dimension_mismatch(
                format!("random effect {term} node count"),
                node_count,
                self.node_count(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn dimensions(&self) -> &[Arc<StructuralMatrix>] {
        &self.dimensions
    }

    #[must_use]
    pub fn dimension_sizes(&self) -> Vec<usize> {
        self.dimensions.iter().map(|matrix| matrix.dim()).collect()
    }

    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[must_use]
    pub const fn base_precision(&self) -> f64 {
        self.base_precision
    }

    #[must_use]
    pub const fn hyperprior(&self) -> Hyperprior {
        self.hyperprior
    }

    /// Number of field entries, the product of the dimension sizes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.dimensions.iter().map(|matrix| matrix.dim()).product()
    }

    /// Nullity of the weighted Kronecker sum after regularization.
    #[must_use]
    pub fn total_nullity(&self) -> usize {
        self.dimensions
            .iter()
            .map(|matrix| matrix.nullity_after_regularization())
            .product()
    }

    #[must_use]
    pub fn effective_rank(&self) -> usize {
        self.node_count() - self.total_nullity()
    }

    /// Unscaled weighted Kronecker-sum structure `Σ_d w_d (I ⊗ Q_d ⊗ I)`.
    #[must_use]
    pub const fn structure(&self) -> &SparseColMat<usize, f64> {
        &self.structure
    }

    /// `τ = base_precision × multiplier`.
    #[must_use]
    pub fn precision(&self, multiplier: f64) -> f64 {
        self.base_precision * multiplier
    }

    /// `xᵀ K x` for the unscaled structure `K`.
    #[must_use]
    pub fn quadratic_form(&self, field: &[f64]) -> f64 {
        sparse_mul_vec(&self.structure, field)
            .iter()
            .zip(field)
            .map(|(kx, x)| kx * x)
            .sum()
    }

    /// Additive contribution of the field to the node linear predictor.
    #[must_use]
    pub const fn contribution<'a>(&self, field: &'a [f64]) -> &'a [f64] {
        field
    }

    /// Zero-mean Gaussian prior of the field given the multiplier.
    #[must_use]
    pub fn prior(&self, multiplier: f64) -> GaussianPrior {
        let tau = self.precision(multiplier);
        let mut precision = self.structure.clone();
        for value in precision.val_mut() {
            *value *= tau;
        }
        GaussianPrior::new(vec![0.0; self.node_count()], precision)
    }

    /// Log prior of the field and multiplier, up to constants.
    #[must_use]
    pub fn log_prior(&self, field: &[f64], multiplier: f64) -> f64 {
        let tau = self.precision(multiplier);
        if !(tau > 0.0) {
            return f64::NEG_INFINITY;
        }
        let rank = usize_to_f64(self.effective_rank());
        let field_term = 0.5f64.mul_add(rank * tau.ln(), -0.5 * tau * self.quadratic_form(field));
        match self.hyperprior {
            Hyperprior::Fixed => field_term,
            Hyperprior::Gamma(gamma) => field_term + gamma.log_density(multiplier),
        }
    }

    /// Conjugate Gibbs draw of the multiplier given the field.
    ///
    /// `Gamma(α + r/2, β + base · xᵀKx / 2)` in shape/rate form; fixed
    /// hyperpriors always return 1.
    pub fn sample_multiplier(&self, field: &[f64], rng: &mut StdRng) -> f64 {
        match self.hyperprior {
            Hyperprior::Fixed => 1.0,
            Hyperprior::Gamma(gamma) => {
                let conditional = gamma.posterior(
                    usize_to_f64(self.effective_rank()),
                    self.base_precision * self.quadratic_form(field),
                );
                sample_gamma(rng, conditional.shape, 1.0 / conditional.rate)
            }
        }
    }

    /// Conditional mode of the multiplier given the field.
    #[must_use]
    pub fn mode_multiplier(&self, field: &[f64]) -> f64 {
        match self.hyperprior {
            Hyperprior::Fixed => 1.0,
            Hyperprior::Gamma(gamma) => gamma
                .posterior(
                    usize_to_f64(self.effective_rank()),
                    self.base_precision * self.quadratic_form(field),
                )
                .mode(),
        }
    }
}

fn kronecker_sum(
    dimensions: &[Arc<StructuralMatrix>],
    weights: &[f64],
) -> Result<SparseColMat<usize, f64>, GlmmError> {
    let sizes: Vec<usize> = dimensions.iter().map(|matrix| matrix.dim()).collect();
    let total: usize = sizes.iter().product();
    let mut entries = Vec::new();
    for (d, (matrix, &weight)) in dimensions.iter().zip(weights).enumerate() {
        let stride: usize = sizes[d + 1..].iter().product();
        let block = sizes[d] * stride;
        let outer_count = total / block.max(1);
        for_each_sparse_entry(matrix.matrix(), |row, col, value| {
            for outer in 0..outer_count {
                for inner in 0..stride {
                    let base = outer * block + inner;
                    entries.push((base + row * stride, base + col * stride, weight * value));
                }
            }
        });
    }
    sparse_from_entries(total, total, entries).map_err(|error| {
        GlmmError::Configuration(ConfigError::Structure(error.into()))
    })
}
