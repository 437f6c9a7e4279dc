/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Observation sets linking the node predictor to surveillance data sources.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Observation sets
//!
//! Each set maps the node linear predictor `η` to its own observations:
//! `μ = slope · g⁻¹(Cη) + intercept` where `C` is the set's sparse projection
//! and `g⁻¹` its inverse link, then scores the observed values with its
//! likelihood family and precision.

use faer::sparse::SparseColMat;
use serde::{Deserialize, Serialize};

use crate::models::glmm::{ConfigError, GlmmError};
use crate::models::likelihood::{LikelihoodFamily, LinkFunction};
use crate::models::priors::GaussianPrior;
use crate::utils::{LinalgError, sparse_diagonal, sparse_from_entries, sparse_rows};

/// Smallest working weight used for curvature in the predictor space.
pub const MIN_WORKING_WEIGHT: f64 = 1.0e-10;

/// Observation precision shared by a set or given per observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationPrecision {
    Scalar(f64),
    PerObservation(Vec<f64>),
}

impl ObservationPrecision {
    #[must_use]
    pub fn precision_at(&self, index: usize) -> f64 {
        match self {
            Self::Scalar(value) => *value,
            Self::PerObservation(values) => values[index],
        }
    }
}

/// Linear correction applied on the mean scale of a secondary data source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Recalibration {
    /// `μ = g⁻¹(Cη)`.
    Identity,
    /// Known slope and intercept.
    Fixed { slope: f64, intercept: f64 },
    /// `(slope, intercept)` sampled with an independent Gaussian prior.
    Estimated {
        prior_mean: [f64; 2],
        /// Diagonal prior precision of `(slope, intercept)`.
        prior_precision: [f64; 2],
    },
}

/// Tag of a [`Recalibration`], recorded in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalibrationKind {
    Identity,
    Fixed,
    Estimated,
}

impl Recalibration {
    #[must_use]
    pub const fn kind(self) -> RecalibrationKind {
        match self {
            Self::Identity => RecalibrationKind::Identity,
            Self::Fixed { .. } => RecalibrationKind::Fixed,
            Self::Estimated { .. } => RecalibrationKind::Estimated,
        }
    }

    /// Starting `(slope, intercept)`.
    #[must_use]
    pub const fn initial_coefficients(self) -> [f64; 2] {
        match self {
            Self::Identity => [1.0, 0.0],
            Self::Fixed { slope, intercept } => [slope, intercept],
            Self::Estimated { prior_mean, .. } => prior_mean,
        }
    }

    #[must_use]
    pub fn prior(self) -> Option<GaussianPrior> {
        match self {
            Self::Estimated {
                prior_mean,
                prior_precision,
            } => sparse_diagonal(&prior_precision)
                .ok()
                .map(|precision| GaussianPrior::new(prior_mean.to_vec(), precision)),
            Self::Identity | Self::Fixed { .. } => None,
        }
    }

    fn is_valid(self) -> bool {
        match self {
            Self::Identity => true,
            Self::Fixed { slope, intercept } => slope.is_finite() && intercept.is_finite(),
            Self::Estimated {
                prior_mean,
                prior_precision,
            } => {
                prior_mean.iter().all(|value| value.is_finite())
                    && prior_precision
                        .iter()
                        .all(|value| value.is_finite() && *value > 0.0)
            }
        }
    }
}

/// Gradient and curvature of a log-likelihood with respect to the node predictor.
#[derive(Debug, Clone)]
pub struct PredictorCurvature {
    pub gradient: Vec<f64>,
    /// Triplets of the positive semi-definite working information `Cᵀ W C`.
    entries: Vec<(usize, usize, f64)>,
}

impl PredictorCurvature {
    #[must_use]
    pub fn zeros(node_count: usize) -> Self {
        Self {
            gradient: vec![0.0; node_count],
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.gradient.len()
    }

    /// Sparse working information, with duplicate triplets summed.
    ///
    /// # Errors
    ///
    /// Returns `LinalgError::SparseConstruction` if a triplet lies outside the node range.
    pub fn information(&self) -> Result<SparseColMat<usize, f64>, LinalgError> {
        let node_count = self.node_count();
        sparse_from_entries(node_count, node_count, self.entries.iter().copied())
    }
}

/// Gradient and curvature with respect to `(slope, intercept)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecalibrationCurvature {
    pub gradient: [f64; 2],
    pub information: [[f64; 2]; 2],
}

/// One observation stream.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    projection: SparseColMat<usize, f64>,
    rows: Vec<Vec<(usize, f64)>>,
    link: LinkFunction,
    family: LikelihoodFamily,
    precision: ObservationPrecision,
    recalibration: Recalibration,
}

impl ObservationSet {
    /// Set with an identity link, unit precision and no recalibration.
    #[must_use]
    pub fn new(projection: SparseColMat<usize, f64>, family: LikelihoodFamily) -> Self {
        let rows = sparse_rows(&projection);
        Self {
            projection,
            rows,
            link: LinkFunction::Identity,
            family,
            precision: ObservationPrecision::Scalar(1.0),
            recalibration: Recalibration::Identity,
        }
    }

    #[must_use]
    pub fn with_link(mut self, link: LinkFunction) -> Self {
        self.link = link;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: ObservationPrecision) -> Self {
        self.precision = precision;
        self
    }

    #[must_use]
    pub fn with_recalibration(mut self, recalibration: Recalibration) -> Self {
        self.recalibration = recalibration;
        self
    }

    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.projection.nrows()
    }

    #[must_use]
    pub const fn projection(&self) -> &SparseColMat<usize, f64> {
        &self.projection
    }

    #[must_use]
    pub const fn link(&self) -> LinkFunction {
        self.link
    }

    #[must_use]
    pub const fn family(&self) -> LikelihoodFamily {
        self.family
    }

    #[must_use]
    pub const fn precision(&self) -> &ObservationPrecision {
        &self.precision
    }

    #[must_use]
    pub const fn recalibration(&self) -> Recalibration {
        self.recalibration
    }

    /// # Errors
    ///
    /// Returns `GlmmError` if the projection, precision, support or
    /// recalibration of set `set` is invalid for a model with `node_count` nodes.
    pub fn validate(&self, set: usize, node_count: usize) -> Result<(), GlmmError> {
        if self.projection.ncols() != node_count {
            return Err(GlmmError::dimension_mismatch(
                format!("observation set {set} projection columns"),
                node_count,
                self.projection.ncols(),
            ));
        }
        let finite_projection = self
            .rows
            .iter()
            .flatten()
            .all(|(_, value)| value.is_finite());
        if !finite_projection {
            return Err(ConfigError::NonFiniteProjection { set }.into());
        }
        let rows = self.observation_count();
        match &self.precision {
            ObservationPrecision::Scalar(value) => {
                if !(value.is_finite() && *value > 0.0) {
                    return Err(ConfigError::InvalidObservationPrecision {
                        set,
                        index: 0,
                        value: *value,
                    }
                    .into());
                }
            }
            ObservationPrecision::PerObservation(values) => {
                if values.len() != rows {
                    return Err(GlmmError::dimension_mismatch(
                        format!("observation set {set} precision vector"),
                        rows,
                        values.len(),
                    ));
                }
                if let Some((index, &value)) = values
                    .iter()
                    .enumerate()
                    .find(|(_, value)| !(value.is_finite() && **value > 0.0))
                {
                    return Err(
                        ConfigError::InvalidObservationPrecision { set, index, value }.into(),
                    );
                }
            }
        }
        if !self.family.is_valid() {
            return Err(ConfigError::InvalidSupport { set }.into());
        }
        if set == 0 && self.recalibration != Recalibration::Identity {
            return Err(ConfigError::RecalibrationOnFirstSet.into());
        }
        if !self.recalibration.is_valid() {
            return Err(ConfigError::InvalidRecalibration { set }.into());
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `GlmmError` if `observed` has the wrong length or leaves the support.
    pub fn validate_observed(&self, set: usize, observed: &[f64]) -> Result<(), GlmmError> {
        if observed.len() != self.observation_count() {
            return Err(GlmmError::dimension_mismatch(
                format!("observation set {set} observed values"),
                self.observation_count(),
                observed.len(),
            ));
        }
        if let Some((index, &value)) = observed
            .iter()
            .enumerate()
            .find(|(_, value)| !self.family.supports(**value))
        {
            return Err(ConfigError::ObservationOutsideSupport { set, index, value }.into());
        }
        Ok(())
    }

    /// Projected predictor `Cη` for one observation row.
    fn projected(&self, row: usize, predictor: &[f64]) -> f64 {
        self.rows[row]
            .iter()
            .map(|&(node, weight)| weight * predictor[node])
            .sum()
    }

    /// Log-likelihood of `observed` given the node predictor and `(slope, intercept)`.
    #[must_use]
    pub fn log_likelihood(
        &self,
        predictor: &[f64],
        recalibration: [f64; 2],
        observed: &[f64],
    ) -> f64 {
        let [slope, intercept] = recalibration;
        observed
            .iter()
            .enumerate()
            .map(|(row, &value)| {
                let base = self.link.inverse(self.projected(row, predictor));
                let mean = slope.mul_add(base, intercept);
                self.family
                    .log_density(value, mean, self.precision.precision_at(row))
            })
            .sum()
    }

    /// Add this set's gradient and working information in the node predictor to `curvature`.
    ///
    /// Per observation the score `s` and information `h` in the mean are
    /// mapped through `dμ/dz = slope · g⁻¹'(z)`; the information is floored at
    /// [`MIN_WORKING_WEIGHT`].
    pub fn accumulate_curvature(
        &self,
        predictor: &[f64],
        recalibration: [f64; 2],
        observed: &[f64],
        curvature: &mut PredictorCurvature,
    ) {
        let [slope, intercept] = recalibration;
        for (row, &value) in observed.iter().enumerate() {
            let z = self.projected(row, predictor);
            let mean = slope.mul_add(self.link.inverse(z), intercept);
            let (score, information) =
                self.family
                    .score_and_information(value, mean, self.precision.precision_at(row));
            let chain = slope * self.link.inverse_derivative(z);
            let score_z = score * chain;
            let weight = (information * chain * chain).max(MIN_WORKING_WEIGHT);
            let entries = &self.rows[row];
            for &(node, coefficient) in entries {
                curvature.gradient[node] += coefficient * score_z;
                for &(other, other_coefficient) in entries {
                    curvature
                        .entries
                        .push((node, other, weight * coefficient * other_coefficient));
                }
            }
        }
    }

    /// Gradient and working information with respect to `(slope, intercept)`.
    #[must_use]
    pub fn recalibration_curvature(
        &self,
        predictor: &[f64],
        recalibration: [f64; 2],
        observed: &[f64],
    ) -> RecalibrationCurvature {
        let [slope, intercept] = recalibration;
        let mut curvature = RecalibrationCurvature::default();
        for (row, &value) in observed.iter().enumerate() {
            let base = self.link.inverse(self.projected(row, predictor));
            let mean = slope.mul_add(base, intercept);
            let (score, information) =
                self.family
                    .score_and_information(value, mean, self.precision.precision_at(row));
            curvature.gradient[0] += score * base;
            curvature.gradient[1] += score;
            curvature.information[0][0] += information * base * base;
            curvature.information[0][1] += information * base;
            curvature.information[1][1] += information;
        }
        curvature.information[1][0] = curvature.information[0][1];
        curvature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sparse_from_entries;
    use approx::assert_relative_eq;

    fn identity_projection(n: usize) -> SparseColMat<usize, f64> {
        sparse_from_entries(n, n, (0..n).map(|idx| (idx, idx, 1.0))).expect("identity")
    }

    #[test]
    fn identity_recalibration_matches_explicit_unit_slope() {
        let set = ObservationSet::new(identity_projection(2), LikelihoodFamily::Gaussian);
        let eta = [0.3, -0.2];
        let observed = [0.1, 0.0];
        let identity = set.log_likelihood(&eta, Recalibration::Identity.initial_coefficients(), &observed);
        let fixed = set.log_likelihood(
            &eta,
            Recalibration::Fixed {
                slope: 1.0,
                intercept: 0.0,
            }
            .initial_coefficients(),
            &observed,
        );
        assert_eq!(identity.to_bits(), fixed.to_bits());
    }

    #[test]
    fn gradient_matches_finite_difference_through_link_and_projection() {
        let projection =
            sparse_from_entries(2, 3, [(0, 0, 0.5), (0, 1, 0.5), (1, 2, 1.0)]).expect("projection");
        let set = ObservationSet::new(projection, LikelihoodFamily::Beta)
            .with_link(LinkFunction::Logistic)
            .with_precision(ObservationPrecision::PerObservation(vec![20.0, 40.0]));
        let eta = [-1.0, -0.5, 0.2];
        let observed = [0.3, 0.6];
        let recal = [0.9, 0.02];
        let mut curvature = PredictorCurvature::zeros(3);
        set.accumulate_curvature(&eta, recal, &observed, &mut curvature);

        let step = 1.0e-6;
        for node in 0..3 {
            let mut up = eta;
            let mut down = eta;
            up[node] += step;
            down[node] -= step;
            let numeric = (set.log_likelihood(&up, recal, &observed)
                - set.log_likelihood(&down, recal, &observed))
                / (2.0 * step);
            assert_relative_eq!(curvature.gradient[node], numeric, epsilon = 1.0e-5);
        }
        let information =
            crate::utils::sparse_to_dense(&curvature.information().expect("in-range triplets"));
        assert!(information[(0, 0)] > 0.0);
        assert_relative_eq!(information[(0, 1)], information[(1, 0)]);
        assert_relative_eq!(information[(0, 2)], 0.0);
    }

    #[test]
    fn recalibration_gradient_matches_finite_difference() {
        let set = ObservationSet::new(identity_projection(3), LikelihoodFamily::default())
            .with_precision(ObservationPrecision::Scalar(50.0));
        let eta = [0.1, 0.2, 0.15];
        let observed = [0.12, 0.25, 0.2];
        let recal = [1.1, 0.01];
        let curvature = set.recalibration_curvature(&eta, recal, &observed);
        let step = 1.0e-6;
        for index in 0..2 {
            let mut up = recal;
            let mut down = recal;
            up[index] += step;
            down[index] -= step;
            let numeric = (set.log_likelihood(&eta, up, &observed)
                - set.log_likelihood(&eta, down, &observed))
                / (2.0 * step);
            assert_relative_eq!(curvature.gradient[index], numeric, epsilon = 1.0e-5);
        }
        assert_relative_eq!(curvature.information[1][1], 150.0);
    }

    #[test]
    fn validation_catches_configuration_errors() {
        let set = ObservationSet::new(identity_projection(3), LikelihoodFamily::default());
        assert!(matches!(
            set.validate(0, 4),
            Err(GlmmError::DimensionMismatch { .. })
        ));

        let short = set
            .clone()
            .with_precision(ObservationPrecision::PerObservation(vec![1.0, 2.0]));
        assert!(matches!(
            short.validate(1, 3),
            Err(GlmmError::DimensionMismatch { expected: 3, found: 2, .. })
        ));

        let negative = set
            .clone()
            .with_precision(ObservationPrecision::PerObservation(vec![1.0, -2.0, 1.0]));
        assert!(matches!(
            negative.validate(1, 3),
            Err(GlmmError::Configuration(ConfigError::InvalidObservationPrecision {
                set: 1,
                index: 1,
                ..
            }))
        ));

        let recalibrated_first = set.clone().with_recalibration(Recalibration::Fixed {
            slope: 2.0,
            intercept: 0.0,
        });
        assert!(matches!(
            recalibrated_first.validate(0, 3),
            Err(GlmmError::Configuration(ConfigError::RecalibrationOnFirstSet))
        ));
        assert!(recalibrated_first.validate(1, 3).is_ok());
    }

    #[test]
    fn observed_values_must_lie_in_support() {
        let set = ObservationSet::new(identity_projection(2), LikelihoodFamily::default());
        assert!(set.validate_observed(0, &[0.1, 0.2]).is_ok());
        assert!(matches!(
            set.validate_observed(0, &[0.1, -0.2]),
            Err(GlmmError::Configuration(ConfigError::ObservationOutsideSupport {
                set: 0,
                index: 1,
                ..
            }))
        ));
        assert!(matches!(
            set.validate_observed(0, &[0.1]),
            Err(GlmmError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            set.validate_observed(0, &[0.1, f64::NAN]),
            Err(GlmmError::Configuration(ConfigError::ObservationOutsideSupport { .. }))
        ));
    }
}
