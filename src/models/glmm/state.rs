//! Parameter state of a GLMM chain.

use serde::{Deserialize, Serialize};

use crate::models::fixed_effect::FixedEffectTerm;
use crate::models::observation::ObservationSet;
use crate::models::random_effect::RandomEffectTerm;
use crate::utils::max_abs_diff;

/// Every parameter block of the model plus the derived linear predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub fixed_coefficients: Vec<f64>,
    /// One latent field per random-effect term.
    pub fields: Vec<Vec<f64>>,
    pub precision_multipliers: Vec<f64>,
    /// `(slope, intercept)` per observation set.
    pub recalibrations: Vec<[f64; 2]>,
    /// `baseline + Xβ + Σ_k field_k`, node-indexed.
    pub linear_predictor: Vec<f64>,
}

impl ParameterState {
    /// Starting state: prior-mean coefficients, zero fields, prior-mean
    /// multipliers and the configured recalibration coefficients.
    #[must_use]
    pub fn initial(
        node_count: usize,
        baseline: f64,
        random_effects: &[RandomEffectTerm],
        fixed_effects: &FixedEffectTerm,
        observations: &[ObservationSet],
    ) -> Self {
        let mut state = Self {
            fixed_coefficients: fixed_effects.initial_coefficients(),
            fields: random_effects
                .iter()
                .map(|term| vec![0.0; term.node_count()])
                .collect(),
            precision_multipliers: random_effects
                .iter()
                .map(|term| term.hyperprior().initial_multiplier())
                .collect(),
            recalibrations: observations
                .iter()
                .map(|set| set.recalibration().initial_coefficients())
                .collect(),
            linear_predictor: Vec::new(),
        };
        state.linear_predictor =
            PredictorParts::all().assemble(node_count, baseline, random_effects, fixed_effects, &state);
        state
    }

    /// Whether every stored value is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.fixed_coefficients.iter().all(|value| value.is_finite())
            && self.fields.iter().flatten().all(|value| value.is_finite())
            && self
                .precision_multipliers
                .iter()
                .all(|value| value.is_finite() && *value > 0.0)
            && self.recalibrations.iter().flatten().all(|value| value.is_finite())
            && self.linear_predictor.iter().all(|value| value.is_finite())
    }

    /// Largest absolute change of any parameter relative to `previous`.
    #[must_use]
    pub fn max_parameter_change(&self, previous: &Self) -> f64 {
        let fields = self
            .fields
            .iter()
            .zip(&previous.fields)
            .map(|(current, before)| max_abs_diff(current, before))
            .fold(0.0, f64::max);
        let recalibrations = self
            .recalibrations
            .iter()
            .zip(&previous.recalibrations)
            .map(|(current, before)| max_abs_diff(current, before))
            .fold(0.0, f64::max);
        max_abs_diff(&self.fixed_coefficients, &previous.fixed_coefficients)
            .max(fields)
            .max(max_abs_diff(
                &self.precision_multipliers,
                &previous.precision_multipliers,
            ))
            .max(recalibrations)
    }
}

/// Which additive parts enter an assembled predictor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PredictorParts {
    pub skip_field: Option<usize>,
    pub skip_fixed: bool,
}

impl PredictorParts {
    pub(crate) const fn all() -> Self {
        Self {
            skip_field: None,
            skip_fixed: false,
        }
    }

    pub(crate) const fn without_field(term: usize) -> Self {
        Self {
            skip_field: Some(term),
            skip_fixed: false,
        }
    }

    pub(crate) const fn without_fixed() -> Self {
        Self {
            skip_field: None,
            skip_fixed: true,
        }
    }

    /// Sum the selected parts from scratch.
    pub(crate) fn assemble(
        self,
        node_count: usize,
        baseline: f64,
        random_effects: &[RandomEffectTerm],
        fixed_effects: &FixedEffectTerm,
        state: &ParameterState,
    ) -> Vec<f64> {
        let mut predictor = if self.skip_fixed {
            vec![0.0; node_count]
        } else {
            fixed_effects.contribution(&state.fixed_coefficients, node_count)
        };
        for value in &mut predictor {
            *value += baseline;
        }
        for (term_index, (term, field)) in random_effects.iter().zip(&state.fields).enumerate() {
            if self.skip_field == Some(term_index) {
                continue;
            }
            for (value, effect) in predictor.iter_mut().zip(term.contribution(field)) {
                *value += effect;
            }
        }
        predictor
    }
}
