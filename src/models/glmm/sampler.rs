//! Epoch updates for MCMC and MAP.
//!
//! One epoch visits the blocks in a fixed order: every random-effect field,
//! every precision multiplier, the fixed-effect coefficients and finally the
//! recalibration of every set with estimated coefficients. The linear
//! predictor is rebuilt from scratch after each block that moves it.

use faer::Mat;
use rand::rngs::StdRng;

use super::block::{BlockTarget, WorkingApproximation, metropolis_step, newton_step};
use super::state::{ParameterState, PredictorParts};
use super::types::{BlockId, InstabilityKind};
use crate::inference::ProposalStats;
use crate::models::fixed_effect::FixedEffectTerm;
use crate::models::observation::{ObservationSet, PredictorCurvature};
use crate::models::priors::GaussianPrior;
use crate::models::random_effect::RandomEffectTerm;
use crate::utils::{
    dense_mul_vec, dense_transpose_mul_vec, sparse_from_dense, sparse_from_entries, sparse_mul_vec,
};

/// Failure of a block update, tagged with the block.
pub(crate) type BlockFailure = (BlockId, InstabilityKind);

/// Read-only view of the model and the data for one update call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SamplerContext<'a> {
    pub node_count: usize,
    pub baseline: f64,
    pub random_effects: &'a [RandomEffectTerm],
    pub fixed_effects: &'a FixedEffectTerm,
    pub observations: &'a [ObservationSet],
    pub observed: &'a [Vec<f64>],
}

impl SamplerContext<'_> {
    fn assemble(&self, parts: PredictorParts, state: &ParameterState) -> Vec<f64> {
        parts.assemble(
            self.node_count,
            self.baseline,
            self.random_effects,
            self.fixed_effects,
            state,
        )
    }

    /// Full linear predictor of `state`.
    pub(crate) fn predictor(&self, state: &ParameterState) -> Vec<f64> {
        self.assemble(PredictorParts::all(), state)
    }

    /// Summed log-likelihood of every observation set.
    pub(crate) fn log_likelihood(&self, predictor: &[f64], recalibrations: &[[f64; 2]]) -> f64 {
        self.observations
            .iter()
            .zip(self.observed)
            .zip(recalibrations)
            .map(|((set, observed), recalibration)| {
                set.log_likelihood(predictor, *recalibration, observed)
            })
            .sum()
    }

    /// Unnormalized joint log posterior of `state`.
    pub(crate) fn log_posterior(&self, state: &ParameterState) -> f64 {
        let fields: f64 = self
            .random_effects
            .iter()
            .zip(&state.fields)
            .zip(&state.precision_multipliers)
            .map(|((term, field), multiplier)| term.log_prior(field, *multiplier))
            .sum();
        let fixed = self
            .fixed_effects
            .prior()
            .map_or(0.0, |prior| prior.log_kernel(&state.fixed_coefficients));
        let recalibrations: f64 = self
            .observations
            .iter()
            .zip(&state.recalibrations)
            .filter_map(|(set, coefficients)| {
                set.recalibration()
                    .prior()
                    .map(|prior| prior.log_kernel(coefficients))
            })
            .sum();
        self.log_likelihood(&state.linear_predictor, &state.recalibrations)
            + fields
            + fixed
            + recalibrations
    }

    fn curvature(&self, predictor: &[f64], recalibrations: &[[f64; 2]]) -> PredictorCurvature {
        let mut curvature = PredictorCurvature::zeros(self.node_count);
        for ((set, observed), recalibration) in self
            .observations
            .iter()
            .zip(self.observed)
            .zip(recalibrations)
        {
            set.accumulate_curvature(predictor, *recalibration, observed, &mut curvature);
        }
        curvature
    }

    /// Rebuild the predictor after `block` moved and check the state.
    fn refresh(&self, state: &mut ParameterState, block: BlockId) -> Result<(), BlockFailure> {
        state.linear_predictor = self.predictor(state);
        if state.is_finite() {
            Ok(())
        } else {
            Err((block, InstabilityKind::NonFiniteState))
        }
    }
}

fn shifted(offset: &[f64], delta: &[f64]) -> Vec<f64> {
    offset.iter().zip(delta).map(|(base, value)| base + value).collect()
}

/// Conditional of field `k`: the predictor is `offset + field`.
struct FieldTarget<'s, 'a> {
    context: &'s SamplerContext<'a>,
    recalibrations: &'s [[f64; 2]],
    offset: Vec<f64>,
    prior: GaussianPrior,
}

impl<'s, 'a> FieldTarget<'s, 'a> {
    fn new(context: &'s SamplerContext<'a>, state: &'s ParameterState, term: usize) -> Self {
        Self {
            context,
            recalibrations: &state.recalibrations,
            offset: context.assemble(PredictorParts::without_field(term), state),
            prior: context.random_effects[term].prior(state.precision_multipliers[term]),
        }
    }
}

impl BlockTarget for FieldTarget<'_, '_> {
    fn prior(&self) -> &GaussianPrior {
        &self.prior
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        self.context
            .log_likelihood(&shifted(&self.offset, theta), self.recalibrations)
    }

    fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind> {
        let curvature = self
            .context
            .curvature(&shifted(&self.offset, theta), self.recalibrations);
        let information = curvature
            .information()
            .map_err(|_| InstabilityKind::NonFiniteCurvature)?;
        Ok(WorkingApproximation {
            gradient: curvature.gradient,
            information,
        })
    }
}

/// Conditional of the coefficients: the predictor is `offset + Xβ`.
struct FixedEffectTarget<'s, 'a> {
    context: &'s SamplerContext<'a>,
    recalibrations: &'s [[f64; 2]],
    covariates: &'s Mat<f64>,
    offset: Vec<f64>,
    prior: GaussianPrior,
}

impl FixedEffectTarget<'_, '_> {
    fn predictor(&self, coefficients: &[f64]) -> Vec<f64> {
        shifted(&self.offset, &dense_mul_vec(self.covariates, coefficients))
    }
}

impl BlockTarget for FixedEffectTarget<'_, '_> {
    fn prior(&self) -> &GaussianPrior {
        &self.prior
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        self.context
            .log_likelihood(&self.predictor(theta), self.recalibrations)
    }

    fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind> {
        let curvature = self
            .context
            .curvature(&self.predictor(theta), self.recalibrations);
        let node_information = curvature
            .information()
            .map_err(|_| InstabilityKind::NonFiniteCurvature)?;
        let x = self.covariates;
        // Xᵀ H X, one sparse product per covariate column.
        let weighted: Vec<Vec<f64>> = (0..x.ncols())
            .map(|col| {
                let column: Vec<f64> = (0..x.nrows()).map(|row| x[(row, col)]).collect();
                sparse_mul_vec(&node_information, &column)
            })
            .collect();
        let information = Mat::from_fn(x.ncols(), x.ncols(), |row, col| {
            (0..x.nrows())
                .map(|node| x[(node, row)] * weighted[col][node])
                .sum()
        });
        Ok(WorkingApproximation {
            gradient: dense_transpose_mul_vec(x, &curvature.gradient),
            information: sparse_from_dense(&information)
                .map_err(|_| InstabilityKind::NonFiniteCurvature)?,
        })
    }
}

/// Conditional of `(slope, intercept)` of one set given the predictor.
struct RecalibrationTarget<'s> {
    set: &'s ObservationSet,
    observed: &'s [f64],
    predictor: &'s [f64],
    prior: GaussianPrior,
}

impl BlockTarget for RecalibrationTarget<'_> {
    fn prior(&self) -> &GaussianPrior {
        &self.prior
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        self.set
            .log_likelihood(self.predictor, [theta[0], theta[1]], self.observed)
    }

    fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind> {
        let curvature =
            self.set
                .recalibration_curvature(self.predictor, [theta[0], theta[1]], self.observed);
        let entries = (0..2).flat_map(|row| {
            (0..2).map(move |col| (row, col, curvature.information[row][col]))
        });
        Ok(WorkingApproximation {
            gradient: curvature.gradient.to_vec(),
            information: sparse_from_entries(2, 2, entries)
                .map_err(|_| InstabilityKind::NonFiniteCurvature)?,
        })
    }
}

/// Metropolis-Hastings counters per block, in update order.
#[derive(Debug, Clone, Default)]
pub(crate) struct AcceptanceCounts {
    blocks: Vec<(BlockId, ProposalStats)>,
}

impl AcceptanceCounts {
    fn record(&mut self, block: BlockId, accepted: bool) {
        if let Some((_, stats)) = self.blocks.iter_mut().find(|(id, _)| *id == block) {
            stats.record(accepted);
        } else {
            let mut stats = ProposalStats::default();
            stats.record(accepted);
            self.blocks.push((block, stats));
        }
    }

    pub(crate) fn into_inner(self) -> Vec<(BlockId, ProposalStats)> {
        self.blocks
    }
}

/// How a Gaussian block moves within an epoch.
enum BlockMove<'r> {
    Sample {
        rng: &'r mut StdRng,
        counts: &'r mut AcceptanceCounts,
    },
    Ascend,
}

impl BlockMove<'_> {
    fn apply<T: BlockTarget>(
        &mut self,
        block: BlockId,
        target: &T,
        current: &[f64],
    ) -> Result<Vec<f64>, BlockFailure> {
        match self {
            Self::Sample { rng, counts } => {
                let (next, accepted) =
                    metropolis_step(target, current, rng).map_err(|kind| (block, kind))?;
                counts.record(block, accepted);
                Ok(next)
            }
            Self::Ascend => newton_step(target, current).map_err(|kind| (block, kind)),
        }
    }
}

/// One Metropolis-within-Gibbs sweep.
pub(crate) fn mcmc_epoch(
    context: &SamplerContext<'_>,
    state: &mut ParameterState,
    rng: &mut StdRng,
    counts: &mut AcceptanceCounts,
) -> Result<(), BlockFailure> {
    update_fields(
        context,
        state,
        &mut BlockMove::Sample {
            rng: &mut *rng,
            counts: &mut *counts,
        },
    )?;
    for (index, term) in context.random_effects.iter().enumerate() {
        if term.hyperprior().is_fixed() {
            continue;
        }
        let multiplier = term.sample_multiplier(&state.fields[index], rng);
        set_multiplier(state, index, multiplier)?;
    }
    let mut mover = BlockMove::Sample { rng, counts };
    update_fixed_effects(context, state, &mut mover)?;
    update_recalibrations(context, state, &mut mover)
}

/// One coordinate-ascent sweep towards the posterior mode.
pub(crate) fn map_epoch(
    context: &SamplerContext<'_>,
    state: &mut ParameterState,
) -> Result<(), BlockFailure> {
    let mut mover = BlockMove::Ascend;
    update_fields(context, state, &mut mover)?;
    for (index, term) in context.random_effects.iter().enumerate() {
        if term.hyperprior().is_fixed() {
            continue;
        }
        let multiplier = term.mode_multiplier(&state.fields[index]);
        set_multiplier(state, index, multiplier)?;
    }
    update_fixed_effects(context, state, &mut mover)?;
    update_recalibrations(context, state, &mut mover)
}

fn set_multiplier(
    state: &mut ParameterState,
    index: usize,
    multiplier: f64,
) -> Result<(), BlockFailure> {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err((BlockId::Precision(index), InstabilityKind::NonFiniteState));
    }
    state.precision_multipliers[index] = multiplier;
    Ok(())
}

fn update_fields(
    context: &SamplerContext<'_>,
    state: &mut ParameterState,
    mover: &mut BlockMove<'_>,
) -> Result<(), BlockFailure> {
    for index in 0..context.random_effects.len() {
        let block = BlockId::Field(index);
        let target = FieldTarget::new(context, state, index);
        let field = mover.apply(block, &target, &state.fields[index])?;
        state.fields[index] = field;
        context.refresh(state, block)?;
    }
    Ok(())
}

fn update_fixed_effects(
    context: &SamplerContext<'_>,
    state: &mut ParameterState,
    mover: &mut BlockMove<'_>,
) -> Result<(), BlockFailure> {
    let (Some(covariates), Some(prior)) = (
        context.fixed_effects.covariates(),
        context.fixed_effects.prior(),
    ) else {
        return Ok(());
    };
    let block = BlockId::FixedEffects;
    let target = FixedEffectTarget {
        context,
        recalibrations: &state.recalibrations,
        covariates,
        offset: context.assemble(PredictorParts::without_fixed(), state),
        prior,
    };
    let coefficients = mover.apply(block, &target, &state.fixed_coefficients)?;
    state.fixed_coefficients = coefficients;
    context.refresh(state, block)
}

fn update_recalibrations(
    context: &SamplerContext<'_>,
    state: &mut ParameterState,
    mover: &mut BlockMove<'_>,
) -> Result<(), BlockFailure> {
    for (index, (set, observed)) in context
        .observations
        .iter()
        .zip(context.observed)
        .enumerate()
    {
        let Some(prior) = set.recalibration().prior() else {
            continue;
        };
        let block = BlockId::Recalibration(index);
        let target = RecalibrationTarget {
            set,
            observed,
            predictor: &state.linear_predictor,
            prior,
        };
        let next = mover.apply(block, &target, &state.recalibrations[index])?;
        if next.iter().any(|value| !value.is_finite()) {
            return Err((block, InstabilityKind::NonFiniteState));
        }
        state.recalibrations[index] = [next[0], next[1]];
    }
    Ok(())
}
