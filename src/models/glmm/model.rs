//! The GLMM model and its update loop.

use faer::Mat;
use log::{debug, info, warn};

use super::checkpoint::{
    ChainCheckpoint, ChainStore, ChainToken, ModelSettings, ModelShape, RandomEffectSettings,
};
use super::diagnostics::{ChainDiagnostics, chain_diagnostics};
use super::posterior::{
    ParameterSummary, PosteriorDraw, PosteriorResult, PosteriorSamples, PosteriorSummary,
    summarize_linear_predictor, summarize_posterior,
};
use super::sampler::{AcceptanceCounts, SamplerContext, map_epoch, mcmc_epoch};
use super::state::ParameterState;
use super::types::{
    BlockId, ChainPersistence, ConfigError, GlmmError, InferenceMethod, InstabilityKind,
    ModelPhase, UpdateConfig, UpdateReport,
};
use crate::inference::{MapOptions, McmcSchedule, ProposalStats, epoch_rng};
use crate::models::fixed_effect::FixedEffectTerm;
use crate::models::likelihood::logistic_stable;
use crate::models::observation::ObservationSet;
use crate::models::random_effect::RandomEffectTerm;

/// Everything needed to build a [`GlmmModel`].
#[derive(Debug, Clone, Default)]
pub struct GlmmConfig {
    pub node_count: usize,
    /// Constant offset of the linear predictor.
    pub baseline: f64,
    pub random_effects: Vec<RandomEffectTerm>,
    pub fixed_effects: FixedEffectTerm,
    /// Observation streams; the first one fixes the reference scale.
    pub observations: Vec<ObservationSet>,
}

impl GlmmConfig {
    #[must_use]
    pub fn new(node_count: usize, baseline: f64) -> Self {
        Self {
            node_count,
            baseline,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_random_effect(mut self, term: RandomEffectTerm) -> Self {
        self.random_effects.push(term);
        self
    }

    #[must_use]
    pub fn with_fixed_effects(mut self, fixed_effects: FixedEffectTerm) -> Self {
        self.fixed_effects = fixed_effects;
        self
    }

    #[must_use]
    pub fn with_observation_set(mut self, set: ObservationSet) -> Self {
        self.observations.push(set);
        self
    }

    /// # Errors
    ///
    /// Returns `GlmmError` for the first invalid node count, baseline, term
    /// or observation set.
    pub fn validate(&self) -> Result<(), GlmmError> {
        if self.node_count == 0 {
            return Err(ConfigError::ZeroNodes.into());
        }
        if !self.baseline.is_finite() {
            return Err(ConfigError::NonFiniteBaseline(self.baseline).into());
        }
        for (index, term) in self.random_effects.iter().enumerate() {
            term.validate(index, self.node_count)?;
        }
        self.fixed_effects.validate(self.node_count)?;
        if self.observations.is_empty() {
            return Err(ConfigError::NoObservationSets.into());
        }
        for (index, set) in self.observations.iter().enumerate() {
            set.validate(index, self.node_count)?;
        }
        Ok(())
    }

    fn shape(&self) -> ModelShape {
        ModelShape {
            node_count: self.node_count,
            field_lengths: self
                .random_effects
                .iter()
                .map(RandomEffectTerm::node_count)
                .collect(),
            coefficient_count: self.fixed_effects.coefficient_count(),
            observation_counts: self
                .observations
                .iter()
                .map(ObservationSet::observation_count)
                .collect(),
            recalibrations: self
                .observations
                .iter()
                .map(|set| set.recalibration().kind())
                .collect(),
        }
    }

    fn settings(&self) -> ModelSettings {
        ModelSettings {
            baseline: self.baseline,
            random_effects: self
                .random_effects
                .iter()
                .map(|term| RandomEffectSettings {
                    dimension_sizes: term.dimension_sizes(),
                    weights: term.weights().to_vec(),
                    base_precision: term.base_precision(),
                    hyperprior: term.hyperprior(),
                    regularization_epsilons: term
                        .dimensions()
                        .iter()
                        .map(|matrix| matrix.regularization_epsilon())
                        .collect(),
                })
                .collect(),
            recalibrations: self
                .observations
                .iter()
                .map(ObservationSet::recalibration)
                .collect(),
        }
    }

    fn context<'a>(&'a self, observed: &'a [Vec<f64>]) -> SamplerContext<'a> {
        SamplerContext {
            node_count: self.node_count,
            baseline: self.baseline,
            random_effects: &self.random_effects,
            fixed_effects: &self.fixed_effects,
            observations: &self.observations,
            observed,
        }
    }
}

/// Hierarchical GLMM with GMRF random effects.
///
/// Construction validates the configuration and sets the initial state; all
/// inference happens in [`GlmmModel::update`].
#[derive(Debug, Clone)]
pub struct GlmmModel {
    config: GlmmConfig,
    phase: ModelPhase,
    state: ParameterState,
    epochs_completed: usize,
    result: Option<PosteriorResult>,
}

impl GlmmModel {
    /// # Errors
    ///
    /// Returns `GlmmError` if the configuration is invalid.
    pub fn new(config: GlmmConfig) -> Result<Self, GlmmError> {
        config.validate()?;
        let state = ParameterState::initial(
            config.node_count,
            config.baseline,
            &config.random_effects,
            &config.fixed_effects,
            &config.observations,
        );
        Ok(Self {
            config,
            phase: ModelPhase::Constructed,
            state,
            epochs_completed: 0,
            result: None,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &GlmmConfig {
        &self.config
    }

    #[must_use]
    pub const fn phase(&self) -> ModelPhase {
        self.phase
    }

    /// Current state; after a failed update, the state at the start of the
    /// failing epoch.
    #[must_use]
    pub const fn state(&self) -> &ParameterState {
        &self.state
    }

    /// Epochs completed by the chain, across calls and resumes.
    #[must_use]
    pub const fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    /// Result of the latest update; partial draws after a failed one.
    #[must_use]
    pub const fn result(&self) -> Option<&PosteriorResult> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn shape(&self) -> ModelShape {
        self.config.shape()
    }

    /// Configuration values recorded in every checkpoint and checked on resume.
    #[must_use]
    pub fn settings(&self) -> ModelSettings {
        self.config.settings()
    }

    /// Run the configured epochs against `observed`, one vector per set.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError` for invalid observations or update configuration,
    /// a missing or failing chain store, an unusable checkpoint, or a
    /// numerical instability inside an epoch.
    pub fn update(
        &mut self,
        observed: &[Vec<f64>],
        config: &UpdateConfig,
        store: Option<&mut dyn ChainStore>,
    ) -> Result<UpdateReport, GlmmError> {
        config.validate()?;
        self.validate_observed(observed)?;
        let store = if config.persistence.requires_store() {
            Some(store.ok_or(ConfigError::MissingChainStore)?)
        } else {
            None
        };
        let mut checkpointer = Checkpointer {
            store,
            interval: config.checkpoint_interval,
            shape: self.config.shape(),
            settings: self.config.settings(),
            seed: config.seed(),
            last_saved: None,
        };
        if let ChainPersistence::Resume(token) = &config.persistence {
            let (epochs_completed, state) = checkpointer.resume(token)?;
            self.epochs_completed = epochs_completed;
            self.state = state;
        }

        self.phase = ModelPhase::Updating;
        self.result = None;
        let context = self.config.context(observed);
        self.state.linear_predictor = context.predictor(&self.state);
        if !context.log_posterior(&self.state).is_finite() {
            return Err(GlmmError::NumericalInstability {
                epoch: self.epochs_completed,
                block: BlockId::Initialization,
                kind: InstabilityKind::NonFiniteLogPosterior,
            });
        }

        let start_epoch = self.epochs_completed;
        info!(
            "starting {} update at epoch {start_epoch} with a budget of {} epochs",
            method_name(config.method),
            config.epoch_budget()
        );
        let mut run = ChainRun {
            context,
            state: &mut self.state,
            epochs_completed: &mut self.epochs_completed,
            checkpointer: &mut checkpointer,
        };
        let outcome = match config.method {
            InferenceMethod::Mcmc(schedule) => run.mcmc(schedule),
            InferenceMethod::Map(options) => run.map(options),
        };
        let FinishedRun {
            result,
            converged,
            acceptance,
        } = match outcome {
            Ok(finished) => finished,
            Err((error, partial)) => {
                self.result = partial;
                return Err(error);
            }
        };

        let retained_draws = result.samples().map_or(0, PosteriorSamples::len);
        self.result = Some(result);
        let checkpoint = checkpointer.save(self.epochs_completed, &self.state)?;
        self.phase = ModelPhase::Ready;
        let epochs_run = self.epochs_completed - start_epoch;
        info!(
            "update finished after {epochs_run} epochs ({} total, {retained_draws} retained)",
            self.epochs_completed
        );

        Ok(UpdateReport {
            epochs_run,
            epochs_completed_total: self.epochs_completed,
            retained_draws,
            acceptance,
            converged,
            checkpoint,
        })
    }

    fn validate_observed(&self, observed: &[Vec<f64>]) -> Result<(), GlmmError> {
        if observed.len() != self.config.observations.len() {
            return Err(GlmmError::dimension_mismatch(
                "observed value vectors",
                self.config.observations.len(),
                observed.len(),
            ));
        }
        for (index, (set, values)) in self.config.observations.iter().zip(observed).enumerate() {
            set.validate_observed(index, values)?;
        }
        Ok(())
    }

    fn ready_result(&self) -> Result<&PosteriorResult, GlmmError> {
        let not_ready = GlmmError::InvalidPhase {
            required: ModelPhase::Ready,
            actual: self.phase,
        };
        if self.phase != ModelPhase::Ready {
            return Err(not_ready);
        }
        self.result.as_ref().ok_or(not_ready)
    }

    /// Posterior mean (MCMC) or mode (MAP) of the node linear predictor.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError::InvalidPhase` unless the last update completed.
    pub fn posterior_mean_predictor(&self) -> Result<Vec<f64>, GlmmError> {
        Ok(self.ready_result()?.mean_linear_predictor())
    }

    /// Mean predictor arranged as `spatial × temporal`, node `s · temporal + t`
    /// at row `s`, column `t`.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError` if the model is not ready or the grid does not
    /// cover every node.
    pub fn predictor_grid(&self, spatial: usize, temporal: usize) -> Result<Mat<f64>, GlmmError> {
        let cells = spatial.saturating_mul(temporal);
        if cells != self.config.node_count {
            return Err(GlmmError::dimension_mismatch(
                "predictor grid cells",
                self.config.node_count,
                cells,
            ));
        }
        let mean = self.posterior_mean_predictor()?;
        Ok(Mat::from_fn(spatial, temporal, |row, col| {
            mean[row * temporal + col]
        }))
    }

    /// Logistic transform of [`GlmmModel::predictor_grid`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`GlmmModel::predictor_grid`].
    pub fn probability_grid(&self, spatial: usize, temporal: usize) -> Result<Mat<f64>, GlmmError> {
        let grid = self.predictor_grid(spatial, temporal)?;
        Ok(Mat::from_fn(spatial, temporal, |row, col| {
            logistic_stable(grid[(row, col)])
        }))
    }

    /// Node-wise predictor summaries.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError::InvalidPhase` unless the last update completed.
    pub fn predictor_summary(&self) -> Result<Vec<ParameterSummary>, GlmmError> {
        Ok(summarize_linear_predictor(self.ready_result()?))
    }

    /// # Errors
    ///
    /// Returns `GlmmError::InvalidPhase` unless the last update completed.
    pub fn posterior_summary(&self) -> Result<PosteriorSummary, GlmmError> {
        Ok(summarize_posterior(self.ready_result()?))
    }

    /// Trace diagnostics of the retained draws; `None` for MAP results.
    ///
    /// # Errors
    ///
    /// Returns `GlmmError::InvalidPhase` unless the last update completed.
    pub fn diagnostics(&self) -> Result<Option<ChainDiagnostics>, GlmmError> {
        Ok(self.ready_result()?.samples().map(chain_diagnostics))
    }
}

const fn method_name(method: InferenceMethod) -> &'static str {
    match method {
        InferenceMethod::Mcmc(_) => "MCMC",
        InferenceMethod::Map(_) => "MAP",
    }
}

/// Optional store plus what every checkpoint of this call records.
struct Checkpointer<'s> {
    store: Option<&'s mut dyn ChainStore>,
    interval: Option<usize>,
    shape: ModelShape,
    settings: ModelSettings,
    seed: Option<u64>,
    /// Epoch and token of the latest checkpoint written by this call.
    last_saved: Option<(usize, ChainToken)>,
}

impl Checkpointer<'_> {
    fn resume(&self, token: &ChainToken) -> Result<(usize, ParameterState), GlmmError> {
        let store = self.store.as_deref().ok_or(ConfigError::MissingChainStore)?;
        let checkpoint = store.load(token)?;
        checkpoint.verify(&self.shape, &self.settings)?;
        if checkpoint.seed != self.seed {
            warn!(
                "resuming chain {token} recorded with seed {:?}; continuing with seed {:?}",
                checkpoint.seed, self.seed
            );
        }
        info!(
            "resuming chain {token} after {} epochs",
            checkpoint.epochs_completed
        );
        Ok((checkpoint.epochs_completed, checkpoint.state))
    }

    fn save(
        &mut self,
        epochs_completed: usize,
        state: &ParameterState,
    ) -> Result<Option<ChainToken>, GlmmError> {
        let Some(store) = self.store.as_deref_mut() else {
            return Ok(None);
        };
        if let Some((_, token)) = self
            .last_saved
            .as_ref()
            .filter(|(epoch, _)| *epoch == epochs_completed)
        {
            return Ok(Some(token.clone()));
        }
        let token = store.save(&ChainCheckpoint {
            shape: self.shape.clone(),
            settings: self.settings.clone(),
            seed: self.seed,
            epochs_completed,
            state: state.clone(),
        })?;
        debug!("saved checkpoint {token} at epoch {epochs_completed}");
        self.last_saved = Some((epochs_completed, token.clone()));
        Ok(Some(token))
    }

    fn periodic(&mut self, epochs_completed: usize, state: &ParameterState) -> Result<(), GlmmError> {
        match self.interval {
            Some(interval) if epochs_completed.is_multiple_of(interval) => {
                self.save(epochs_completed, state).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

/// Output of a finished run.
struct FinishedRun {
    result: PosteriorResult,
    converged: Option<bool>,
    acceptance: Vec<(BlockId, ProposalStats)>,
}

/// A failed run keeps whatever result it had gathered.
type RunOutcome = Result<FinishedRun, (GlmmError, Option<PosteriorResult>)>;

/// Mutable chain state borrowed for one update call.
struct ChainRun<'r, 'a, 's> {
    context: SamplerContext<'a>,
    state: &'r mut ParameterState,
    epochs_completed: &'r mut usize,
    checkpointer: &'r mut Checkpointer<'s>,
}

impl ChainRun<'_, '_, '_> {
    fn mcmc(&mut self, schedule: McmcSchedule) -> RunOutcome {
        let mut draws = Vec::with_capacity(schedule.retained_draws());
        let mut counts = AcceptanceCounts::default();
        for local in 0..schedule.num_sample {
            let epoch = *self.epochs_completed;
            let snapshot = self.state.clone();
            let mut rng = epoch_rng(schedule.seed, epoch);
            if let Err((block, kind)) = mcmc_epoch(&self.context, self.state, &mut rng, &mut counts) {
                *self.state = snapshot;
                warn!("MCMC aborted at epoch {epoch} in {block}: {kind}");
                let partial = PosteriorResult::Samples(PosteriorSamples { draws });
                return Err((
                    GlmmError::NumericalInstability { epoch, block, kind },
                    Some(partial),
                ));
            }
            *self.epochs_completed += 1;
            if schedule.is_retained(local) {
                draws.push(PosteriorDraw {
                    epoch,
                    state: self.state.clone(),
                });
            }
            if let Err(error) = self
                .checkpointer
                .periodic(*self.epochs_completed, self.state)
            {
                let partial = PosteriorResult::Samples(PosteriorSamples { draws });
                return Err((error, Some(partial)));
            }
        }
        Ok(FinishedRun {
            result: PosteriorResult::Samples(PosteriorSamples { draws }),
            converged: None,
            acceptance: counts.into_inner(),
        })
    }

    fn map(&mut self, options: MapOptions) -> RunOutcome {
        let mut converged = false;
        for _ in 0..options.max_epochs {
            let epoch = *self.epochs_completed;
            let previous = self.state.clone();
            if let Err((block, kind)) = map_epoch(&self.context, self.state) {
                *self.state = previous;
                warn!("MAP aborted at epoch {epoch} in {block}: {kind}");
                return Err((GlmmError::NumericalInstability { epoch, block, kind }, None));
            }
            *self.epochs_completed += 1;
            self.checkpointer
                .periodic(*self.epochs_completed, self.state)
                .map_err(|error| (error, None))?;
            let change = self.state.max_parameter_change(&previous);
            if change < options.tolerance {
                debug!("MAP converged at epoch {epoch} (max change {change:e})");
                converged = true;
                break;
            }
        }
        Ok(FinishedRun {
            result: PosteriorResult::PointEstimate(self.state.clone()),
            converged: Some(converged),
            acceptance: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::glmm::checkpoint::MemoryChainStore;
    use crate::models::likelihood::LikelihoodFamily;
    use crate::models::observation::ObservationPrecision;
    use crate::models::priors::Hyperprior;
    use crate::models::structure::{Adjacency, Regularization, StructuralMatrix};
    use crate::utils::sparse_from_entries;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn identity_set(n: usize) -> ObservationSet {
        let projection =
            sparse_from_entries(n, n, (0..n).map(|idx| (idx, idx, 1.0))).expect("identity");
        ObservationSet::new(projection, LikelihoodFamily::Gaussian)
            .with_precision(ObservationPrecision::Scalar(25.0))
    }

    fn grid_config() -> GlmmConfig {
        // 2 regions × 3 weeks, one field over a path graph of all six cells.
        let adjacency =
            Adjacency::from_edges(6, &[(0, 1), (1, 2), (3, 4), (4, 5), (0, 3)]).expect("edges");
        let matrix = Arc::new(
            StructuralMatrix::from_adjacency(&adjacency, Regularization::default())
                .expect("laplacian"),
        );
        GlmmConfig::new(6, -1.0)
            .with_random_effect(
                RandomEffectTerm::new(vec![matrix], 5.0, Hyperprior::Fixed).expect("term"),
            )
            .with_observation_set(identity_set(6))
    }

    fn observed() -> Vec<Vec<f64>> {
        vec![vec![-1.2, -0.8, -1.0, -0.5, -0.6, -0.4]]
    }

    fn short_schedule() -> McmcSchedule {
        McmcSchedule {
            num_sample: 30,
            num_burn_in: 10,
            thinning: 5,
            seed: 17,
        }
    }

    #[test]
    fn construction_validates_configuration() {
        assert!(matches!(
            GlmmModel::new(GlmmConfig::new(0, 0.0)),
            Err(GlmmError::Configuration(ConfigError::ZeroNodes))
        ));
        assert!(matches!(
            GlmmModel::new(GlmmConfig::new(3, f64::NAN)),
            Err(GlmmError::Configuration(ConfigError::NonFiniteBaseline(_)))
        ));
        assert!(matches!(
            GlmmModel::new(GlmmConfig::new(3, 0.0)),
            Err(GlmmError::Configuration(ConfigError::NoObservationSets))
        ));
        let model = GlmmModel::new(grid_config()).expect("model");
        assert_eq!(model.phase(), ModelPhase::Constructed);
        assert_eq!(model.epochs_completed(), 0);
        assert_eq!(model.shape().field_lengths, vec![6]);
    }

    #[test]
    fn queries_require_a_completed_update() {
        let model = GlmmModel::new(grid_config()).expect("model");
        assert!(matches!(
            model.posterior_mean_predictor(),
            Err(GlmmError::InvalidPhase {
                required: ModelPhase::Ready,
                actual: ModelPhase::Constructed
            })
        ));
    }

    #[test]
    fn mcmc_update_retains_scheduled_draws() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        let report = model
            .update(&observed(), &UpdateConfig::mcmc(short_schedule()), None)
            .expect("update");
        assert_eq!(model.phase(), ModelPhase::Ready);
        assert_eq!(report.epochs_run, 30);
        assert_eq!(report.retained_draws, 4);
        assert!(report.converged.is_none());
        assert!(report.acceptance_rate(BlockId::Field(0)).is_some());
        let samples = model.result().and_then(PosteriorResult::samples).expect("draws");
        let epochs: Vec<usize> = samples.draws.iter().map(|draw| draw.epoch).collect();
        assert_eq!(epochs, vec![10, 15, 20, 25]);

        let report = model
            .update(&observed(), &UpdateConfig::mcmc(short_schedule()), None)
            .expect("second update");
        assert_eq!(report.epochs_completed_total, 60);
        let samples = model.result().and_then(PosteriorResult::samples).expect("draws");
        assert_eq!(samples.draws[0].epoch, 40);
    }

    #[test]
    fn grids_are_space_by_time() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        model
            .update(&observed(), &UpdateConfig::map(MapOptions::default()), None)
            .expect("update");
        let mean = model.posterior_mean_predictor().expect("mean");
        let grid = model.predictor_grid(2, 3).expect("grid");
        assert_eq!((grid.nrows(), grid.ncols()), (2, 3));
        assert_relative_eq!(grid[(1, 2)], mean[5]);
        assert_relative_eq!(grid[(0, 1)], mean[1]);
        let probabilities = model.probability_grid(2, 3).expect("probabilities");
        assert_relative_eq!(probabilities[(1, 0)], logistic_stable(mean[3]));
        assert!(matches!(
            model.predictor_grid(4, 2),
            Err(GlmmError::DimensionMismatch { expected: 6, found: 8, .. })
        ));
        assert!(model.diagnostics().expect("ready").is_none());
    }

    #[test]
    fn persistence_requires_a_store() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        let config = UpdateConfig::mcmc(short_schedule()).with_persistence(ChainPersistence::StartFresh);
        assert!(matches!(
            model.update(&observed(), &config, None),
            Err(GlmmError::Configuration(ConfigError::MissingChainStore))
        ));
        assert_eq!(model.phase(), ModelPhase::Constructed);
    }

    #[test]
    fn periodic_and_final_checkpoints_are_written() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        let mut store = MemoryChainStore::new();
        let config = UpdateConfig::mcmc(short_schedule())
            .with_persistence(ChainPersistence::StartFresh)
            .with_checkpoint_interval(10);
        let report = model
            .update(&observed(), &config, Some(&mut store))
            .expect("update");
        let tokens: Vec<&str> = store.tokens().map(ChainToken::as_str).collect();
        assert_eq!(tokens, vec!["epoch-10", "epoch-20", "epoch-30"]);
        assert_eq!(report.checkpoint, Some(ChainToken::new("epoch-30")));
    }

    /// Counts every write that reaches the inner store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryChainStore,
        writes: usize,
    }

    impl ChainStore for CountingStore {
        fn save(
            &mut self,
            checkpoint: &ChainCheckpoint,
        ) -> Result<ChainToken, crate::models::glmm::CheckpointError> {
            self.writes += 1;
            self.inner.save(checkpoint)
        }

        fn load(
            &self,
            token: &ChainToken,
        ) -> Result<ChainCheckpoint, crate::models::glmm::CheckpointError> {
            self.inner.load(token)
        }
    }

    #[test]
    fn final_epoch_on_interval_is_written_once() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        let mut store = CountingStore::default();
        let config = UpdateConfig::mcmc(short_schedule())
            .with_persistence(ChainPersistence::StartFresh)
            .with_checkpoint_interval(10);
        let report = model
            .update(&observed(), &config, Some(&mut store))
            .expect("update");
        assert_eq!(store.writes, 3);
        assert_eq!(report.checkpoint, Some(ChainToken::new("epoch-30")));

        let mut store = CountingStore::default();
        let config = UpdateConfig::mcmc(short_schedule())
            .with_persistence(ChainPersistence::StartFresh)
            .with_checkpoint_interval(7);
        GlmmModel::new(grid_config())
            .expect("model")
            .update(&observed(), &config, Some(&mut store))
            .expect("update");
        // 7, 14, 21, 28 and the final 30.
        assert_eq!(store.writes, 5);
    }

    #[test]
    fn observed_values_are_checked_before_running() {
        let mut model = GlmmModel::new(grid_config()).expect("model");
        assert!(matches!(
            model.update(&[], &UpdateConfig::default(), None),
            Err(GlmmError::DimensionMismatch { expected: 1, found: 0, .. })
        ));
        let short = vec![vec![0.0; 5]];
        assert!(matches!(
            model.update(&short, &UpdateConfig::default(), None),
            Err(GlmmError::DimensionMismatch { expected: 6, found: 5, .. })
        ));
    }
}
