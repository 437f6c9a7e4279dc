//! Core public types for the GLMM module.

use std::fmt;

use thiserror::Error;

use super::checkpoint::{ChainToken, CheckpointError, ResumeError};
use crate::inference::{InferenceError, MapOptions, McmcSchedule, ProposalStats};
use crate::models::structure::StructureError;

/// Errors returned by GLMM construction, validation, and updating.
#[derive(Debug, Error)]
pub enum GlmmError {
    #[error("{context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Schedule(#[from] InferenceError),
    #[error("numerical instability in {block} at epoch {epoch}: {kind}")]
    NumericalInstability {
        epoch: usize,
        block: BlockId,
        kind: InstabilityKind,
    },
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("operation requires the model to be {required}, but it is {actual}")]
    InvalidPhase {
        required: ModelPhase,
        actual: ModelPhase,
    },
}

impl GlmmError {
    pub(crate) fn dimension_mismatch(
        context: impl Into<String>,
        expected: usize,
        found: usize,
    ) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}

impl From<StructureError> for GlmmError {
    fn from(error: StructureError) -> Self {
        match error {
            StructureError::NodeOutOfRange { from, to, nodes } => {
                Self::dimension_mismatch("adjacency edge endpoint", nodes, from.max(to))
            }
            StructureError::NotSquare { rows, cols } => {
                Self::dimension_mismatch("structural matrix columns", rows, cols)
            }
            other => Self::Configuration(ConfigError::Structure(other)),
        }
    }
}

/// Invalid model or update configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Structure(StructureError),
    #[error("model must have at least one node")]
    ZeroNodes,
    #[error("baseline must be finite; found {0}")]
    NonFiniteBaseline(f64),
    #[error("random effect {term} must have at least one dimension")]
    NoDimensions { term: usize },
    #[error("random effect {term}, dimension {dimension}: weight must be finite and positive; found {weight}")]
    InvalidDimensionWeight {
        term: usize,
        dimension: usize,
        weight: f64,
    },
    #[error("random effect {term}: base precision must be finite and positive; found {value}")]
    InvalidBasePrecision { term: usize, value: f64 },
    #[error("random effect {term}: gamma hyperprior shape and rate must be finite and positive")]
    InvalidHyperprior { term: usize },
    #[error("estimated fixed effects need at least one covariate column")]
    EmptyCovariates,
    #[error("covariate matrix contains non-finite values")]
    NonFiniteCovariates,
    #[error("fixed-effect prior must have finite mean and finite positive precision")]
    InvalidCoefficientPrior,
    #[error("model needs at least one observation set")]
    NoObservationSets,
    #[error("observation set {set}: projection contains non-finite values")]
    NonFiniteProjection { set: usize },
    #[error("observation set {set}: precision {index} must be finite and positive; found {value}")]
    InvalidObservationPrecision { set: usize, index: usize, value: f64 },
    #[error("observation set {set}: likelihood support bounds are invalid")]
    InvalidSupport { set: usize },
    #[error("the first observation set is the reference scale and cannot be recalibrated")]
    RecalibrationOnFirstSet,
    #[error("observation set {set}: recalibration parameters must be finite with positive prior precision")]
    InvalidRecalibration { set: usize },
    #[error("observation set {set}: value {value} at index {index} is outside the likelihood support")]
    ObservationOutsideSupport { set: usize, index: usize, value: f64 },
    #[error("chain persistence requires a chain store")]
    MissingChainStore,
}

/// Lifecycle phase of a [`super::GlmmModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPhase {
    /// Built and validated; no update has run.
    Constructed,
    /// An update is running, or the last one aborted.
    Updating,
    /// The last update finished and its result is available.
    Ready,
}

impl fmt::Display for ModelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Constructed => "constructed",
            Self::Updating => "updating",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Parameter block updated within one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// Evaluation of the starting state.
    Initialization,
    /// Latent field of random-effect term `k`.
    Field(usize),
    /// Precision multiplier of random-effect term `k`.
    Precision(usize),
    FixedEffects,
    /// Recalibration coefficients of observation set `s`.
    Recalibration(usize),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => f.write_str("initialization"),
            Self::Field(term) => write!(f, "field {term}"),
            Self::Precision(term) => write!(f, "precision multiplier {term}"),
            Self::FixedEffects => f.write_str("fixed effects"),
            Self::Recalibration(set) => write!(f, "recalibration of set {set}"),
        }
    }
}

/// What went wrong numerically inside a block update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstabilityKind {
    NotPositiveDefinite,
    NonFiniteCurvature,
    NonFiniteProposal,
    NonFiniteLogPosterior,
    NonFiniteState,
}

impl fmt::Display for InstabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotPositiveDefinite => "block precision is not positive definite",
            Self::NonFiniteCurvature => "working curvature is not finite",
            Self::NonFiniteProposal => "proposal mean is not finite",
            Self::NonFiniteLogPosterior => "log posterior of the current state is not finite",
            Self::NonFiniteState => "parameter state is not finite",
        };
        f.write_str(text)
    }
}

/// Estimation strategy of an update call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InferenceMethod {
    /// Metropolis-within-Gibbs sampling.
    Mcmc(McmcSchedule),
    /// Deterministic coordinate ascent to the posterior mode.
    Map(MapOptions),
}

impl Default for InferenceMethod {
    fn default() -> Self {
        Self::Mcmc(McmcSchedule::default())
    }
}

/// Whether and how the chain is persisted through a [`super::ChainStore`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChainPersistence {
    /// Persist a chain starting from the model's current state.
    StartFresh,
    /// Load the stored state, then continue that chain.
    Resume(ChainToken),
    /// Run without touching any store.
    #[default]
    DoNotStore,
}

impl ChainPersistence {
    #[must_use]
    pub const fn requires_store(&self) -> bool {
        !matches!(self, Self::DoNotStore)
    }
}

/// Configuration of one `update` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateConfig {
    pub method: InferenceMethod,
    pub persistence: ChainPersistence,
    /// Save a checkpoint every `n` completed epochs in addition to the final one.
    pub checkpoint_interval: Option<usize>,
}

impl UpdateConfig {
    #[must_use]
    pub fn mcmc(schedule: McmcSchedule) -> Self {
        Self {
            method: InferenceMethod::Mcmc(schedule),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn map(options: MapOptions) -> Self {
        Self {
            method: InferenceMethod::Map(options),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: ChainPersistence) -> Self {
        self.persistence = persistence;
        self
    }

    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// # Errors
    ///
    /// Returns `GlmmError` if the schedule or the checkpoint interval is invalid.
    pub fn validate(&self) -> Result<(), GlmmError> {
        match self.method {
            InferenceMethod::Mcmc(schedule) => schedule.validate()?,
            InferenceMethod::Map(options) => options.validate()?,
        }
        if self.checkpoint_interval == Some(0) {
            return Err(InferenceError::InvalidCheckpointInterval.into());
        }
        Ok(())
    }

    /// Seed recorded in checkpoints; MAP runs have none.
    #[must_use]
    pub const fn seed(&self) -> Option<u64> {
        match self.method {
            InferenceMethod::Mcmc(schedule) => Some(schedule.seed),
            InferenceMethod::Map(_) => None,
        }
    }

    /// Total epochs this call will run at most.
    #[must_use]
    pub const fn epoch_budget(&self) -> usize {
        match self.method {
            InferenceMethod::Mcmc(schedule) => schedule.num_sample,
            InferenceMethod::Map(options) => options.max_epochs,
        }
    }
}

/// Summary of one completed `update` call.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Epochs run by this call.
    pub epochs_run: usize,
    /// Epochs completed by the chain across all calls, including resumed ones.
    pub epochs_completed_total: usize,
    pub retained_draws: usize,
    /// Acceptance counters of every Metropolis-Hastings block, in update order.
    pub acceptance: Vec<(BlockId, ProposalStats)>,
    /// Whether MAP coordinate ascent met its tolerance; `None` for MCMC.
    pub converged: Option<bool>,
    /// Token of the final checkpoint, when persisted.
    pub checkpoint: Option<ChainToken>,
}

impl UpdateReport {
    #[must_use]
    pub fn acceptance_rate(&self, block: BlockId) -> Option<f64> {
        self.acceptance
            .iter()
            .find(|(id, _)| *id == block)
            .map(|(_, stats)| stats.acceptance_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_config_rejects_zero_checkpoint_interval() {
        let config = UpdateConfig::default().with_checkpoint_interval(0);
        assert!(matches!(
            config.validate(),
            Err(GlmmError::Schedule(InferenceError::InvalidCheckpointInterval))
        ));
    }

    #[test]
    fn update_config_surfaces_schedule_errors() {
        let config = UpdateConfig::mcmc(McmcSchedule {
            num_sample: 10,
            num_burn_in: 10,
            ..McmcSchedule::default()
        });
        assert!(matches!(
            config.validate(),
            Err(GlmmError::Schedule(InferenceError::InvalidBurnIn { .. }))
        ));
    }

    #[test]
    fn map_runs_carry_no_seed() {
        assert_eq!(UpdateConfig::map(MapOptions::default()).seed(), None);
        assert_eq!(UpdateConfig::default().seed(), Some(42));
    }

    #[test]
    fn out_of_range_edges_map_to_dimension_mismatch() {
        let error = GlmmError::from(StructureError::NodeOutOfRange {
            from: 1,
            to: 7,
            nodes: 3,
        });
        assert!(matches!(
            error,
            GlmmError::DimensionMismatch {
                expected: 3,
                found: 7,
                ..
            }
        ));
        assert!(matches!(
            GlmmError::from(StructureError::EmptyBasis),
            GlmmError::Configuration(ConfigError::Structure(StructureError::EmptyBasis))
        ));
    }

    #[test]
    fn block_ids_render_readably() {
        assert_eq!(BlockId::Field(2).to_string(), "field 2");
        assert_eq!(BlockId::Recalibration(1).to_string(), "recalibration of set 1");
        assert_eq!(ModelPhase::Ready.to_string(), "ready");
    }
}
