//! Chain checkpoints and the stores that persist them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ParameterState;
use crate::models::observation::{Recalibration, RecalibrationKind};
use crate::models::priors::Hyperprior;

/// Opaque handle returned by a [`ChainStore`] for a saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainToken(String);

impl ChainToken {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dimensions a checkpoint must share with the model that resumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub node_count: usize,
    pub field_lengths: Vec<usize>,
    pub coefficient_count: usize,
    pub observation_counts: Vec<usize>,
    pub recalibrations: Vec<RecalibrationKind>,
}

/// Prior and recalibration settings of one random effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectSettings {
    pub dimension_sizes: Vec<usize>,
    pub weights: Vec<f64>,
    pub base_precision: f64,
    pub hyperprior: Hyperprior,
    /// Regularization epsilon of every structural matrix.
    pub regularization_epsilons: Vec<f64>,
}

/// Configuration values a checkpoint must share with the model that resumes it.
///
/// Floats are compared exactly; JSON stores keep them bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub baseline: f64,
    pub random_effects: Vec<RandomEffectSettings>,
    pub recalibrations: Vec<Recalibration>,
}

impl ModelSettings {
    /// Name of the first setting that differs from `other`.
    #[must_use]
    pub fn first_difference(&self, other: &Self) -> Option<String> {
        if self.baseline.to_bits() != other.baseline.to_bits() {
            return Some("baseline".into());
        }
        if self.random_effects.len() != other.random_effects.len() {
            return Some("random effect count".into());
        }
        for (index, (mine, theirs)) in self
            .random_effects
            .iter()
            .zip(&other.random_effects)
            .enumerate()
        {
            let name = if mine.dimension_sizes != theirs.dimension_sizes {
                "dimension sizes"
            } else if mine.weights != theirs.weights {
                "dimension weights"
            } else if mine.base_precision.to_bits() != theirs.base_precision.to_bits() {
                "base precision"
            } else if mine.hyperprior != theirs.hyperprior {
                "hyperprior"
            } else if mine.regularization_epsilons != theirs.regularization_epsilons {
                "regularization epsilon"
            } else {
                continue;
            };
            return Some(format!("random effect {index} {name}"));
        }
        if self.recalibrations.len() != other.recalibrations.len() {
            return Some("observation set count".into());
        }
        self.recalibrations
            .iter()
            .zip(&other.recalibrations)
            .position(|(mine, theirs)| mine != theirs)
            .map(|index| format!("recalibration of set {index}"))
    }
}

/// Serializable snapshot of a chain after a completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub shape: ModelShape,
    pub settings: ModelSettings,
    /// Seed of the MCMC schedule that produced the chain; `None` for MAP runs.
    pub seed: Option<u64>,
    pub epochs_completed: usize,
    pub state: ParameterState,
}

impl ChainCheckpoint {
    /// Checks that the stored chain was produced by a model with `shape` and
    /// `settings`, and that its state fits them and is finite.
    ///
    /// # Errors
    ///
    /// Returns `ResumeError` if the shape or a setting differs or the state is corrupt.
    pub fn verify(&self, shape: &ModelShape, settings: &ModelSettings) -> Result<(), ResumeError> {
        if &self.shape != shape {
            return Err(ResumeError::ShapeMismatch {
                expected: Box::new(shape.clone()),
                found: Box::new(self.shape.clone()),
            });
        }
        if let Some(setting) = settings.first_difference(&self.settings) {
            return Err(ResumeError::SettingsMismatch(setting));
        }
        let state = &self.state;
        if state.fixed_coefficients.len() != shape.coefficient_count {
            return Err(ResumeError::CorruptState("coefficient count".into()));
        }
        let field_lengths: Vec<usize> = state.fields.iter().map(Vec::len).collect();
        if field_lengths != shape.field_lengths {
            return Err(ResumeError::CorruptState("field lengths".into()));
        }
        if state.precision_multipliers.len() != shape.field_lengths.len() {
            return Err(ResumeError::CorruptState("precision multiplier count".into()));
        }
        if state.recalibrations.len() != shape.recalibrations.len() {
            return Err(ResumeError::CorruptState("recalibration count".into()));
        }
        if state.linear_predictor.len() != shape.node_count {
            return Err(ResumeError::CorruptState("linear predictor length".into()));
        }
        if !state.is_finite() {
            return Err(ResumeError::CorruptState("non-finite parameters".into()));
        }
        let moved_fixed_multiplier = settings
            .random_effects
            .iter()
            .zip(&state.precision_multipliers)
            .any(|(term, multiplier)| {
                term.hyperprior.is_fixed() && multiplier.to_bits() != 1.0_f64.to_bits()
            });
        if moved_fixed_multiplier {
            return Err(ResumeError::CorruptState("fixed precision multiplier".into()));
        }
        let moved_recalibration = settings
            .recalibrations
            .iter()
            .zip(&state.recalibrations)
            .any(|(recalibration, stored)| {
                recalibration.kind() != RecalibrationKind::Estimated
                    && recalibration.initial_coefficients().map(f64::to_bits)
                        != stored.map(f64::to_bits)
            });
        if moved_recalibration {
            return Err(ResumeError::CorruptState("fixed recalibration".into()));
        }
        Ok(())
    }
}

/// Errors raised while resuming a stored chain.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResumeError {
    #[error("checkpoint shape {found:?} does not match the model shape {expected:?}")]
    ShapeMismatch {
        expected: Box<ModelShape>,
        found: Box<ModelShape>,
    },
    #[error("checkpoint was produced with a different {0}")]
    SettingsMismatch(String),
    #[error("checkpoint state is corrupt: {0}")]
    CorruptState(String),
}

/// Errors raised by checkpoint storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint serialization failed")]
    Serialization(#[from] serde_json::Error),
    #[error("no checkpoint stored under token `{0}`")]
    UnknownToken(ChainToken),
}

/// Durable storage for chain checkpoints.
pub trait ChainStore {
    /// # Errors
    ///
    /// Returns `CheckpointError` if the checkpoint cannot be stored.
    fn save(&mut self, checkpoint: &ChainCheckpoint) -> Result<ChainToken, CheckpointError>;

    /// # Errors
    ///
    /// Returns `CheckpointError` if the token is unknown or the data is unreadable.
    fn load(&self, token: &ChainToken) -> Result<ChainCheckpoint, CheckpointError>;
}

/// Checkpoints kept in process memory, keyed `epoch-{n}`.
#[derive(Debug, Clone, Default)]
pub struct MemoryChainStore {
    checkpoints: BTreeMap<ChainToken, ChainCheckpoint>,
}

impl MemoryChainStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Tokens of all stored checkpoints.
    pub fn tokens(&self) -> impl Iterator<Item = &ChainToken> {
        self.checkpoints.keys()
    }
}

impl ChainStore for MemoryChainStore {
    fn save(&mut self, checkpoint: &ChainCheckpoint) -> Result<ChainToken, CheckpointError> {
        let token = ChainToken::new(format!("epoch-{}", checkpoint.epochs_completed));
        self.checkpoints.insert(token.clone(), checkpoint.clone());
        Ok(token)
    }

    fn load(&self, token: &ChainToken) -> Result<ChainCheckpoint, CheckpointError> {
        self.checkpoints
            .get(token)
            .cloned()
            .ok_or_else(|| CheckpointError::UnknownToken(token.clone()))
    }
}

/// JSON checkpoints in a directory; the token is the file path.
#[derive(Debug, Clone)]
pub struct JsonFileChainStore {
    directory: PathBuf,
}

impl JsonFileChainStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, epochs_completed: usize) -> PathBuf {
        self.directory
            .join(format!("chain-epoch-{epochs_completed:08}.json"))
    }
}

impl ChainStore for JsonFileChainStore {
    fn save(&mut self, checkpoint: &ChainCheckpoint) -> Result<ChainToken, CheckpointError> {
        let path = self.path_for(checkpoint.epochs_completed);
        let file = File::create(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, checkpoint)?;
        writer.flush().map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        log::debug!("wrote chain checkpoint to {}", path.display());
        Ok(ChainToken::new(path.to_string_lossy()))
    }

    fn load(&self, token: &ChainToken) -> Result<ChainCheckpoint, CheckpointError> {
        let path = PathBuf::from(token.as_str());
        let file = File::open(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
