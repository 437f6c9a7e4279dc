#![forbid(unsafe_code)]

//! # `ili_gmrf`
//!
//! Hierarchical generalized linear mixed model for influenza-like-illness
//! surveillance. Latent spatio-temporal structure is modelled with Gaussian
//! Markov random fields built from adjacency graphs or difference bases, and
//! several heterogeneous observation streams (surveillance rates, social-media
//! signals) inform one node-level linear predictor.
//!
//! Inference is either Metropolis-within-Gibbs MCMC or MAP coordinate
//! ascent, with resumable chains through a pluggable checkpoint store.

pub mod inference;
pub mod models;
pub mod utils;

pub use inference::{InferenceError, MapOptions, McmcSchedule, ProposalStats};

pub use models::structure::{
    Adjacency, Regularization, StructuralMatrix, StructureError, StructureKind,
};

pub use models::priors::{GammaHyperprior, GaussianPrior, Hyperprior};

pub use models::likelihood::{LikelihoodFamily, LinkFunction};

pub use models::random_effect::RandomEffectTerm;

pub use models::fixed_effect::FixedEffectTerm;

pub use models::observation::{ObservationPrecision, ObservationSet, Recalibration};

pub use models::glmm::{
    BlockId, ChainCheckpoint, ChainDiagnostics, ChainPersistence, ChainStore, ChainToken,
    CheckpointError, ConfigError, GlmmConfig, GlmmError, GlmmModel, InferenceMethod,
    InstabilityKind, JsonFileChainStore, MemoryChainStore, ModelPhase, ModelSettings, ModelShape,
    ParameterState, ParameterSummary, PosteriorResult, PosteriorSamples, PosteriorSummary,
    RandomEffectSettings, ResumeError, UpdateConfig, UpdateReport,
};
