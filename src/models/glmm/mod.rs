//! Hierarchical GLMM with Gaussian Markov random field effects.
//!
//! A [`GlmmModel`] is built once from a validated [`GlmmConfig`] and then
//! updated by MCMC or MAP through [`GlmmModel::update`]. Chains can be
//! persisted and resumed through any [`ChainStore`].

mod block;
pub mod checkpoint;
pub mod diagnostics;
pub mod model;
pub mod posterior;
mod sampler;
pub mod state;
pub mod types;

pub use checkpoint::{
    ChainCheckpoint, ChainStore, ChainToken, CheckpointError, JsonFileChainStore,
    MemoryChainStore, ModelSettings, ModelShape, RandomEffectSettings, ResumeError,
};
pub use diagnostics::{
    ChainDiagnostics, TraceDiagnostics, autocorrelation, chain_diagnostics, effective_sample_size,
};
pub use model::{GlmmConfig, GlmmModel};
pub use posterior::{
    ParameterSummary, PosteriorDraw, PosteriorResult, PosteriorSamples, PosteriorSummary,
    summarize_linear_predictor, summarize_posterior, summarize_scalar,
};
pub use state::ParameterState;
pub use types::{
    BlockId, ChainPersistence, ConfigError, GlmmError, InferenceMethod, InstabilityKind,
    ModelPhase, UpdateConfig, UpdateReport,
};
