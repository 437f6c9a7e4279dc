//! # Models
//!
//! Building blocks of the surveillance GLMM: structural matrices, GMRF
//! random effects, covariate effects, observation streams with their links
//! and likelihoods, and the model that ties them together.

pub mod fixed_effect;
pub mod glmm;
pub mod likelihood;
pub mod observation;
pub mod priors;
pub mod random_effect;
pub mod structure;
