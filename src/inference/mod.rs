//! Reusable inference and MCMC utility types.
//!
//! Holds the epoch schedules for both inference strategies, proposal
//! counters for Metropolis blocks, and the random-variate helpers shared by
//! the block updates.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::usize_to_f64;

/// Seed increment between consecutive epochs of one chain.
const EPOCH_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors for MCMC and MAP schedule configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InferenceError {
    #[error("number of samples (epochs) must be positive")]
    InvalidIterations,
    #[error("burn-in ({burn_in}) must be smaller than the number of samples ({iterations})")]
    InvalidBurnIn { burn_in: usize, iterations: usize },
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("MAP epoch budget must be positive")]
    InvalidMapEpochs,
    #[error("MAP tolerance must be finite and non-negative")]
    InvalidMapTolerance,
    #[error("checkpoint interval must be positive when set")]
    InvalidCheckpointInterval,
}

/// MCMC epoch schedule.
///
/// `num_sample` counts every epoch of a call, burn-in included. A draw is
/// kept at local epoch `e` when `e >= num_burn_in` and
/// `(e - num_burn_in) % thinning == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McmcSchedule {
    pub num_sample: usize,
    pub num_burn_in: usize,
    pub thinning: usize,
    pub seed: u64,
}

impl Default for McmcSchedule {
    fn default() -> Self {
        Self {
            num_sample: 4_000,
            num_burn_in: 1_000,
            thinning: 4,
            seed: 42,
        }
    }
}

impl McmcSchedule {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub const fn validate(self) -> Result<(), InferenceError> {
        if self.num_sample == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.num_burn_in >= self.num_sample {
            return Err(InferenceError::InvalidBurnIn {
                burn_in: self.num_burn_in,
                iterations: self.num_sample,
            });
        }
        if self.thinning == 0 {
            return Err(InferenceError::InvalidThinning);
        }
        Ok(())
    }

    /// Number of retained draws implied by this schedule.
    #[must_use]
    pub const fn retained_draws(self) -> usize {
        (self.num_sample - self.num_burn_in).div_ceil(self.thinning)
    }

    /// Whether local epoch `epoch` produces a retained draw.
    #[must_use]
    pub const fn is_retained(self, epoch: usize) -> bool {
        epoch >= self.num_burn_in && (epoch - self.num_burn_in).is_multiple_of(self.thinning)
    }
}

/// Coordinate-ascent settings for MAP estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapOptions {
    /// Maximum number of coordinate-ascent sweeps.
    pub max_epochs: usize,
    /// Stop once the largest parameter change in a sweep is below this value.
    pub tolerance: f64,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            max_epochs: 200,
            tolerance: 1.0e-8,
        }
    }
}

impl MapOptions {
    /// # Errors
    ///
    /// Returns `InferenceError` if the epoch budget or tolerance is invalid.
    pub fn validate(self) -> Result<(), InferenceError> {
        if self.max_epochs == 0 {
            return Err(InferenceError::InvalidMapEpochs);
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(InferenceError::InvalidMapTolerance);
        }
        Ok(())
    }
}

/// Proposal counters for a single Metropolis-Hastings block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

/// Generator for one epoch of a chain.
///
/// Each epoch derives its own stream from the chain seed and the global epoch
/// index, so a chain resumed from a checkpoint replays the same randomness.
#[must_use]
pub fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    let epoch = u64::try_from(epoch).unwrap_or(u64::MAX);
    StdRng::seed_from_u64(seed.wrapping_add(epoch.wrapping_mul(EPOCH_SEED_STRIDE)))
}

/// Metropolis acceptance test on the log scale.
pub fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

/// Box-Muller standard normal variate.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Gamma variate with the given shape and scale (Marsaglia-Tsang).
pub fn sample_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    if !(shape > 0.0 && scale > 0.0) {
        return f64::NAN;
    }

    if shape < 1.0 {
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0, scale) * u.powf(1.0 / shape);
    }

    let shape_minus_third = shape - (1.0 / 3.0);
    let coeff = (1.0 / (9.0 * shape_minus_third)).sqrt();
    loop {
        let standard_normal = sample_standard_normal(rng);
        let one_plus_coeff_noise = coeff.mul_add(standard_normal, 1.0);
        if one_plus_coeff_noise <= 0.0 {
            continue;
        }
        let cubic_term = one_plus_coeff_noise * one_plus_coeff_noise * one_plus_coeff_noise;
        let uniform = rng.random::<f64>();
        if uniform
            < (0.0331 * standard_normal * standard_normal * standard_normal)
                .mul_add(-standard_normal, 1.0)
        {
            return scale * shape_minus_third * cubic_term;
        }
        if uniform.ln()
            < (0.5 * standard_normal).mul_add(
                standard_normal,
                shape_minus_third * (1.0 - cubic_term + cubic_term.ln()),
            )
        {
            return scale * shape_minus_third * cubic_term;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_validation_rejects_zero_samples() {
        let schedule = McmcSchedule {
            num_sample: 0,
            ..McmcSchedule::default()
        };
        assert_eq!(schedule.validate(), Err(InferenceError::InvalidIterations));
    }

    #[test]
    fn last_epoch_only_schedule_retains_one_draw() {
        let schedule = McmcSchedule {
            num_sample: 50,
            num_burn_in: 49,
            thinning: 1,
            seed: 1,
        };
        assert!(schedule.validate().is_ok());
        assert_eq!(schedule.retained_draws(), 1);
        assert_eq!((0..50).filter(|e| schedule.is_retained(*e)).count(), 1);
    }

    #[test]
    fn retained_count_matches_epoch_predicate() {
        let schedule = McmcSchedule {
            num_sample: 23,
            num_burn_in: 5,
            thinning: 4,
            seed: 1,
        };
        let counted = (0..schedule.num_sample)
            .filter(|e| schedule.is_retained(*e))
            .count();
        assert_eq!(counted, schedule.retained_draws());
    }

    #[test]
    fn map_options_reject_negative_tolerance() {
        let options = MapOptions {
            tolerance: -1.0,
            ..MapOptions::default()
        };
        assert_eq!(options.validate(), Err(InferenceError::InvalidMapTolerance));
    }

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn epoch_rng_is_reproducible() {
        let mut first = epoch_rng(7, 3);
        let mut second = epoch_rng(7, 3);
        assert_eq!(
            sample_standard_normal(&mut first).to_bits(),
            sample_standard_normal(&mut second).to_bits()
        );
    }

    #[test]
    fn gamma_sample_mean_is_close_to_shape_times_scale() {
        let mut rng = StdRng::seed_from_u64(11);
        let draws = 20_000;
        let mean = (0..draws)
            .map(|_| sample_gamma(&mut rng, 3.0, 0.5))
            .sum::<f64>()
            / usize_to_f64(draws);
        assert!((mean - 1.5).abs() < 0.05, "mean was {mean}");
    }
}
