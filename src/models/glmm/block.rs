//! Gaussian block updates shared by every continuous parameter block.
//!
//! A block target combines a Gaussian prior with a log-likelihood and its
//! working (IWLS) curvature. The proposal is the Newton approximation of the
//! conditional at the current value: precision `P₀ + H`, mean
//! `θ + (P₀ + H)⁻¹ (∇ℓ(θ) - P₀(θ - m₀))`. For a Gaussian likelihood with an
//! identity link this is the exact conditional; otherwise a
//! Metropolis-Hastings correction keeps the chain exact.

use faer::sparse::SparseColMat;
use rand::rngs::StdRng;

use super::types::InstabilityKind;
use crate::inference::{sample_standard_normal, should_accept};
use crate::models::priors::GaussianPrior;
use crate::utils::{
    SparseCholesky, sparse_is_finite, sparse_linear_combination, sparse_quadratic_form,
};

/// Maximum number of step halvings in a damped Newton step.
const MAX_STEP_HALVINGS: usize = 30;

/// Gradient and positive semi-definite curvature of a block log-likelihood.
#[derive(Debug, Clone)]
pub(crate) struct WorkingApproximation {
    pub gradient: Vec<f64>,
    pub information: SparseColMat<usize, f64>,
}

/// Conditional posterior of one parameter block.
pub(crate) trait BlockTarget {
    fn prior(&self) -> &GaussianPrior;

    fn log_likelihood(&self, theta: &[f64]) -> f64;

    fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind>;

    fn log_target(&self, theta: &[f64]) -> f64 {
        self.log_likelihood(theta) + self.prior().log_kernel(theta)
    }
}

/// Newton/IWLS Gaussian approximation of a block conditional.
///
/// The precision `P₀ + H` keeps the sparsity of the prior structure and
/// the working curvature; it is never densified.
#[derive(Debug, Clone)]
pub(crate) struct GaussianProposal {
    mean: Vec<f64>,
    precision: SparseColMat<usize, f64>,
    factor: SparseCholesky,
}

impl GaussianProposal {
    /// Build the approximation at `theta`.
    pub(crate) fn at<T: BlockTarget + ?Sized>(
        target: &T,
        theta: &[f64],
    ) -> Result<Self, InstabilityKind> {
        let working = target.working(theta)?;
        if !(working.gradient.iter().all(|value| value.is_finite())
            && sparse_is_finite(&working.information))
        {
            return Err(InstabilityKind::NonFiniteCurvature);
        }
        let prior = target.prior();
        let precision =
            sparse_linear_combination(&[(1.0, &prior.precision), (1.0, &working.information)])
                .map_err(|_| InstabilityKind::NonFiniteCurvature)?;
        let factor =
            SparseCholesky::new(&precision).map_err(|_| InstabilityKind::NotPositiveDefinite)?;

        let pulled = prior.precision_times_centered(theta);
        let rhs: Vec<f64> = working
            .gradient
            .iter()
            .zip(&pulled)
            .map(|(gradient, prior_pull)| gradient - prior_pull)
            .collect();
        let step = factor
            .solve(&rhs)
            .map_err(|_| InstabilityKind::NonFiniteProposal)?;
        let mean: Vec<f64> = theta.iter().zip(&step).map(|(value, delta)| value + delta).collect();
        if mean.iter().any(|value| !value.is_finite()) {
            return Err(InstabilityKind::NonFiniteProposal);
        }
        Ok(Self {
            mean,
            precision,
            factor,
        })
    }

    pub(crate) fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub(crate) fn draw(&self, rng: &mut StdRng) -> Vec<f64> {
        let noise: Vec<f64> = (0..self.mean.len())
            .map(|_| sample_standard_normal(rng))
            .collect();
        self.factor
            .solve_upper(&noise)
            .iter()
            .zip(&self.mean)
            .map(|(offset, mean)| mean + offset)
            .collect()
    }

    /// Log-density at `x`, without the `2π` constant.
    pub(crate) fn log_density(&self, x: &[f64]) -> f64 {
        let centered: Vec<f64> = x.iter().zip(&self.mean).map(|(value, mean)| value - mean).collect();
        let norm_sq = sparse_quadratic_form(&self.precision, &centered);
        0.5f64.mul_add(self.factor.log_determinant(), -0.5 * norm_sq)
    }
}

/// One Metropolis-Hastings step with the Gaussian block proposal.
///
/// Returns the new block value and whether the candidate was accepted.
/// Candidates with a non-finite target or reverse proposal are rejected.
pub(crate) fn metropolis_step<T: BlockTarget + ?Sized>(
    target: &T,
    current: &[f64],
    rng: &mut StdRng,
) -> Result<(Vec<f64>, bool), InstabilityKind> {
    let current_target = target.log_target(current);
    if !current_target.is_finite() {
        return Err(InstabilityKind::NonFiniteLogPosterior);
    }
    let forward = GaussianProposal::at(target, current)?;
    let candidate = forward.draw(rng);
    let candidate_target = target.log_target(&candidate);
    if !candidate_target.is_finite() {
        return Ok((current.to_vec(), false));
    }
    let Ok(reverse) = GaussianProposal::at(target, &candidate) else {
        return Ok((current.to_vec(), false));
    };
    let log_acceptance = candidate_target - current_target + reverse.log_density(current)
        - forward.log_density(&candidate);
    if should_accept(log_acceptance, rng) {
        Ok((candidate, true))
    } else {
        Ok((current.to_vec(), false))
    }
}

/// Damped Newton step towards the block mode.
///
/// The full step is halved until the log target does not decrease; if no
/// step improves, the current value is kept.
pub(crate) fn newton_step<T: BlockTarget + ?Sized>(
    target: &T,
    current: &[f64],
) -> Result<Vec<f64>, InstabilityKind> {
    let current_target = target.log_target(current);
    if !current_target.is_finite() {
        return Err(InstabilityKind::NonFiniteLogPosterior);
    }
    let proposal = GaussianProposal::at(target, current)?;
    let direction: Vec<f64> = proposal
        .mean()
        .iter()
        .zip(current)
        .map(|(mean, value)| mean - value)
        .collect();
    let mut scale = 1.0_f64;
    for _ in 0..MAX_STEP_HALVINGS {
        let candidate: Vec<f64> = current
            .iter()
            .zip(&direction)
            .map(|(value, delta)| scale.mul_add(*delta, *value))
            .collect();
        let candidate_target = target.log_target(&candidate);
        if candidate_target.is_finite() && candidate_target >= current_target {
            return Ok(candidate);
        }
        scale *= 0.5;
    }
    Ok(current.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::epoch_rng;
    use crate::utils::sparse_diagonal;

    fn diagonal(values: &[f64]) -> SparseColMat<usize, f64> {
        sparse_diagonal(values).expect("diagonal")
    }
    use approx::assert_relative_eq;

    /// Independent Gaussian observations of `theta` with precision `obs_precision`.
    struct GaussianTarget {
        prior: GaussianPrior,
        observed: Vec<f64>,
        obs_precision: f64,
    }

    impl BlockTarget for GaussianTarget {
        fn prior(&self) -> &GaussianPrior {
            &self.prior
        }

        fn log_likelihood(&self, theta: &[f64]) -> f64 {
            theta
                .iter()
                .zip(&self.observed)
                .map(|(t, y)| -0.5 * self.obs_precision * (y - t) * (y - t))
                .sum()
        }

        fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind> {
            Ok(WorkingApproximation {
                gradient: theta
                    .iter()
                    .zip(&self.observed)
                    .map(|(t, y)| self.obs_precision * (y - t))
                    .collect(),
                information: diagonal(&vec![self.obs_precision; theta.len()]),
            })
        }
    }

    /// Poisson-like target with log link: `ℓ(θ) = yθ - e^θ`.
    struct LogLinkTarget {
        prior: GaussianPrior,
        count: f64,
    }

    impl BlockTarget for LogLinkTarget {
        fn prior(&self) -> &GaussianPrior {
            &self.prior
        }

        fn log_likelihood(&self, theta: &[f64]) -> f64 {
            self.count.mul_add(theta[0], -theta[0].exp())
        }

        fn working(&self, theta: &[f64]) -> Result<WorkingApproximation, InstabilityKind> {
            Ok(WorkingApproximation {
                gradient: vec![self.count - theta[0].exp()],
                information: diagonal(&[theta[0].exp()]),
            })
        }
    }

    fn gaussian_target() -> GaussianTarget {
        GaussianTarget {
            prior: GaussianPrior::new(vec![0.0, 1.0], diagonal(&[1.0, 3.0])),
            observed: vec![2.0, -1.0],
            obs_precision: 1.0,
        }
    }

    #[test]
    fn gaussian_proposal_mean_is_exact_conditional_mean() {
        let target = gaussian_target();
        let proposal = GaussianProposal::at(&target, &[5.0, 5.0]).expect("proposal");
        // (prior_precision * prior_mean + obs_precision * y) / (prior_precision + obs_precision)
        assert_relative_eq!(proposal.mean()[0], 1.0, epsilon = 1.0e-12);
        assert_relative_eq!(proposal.mean()[1], 0.5, epsilon = 1.0e-12);
    }

    #[test]
    fn long_chain_field_proposal_solves_sparse_system() {
        let dim = 600;
        let entries = (0..dim).flat_map(|node| {
            let mut row = vec![(node, node, 2.1)];
            if node + 1 < dim {
                row.push((node, node + 1, -1.0));
                row.push((node + 1, node, -1.0));
            }
            row
        });
        let structure =
            crate::utils::sparse_from_entries(dim, dim, entries).expect("tridiagonal structure");
        let observed: Vec<f64> = (0..dim)
            .map(|node| crate::utils::usize_to_f64(node % 7) - 3.0)
            .collect();
        let target = GaussianTarget {
            prior: GaussianPrior::new(vec![0.0; dim], structure.clone()),
            observed: observed.clone(),
            obs_precision: 1.0,
        };
        let proposal = GaussianProposal::at(&target, &vec![0.0; dim]).expect("proposal");
        let identity = diagonal(&vec![1.0; dim]);
        let system =
            sparse_linear_combination(&[(1.0, &structure), (1.0, &identity)]).expect("same shape");
        let back = crate::utils::sparse_mul_vec(&system, proposal.mean());
        assert!(crate::utils::max_abs_diff(&back, &observed) < 1.0e-9);

        let mut rng = epoch_rng(3, 0);
        let draw = proposal.draw(&mut rng);
        assert_eq!(draw.len(), dim);
        assert!(proposal.log_density(&draw).is_finite());
    }

    #[test]
    fn exact_gaussian_proposals_are_accepted() {
        let target = gaussian_target();
        let mut current = vec![0.0, 0.0];
        let mut accepted = 0;
        for epoch in 0..50 {
            let mut rng = epoch_rng(5, epoch);
            let (next, was_accepted) =
                metropolis_step(&target, &current, &mut rng).expect("finite target");
            current = next;
            accepted += usize::from(was_accepted);
        }
        assert!(accepted >= 49, "accepted {accepted} of 50");
    }

    #[test]
    fn newton_steps_reach_log_link_mode() {
        let target = LogLinkTarget {
            prior: GaussianPrior::new(vec![0.0], diagonal(&[1.0e-6])),
            count: 4.0,
        };
        let mut theta = vec![0.0];
        for _ in 0..50 {
            theta = newton_step(&target, &theta).expect("finite target");
        }
        assert_relative_eq!(theta[0], 4.0f64.ln(), epsilon = 1.0e-4);
    }

    #[test]
    fn metropolis_step_stays_near_mode_for_log_link() {
        let target = LogLinkTarget {
            prior: GaussianPrior::new(vec![0.0], diagonal(&[1.0e-4])),
            count: 30.0,
        };
        let mut theta = vec![3.0];
        let mut total = 0.0;
        for epoch in 0..2_000_usize {
            let mut rng = epoch_rng(9, epoch);
            theta = metropolis_step(&target, &theta, &mut rng).expect("finite").0;
            total += theta[0];
        }
        let mean = total / 2_000.0;
        // Under a flat prior e^θ ~ Gamma(30, 1), so E[θ] = ψ(30) ≈ 3.385.
        assert!((mean - 3.385).abs() < 0.1, "mean {mean}");
    }

    #[test]
    fn non_finite_current_target_is_an_instability() {
        let target = LogLinkTarget {
            prior: GaussianPrior::new(vec![0.0], diagonal(&[1.0])),
            count: 1.0,
        };
        let mut rng = epoch_rng(1, 0);
        assert_eq!(
            metropolis_step(&target, &[f64::NAN], &mut rng).map(|(_, accepted)| accepted),
            Err(InstabilityKind::NonFiniteLogPosterior)
        );
    }
}
