//! Posterior storage and summaries.

use num_traits::ToPrimitive;

use super::state::ParameterState;
use crate::utils::usize_to_f64;

/// A retained draw tagged with its global epoch index.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraw {
    pub epoch: usize,
    pub state: ParameterState,
}

/// Ordered retained draws of one update call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosteriorSamples {
    pub draws: Vec<PosteriorDraw>,
}

impl PosteriorSamples {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    /// Node-wise posterior mean of the linear predictor.
    #[must_use]
    pub fn mean_linear_predictor(&self) -> Vec<f64> {
        let Some(first) = self.draws.first() else {
            return Vec::new();
        };
        let mut mean = vec![0.0; first.state.linear_predictor.len()];
        for draw in &self.draws {
            for (total, value) in mean.iter_mut().zip(&draw.state.linear_predictor) {
                *total += value;
            }
        }
        let count = usize_to_f64(self.len());
        for value in &mut mean {
            *value /= count;
        }
        mean
    }

    /// Trace of one scalar extracted from every draw.
    pub fn trace(&self, extract: impl Fn(&ParameterState) -> f64) -> Vec<f64> {
        self.draws.iter().map(|draw| extract(&draw.state)).collect()
    }
}

/// Result of the latest completed update.
#[derive(Debug, Clone, PartialEq)]
pub enum PosteriorResult {
    /// Retained MCMC draws.
    Samples(PosteriorSamples),
    /// MAP estimate.
    PointEstimate(ParameterState),
}

impl PosteriorResult {
    /// Posterior mean (MCMC) or mode (MAP) of the linear predictor.
    #[must_use]
    pub fn mean_linear_predictor(&self) -> Vec<f64> {
        match self {
            Self::Samples(samples) => samples.mean_linear_predictor(),
            Self::PointEstimate(state) => state.linear_predictor.clone(),
        }
    }

    /// Draws when the result came from MCMC.
    #[must_use]
    pub const fn samples(&self) -> Option<&PosteriorSamples> {
        match self {
            Self::Samples(samples) => Some(samples),
            Self::PointEstimate(_) => None,
        }
    }
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

impl ParameterSummary {
    /// Degenerate summary of a point estimate.
    #[must_use]
    pub const fn point(value: f64) -> Self {
        Self {
            mean: value,
            std_dev: 0.0,
            q025: value,
            q50: value,
            q975: value,
        }
    }
}

/// Posterior summary of the hyperparameter-level blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosteriorSummary {
    pub fixed_coefficients: Vec<ParameterSummary>,
    pub precision_multipliers: Vec<ParameterSummary>,
    /// `[slope, intercept]` per observation set.
    pub recalibrations: Vec<[ParameterSummary; 2]>,
    pub draw_count: usize,
}

/// Summaries for every coefficient, multiplier and recalibration parameter.
#[must_use]
pub fn summarize_posterior(result: &PosteriorResult) -> PosteriorSummary {
    match result {
        PosteriorResult::PointEstimate(state) => PosteriorSummary {
            fixed_coefficients: state
                .fixed_coefficients
                .iter()
                .map(|value| ParameterSummary::point(*value))
                .collect(),
            precision_multipliers: state
                .precision_multipliers
                .iter()
                .map(|value| ParameterSummary::point(*value))
                .collect(),
            recalibrations: state
                .recalibrations
                .iter()
                .map(|[slope, intercept]| {
                    [
                        ParameterSummary::point(*slope),
                        ParameterSummary::point(*intercept),
                    ]
                })
                .collect(),
            draw_count: 1,
        },
        PosteriorResult::Samples(samples) => {
            let Some(first) = samples.draws.first() else {
                return PosteriorSummary::default();
            };
            let first = &first.state;
            PosteriorSummary {
                fixed_coefficients: (0..first.fixed_coefficients.len())
                    .map(|index| {
                        summarize_scalar(&samples.trace(|state| state.fixed_coefficients[index]))
                    })
                    .collect(),
                precision_multipliers: (0..first.precision_multipliers.len())
                    .map(|index| {
                        summarize_scalar(&samples.trace(|state| state.precision_multipliers[index]))
                    })
                    .collect(),
                recalibrations: (0..first.recalibrations.len())
                    .map(|set| {
                        [0, 1].map(|component| {
                            summarize_scalar(
                                &samples.trace(|state| state.recalibrations[set][component]),
                            )
                        })
                    })
                    .collect(),
                draw_count: samples.len(),
            }
        }
    }
}

/// Node-wise summaries of the linear predictor.
#[must_use]
pub fn summarize_linear_predictor(result: &PosteriorResult) -> Vec<ParameterSummary> {
    match result {
        PosteriorResult::PointEstimate(state) => state
            .linear_predictor
            .iter()
            .map(|value| ParameterSummary::point(*value))
            .collect(),
        PosteriorResult::Samples(samples) => {
            let nodes = samples
                .draws
                .first()
                .map_or(0, |draw| draw.state.linear_predictor.len());
            (0..nodes)
                .map(|node| summarize_scalar(&samples.trace(|state| state.linear_predictor[node])))
                .collect()
        }
    }
}

#[must_use]
pub fn summarize_scalar(values: &[f64]) -> ParameterSummary {
    if values.is_empty() {
        return ParameterSummary::default();
    }

    let n = usize_to_f64(values.len());
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / n.max(1.0);

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    ParameterSummary {
        mean,
        std_dev: variance.sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}

#[must_use]
fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn state(value: f64) -> ParameterState {
        ParameterState {
            fixed_coefficients: vec![value],
            fields: vec![vec![value, -value]],
            precision_multipliers: vec![value + 1.0],
            recalibrations: vec![[1.0, 0.0], [value, 2.0 * value]],
            linear_predictor: vec![value, 2.0 * value],
        }
    }

    fn samples() -> PosteriorSamples {
        PosteriorSamples {
            draws: [0.0, 1.0, 2.0]
                .into_iter()
                .enumerate()
                .map(|(epoch, value)| PosteriorDraw {
                    epoch,
                    state: state(value),
                })
                .collect(),
        }
    }

    #[test]
    fn mean_predictor_averages_draws() {
        let mean = samples().mean_linear_predictor();
        assert_relative_eq!(mean[0], 1.0);
        assert_relative_eq!(mean[1], 2.0);
        assert!(PosteriorSamples::default().mean_linear_predictor().is_empty());
    }

    #[test]
    fn summary_covers_every_block() {
        let summary = summarize_posterior(&PosteriorResult::Samples(samples()));
        assert_eq!(summary.draw_count, 3);
        assert_relative_eq!(summary.fixed_coefficients[0].mean, 1.0);
        assert_relative_eq!(summary.precision_multipliers[0].q50, 2.0);
        assert_relative_eq!(summary.recalibrations[1][1].mean, 2.0);
        assert_relative_eq!(summary.recalibrations[0][0].std_dev, 0.0);
    }

    #[test]
    fn point_estimate_summaries_are_degenerate() {
        let result = PosteriorResult::PointEstimate(state(0.5));
        let nodes = summarize_linear_predictor(&result);
        assert_eq!(nodes.len(), 2);
        assert_relative_eq!(nodes[1].q975, 1.0);
        assert_relative_eq!(nodes[1].std_dev, 0.0);
        assert_eq!(summarize_posterior(&result).draw_count, 1);
    }

    #[test]
    fn percentile_interpolates_between_order_statistics() {
        let summary = summarize_scalar(&[4.0, 1.0, 3.0, 2.0, 5.0]);
        assert_relative_eq!(summary.q50, 3.0);
        assert_relative_eq!(summary.q025, 1.1, epsilon = 1.0e-12);
        assert_relative_eq!(summary.std_dev, 2.0f64.sqrt(), epsilon = 1.0e-12);
    }
}
