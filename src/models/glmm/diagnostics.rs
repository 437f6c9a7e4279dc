//! MCMC trace diagnostics.

use super::posterior::PosteriorSamples;
use crate::utils::usize_to_f64;

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let denominator: f64 = series
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum();
    if denominator <= 0.0 {
        return 0.0;
    }

    let numerator: f64 = (0..n)
        .map(|idx| (series[idx] - mean) * (series[idx + lag] - mean))
        .sum();
    numerator / denominator
}

/// Heuristic effective sample size using positive autocorrelation truncation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Mixing summary of one scalar trace.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceDiagnostics {
    pub lag1_autocorrelation: f64,
    pub effective_sample_size: f64,
}

impl TraceDiagnostics {
    #[must_use]
    pub fn from_trace(series: &[f64]) -> Self {
        Self {
            lag1_autocorrelation: autocorrelation(series, 1),
            effective_sample_size: effective_sample_size(series),
        }
    }
}

/// Trace diagnostics of the retained draws.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainDiagnostics {
    pub draw_count: usize,
    pub fixed_coefficients: Vec<TraceDiagnostics>,
    pub precision_multipliers: Vec<TraceDiagnostics>,
    /// Smallest effective sample size over the node linear predictor.
    pub min_predictor_ess: Option<f64>,
}

/// Compute trace diagnostics for coefficients, multipliers and the predictor.
#[must_use]
pub fn chain_diagnostics(samples: &PosteriorSamples) -> ChainDiagnostics {
    let Some(first) = samples.draws.first() else {
        return ChainDiagnostics::default();
    };
    let first = &first.state;
    let fixed_coefficients = (0..first.fixed_coefficients.len())
        .map(|index| {
            TraceDiagnostics::from_trace(&samples.trace(|state| state.fixed_coefficients[index]))
        })
        .collect();
    let precision_multipliers = (0..first.precision_multipliers.len())
        .map(|index| {
            TraceDiagnostics::from_trace(&samples.trace(|state| state.precision_multipliers[index]))
        })
        .collect();
    let min_predictor_ess = (0..first.linear_predictor.len())
        .map(|node| effective_sample_size(&samples.trace(|state| state.linear_predictor[node])))
        .reduce(f64::min);

    ChainDiagnostics {
        draw_count: samples.len(),
        fixed_coefficients,
        precision_multipliers,
        min_predictor_ess,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::glmm::posterior::PosteriorDraw;
    use crate::models::glmm::state::ParameterState;

    #[test]
    fn autocorrelation_is_zero_for_invalid_lag() {
        let values = [1.0, 2.0, 3.0];
        assert!((autocorrelation(&values, 3) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ess_bounded_by_chain_length() {
        let values = [1.0, 1.5, 2.0, 2.5, 3.0];
        let ess = effective_sample_size(&values);
        assert!(ess <= 5.0);
        assert!(ess > 0.0);
    }

    #[test]
    fn alternating_trace_keeps_full_ess() {
        let values: Vec<f64> = (0..40).map(|idx| if idx % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(autocorrelation(&values, 1) < 0.0);
        assert!((effective_sample_size(&values) - 40.0).abs() < 1.0e-12);
    }

    #[test]
    fn chain_diagnostics_cover_each_block() {
        let samples = PosteriorSamples {
            draws: (0..6)
                .map(|epoch| {
                    let value = f64::from(u8::try_from(epoch).unwrap_or(0));
                    PosteriorDraw {
                        epoch,
                        state: ParameterState {
                            fixed_coefficients: vec![value, 1.0],
                            fields: vec![],
                            precision_multipliers: vec![1.0 + value],
                            recalibrations: vec![[1.0, 0.0]],
                            linear_predictor: vec![value, -value, 0.5],
                        },
                    }
                })
                .collect(),
        };
        let diagnostics = chain_diagnostics(&samples);
        assert_eq!(diagnostics.draw_count, 6);
        assert_eq!(diagnostics.fixed_coefficients.len(), 2);
        assert_eq!(diagnostics.precision_multipliers.len(), 1);
        assert!(diagnostics.min_predictor_ess.is_some());
        assert_eq!(chain_diagnostics(&PosteriorSamples::default()).draw_count, 0);
    }
}
