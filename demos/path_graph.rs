use std::collections::HashMap;
use std::sync::Arc;

use faer::Mat;
use ili_gmrf::utils::sparse_from_entries;
use ili_gmrf::{
    Adjacency, FixedEffectTerm, GlmmConfig, GlmmModel, Hyperprior, LikelihoodFamily, MapOptions,
    McmcSchedule, ObservationPrecision, ObservationSet, RandomEffectTerm, Regularization,
    StructuralMatrix, UpdateConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let counties: Vec<String> = ["A", "B", "C"].iter().map(ToString::to_string).collect();
    let neighbors: HashMap<String, Vec<&str>> = HashMap::from([
        ("A".to_string(), vec!["B"]),
        ("B".to_string(), vec!["A", "C"]),
        ("C".to_string(), vec!["B", "Z"]),
    ]);
    let adjacency = Adjacency::from_neighbor_map(counties, &neighbors)?;
    let spatial = Arc::new(StructuralMatrix::from_adjacency(
        &adjacency,
        Regularization::default(),
    )?);
    println!(
        "Spatial structure: {} nodes, {} edges, rank deficiency {}",
        spatial.dim(),
        adjacency.edge_count(),
        spatial.rank_deficiency()
    );

    let config = GlmmConfig::new(3, 0.0)
        .with_random_effect(RandomEffectTerm::new(
            vec![spatial],
            1_000.0,
            Hyperprior::Fixed,
        )?)
        .with_fixed_effects(FixedEffectTerm::estimated(
            Mat::from_fn(3, 1, |_, _| 1.0),
            0.0,
            0.2,
        ))
        .with_observation_set(
            ObservationSet::new(
                sparse_from_entries(3, 3, (0..3).map(|idx| (idx, idx, 1.0)))?,
                LikelihoodFamily::default(),
            )
            .with_precision(ObservationPrecision::Scalar(100.0)),
        );
    let observed = vec![vec![0.1, 0.2, 0.15]];

    let mut model = GlmmModel::new(config.clone())?;
    let report = model.update(
        &observed,
        &UpdateConfig::mcmc(McmcSchedule {
            num_sample: 2_000,
            num_burn_in: 500,
            thinning: 2,
            seed: 2_026,
        }),
        None,
    )?;
    println!(
        "MCMC: epochs={}, retained draws={}",
        report.epochs_run, report.retained_draws
    );
    for (block, stats) in &report.acceptance {
        println!("  {block}: acceptance {:.2}", stats.acceptance_rate());
    }
    for (node, summary) in model.predictor_summary()?.iter().enumerate() {
        println!(
            "  node {node}: mean={:.4}, 95% CrI [{:.4}, {:.4}]",
            summary.mean, summary.q025, summary.q975
        );
    }
    if let Some(ess) = model
        .diagnostics()?
        .and_then(|diagnostics| diagnostics.min_predictor_ess)
    {
        println!("  smallest predictor ESS: {ess:.1}");
    }

    let mut map_model = GlmmModel::new(config)?;
    let map_report = map_model.update(&observed, &UpdateConfig::map(MapOptions::default()), None)?;
    println!(
        "MAP: epochs={}, converged={:?}",
        map_report.epochs_run, map_report.converged
    );
    let probabilities = map_model.probability_grid(3, 1)?;
    for node in 0..3 {
        println!("  node {node}: expit(mode)={:.4}", probabilities[(node, 0)]);
    }

    Ok(())
}
