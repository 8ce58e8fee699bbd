//! Scoring a few projects from metrics that are already known

use std::sync::Arc;
use trustable_score::{
    assemble, score_batch, BatchOptions, MetricsDocument, ProjectInput, ReportFormat,
    ScoringEngine, StaticSource, TrustConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = TrustConfig::default();
    config.validate()?;

    let registry = Arc::new(config.build_registry()?);
    let engine = Arc::new(ScoringEngine::new(registry, config.license_multipliers.clone())?);

    // Metrics as GrimoireLab would report them
    let mut source = StaticSource::new("demo", MetricsDocument::default());
    let perceval = "https://github.com/chaoss/grimoirelab-perceval";
    source.insert(perceval, "total_commits", 1000.0);
    source.insert(perceval, "total_contributors", 50.0);
    source.insert(perceval, "pony_factor", 6.0);
    source.insert(perceval, "elephant_factor", 4.0);
    source.insert(perceval, "commits_week_mean", 20.0);

    let sortinghat = "https://github.com/chaoss/grimoirelab-sortinghat";
    source.insert(sortinghat, "total_commits", 120.0);
    source.insert(sortinghat, "total_contributors", 8.0);
    source.insert(sortinghat, "pony_factor", 2.0);

    let projects = vec![
        ProjectInput::new(perceval, Some("GPL-3.0-or-later".to_string())),
        ProjectInput::new(sortinghat, Some("MIT".to_string())),
        ProjectInput::new("https://github.com/example/unlisted", None),
    ];

    let (_cancel, cancelled) = tokio::sync::watch::channel(false);
    let outcome = score_batch(
        projects,
        Arc::new(source),
        engine,
        &BatchOptions::from_config(&config),
        cancelled,
    )
    .await;

    for (project, warnings) in &outcome.warnings {
        for warning in warnings {
            println!("⚠  {}: {}", project, warning);
        }
    }

    let report = assemble(outcome.scores).with_failures(outcome.failures);
    println!("{}", report.render(ReportFormat::Text)?);

    if let Some(best) = report.scores.first() {
        println!("Most trustable: {} ({:.2})", best.project, best.score);
    }

    Ok(())
}
