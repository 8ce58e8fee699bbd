//! Concurrent scoring of many projects

use crate::config::{LicensePolicy, TrustConfig};
use crate::error::{Result, TrustError};
use crate::license::analyze_license;
use crate::scoring::ScoringEngine;
use crate::source::MetricSource;
use crate::types::{CompositeScore, ProjectFailure, ProjectInput};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Limits applied to a batch run
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of projects fetched at the same time
    pub max_concurrent: usize,
    /// Upper bound for fetching one project's measurements
    pub fetch_timeout: Duration,
    /// Policy used when classifying each project's license
    pub license_policy: LicensePolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&TrustConfig::default())
    }
}

impl BatchOptions {
    /// When GrimoireLab scheduling is configured, waiting for a repository to be
    /// analyzed counts towards each project's fetch timeout
    pub fn from_config(config: &TrustConfig) -> Self {
        let mut fetch_timeout = config.network.fetch_timeout();
        if config.grimoirelab.url.is_some() {
            fetch_timeout += config.grimoirelab.repository_timeout();
        }

        Self {
            max_concurrent: config.network.max_concurrent_fetches,
            fetch_timeout,
            license_policy: config.license_policy.clone(),
        }
    }
}

/// Everything a batch run produced
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Scores of the projects that completed, in input order
    pub scores: Vec<CompositeScore>,
    /// Projects that could not be scored
    pub failures: Vec<ProjectFailure>,
    /// Projects skipped because the run was cancelled before they started
    pub cancelled: Vec<String>,
    /// License policy warnings per project
    pub warnings: BTreeMap<String, Vec<String>>,
}

impl BatchOutcome {
    /// True when every project was scored
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.cancelled.is_empty()
    }
}

enum TaskResult {
    Scored(CompositeScore, Vec<String>),
    Failed(ProjectFailure),
    Cancelled,
}

/// Fetch, classify and score a single project
pub async fn score_project(
    input: &ProjectInput,
    source: &dyn MetricSource,
    engine: &ScoringEngine,
    policy: &LicensePolicy,
) -> Result<(CompositeScore, Vec<String>)> {
    let measurements = source.fetch(&input.project).await?;
    let (risk, warnings) = analyze_license(input.license.as_deref(), policy);
    let score = engine.score(&input.project, measurements, risk)?;
    Ok((score, warnings))
}

/// Score every project, isolating failures per project.
///
/// At most `options.max_concurrent` fetches run at once and each is bounded by
/// `options.fetch_timeout`. Once `cancel` turns true, projects that have not
/// started fetching are reported as cancelled while in-flight ones complete.
pub async fn score_batch(
    projects: Vec<ProjectInput>,
    source: Arc<dyn MetricSource>,
    engine: Arc<ScoringEngine>,
    options: &BatchOptions,
    cancel: watch::Receiver<bool>,
) -> BatchOutcome {
    info!(
        "Scoring {} projects from {} (max {} concurrent)",
        projects.len(),
        source.name(),
        options.max_concurrent
    );

    let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut tasks = Vec::with_capacity(projects.len());

    for input in projects {
        let source = Arc::clone(&source);
        let engine = Arc::clone(&engine);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let policy = options.license_policy.clone();
        let fetch_timeout = options.fetch_timeout;
        let project = input.project.clone();

        let task = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            if *cancel.borrow() {
                debug!("Skipping {} after cancellation", input.project);
                return TaskResult::Cancelled;
            }

            let outcome = tokio::time::timeout(
                fetch_timeout,
                score_project(&input, source.as_ref(), &engine, &policy),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TrustError::source_unavailable(
                    &input.project,
                    format!("fetch timed out after {}s", fetch_timeout.as_secs_f64()),
                ))
            });

            match outcome {
                Ok((score, warnings)) => TaskResult::Scored(score, warnings),
                Err(e) => TaskResult::Failed(failure(&input.project, &e)),
            }
        });

        tasks.push((project, task));
    }

    let mut outcome = BatchOutcome::default();
    for (project, task) in tasks {
        match task.await {
            Ok(TaskResult::Scored(score, warnings)) => {
                for warning in &warnings {
                    warn!("{}: {}", project, warning);
                }
                if !warnings.is_empty() {
                    outcome.warnings.insert(project, warnings);
                }
                outcome.scores.push(score);
            }
            Ok(TaskResult::Failed(failure)) => {
                warn!("Failed to score {}: {}", failure.project, failure.reason);
                outcome.failures.push(failure);
            }
            Ok(TaskResult::Cancelled) => outcome.cancelled.push(project),
            Err(e) => {
                warn!("Task failed for {}: {}", project, e);
                outcome.failures.push(ProjectFailure {
                    project,
                    metric: None,
                    reason: format!("scoring task failed: {}", e),
                });
            }
        }
    }

    info!(
        "Batch complete: {} scored, {} failed, {} cancelled",
        outcome.scores.len(),
        outcome.failures.len(),
        outcome.cancelled.len()
    );

    outcome
}

fn failure(project: &str, error: &TrustError) -> ProjectFailure {
    ProjectFailure {
        project: project.to_string(),
        metric: error.metric().map(str::to_string),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::LicenseMultipliers;
    use crate::registry::{MetricDefinition, MetricRegistry, Normalization, ValueDomain};
    use crate::source::{MetricsDocument, StaticSource};
    use crate::types::Measurements;
    use async_trait::async_trait;

    fn engine() -> Arc<ScoringEngine> {
        let ratio = |key: &str, weight: f64| {
            MetricDefinition::new(
                key,
                ValueDomain::Numeric {
                    min: Some(0.0),
                    max: Some(1.0),
                },
                Normalization::Linear { low: 0.0, high: 1.0 },
                weight,
            )
        };
        let registry = MetricRegistry::from_definitions([ratio("activity", 0.6), ratio("security", 0.4)]).unwrap();
        Arc::new(ScoringEngine::new(Arc::new(registry), LicenseMultipliers::default()).unwrap())
    }

    fn inputs(names: &[&str]) -> Vec<ProjectInput> {
        names
            .iter()
            .map(|n| ProjectInput::new(*n, Some("MIT".to_string())))
            .collect()
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_domain_violation_isolated() {
        let mut source = StaticSource::new("memory", MetricsDocument::default());
        for (project, activity) in [("a", 0.9), ("b", 0.5), ("c", -0.2), ("d", 1.0), ("e", 0.1)] {
            source.insert(project, "activity", activity);
            source.insert(project, "security", 1.0);
        }

        let outcome = score_batch(
            inputs(&["a", "b", "c", "d", "e"]),
            Arc::new(source),
            engine(),
            &BatchOptions::default(),
            not_cancelled(),
        )
        .await;

        assert_eq!(outcome.scores.len(), 4);
        assert_eq!(outcome.failures.len(), 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.project, "c");
        assert_eq!(failure.metric.as_deref(), Some("activity"));
        assert!(failure.reason.contains("outside its declared domain"));
        assert!(!outcome.is_complete());
    }

    struct SlowSource {
        slow: &'static str,
    }

    #[async_trait]
    impl MetricSource for SlowSource {
        async fn fetch(&self, project: &str) -> Result<Measurements> {
            if project == self.slow {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Measurements::empty())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_options_from_config() {
        let mut config = TrustConfig::default();
        config.network.fetch_timeout_secs = 60;
        config.grimoirelab.repository_timeout_secs = 600;

        let options = BatchOptions::from_config(&config);
        assert_eq!(options.fetch_timeout, Duration::from_secs(60));
        assert_eq!(options.max_concurrent, config.network.max_concurrent_fetches);

        config.grimoirelab.url = Some("http://localhost:8000/api/v1".to_string());
        let options = BatchOptions::from_config(&config);
        assert_eq!(options.fetch_timeout, Duration::from_secs(660));
    }

    #[tokio::test]
    async fn test_timeout_fails_only_that_project() {
        let options = BatchOptions {
            fetch_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let outcome = score_batch(
            inputs(&["fast", "stuck", "quick"]),
            Arc::new(SlowSource { slow: "stuck" }),
            engine(),
            &options,
            not_cancelled(),
        )
        .await;

        assert_eq!(outcome.scores.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].project, "stuck");
        assert!(outcome.failures[0].reason.contains("timed out"));
    }

    struct CancellingSource {
        cancel: watch::Sender<bool>,
    }

    #[async_trait]
    impl MetricSource for CancellingSource {
        async fn fetch(&self, _project: &str) -> Result<Measurements> {
            let _ = self.cancel.send(true);
            Ok(Measurements::empty())
        }

        fn name(&self) -> &str {
            "cancelling"
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_in_flight_results() {
        let (tx, rx) = watch::channel(false);
        let options = BatchOptions {
            max_concurrent: 1,
            ..Default::default()
        };

        let outcome = score_batch(
            inputs(&["a", "b", "c"]),
            Arc::new(CancellingSource { cancel: tx }),
            engine(),
            &options,
            rx,
        )
        .await;

        assert_eq!(outcome.scores.len(), 1);
        assert_eq!(outcome.cancelled.len(), 2);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (tx, rx) = watch::channel(true);
        let outcome = score_batch(
            inputs(&["a", "b"]),
            Arc::new(StaticSource::new("memory", MetricsDocument::default())),
            engine(),
            &BatchOptions::default(),
            rx,
        )
        .await;
        drop(tx);

        assert!(outcome.scores.is_empty());
        assert_eq!(outcome.cancelled, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_license_warnings_collected() {
        let mut source = StaticSource::new("memory", MetricsDocument::default());
        source.insert("gpl", "activity", 1.0);
        let projects = vec![ProjectInput::new("gpl", Some("GPL-3.0-only".to_string()))];

        let outcome = score_batch(
            projects,
            Arc::new(source),
            engine(),
            &BatchOptions::default(),
            not_cancelled(),
        )
        .await;

        assert_eq!(outcome.scores[0].license_multiplier, 0.5);
        assert!(outcome.warnings["gpl"][0].contains("Copyleft"));
    }
}
