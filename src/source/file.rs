//! Measurements read from a metrics document or held in memory

use super::MetricSource;
use crate::error::Result;
use crate::types::{Measurements, MetricValue, RawMeasurement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Raw metrics per repository, as written by the `fetch` command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub repositories: BTreeMap<String, RepositoryMetrics>,
}

/// Raw metrics of a single repository
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryMetrics {
    pub metrics: BTreeMap<String, MetricValue>,
}

impl MetricsDocument {
    /// Record a batch of measurements under their projects
    pub fn extend(&mut self, measurements: impl IntoIterator<Item = RawMeasurement>) {
        for m in measurements {
            self.repositories
                .entry(m.project)
                .or_default()
                .metrics
                .insert(m.metric, m.value);
        }
    }
}

/// Source serving measurements that are already known
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    document: MetricsDocument,
    measured_at: DateTime<Utc>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, document: MetricsDocument) -> Self {
        Self {
            name: name.into(),
            document,
            measured_at: Utc::now(),
        }
    }

    /// Read a metrics document from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let document: MetricsDocument = serde_json::from_str(&content)?;
        debug!(
            "Loaded metrics for {} repositories from {}",
            document.repositories.len(),
            path.display()
        );
        Ok(Self::new(format!("file:{}", path.display()), document))
    }

    pub fn with_timestamp(mut self, measured_at: DateTime<Utc>) -> Self {
        self.measured_at = measured_at;
        self
    }

    /// Add or replace one metric value
    pub fn insert(&mut self, project: &str, metric: &str, value: impl Into<MetricValue>) {
        self.document
            .repositories
            .entry(project.to_string())
            .or_default()
            .metrics
            .insert(metric.to_string(), value.into());
    }

    pub fn projects(&self) -> impl Iterator<Item = &str> {
        self.document.repositories.keys().map(String::as_str)
    }
}

#[async_trait]
impl MetricSource for StaticSource {
    async fn fetch(&self, project: &str) -> Result<Measurements> {
        let Some(repository) = self.document.repositories.get(project) else {
            debug!("No metrics recorded for {}", project);
            return Ok(Measurements::empty());
        };

        let measurements: Vec<RawMeasurement> = repository
            .metrics
            .iter()
            .map(|(metric, value)| RawMeasurement {
                project: project.to_string(),
                metric: metric.clone(),
                value: value.clone(),
                measured_at: self.measured_at,
                source: self.name.clone(),
            })
            .collect();

        Ok(measurements.into())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_fetch_from_document() {
        let doc: MetricsDocument = serde_json::from_str(
            r#"{
                "repositories": {
                    "https://github.com/chaoss/grimoirelab": {
                        "metrics": { "total_commits": 42, "pony_factor": 3, "archived": false }
                    }
                }
            }"#,
        )
        .unwrap();
        let source = StaticSource::new("memory", doc);

        let measurements: Vec<_> = source
            .fetch("https://github.com/chaoss/grimoirelab")
            .await
            .unwrap()
            .collect();
        assert_eq!(measurements.len(), 3);
        let commits = measurements.iter().find(|m| m.metric == "total_commits").unwrap();
        assert_eq!(commits.value, MetricValue::Number(42.0));
        assert_eq!(commits.source, "memory");
    }

    #[tokio::test]
    async fn test_unknown_project_is_empty() {
        let source = StaticSource::new("memory", MetricsDocument::default());
        let measurements = source.fetch("https://example.org/none").await.unwrap();
        assert_eq!(measurements.remaining(), 0);
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"repositories": {{"p": {{"metrics": {{"total_commits": 1}}}}}}}}"#).unwrap();

        let source = StaticSource::from_file(file.path()).unwrap();
        assert_eq!(source.projects().collect::<Vec<_>>(), vec!["p"]);
        assert!(source.name().starts_with("file:"));
    }

    #[test]
    fn test_document_extend() {
        let mut doc = MetricsDocument::default();
        let now = Utc::now();
        doc.extend(vec![
            RawMeasurement::new("p", "total_commits", 3.0, now, "test"),
            RawMeasurement::new("p", "pony_factor", 1.0, now, "test"),
        ]);
        assert_eq!(doc.repositories["p"].metrics.len(), 2);
    }
}
