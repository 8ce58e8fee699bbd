//! Metric sources: where raw per-project measurements come from

pub mod events;
pub mod file;
pub mod grimoirelab;
pub mod opensearch;

pub use events::{GitEvent, GitEventsAnalyzer, COMMIT_EVENT_TYPE};
pub use file::{MetricsDocument, RepositoryMetrics, StaticSource};
pub use grimoirelab::{GrimoireLabClient, GrimoireLabSource};
pub use opensearch::OpenSearchSource;

use crate::error::Result;
use crate::types::Measurements;
use async_trait::async_trait;

/// A store that can produce measurements for a project.
///
/// An unknown project yields an empty sequence; store or network failures are
/// reported as [`TrustError::SourceUnavailable`](crate::TrustError::SourceUnavailable).
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fetch every available measurement for one project
    async fn fetch(&self, project: &str) -> Result<Measurements>;

    /// Short label used in logs and measurement attribution
    fn name(&self) -> &str;
}
