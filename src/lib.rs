//! # trustable_score
//!
//! Composite trust scores for open source projects, built from:
//! - **Activity metrics**: git commit events collected by GrimoireLab and stored in OpenSearch
//! - **License risk**: SPDX license expressions, classified from permissive to proprietary
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trustable_score::{
//!     score_batch, BatchOptions, OpenSearchSource, ProjectInput, ScoringEngine, TrustConfig,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = TrustConfig::default();
//! config.validate()?;
//!
//! let registry = Arc::new(config.build_registry()?);
//! let engine = Arc::new(ScoringEngine::new(registry, config.license_multipliers.clone())?);
//! let source = Arc::new(OpenSearchSource::new(&config.source, &config.network)?);
//!
//! let projects = vec![ProjectInput::new(
//!     "https://github.com/chaoss/grimoirelab-perceval",
//!     Some("GPL-3.0-or-later".to_string()),
//! )];
//! let (_cancel, cancelled) = tokio::sync::watch::channel(false);
//! let outcome = score_batch(projects, source, engine, &BatchOptions::from_config(&config), cancelled).await;
//!
//! for score in outcome.scores {
//!     println!("{}: {:.2} ({})", score.project, score.score, score.license_risk);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - Closed metric registry, validated and frozen before scoring
//! - Linear, logarithmic, piecewise, categorical and presence normalization
//! - Per-metric breakdown with coverage of measured vs defaulted signals
//! - Bounded concurrent fetching with per-project timeouts and cancellation
//! - SPDX SBOM input and GrimoireLab repository scheduling
//! - JSON, Markdown and text reports

mod batch;
mod config;
mod error;
mod license;
mod registry;
mod report;
mod sbom;
mod scoring;
mod types;

pub mod source;

// Re-export public API
pub use batch::{score_batch, score_project, BatchOptions, BatchOutcome};
pub use config::{
    default_metrics, GrimoireLabConfig, LicensePolicy, NetworkConfig, SourceConfig, TrustConfig,
    TrustConfigBuilder, DEFAULT_CODE_FILE_PATTERN,
};
pub use error::{Result, TrustError};
pub use license::{analyze_license, classify, LicenseMultipliers};
pub use registry::{
    Breakpoint, MetricDefinition, MetricRegistry, MetricRegistryBuilder, Normalization,
    ValueDomain,
};
pub use report::{assemble, Report, ReportFormat, ReportRow, ReportSummary};
pub use sbom::{parse_sbom, read_sbom, repository_url};
pub use scoring::ScoringEngine;
pub use source::{
    GrimoireLabClient, GrimoireLabSource, MetricSource, MetricsDocument, OpenSearchSource,
    StaticSource,
};
pub use types::{
    CompositeScore, Contribution, LicenseRisk, Measurements, MetricValue, NormalizedSignal,
    ProjectFailure, ProjectInput, RawMeasurement,
};
