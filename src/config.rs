//! Configuration for sources, scoring and license handling

use crate::error::{Result, TrustError};
use crate::license::LicenseMultipliers;
use crate::registry::{Breakpoint, MetricDefinition, MetricRegistry, Normalization, ValueDomain};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// File extensions counted as code by the git events analyzer
pub const DEFAULT_CODE_FILE_PATTERN: &str = r"\.bazel$|\.bazelrc$|\.bzl$|\.c$|\.cc$|\.cp$|\.cpp$|\.cxx$|\.c\+\+$|\.go$|\.h$|\.js$|\.mjs$|\.java$|\.py$|\.rs$|\.sh$|\.tf$|\.ts$";

/// Main configuration for a scoring run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Metric definitions; replaces the default set when given
    pub metrics: Vec<MetricDefinition>,
    /// Multiplier applied to the base score per license risk
    pub license_multipliers: LicenseMultipliers,
    /// License policy configuration
    pub license_policy: LicensePolicy,
    /// Activity data source
    pub source: SourceConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// GrimoireLab scheduling (disabled without a URL)
    pub grimoirelab: GrimoireLabConfig,
}

/// License policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicensePolicy {
    /// Allowed license types (empty = allow all)
    pub allowed_licenses: HashSet<String>,
    /// Explicitly forbidden licenses, scored as proprietary
    pub forbidden_licenses: HashSet<String>,
    /// Warn on copyleft licenses
    pub warn_on_copyleft: bool,
    /// Warn on unknown licenses
    pub warn_on_unknown: bool,
}

/// Where git activity events are read from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// OpenSearch server URL
    pub opensearch_url: String,
    /// Index holding GrimoireLab events
    pub opensearch_index: String,
    /// Verify TLS certificates of the OpenSearch server
    pub verify_certs: bool,
    /// Start of the analysis window (default: one year ago)
    pub from_date: Option<NaiveDate>,
    /// End of the analysis window, exclusive (default: open)
    pub to_date: Option<NaiveDate>,
    /// Regular expression matching code files
    pub code_file_pattern: String,
    /// Page size for scroll requests
    pub page_size: u32,
}

/// Network configuration for API calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for failed requests
    pub max_retries: u32,
    /// Base delay between retries (milliseconds)
    pub request_delay_ms: u64,
    /// Upper bound for fetching one project's measurements, in seconds
    pub fetch_timeout_secs: u64,
    /// Maximum number of projects fetched at the same time
    pub max_concurrent_fetches: usize,
}

/// GrimoireLab API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrimoireLabConfig {
    /// GrimoireLab API URL; scheduling is skipped when unset
    pub url: Option<String>,
    /// API user (optional)
    pub user: Option<String>,
    /// API password (optional)
    pub password: Option<String>,
    /// Delay between readiness checks, in seconds
    pub poll_interval_secs: u64,
    /// How long to wait for a repository to be analyzed, in seconds
    pub repository_timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            license_multipliers: LicenseMultipliers::default(),
            license_policy: LicensePolicy::default(),
            source: SourceConfig::default(),
            network: NetworkConfig::default(),
            grimoirelab: GrimoireLabConfig::default(),
        }
    }
}

impl Default for LicensePolicy {
    fn default() -> Self {
        Self {
            allowed_licenses: HashSet::new(),
            forbidden_licenses: HashSet::new(),
            warn_on_copyleft: true,
            warn_on_unknown: true,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            opensearch_url: "http://localhost:9200/".to_string(),
            opensearch_index: "events".to_string(),
            verify_certs: false,
            from_date: None,
            to_date: None,
            code_file_pattern: DEFAULT_CODE_FILE_PATTERN.to_string(),
            page_size: 500,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            request_delay_ms: 100,
            fetch_timeout_secs: 300,
            max_concurrent_fetches: 8,
        }
    }
}

impl Default for GrimoireLabConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: std::env::var("GRIMOIRELAB_USER").ok(),
            password: std::env::var("GRIMOIRELAB_PASSWORD").ok(),
            poll_interval_secs: 5,
            repository_timeout_secs: 3600,
        }
    }
}

impl NetworkConfig {
    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get retry delay as Duration
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Get per-project fetch timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl GrimoireLabConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn repository_timeout(&self) -> Duration {
        Duration::from_secs(self.repository_timeout_secs)
    }
}

/// Illustrative metric set over the git activity measurements
pub fn default_metrics() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition::new(
            "commits_week_mean",
            ValueDomain::non_negative(),
            Normalization::Piecewise {
                points: vec![
                    Breakpoint { input: 0.0, score: 0.0 },
                    Breakpoint { input: 1.0, score: 0.4 },
                    Breakpoint { input: 5.0, score: 0.8 },
                    Breakpoint { input: 20.0, score: 1.0 },
                ],
            },
            0.25,
        )
        .with_description("Average number of commits per week"),
        MetricDefinition::new(
            "total_contributors",
            ValueDomain::non_negative(),
            Normalization::Logarithmic { saturation: 50.0 },
            0.15,
        )
        .with_description("Distinct commit authors"),
        MetricDefinition::new(
            "pony_factor",
            ValueDomain::non_negative(),
            Normalization::Piecewise {
                points: vec![
                    Breakpoint { input: 0.0, score: 0.0 },
                    Breakpoint { input: 1.0, score: 0.2 },
                    Breakpoint { input: 3.0, score: 0.6 },
                    Breakpoint { input: 6.0, score: 1.0 },
                ],
            },
            0.20,
        )
        .with_description("Fewest authors producing more than half of the commits"),
        MetricDefinition::new(
            "elephant_factor",
            ValueDomain::non_negative(),
            Normalization::Linear { low: 0.0, high: 4.0 },
            0.15,
        )
        .with_description("Fewest organizations producing more than half of the commits"),
        MetricDefinition::new(
            "developer_categories_core",
            ValueDomain::non_negative(),
            Normalization::Logarithmic { saturation: 20.0 },
            0.10,
        )
        .with_description("Core developers (first 80% of contributions)"),
        MetricDefinition::new(
            "total_commits",
            ValueDomain::non_negative(),
            Normalization::Logarithmic { saturation: 1000.0 },
            0.15,
        )
        .with_description("Commits in the analysis window"),
    ]
}

impl TrustConfig {
    /// Create a new builder for TrustConfig
    pub fn builder() -> TrustConfigBuilder {
        TrustConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrustConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build and freeze the metric registry
    pub fn build_registry(&self) -> Result<MetricRegistry> {
        MetricRegistry::from_definitions(self.metrics.iter().cloned())
    }

    /// Validate everything that must hold before any scoring starts
    pub fn validate(&self) -> Result<()> {
        self.build_registry()?;
        self.license_multipliers.validate()?;
        regex::Regex::new(&self.source.code_file_pattern).map_err(|e| {
            TrustError::config(format!("invalid code file pattern: {}", e))
        })?;
        if let (Some(from), Some(to)) = (self.source.from_date, self.source.to_date) {
            if from >= to {
                return Err(TrustError::config(format!(
                    "from date {} must be before to date {}",
                    from, to
                )));
            }
        }
        if self.network.max_concurrent_fetches == 0 {
            return Err(TrustError::config("max_concurrent_fetches must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for TrustConfig
#[derive(Default)]
pub struct TrustConfigBuilder {
    metrics: Option<Vec<MetricDefinition>>,
    license_multipliers: Option<LicenseMultipliers>,
    license_policy: Option<LicensePolicy>,
    source: Option<SourceConfig>,
    network: Option<NetworkConfig>,
    grimoirelab: Option<GrimoireLabConfig>,
}

impl TrustConfigBuilder {
    pub fn metrics(mut self, metrics: Vec<MetricDefinition>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn license_multipliers(mut self, multipliers: LicenseMultipliers) -> Self {
        self.license_multipliers = Some(multipliers);
        self
    }

    pub fn license_policy(mut self, policy: LicensePolicy) -> Self {
        self.license_policy = Some(policy);
        self
    }

    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    pub fn grimoirelab(mut self, grimoirelab: GrimoireLabConfig) -> Self {
        self.grimoirelab = Some(grimoirelab);
        self
    }

    pub fn build(self) -> TrustConfig {
        TrustConfig {
            metrics: self.metrics.unwrap_or_else(default_metrics),
            license_multipliers: self.license_multipliers.unwrap_or_default(),
            license_policy: self.license_policy.unwrap_or_default(),
            source: self.source.unwrap_or_default(),
            network: self.network.unwrap_or_default(),
            grimoirelab: self.grimoirelab.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrustConfig::default();
        config.validate().unwrap();

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 6);
        assert!((registry.total_weight() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_toml() {
        let config: TrustConfig = toml::from_str(
            r#"
            [[metrics]]
            key = "activity"
            weight = 0.6
            domain = { type = "numeric", min = 0.0, max = 1.0 }
            normalization = { strategy = "linear", low = 0.0, high = 1.0 }

            [[metrics]]
            key = "security"
            weight = 0.4
            domain = { type = "boolean" }
            normalization = { strategy = "presence", present = 1.0, absent = 0.0 }

            [license_multipliers]
            unknown = 0.4

            [source]
            opensearch_url = "https://search.example.org"
            from_date = "2024-01-01"

            [network]
            max_concurrent_fetches = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.metrics.len(), 2);
        assert_eq!(config.license_multipliers.unknown, 0.4);
        assert_eq!(config.license_multipliers.permissive, 1.0);
        assert_eq!(config.source.opensearch_index, "events");
        assert_eq!(config.source.from_date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(config.network.max_concurrent_fetches, 2);
        assert_eq!(config.network.timeout_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_weights_invalid() {
        let mut config = TrustConfig::default();
        for metric in &mut config.metrics {
            metric.weight = 0.0;
        }
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bad_date_range_invalid() {
        let mut config = TrustConfig::default();
        config.source.from_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        config.source.to_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = TrustConfig::builder()
            .network(NetworkConfig {
                max_concurrent_fetches: 1,
                ..Default::default()
            })
            .build();
        assert_eq!(config.network.max_concurrent_fetches, 1);
        assert_eq!(config.metrics.len(), default_metrics().len());
    }
}
