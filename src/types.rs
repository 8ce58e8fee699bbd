//! Core data types for measurements, signals and scores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A raw metric value as produced by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Flag(bool),
    Category(String),
}

impl MetricValue {
    /// Short name of the value kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Flag(_) => "boolean",
            Self::Category(_) => "category",
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Flag(b) => write!(f, "{}", b),
            Self::Category(c) => write!(f, "{}", c),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// A single measurement for one metric of one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    /// Project identifier (usually a repository URL)
    pub project: String,
    /// Metric key
    pub metric: String,
    /// Raw value
    pub value: MetricValue,
    /// When the measurement was taken
    pub measured_at: DateTime<Utc>,
    /// Where the measurement came from
    pub source: String,
}

impl RawMeasurement {
    pub fn new(
        project: impl Into<String>,
        metric: impl Into<String>,
        value: impl Into<MetricValue>,
        measured_at: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            metric: metric.into(),
            value: value.into(),
            measured_at,
            source: source.into(),
        }
    }
}

/// Single-pass sequence of measurements returned by a source.
///
/// The sequence is moved into the scoring engine and cannot be replayed.
#[derive(Debug, Default)]
pub struct Measurements {
    inner: std::vec::IntoIter<RawMeasurement>,
}

impl Measurements {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of measurements not yet consumed
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl From<Vec<RawMeasurement>> for Measurements {
    fn from(items: Vec<RawMeasurement>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }
}

impl Iterator for Measurements {
    type Item = RawMeasurement;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// A metric value mapped into [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub metric: String,
    pub value: f64,
    /// 1.0 when measured, 0.0 when the metric default was used
    pub confidence: f64,
}

impl NormalizedSignal {
    pub fn measured(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            confidence: 1.0,
        }
    }

    pub fn defaulted(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            confidence: 0.0,
        }
    }
}

/// License risk categorization, ordered from least to most risky
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LicenseRisk {
    /// Permissive licenses (MIT, Apache, BSD, etc.)
    Permissive,
    /// File or library scoped copyleft (LGPL, MPL, EPL, etc.)
    WeakCopyleft,
    /// Project scoped copyleft (GPL, AGPL, etc.)
    StrongCopyleft,
    /// Proprietary or restrictive licenses
    Proprietary,
    /// License absent, not asserted, or not parsable
    Unknown,
}

impl LicenseRisk {
    pub const ALL: [LicenseRisk; 5] = [
        Self::Permissive,
        Self::WeakCopyleft,
        Self::StrongCopyleft,
        Self::Proprietary,
        Self::Unknown,
    ];
}

impl std::fmt::Display for LicenseRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permissive => write!(f, "Permissive"),
            Self::WeakCopyleft => write!(f, "Weak copyleft"),
            Self::StrongCopyleft => write!(f, "Strong copyleft"),
            Self::Proprietary => write!(f, "Proprietary"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Provenance of one metric in a composite score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Effective weight (share of the total active weight)
    pub weight: f64,
    /// Normalized value in [0, 1]
    pub normalized: f64,
    /// 1.0 when measured, 0.0 when defaulted
    pub confidence: f64,
    /// Points contributed to the base score
    pub contribution: f64,
}

impl Contribution {
    /// Points this metric could have contributed but did not
    pub fn shortfall(&self) -> f64 {
        self.weight * 100.0 - self.contribution
    }
}

/// Final trust score for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    /// Project identifier
    pub project: String,
    /// License adjusted score (0-100, two decimals)
    pub score: f64,
    /// Score before the license adjustment (0-100, two decimals)
    pub base_score: f64,
    /// License risk used for the adjustment
    pub license_risk: LicenseRisk,
    /// Multiplier applied for the license risk
    pub license_multiplier: f64,
    /// Per metric breakdown, ordered by metric key
    pub breakdown: BTreeMap<String, Contribution>,
    /// Share of active weight backed by real measurements (0.0-1.0)
    pub coverage: f64,
    /// Timestamp of the scoring run
    pub computed_at: DateTime<Utc>,
}

impl CompositeScore {
    /// Metric with the largest contribution
    pub fn top_contributor(&self) -> Option<(&str, &Contribution)> {
        self.breakdown
            .iter()
            .filter(|(_, c)| c.contribution > 0.0)
            .fold(None, |best: Option<(&String, &Contribution)>, (k, c)| match best {
                Some((_, b)) if b.contribution >= c.contribution => best,
                _ => Some((k, c)),
            })
            .map(|(k, c)| (k.as_str(), c))
    }

    /// Metric with the largest shortfall from its maximum contribution
    pub fn top_detractor(&self) -> Option<(&str, &Contribution)> {
        self.breakdown
            .iter()
            .filter(|(_, c)| c.shortfall() > 1e-9)
            .fold(None, |best: Option<(&String, &Contribution)>, (k, c)| match best {
                Some((_, b)) if b.shortfall() >= c.shortfall() => best,
                _ => Some((k, c)),
            })
            .map(|(k, c)| (k.as_str(), c))
    }
}

/// A project that could not be scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFailure {
    pub project: String,
    /// Offending metric, when the failure is tied to one
    pub metric: Option<String>,
    pub reason: String,
}

/// A project to score together with its license declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInput {
    pub project: String,
    pub license: Option<String>,
}

impl ProjectInput {
    pub fn new(project: impl Into<String>, license: Option<String>) -> Self {
        Self {
            project: project.into(),
            license,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(weight: f64, normalized: f64) -> Contribution {
        Contribution {
            weight,
            normalized,
            confidence: 1.0,
            contribution: weight * normalized * 100.0,
        }
    }

    #[test]
    fn test_metric_value_untagged() {
        let values: Vec<MetricValue> = serde_json::from_str(r#"[3.5, true, "active"]"#).unwrap();
        assert_eq!(values[0], MetricValue::Number(3.5));
        assert_eq!(values[1], MetricValue::Flag(true));
        assert_eq!(values[2], MetricValue::Category("active".into()));
    }

    #[test]
    fn test_license_risk_order() {
        assert!(LicenseRisk::Permissive < LicenseRisk::WeakCopyleft);
        assert!(LicenseRisk::StrongCopyleft < LicenseRisk::Unknown);
        assert_eq!(
            serde_json::to_string(&LicenseRisk::WeakCopyleft).unwrap(),
            "\"weak-copyleft\""
        );
    }

    #[test]
    fn test_measurements_single_pass() {
        let now = Utc::now();
        let mut m = Measurements::from(vec![RawMeasurement::new("p", "a", 1.0, now, "test")]);
        assert_eq!(m.remaining(), 1);
        assert!(m.next().is_some());
        assert!(m.next().is_none());
    }

    #[test]
    fn test_top_contributor_and_detractor() {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("activity".to_string(), contribution(0.6, 0.5));
        breakdown.insert("security".to_string(), contribution(0.4, 1.0));
        let score = CompositeScore {
            project: "p".into(),
            score: 70.0,
            base_score: 70.0,
            license_risk: LicenseRisk::Permissive,
            license_multiplier: 1.0,
            breakdown,
            coverage: 1.0,
            computed_at: Utc::now(),
        };

        assert_eq!(score.top_contributor().map(|(k, _)| k), Some("security"));
        assert_eq!(score.top_detractor().map(|(k, _)| k), Some("activity"));
    }
}
