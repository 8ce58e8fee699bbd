//! Metric registry: declared metrics, their value domains and normalization curves

use crate::error::{Result, TrustError};
use crate::types::{MetricValue, NormalizedSignal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Values a metric accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueDomain {
    /// Real numbers within optional inclusive bounds
    Numeric {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// One of a fixed set of labels
    Category { values: Vec<String> },
    /// True or false
    Boolean,
}

impl ValueDomain {
    /// Non-negative numbers, the domain of every count and ratio metric
    pub fn non_negative() -> Self {
        Self::Numeric {
            min: Some(0.0),
            max: None,
        }
    }

    fn check(&self, value: &MetricValue) -> std::result::Result<(), String> {
        match (self, value) {
            (Self::Numeric { min, max }, MetricValue::Number(n)) => {
                if !n.is_finite() {
                    return Err(format!("{} is not a finite number", n));
                }
                if let Some(min) = min {
                    if n < min {
                        return Err(format!("{} is below the minimum {}", n, min));
                    }
                }
                if let Some(max) = max {
                    if n > max {
                        return Err(format!("{} is above the maximum {}", n, max));
                    }
                }
                Ok(())
            }
            (Self::Category { values }, MetricValue::Category(c)) => {
                if values.iter().any(|v| v == c) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of {:?}", c, values))
                }
            }
            (Self::Boolean, MetricValue::Flag(_)) => Ok(()),
            (domain, value) => Err(format!(
                "expected a {} value, got {} '{}'",
                domain.kind(),
                value.kind(),
                value
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Numeric { .. } => "number",
            Self::Category { .. } => "category",
            Self::Boolean => "boolean",
        }
    }
}

/// A point on a piecewise linear curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub input: f64,
    pub score: f64,
}

/// Strategy mapping a raw value into [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Normalization {
    /// Ramp from `low` (0.0) to `high` (1.0), saturating outside.
    /// `low > high` inverts the ramp for metrics where less is better.
    Linear { low: f64, high: f64 },
    /// `ln(1 + x) / ln(1 + saturation)`, capped at 1.0
    Logarithmic { saturation: f64 },
    /// Linear interpolation between breakpoints sorted by input
    Piecewise { points: Vec<Breakpoint> },
    /// Fixed score per category
    Categorical { scores: BTreeMap<String, f64> },
    /// Fixed score for true and false
    Presence { present: f64, absent: f64 },
}

impl Normalization {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Logarithmic { .. } => "logarithmic",
            Self::Piecewise { .. } => "piecewise",
            Self::Categorical { .. } => "categorical",
            Self::Presence { .. } => "presence",
        }
    }

    fn apply(&self, value: &MetricValue) -> f64 {
        let score = match (self, value) {
            (Self::Linear { low, high }, MetricValue::Number(x)) => (x - low) / (high - low),
            (Self::Logarithmic { saturation }, MetricValue::Number(x)) => {
                x.ln_1p() / saturation.ln_1p()
            }
            (Self::Piecewise { points }, MetricValue::Number(x)) => piecewise(*x, points),
            (Self::Categorical { scores }, MetricValue::Category(c)) => {
                scores.get(c).copied().unwrap_or(0.0)
            }
            (Self::Presence { present, absent }, MetricValue::Flag(flag)) => {
                if *flag {
                    *present
                } else {
                    *absent
                }
            }
            // Domain checks run first, so kinds always line up here
            _ => 0.0,
        };
        // clamp passes NaN through
        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }
}

fn piecewise(value: f64, points: &[Breakpoint]) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if value <= first.input {
        return first.score;
    }
    for w in points.windows(2) {
        if value <= w[1].input {
            let frac = (value - w[0].input) / (w[1].input - w[0].input);
            return w[0].score + frac * (w[1].score - w[0].score);
        }
    }
    last.score
}

/// Declaration of a recognized metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Stable identifier
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub domain: ValueDomain,
    pub normalization: Normalization,
    /// Relative weight (non-negative)
    pub weight: f64,
    /// Normalized value used when the metric was not measured
    #[serde(default)]
    pub default_value: f64,
    /// Disabled metrics are registered but take no part in scoring
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl MetricDefinition {
    /// Create an enabled metric with a 0.0 default value
    pub fn new(
        key: impl Into<String>,
        domain: ValueDomain,
        normalization: Normalization,
        weight: f64,
    ) -> Self {
        Self {
            key: key.into(),
            description: None,
            domain,
            normalization,
            weight,
            default_value: 0.0,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default_value: f64) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TrustError::config(format!("metric '{}': {}", self.key, msg)));

        if self.key.trim().is_empty() {
            return Err(TrustError::config("metric key must not be empty"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return invalid(format!("weight must be a non-negative number, got {}", self.weight));
        }
        if !unit(self.default_value) {
            return invalid(format!("default value {} is outside [0, 1]", self.default_value));
        }

        match &self.domain {
            ValueDomain::Numeric { min, max } => {
                if min.is_some_and(|m| !m.is_finite()) || max.is_some_and(|m| !m.is_finite()) {
                    return invalid("numeric bounds must be finite".to_string());
                }
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return invalid(format!("minimum {} exceeds maximum {}", min, max));
                    }
                }
            }
            ValueDomain::Category { values } => {
                if values.is_empty() {
                    return invalid("category domain declares no values".to_string());
                }
                let unique: BTreeSet<&String> = values.iter().collect();
                if unique.len() != values.len() {
                    return invalid("category domain declares duplicate values".to_string());
                }
            }
            ValueDomain::Boolean => {}
        }

        match (&self.normalization, &self.domain) {
            (Normalization::Linear { low, high }, ValueDomain::Numeric { .. }) => {
                if !low.is_finite() || !high.is_finite() || low == high || !(high - low).is_finite() {
                    return invalid(format!("linear bounds {} and {} must be finite and distinct", low, high));
                }
            }
            (Normalization::Logarithmic { saturation }, ValueDomain::Numeric { min, .. }) => {
                if !saturation.is_finite() || !(saturation.ln_1p() > 0.0) {
                    return invalid(format!("logarithmic saturation must be positive, got {}", saturation));
                }
                if !min.is_some_and(|m| m >= 0.0) {
                    return invalid("logarithmic normalization needs a domain minimum >= 0".to_string());
                }
            }
            (Normalization::Piecewise { points }, ValueDomain::Numeric { .. }) => {
                if points.is_empty() {
                    return invalid("piecewise curve has no breakpoints".to_string());
                }
                if !points.windows(2).all(|w| w[0].input < w[1].input) {
                    return invalid("piecewise breakpoints must be strictly increasing".to_string());
                }
                if points.iter().any(|p| !p.input.is_finite() || !unit(p.score)) {
                    return invalid("piecewise scores must lie in [0, 1]".to_string());
                }
            }
            (Normalization::Categorical { scores }, ValueDomain::Category { values }) => {
                if let Some(missing) = values.iter().find(|v| !scores.contains_key(*v)) {
                    return invalid(format!("no score for category '{}'", missing));
                }
                if let Some(extra) = scores.keys().find(|k| !values.contains(*k)) {
                    return invalid(format!("score given for undeclared category '{}'", extra));
                }
                if scores.values().any(|s| !unit(*s)) {
                    return invalid("category scores must lie in [0, 1]".to_string());
                }
            }
            (Normalization::Presence { present, absent }, ValueDomain::Boolean) => {
                if !unit(*present) || !unit(*absent) {
                    return invalid("presence scores must lie in [0, 1]".to_string());
                }
            }
            (_, domain) => {
                return invalid(format!(
                    "normalization strategy does not apply to a {} domain",
                    domain.kind()
                ));
            }
        }

        Ok(())
    }
}

fn unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Collects metric definitions before the registry is frozen
#[derive(Debug, Default)]
pub struct MetricRegistryBuilder {
    definitions: BTreeMap<String, MetricDefinition>,
}

impl MetricRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric; keys must be unique
    pub fn register(&mut self, definition: MetricDefinition) -> Result<&mut Self> {
        if self.definitions.contains_key(&definition.key) {
            return Err(TrustError::DuplicateMetric(definition.key));
        }
        self.definitions.insert(definition.key.clone(), definition);
        Ok(self)
    }

    /// Validate every definition and produce the immutable registry
    pub fn freeze(self) -> Result<MetricRegistry> {
        for definition in self.definitions.values() {
            definition.validate()?;
        }

        let total_weight: f64 = self
            .definitions
            .values()
            .filter(|d| d.enabled)
            .map(|d| d.weight)
            .sum();

        if !(total_weight > 0.0) || !total_weight.is_finite() {
            return Err(TrustError::config(format!(
                "total weight of active metrics must be finite and greater than zero, got {}",
                total_weight
            )));
        }

        let metrics = self
            .definitions
            .into_iter()
            .map(|(key, definition)| {
                let effective_weight = if definition.enabled {
                    definition.weight / total_weight
                } else {
                    0.0
                };
                (
                    key,
                    RegisteredMetric {
                        definition,
                        effective_weight,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        debug!(
            "Froze metric registry with {} metrics (total active weight {})",
            metrics.len(),
            total_weight
        );

        Ok(MetricRegistry {
            metrics,
            total_weight,
        })
    }
}

#[derive(Debug, Clone)]
struct RegisteredMetric {
    definition: MetricDefinition,
    effective_weight: f64,
}

/// Frozen set of metric definitions, safe to share across threads
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, RegisteredMetric>,
    total_weight: f64,
}

impl MetricRegistry {
    pub fn builder() -> MetricRegistryBuilder {
        MetricRegistryBuilder::new()
    }

    /// Build and freeze a registry from a list of definitions
    pub fn from_definitions(definitions: impl IntoIterator<Item = MetricDefinition>) -> Result<Self> {
        let mut builder = MetricRegistryBuilder::new();
        for definition in definitions {
            builder.register(definition)?;
        }
        builder.freeze()
    }

    pub fn resolve(&self, key: &str) -> Result<&MetricDefinition> {
        self.metrics
            .get(key)
            .map(|m| &m.definition)
            .ok_or_else(|| TrustError::UnknownMetric(key.to_string()))
    }

    /// Check `value` against the metric's domain and map it into [0, 1]
    pub fn normalize(&self, key: &str, value: &MetricValue) -> Result<NormalizedSignal> {
        let definition = self.resolve(key)?;
        definition
            .domain
            .check(value)
            .map_err(|reason| TrustError::domain(key, reason))?;
        Ok(NormalizedSignal::measured(
            key,
            definition.normalization.apply(value),
        ))
    }

    /// Share of the total active weight held by a metric (0.0 when disabled)
    pub fn effective_weight(&self, key: &str) -> Result<f64> {
        self.metrics
            .get(key)
            .map(|m| m.effective_weight)
            .ok_or_else(|| TrustError::UnknownMetric(key.to_string()))
    }

    /// Active metrics in key order, with their effective weights
    pub fn active(&self) -> impl Iterator<Item = (&MetricDefinition, f64)> {
        self.metrics
            .values()
            .filter(|m| m.definition.enabled)
            .map(|m| (&m.definition, m.effective_weight))
    }

    /// All registered metrics in key order
    pub fn definitions(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.values().map(|m| &m.definition)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.metrics.get(key).is_some_and(|m| m.definition.enabled)
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
