//! Composite trust score calculation

use crate::error::Result;
use crate::license::LicenseMultipliers;
use crate::registry::MetricRegistry;
use crate::types::{CompositeScore, Contribution, LicenseRisk, NormalizedSignal, RawMeasurement};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Combines normalized metric signals and license risk into a composite score.
///
/// The engine only reads the frozen registry and multiplier table, so one
/// instance can be shared across concurrent scoring tasks.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    registry: Arc<MetricRegistry>,
    multipliers: LicenseMultipliers,
    run_timestamp: DateTime<Utc>,
}

impl ScoringEngine {
    /// Create an engine; the run timestamp is taken now
    pub fn new(registry: Arc<MetricRegistry>, multipliers: LicenseMultipliers) -> Result<Self> {
        multipliers.validate()?;
        Ok(Self {
            registry,
            multipliers,
            run_timestamp: Utc::now(),
        })
    }

    /// Use a fixed timestamp for every score of this run
    pub fn with_run_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.run_timestamp = timestamp;
        self
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn multipliers(&self) -> &LicenseMultipliers {
        &self.multipliers
    }

    /// Score one project.
    ///
    /// Fails with a domain violation (carrying the project identifier) when a
    /// measured value lies outside its metric's domain.
    pub fn score(
        &self,
        project: &str,
        measurements: impl IntoIterator<Item = RawMeasurement>,
        license_risk: LicenseRisk,
    ) -> Result<CompositeScore> {
        let latest = self.index_measurements(project, measurements);

        let mut breakdown = BTreeMap::new();
        let mut base = 0.0;
        let mut coverage = 0.0;

        for (definition, weight) in self.registry.active() {
            let signal = match latest.get(definition.key.as_str()) {
                Some(measurement) => self
                    .registry
                    .normalize(&definition.key, &measurement.value)
                    .map_err(|e| e.for_project(project))?,
                None => NormalizedSignal::defaulted(&definition.key, definition.default_value),
            };

            let contribution = weight * signal.value * 100.0;
            base += contribution;
            coverage += weight * signal.confidence;

            breakdown.insert(
                definition.key.clone(),
                Contribution {
                    weight,
                    normalized: signal.value,
                    confidence: signal.confidence,
                    contribution,
                },
            );
        }

        let base_score = round2(base.clamp(0.0, 100.0));
        let license_multiplier = self.multipliers.multiplier(license_risk);
        let score = round2((base_score * license_multiplier).clamp(0.0, 100.0));

        debug!(
            "Scored {}: base {:.2}, license {} (x{}), final {:.2}",
            project, base_score, license_risk, license_multiplier, score
        );

        Ok(CompositeScore {
            project: project.to_string(),
            score,
            base_score,
            license_risk,
            license_multiplier,
            breakdown,
            coverage: round2(coverage.clamp(0.0, 1.0)),
            computed_at: self.run_timestamp,
        })
    }

    /// Keep the latest measurement per active metric; sequence order breaks ties
    fn index_measurements(
        &self,
        project: &str,
        measurements: impl IntoIterator<Item = RawMeasurement>,
    ) -> HashMap<String, RawMeasurement> {
        let mut latest: HashMap<String, RawMeasurement> = HashMap::new();

        for measurement in measurements {
            if measurement.project != project {
                warn!(
                    "Ignoring measurement of {} for project {} while scoring {}",
                    measurement.metric, measurement.project, project
                );
                continue;
            }
            if !self.registry.is_active(&measurement.metric) {
                debug!("Ignoring unregistered or disabled metric {}", measurement.metric);
                continue;
            }
            match latest.get(&measurement.metric) {
                Some(existing) if existing.measured_at > measurement.measured_at => {}
                _ => {
                    latest.insert(measurement.metric.clone(), measurement);
                }
            }
        }

        latest
    }
}

/// Round to two decimal places
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
