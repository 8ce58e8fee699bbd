//! Ordering and rendering of composite scores

use crate::types::{CompositeScore, LicenseRisk, ProjectFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered scores of a run, ready to be rendered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SavedReport")]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    /// Scores by descending score, ties by ascending project
    pub scores: Vec<CompositeScore>,
    /// Projects that could not be scored, by project
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProjectFailure>,
    #[serde(skip)]
    pub rows: Vec<ReportRow>,
}

/// Serialized form of a report; rows are derived again on load
#[derive(Deserialize)]
struct SavedReport {
    generated_at: DateTime<Utc>,
    summary: ReportSummary,
    scores: Vec<CompositeScore>,
    #[serde(default)]
    failures: Vec<ProjectFailure>,
}

impl From<SavedReport> for Report {
    fn from(saved: SavedReport) -> Self {
        let rows = saved.scores.iter().map(ReportRow::from).collect();
        Self {
            generated_at: saved.generated_at,
            summary: saved.summary,
            scores: saved.scores,
            failures: saved.failures,
            rows,
        }
    }
}

/// Aggregate statistics over a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_projects: usize,
    pub scored: usize,
    pub failed: usize,
    pub average_score: f64,
    pub by_license_risk: BTreeMap<LicenseRisk, usize>,
}

/// One line of the rendered report
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub project: String,
    pub score: f64,
    pub license_risk: LicenseRisk,
    pub coverage: f64,
    /// Metric with the largest contribution
    pub top_contributor: Option<String>,
    /// Metric with the largest shortfall
    pub top_detractor: Option<String>,
}

/// Output format of a rendered report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Markdown,
    Text,
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "text" | "txt" => Ok(ReportFormat::Text),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

impl From<&CompositeScore> for ReportRow {
    fn from(score: &CompositeScore) -> Self {
        Self {
            project: score.project.clone(),
            score: score.score,
            license_risk: score.license_risk,
            coverage: score.coverage,
            top_contributor: score.top_contributor().map(|(key, _)| key.to_string()),
            top_detractor: score.top_detractor().map(|(key, _)| key.to_string()),
        }
    }
}

/// Order scores and derive the rendered rows
pub fn assemble(mut scores: Vec<CompositeScore>) -> Report {
    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.project.cmp(&b.project))
    });
    let rows = scores.iter().map(ReportRow::from).collect();

    let mut report = Report {
        generated_at: Utc::now(),
        summary: ReportSummary::default(),
        scores,
        failures: Vec::new(),
        rows,
    };
    report.compute_summary();
    report
}

impl Report {
    /// Attach the projects that failed
    pub fn with_failures(mut self, mut failures: Vec<ProjectFailure>) -> Self {
        failures.sort_by(|a, b| a.project.cmp(&b.project));
        self.failures = failures;
        self.compute_summary();
        self
    }

    fn compute_summary(&mut self) {
        let scored = self.scores.len();
        let mut by_license_risk = BTreeMap::new();
        for score in &self.scores {
            *by_license_risk.entry(score.license_risk).or_insert(0) += 1;
        }
        let average_score = if scored > 0 {
            let total: f64 = self.scores.iter().map(|s| s.score).sum();
            crate::scoring::round2(total / scored as f64)
        } else {
            0.0
        };

        self.summary = ReportSummary {
            total_projects: scored + self.failures.len(),
            scored,
            failed: self.failures.len(),
            average_score,
            by_license_risk,
        };
    }

    pub fn render(&self, format: ReportFormat) -> crate::error::Result<String> {
        match format {
            ReportFormat::Json => self.to_json(),
            ReportFormat::Markdown => Ok(self.to_markdown()),
            ReportFormat::Text => Ok(self.to_text()),
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str("# Trust Score Report\n\n");
        md.push_str(&format!("**Generated:** {}\n\n", self.generated_at));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- Projects: {}\n", self.summary.total_projects));
        md.push_str(&format!("- Scored: {}\n", self.summary.scored));
        md.push_str(&format!("- Failed: {}\n", self.summary.failed));
        md.push_str(&format!("- Average score: {:.2}\n", self.summary.average_score));
        for (risk, count) in &self.summary.by_license_risk {
            md.push_str(&format!("- {} licenses: {}\n", risk, count));
        }
        md.push('\n');

        md.push_str("## Scores\n\n");
        md.push_str("| Project | Score | License | Coverage | Top contributor | Top detractor |\n");
        md.push_str("|---------|-------|---------|----------|-----------------|---------------|\n");
        for row in &self.rows {
            md.push_str(&format!(
                "| {} | {:.2} | {} | {:.0}% | {} | {} |\n",
                row.project,
                row.score,
                row.license_risk,
                row.coverage * 100.0,
                row.top_contributor.as_deref().unwrap_or("-"),
                row.top_detractor.as_deref().unwrap_or("-"),
            ));
        }

        if !self.failures.is_empty() {
            md.push_str("\n## Failures\n\n");
            for failure in &self.failures {
                md.push_str(&format!("- {}: {}\n", failure.project, failure.reason));
            }
        }

        md
    }

    pub fn to_text(&self) -> String {
        let width = self
            .rows
            .iter()
            .map(|r| r.project.len())
            .max()
            .unwrap_or(0)
            .max("PROJECT".len());

        let mut out = format!(
            "{:<width$}  {:>6}  {:<15}  {:>8}  {:<28}  {}\n",
            "PROJECT", "SCORE", "LICENSE", "COVERAGE", "TOP CONTRIBUTOR", "TOP DETRACTOR",
        );
        for row in &self.rows {
            out.push_str(&format!(
                "{:<width$}  {:>6.2}  {:<15}  {:>7.0}%  {:<28}  {}\n",
                row.project,
                row.score,
                row.license_risk.to_string(),
                row.coverage * 100.0,
                row.top_contributor.as_deref().unwrap_or("-"),
                row.top_detractor.as_deref().unwrap_or("-"),
            ));
        }
        for failure in &self.failures {
            out.push_str(&format!("FAILED {}: {}\n", failure.project, failure.reason));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Contribution;

    fn score(project: &str, value: f64) -> CompositeScore {
        let mut breakdown = BTreeMap::new();
        breakdown.insert(
            "activity".to_string(),
            Contribution {
                weight: 0.6,
                normalized: 1.0,
                confidence: 1.0,
                contribution: 60.0,
            },
        );
        breakdown.insert(
            "security".to_string(),
            Contribution {
                weight: 0.4,
                normalized: 0.25,
                confidence: 1.0,
                contribution: 10.0,
            },
        );
        CompositeScore {
            project: project.to_string(),
            score: value,
            base_score: 70.0,
            license_risk: LicenseRisk::Permissive,
            license_multiplier: 1.0,
            breakdown,
            coverage: 1.0,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_ordering() {
        let report = assemble(vec![
            score("b", 50.0),
            score("c", 70.0),
            score("a", 50.0),
            score("d", 12.5),
        ]);
        let order: Vec<_> = report.rows.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
        assert_eq!(report.scores[0].project, "c");
    }

    #[test]
    fn test_rows_name_contributor_and_detractor() {
        let report = assemble(vec![score("a", 70.0)]);
        let row = &report.rows[0];
        assert_eq!(row.top_contributor.as_deref(), Some("activity"));
        assert_eq!(row.top_detractor.as_deref(), Some("security"));
    }

    #[test]
    fn test_summary_and_failures() {
        let report = assemble(vec![score("a", 70.0), score("b", 35.0)]).with_failures(vec![
            ProjectFailure {
                project: "z".to_string(),
                metric: None,
                reason: "timeout".to_string(),
            },
            ProjectFailure {
                project: "y".to_string(),
                metric: Some("activity".to_string()),
                reason: "out of range".to_string(),
            },
        ]);

        assert_eq!(report.summary.total_projects, 4);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.average_score, 52.5);
        assert_eq!(report.summary.by_license_risk[&LicenseRisk::Permissive], 2);
        assert_eq!(report.failures[0].project, "y");
    }

    #[test]
    fn test_renderers() {
        let report = assemble(vec![score("https://github.com/chaoss/grimoirelab", 70.0)]);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["scores"][0]["score"], 70.0);
        assert!(json.get("rows").is_none());

        let md = report.to_markdown();
        assert!(md.contains("| https://github.com/chaoss/grimoirelab | 70.00 | Permissive | 100% | activity | security |"));

        let text = report.render(ReportFormat::Text).unwrap();
        assert!(text.starts_with("PROJECT"));
        assert!(text.contains("70.00"));
    }

    #[test]
    fn test_loaded_report_keeps_rows() {
        let report = assemble(vec![score("b", 50.0), score("a", 80.0)]);
        let json = report.to_json().unwrap();

        let loaded: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.rows, report.rows);
        assert_eq!(loaded.rows[0].project, "a");
        assert_eq!(loaded.summary, report.summary);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("MD".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
