//! Activity metrics computed from GrimoireLab git commit events

use crate::error::{Result, TrustError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Event type of git commits in the GrimoireLab events index
pub const COMMIT_EVENT_TYPE: &str = "org.grimoirelab.events.git.commit";

/// A single event as stored in the index
#[derive(Debug, Clone, Deserialize)]
pub struct GitEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct CommitData {
    #[serde(rename = "Author")]
    author: String,
    #[serde(default)]
    files: Vec<FileChange>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    added: Option<Value>,
    #[serde(default)]
    removed: Option<Value>,
}

/// Accumulates commit events and derives community and activity metrics
#[derive(Debug)]
pub struct GitEventsAnalyzer {
    code_pattern: regex::Regex,
    total_commits: u64,
    contributors: HashMap<String, u64>,
    companies: HashMap<String, u64>,
    code_files: u64,
    other_files: u64,
    added_lines: u64,
    removed_lines: u64,
    message_sizes: Vec<u64>,
}

/// Core, regular and casual developer counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeveloperCategories {
    pub core: u64,
    pub regular: u64,
    pub casual: u64,
}

impl GitEventsAnalyzer {
    /// Create an analyzer; `code_file_pattern` decides which files count as code
    pub fn new(code_file_pattern: &str) -> Result<Self> {
        let code_pattern = regex::Regex::new(code_file_pattern)
            .map_err(|e| TrustError::config(format!("invalid code file pattern: {}", e)))?;
        Ok(Self {
            code_pattern,
            total_commits: 0,
            contributors: HashMap::new(),
            companies: HashMap::new(),
            code_files: 0,
            other_files: 0,
            added_lines: 0,
            removed_lines: 0,
            message_sizes: Vec::new(),
        })
    }

    pub fn process_events(&mut self, events: impl IntoIterator<Item = GitEvent>) {
        for event in events {
            self.process_event(event);
        }
    }

    pub fn process_event(&mut self, event: GitEvent) {
        if event.event_type != COMMIT_EVENT_TYPE {
            return;
        }

        let commit: CommitData = match serde_json::from_value(event.data) {
            Ok(commit) => commit,
            Err(e) => {
                debug!("Skipping malformed commit event: {}", e);
                return;
            }
        };

        self.total_commits += 1;
        *self.contributors.entry(commit.author.clone()).or_default() += 1;

        // "Name <user@domain>" -> "domain"
        if let Some(domain) = commit.author.split('@').nth(1) {
            let domain = domain.strip_suffix('>').unwrap_or(domain);
            if !domain.is_empty() {
                *self.companies.entry(domain.to_string()).or_default() += 1;
            }
        }

        for change in &commit.files {
            let Some(file) = change.file.as_deref().filter(|f| !f.is_empty()) else {
                continue;
            };
            if self.code_pattern.is_match(file) {
                self.code_files += 1;
            } else {
                self.other_files += 1;
            }
            self.added_lines += line_count(change.added.as_ref());
            self.removed_lines += line_count(change.removed.as_ref());
        }

        self.message_sizes.push(commit.message.chars().count() as u64);
    }

    pub fn commit_count(&self) -> u64 {
        self.total_commits
    }

    pub fn contributor_count(&self) -> u64 {
        self.contributors.len() as u64
    }

    /// Fewest authors producing more than half of the commits
    pub fn pony_factor(&self) -> u64 {
        majority_factor(&self.contributors, self.total_commits)
    }

    /// Fewest email domains producing more than half of the commits
    pub fn elephant_factor(&self) -> u64 {
        majority_factor(&self.companies, self.total_commits)
    }

    /// Average number of commits per week over a window of `days`
    pub fn commits_week_mean(&self, days: i64) -> f64 {
        if days <= 0 {
            return 0.0;
        }
        self.total_commits as f64 * 7.0 / days as f64
    }

    /// Split authors by the 80% and 95% cumulative contribution thresholds
    pub fn developer_categories(&self) -> DeveloperCategories {
        let regular_threshold = (0.8 * self.total_commits as f64) as u64;
        let casual_threshold = (0.95 * self.total_commits as f64) as u64;
        let mut categories = DeveloperCategories::default();
        let mut accumulated = 0;
        let mut last_core = 0;

        for contributions in sorted_counts(&self.contributors) {
            accumulated += contributions;
            if accumulated <= regular_threshold || contributions > last_core {
                last_core = contributions;
                categories.core += 1;
            } else if accumulated <= casual_threshold || contributions == last_core {
                categories.regular += 1;
            } else {
                categories.casual += 1;
            }
        }

        categories
    }

    /// (total, mean, median) message length in characters
    pub fn message_sizes(&self) -> (u64, f64, u64) {
        let total: u64 = self.message_sizes.iter().sum();
        let count = self.message_sizes.len();
        if count == 0 {
            return (0, 0.0, 0);
        }
        let mut sorted = self.message_sizes.clone();
        sorted.sort_unstable();
        (total, total as f64 / count as f64, sorted[count / 2])
    }

    /// Every metric, flattened and keyed the way GrimoireLab reports them
    pub fn metrics(&self, days: i64) -> BTreeMap<String, f64> {
        let categories = self.developer_categories();
        let (message_total, message_mean, message_median) = self.message_sizes();

        [
            ("total_commits", self.total_commits as f64),
            ("total_contributors", self.contributor_count() as f64),
            ("pony_factor", self.pony_factor() as f64),
            ("elephant_factor", self.elephant_factor() as f64),
            ("commits_week_mean", self.commits_week_mean(days)),
            ("file_types_code", self.code_files as f64),
            ("file_types_other", self.other_files as f64),
            ("commit_size_added_lines", self.added_lines as f64),
            ("commit_size_removed_lines", self.removed_lines as f64),
            ("message_size_total", message_total as f64),
            ("message_size_mean", message_mean),
            ("message_size_median", message_median as f64),
            ("developer_categories_core", categories.core as f64),
            ("developer_categories_regular", categories.regular as f64),
            ("developer_categories_casual", categories.casual as f64),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn sorted_counts(counts: &HashMap<String, u64>) -> Vec<u64> {
    let mut values: Vec<u64> = counts.values().copied().collect();
    values.sort_unstable_by(|a, b| b.cmp(a));
    values
}

fn majority_factor(counts: &HashMap<String, u64>, total: u64) -> u64 {
    if counts.is_empty() || total == 0 {
        return 0;
    }
    let mut partial = 0;
    let mut factor = 0;
    for contributions in sorted_counts(counts) {
        partial += contributions;
        factor += 1;
        if partial as f64 / total as f64 > 0.5 {
            break;
        }
    }
    factor
}

/// Added/removed counts arrive as numbers or strings ("-" for binary files)
fn line_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
