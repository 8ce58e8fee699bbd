//! Error types for the scoring system

use thiserror::Error;

/// Result type alias for scoring operations
pub type Result<T> = std::result::Result<T, TrustError>;

/// Main error type for scoring operations
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Metric already registered: {0}")]
    DuplicateMetric(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Value for metric '{metric}' outside its declared domain{}: {reason}", project_suffix(.project))]
    DomainViolation {
        metric: String,
        project: Option<String>,
        reason: String,
    },

    #[error("Source unavailable for {project}: {message}")]
    SourceUnavailable { project: String, message: String },

    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("API error from {service}: {message}")]
    ApiError { service: String, message: String },
}

fn project_suffix(project: &Option<String>) -> String {
    match project {
        Some(project) => format!(" (project {})", project),
        None => String::new(),
    }
}

impl TrustError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a domain violation that is not yet attributed to a project
    pub fn domain(metric: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DomainViolation {
            metric: metric.into(),
            project: None,
            reason: reason.into(),
        }
    }

    /// Create a source error for a project
    pub fn source_unavailable(project: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            project: project.into(),
            message: message.into(),
        }
    }

    /// Create an API error
    pub fn api(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApiError {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Attach a project identifier to a domain violation
    pub fn for_project(self, id: &str) -> Self {
        match self {
            Self::DomainViolation {
                metric,
                project: None,
                reason,
            } => Self::DomainViolation {
                metric,
                project: Some(id.to_string()),
                reason,
            },
            other => other,
        }
    }

    /// Whether this error stems from startup configuration and must abort the run
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownMetric(_)
                | Self::DuplicateMetric(_)
                | Self::InvalidConfiguration(_)
                | Self::TomlError(_)
        )
    }

    /// Metric key involved in the failure, if any
    pub fn metric(&self) -> Option<&str> {
        match self {
            Self::DomainViolation { metric, .. } => Some(metric),
            Self::UnknownMetric(metric) | Self::DuplicateMetric(metric) => Some(metric),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_violation_message_includes_project() {
        let err = TrustError::domain("activity", "negative value -1").for_project("https://x/y");
        let msg = err.to_string();
        assert!(msg.contains("activity"));
        assert!(msg.contains("https://x/y"));
        assert_eq!(err.metric(), Some("activity"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(TrustError::config("zero weight").is_configuration());
        assert!(TrustError::DuplicateMetric("a".into()).is_configuration());
        assert!(!TrustError::source_unavailable("p", "down").is_configuration());
        assert!(!TrustError::domain("m", "bad").is_configuration());
    }
}
