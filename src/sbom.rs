//! Read git repositories and their licenses from SPDX JSON SBOM documents

use crate::error::{Result, TrustError};
use crate::types::ProjectInput;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

const GIT_REPO_PATTERN: &str = r"((git|http(s)?)|(git@[\w.]+))://?([\w.@:/~-]+)(\.git)(/)?";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxDocument {
    spdx_version: Option<String>,
    #[serde(default)]
    packages: Vec<SpdxPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxPackage {
    #[serde(rename = "SPDXID", default)]
    spdx_id: String,
    #[serde(default)]
    name: String,
    download_location: Option<String>,
    license_concluded: Option<String>,
    license_declared: Option<String>,
}

fn git_repo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(GIT_REPO_PATTERN).expect("valid git repository pattern"))
}

/// Turn an SPDX download location into an `https://` repository URL.
///
/// Only locations pointing at a `.git` repository are accepted, e.g.
/// `git+https://host/org/project.git@v1.0` gives `https://host/org/project`.
pub fn repository_url(download_location: &str) -> Option<String> {
    let location = download_location.trim();
    if location.is_empty() || is_spdx_none(location) {
        return None;
    }
    git_repo_regex()
        .captures(location)
        .and_then(|caps| caps.get(5))
        .map(|path| format!("https://{}", path.as_str()))
}

fn is_spdx_none(value: &str) -> bool {
    matches!(value, "NOASSERTION" | "NONE")
}

fn declared_license(package: &SpdxPackage) -> Option<String> {
    [&package.license_declared, &package.license_concluded]
        .into_iter()
        .flatten()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !is_spdx_none(l))
        .map(str::to_string)
}

/// Parse an SPDX JSON document into the distinct repositories it references.
///
/// Packages without a git repository are skipped with a warning. The result is
/// ordered by repository URL; when several packages share a repository the
/// first declared license is kept.
pub fn parse_sbom(content: &str) -> Result<Vec<ProjectInput>> {
    let document: SpdxDocument = serde_json::from_str(content)
        .map_err(|e| TrustError::parse(format!("Error while parsing document: {}", e)))?;

    match document.spdx_version.as_deref() {
        Some(version) if version.starts_with("SPDX-") => {
            debug!("Reading {} document", version);
        }
        _ => return Err(TrustError::parse("Unsupported SPDX file type")),
    }

    let mut repositories: BTreeMap<String, Option<String>> = BTreeMap::new();
    for package in &document.packages {
        let Some(repo) = package.download_location.as_deref().and_then(repository_url) else {
            warn!(
                "Could not find a git repository for {} ({})",
                package.spdx_id, package.name
            );
            continue;
        };
        let license = repositories.entry(repo).or_default();
        if license.is_none() {
            *license = declared_license(package);
        }
    }

    if repositories.is_empty() {
        info!("Could not find any git repositories to analyze");
    } else {
        info!("Found {} git repositories", repositories.len());
    }

    Ok(repositories
        .into_iter()
        .map(|(repo, license)| ProjectInput::new(repo, license))
        .collect())
}

/// Read and parse an SPDX JSON file
pub fn read_sbom(path: &Path) -> Result<Vec<ProjectInput>> {
    let content = std::fs::read_to_string(path)?;
    parse_sbom(&content)
}
