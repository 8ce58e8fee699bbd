//! License analysis, risk categorization and the license multiplier table

use crate::config::LicensePolicy;
use crate::error::{Result, TrustError};
use crate::types::LicenseRisk;
use serde::{Deserialize, Serialize};
use spdx::{Expression, LicenseItem, LicenseReq, ParseMode};
use tracing::debug;

/// SPDX identifier prefixes of file or library scoped copyleft licenses
const WEAK_COPYLEFT: &[&str] = &[
    "LGPL", "MPL", "EPL", "CDDL", "CPL", "EUPL-1.2", "OSL", "MS-RL", "APSL", "CECILL-C",
];

/// Source-available or non-commercial licenses that restrict use
const RESTRICTIVE: &[&str] = &["SSPL", "BUSL", "Elastic", "CC-BY-NC", "Commons-Clause"];

/// Markers of proprietary terms in free-form license text
const PROPRIETARY_MARKERS: &[&str] = &["proprietary", "commercial", "all rights reserved"];

/// Classify a license declaration into a risk level.
///
/// Never fails: absent, `NOASSERTION`, `NONE` or unparsable declarations are
/// [`LicenseRisk::Unknown`]. For compound expressions an `OR` takes the least
/// risky alternative and an `AND` the most risky requirement.
pub fn classify(declaration: Option<&str>) -> LicenseRisk {
    let Some(raw) = declaration.map(str::trim) else {
        return LicenseRisk::Unknown;
    };

    if raw.is_empty() || raw.eq_ignore_ascii_case("NOASSERTION") || raw.eq_ignore_ascii_case("NONE") {
        return LicenseRisk::Unknown;
    }

    match Expression::parse_mode(raw, ParseMode::LAX) {
        Ok(expr) => expression_risk(&expr),
        Err(e) => {
            debug!("Could not parse license expression '{}': {}", raw, e);
            if has_proprietary_marker(raw) {
                LicenseRisk::Proprietary
            } else {
                LicenseRisk::Unknown
            }
        }
    }
}

/// Risk of a parsed expression: the lowest level at which the expression is satisfied
fn expression_risk(expr: &Expression) -> LicenseRisk {
    LicenseRisk::ALL
        .into_iter()
        .find(|level| expr.evaluate(|req| requirement_risk(req) <= *level))
        .unwrap_or(LicenseRisk::Unknown)
}

fn requirement_risk(req: &LicenseReq) -> LicenseRisk {
    match &req.license {
        LicenseItem::Spdx { id, .. } => {
            let name = id.name;
            if RESTRICTIVE.iter().any(|p| name.starts_with(p)) {
                LicenseRisk::Proprietary
            } else if WEAK_COPYLEFT.iter().any(|p| name.starts_with(p)) {
                LicenseRisk::WeakCopyleft
            } else if id.is_copyleft() {
                LicenseRisk::StrongCopyleft
            } else if id.is_osi_approved() || id.is_fsf_free_libre() {
                LicenseRisk::Permissive
            } else {
                LicenseRisk::Unknown
            }
        }
        LicenseItem::Other { lic_ref, .. } => {
            if has_proprietary_marker(lic_ref) {
                LicenseRisk::Proprietary
            } else {
                LicenseRisk::Unknown
            }
        }
    }
}

fn has_proprietary_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    PROPRIETARY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify a license and collect policy warnings
pub fn analyze_license(
    declaration: Option<&str>,
    policy: &LicensePolicy,
) -> (LicenseRisk, Vec<String>) {
    let mut warnings = Vec::new();

    let Some(license) = declaration.filter(|l| !l.trim().is_empty()) else {
        if policy.warn_on_unknown {
            warnings.push("No license information found".to_string());
        }
        return (LicenseRisk::Unknown, warnings);
    };

    if let Some(forbidden) = policy
        .forbidden_licenses
        .iter()
        .find(|f| license_matches(license, f))
    {
        warnings.push(format!("Uses forbidden license {} in '{}'", forbidden, license));
        return (LicenseRisk::Proprietary, warnings);
    }

    if !policy.allowed_licenses.is_empty()
        && !policy
            .allowed_licenses
            .iter()
            .any(|a| license_matches(license, a))
    {
        warnings.push(format!("License {} not in allowed list", license));
    }

    let risk = classify(Some(license));

    match risk {
        LicenseRisk::WeakCopyleft | LicenseRisk::StrongCopyleft if policy.warn_on_copyleft => {
            warnings.push(format!("Copyleft license detected: {}", license));
        }
        LicenseRisk::Unknown if policy.warn_on_unknown => {
            warnings.push(format!("Unknown license: {}", license));
        }
        LicenseRisk::Proprietary => {
            warnings.push(format!("Proprietary license detected: {}", license));
        }
        _ => {}
    }

    (risk, warnings)
}

/// Check whether any term of an expression matches a policy entry (case-insensitive)
fn license_matches(license: &str, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    license
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == '/')
        .filter(|term| !term.is_empty() && !matches!(*term, "or" | "and" | "with"))
        .any(|term| term.starts_with(&pattern))
}

/// Score multiplier per license risk level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseMultipliers {
    pub permissive: f64,
    pub weak_copyleft: f64,
    pub strong_copyleft: f64,
    pub proprietary: f64,
    pub unknown: f64,
}

impl Default for LicenseMultipliers {
    fn default() -> Self {
        Self {
            permissive: 1.0,
            weak_copyleft: 0.85,
            strong_copyleft: 0.5,
            proprietary: 0.5,
            unknown: 0.5,
        }
    }
}

impl LicenseMultipliers {
    pub fn multiplier(&self, risk: LicenseRisk) -> f64 {
        match risk {
            LicenseRisk::Permissive => self.permissive,
            LicenseRisk::WeakCopyleft => self.weak_copyleft,
            LicenseRisk::StrongCopyleft => self.strong_copyleft,
            LicenseRisk::Proprietary => self.proprietary,
            LicenseRisk::Unknown => self.unknown,
        }
    }

    /// Every multiplier must lie in (0, 1] and never grow with risk
    pub fn validate(&self) -> Result<()> {
        let mut previous = f64::INFINITY;
        for risk in LicenseRisk::ALL {
            let m = self.multiplier(risk);
            if !m.is_finite() || m <= 0.0 || m > 1.0 {
                return Err(TrustError::config(format!(
                    "license multiplier for {} must lie in (0, 1], got {}",
                    risk, m
                )));
            }
            if m > previous {
                return Err(TrustError::config(format!(
                    "license multiplier for {} ({}) exceeds the multiplier of a lower risk ({})",
                    risk, m, previous
                )));
            }
            previous = m;
        }
        Ok(())
    }
}
