//! Structured security findings and fingerprint deduplication.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category assigned to findings that prove the run objective.
pub const FLAG_CATEGORY: &str = "flag";

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    /// Objective-level impact; must be acted on.
    Critical,
    /// Exploitable issue.
    High,
    /// Likely issue needing verification.
    Medium,
    /// Minor weakness.
    Low,
    /// Informational observation.
    Info,
}

impl FindingSeverity {
    /// Parses a severity name, defaulting to `Medium` for unknown input.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => FindingSeverity::Critical,
            "high" => FindingSeverity::High,
            "low" => FindingSeverity::Low,
            "info" | "informational" => FindingSeverity::Info,
            _ => FindingSeverity::Medium,
        }
    }

    /// Returns true for severities that justify an immediate replan.
    pub fn triggers_replan(self) -> bool {
        matches!(self, FindingSeverity::Critical | FindingSeverity::High)
    }

    /// Lowercase label, for prompt and report rendering.
    pub fn label(self) -> &'static str {
        match self {
            FindingSeverity::Critical => "critical",
            FindingSeverity::High => "high",
            FindingSeverity::Medium => "medium",
            FindingSeverity::Low => "low",
            FindingSeverity::Info => "info",
        }
    }
}

/// A security-relevant fact discovered during the run.
///
/// The set of findings in a run grows monotonically; entries are
/// deduplicated by [`Finding::fingerprint`] before insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Unique finding identifier.
    pub id: String,
    /// Category (e.g., "idor", "xss", "discovery", "flag").
    pub category: String,
    /// Severity level.
    pub severity: FindingSeverity,
    /// Raw evidence excerpt from execution output.
    pub evidence: String,
    /// Task whose output produced this finding.
    pub source_task_id: String,
    /// Step counter value at discovery time.
    pub discovered_at_step: u32,
}

impl Finding {
    /// Creates a finding with a fresh id.
    pub fn new(
        category: impl Into<String>,
        severity: FindingSeverity,
        evidence: impl Into<String>,
        source_task_id: impl Into<String>,
        step: u32,
    ) -> Self {
        Self {
            id: format!("FND-{}", Uuid::new_v4().simple()),
            category: category.into(),
            severity,
            evidence: evidence.into(),
            source_task_id: source_task_id.into(),
            discovered_at_step: step,
        }
    }

    /// Content fingerprint used for deduplication.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.category, &self.evidence)
    }

    /// Returns true if this finding proves the run objective.
    pub fn is_goal_proof(&self) -> bool {
        self.category == FLAG_CATEGORY
    }
}

/// Normalizes evidence text: lowercased, trimmed, every whitespace run
/// collapsed to a single space. The rule is fixed so fingerprints stay
/// stable under casing and formatting variation.
pub fn normalize_evidence(evidence: &str) -> String {
    evidence
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Computes the content fingerprint for a (category, evidence) pair.
pub fn fingerprint(category: &str, evidence: &str) -> String {
    format!(
        "{}:{}",
        category.trim().to_lowercase(),
        normalize_evidence(evidence)
    )
}
