//! Finding extraction from raw execution output.
//!
//! Extraction runs in two passes: cheap marker regexes over the report
//! contract the executor enforces, then the model as an extraction policy
//! for unmarked output. Unparsable policy output degrades to zero findings;
//! extraction is never fatal. Deduplication against the already-recorded
//! fingerprint set happens here, not in the state manager.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::finding::{fingerprint, Finding, FindingSeverity, FLAG_CATEGORY};
use crate::model::{extract_json, ModelClient};
use crate::state::ExecutionResult;

static FINDING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*-?\s*\[FINDING\]\s*([^:\n]+?)\s*:\s*(.+)$").expect("finding regex")
});

static DISCOVERY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*-?\s*\[DISCOVERY\]\s*(.+)$").expect("discovery regex"));

static FLAG_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*-?\s*\[FLAG\]\s*(.+)$").expect("flag marker regex"));

static FLAG_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)flag\{[^}]+\}").expect("flag value regex"));

/// Output below this length is never worth a model extraction pass.
const POLICY_MIN_OUTPUT: usize = 80;

#[derive(Debug, Deserialize)]
struct PolicyFinding {
    category: String,
    #[serde(default)]
    severity: Option<String>,
    evidence: String,
}

const POLICY_SYSTEM: &str = "You review raw output from a security test step. \
Extract security-relevant findings only: exposed data, vulnerabilities, \
credentials, reachable internal endpoints, or captured flags. Respond with a \
JSON array, one object per finding: \
{\"category\": \"...\", \"severity\": \"critical|high|medium|low|info\", \
\"evidence\": \"verbatim excerpt\"}. Respond with [] when there is nothing.";

/// Parses raw execution output into structured, deduplicated findings.
pub struct FindingExtractor {
    model: Arc<dyn ModelClient>,
    model_assisted: bool,
}

impl FindingExtractor {
    /// Creates an extractor using the model as a fallback policy.
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            model_assisted: true,
        }
    }

    /// Enables or disables the model fallback pass.
    pub fn with_model_assist(mut self, enabled: bool) -> Self {
        self.model_assisted = enabled;
        self
    }

    /// Extracts net-new findings from one execution result.
    ///
    /// `existing` holds fingerprints already recorded for the run; only
    /// findings absent from it are returned.
    pub async fn extract(
        &self,
        result: &ExecutionResult,
        existing: &HashSet<String>,
        step: u32,
    ) -> Vec<Finding> {
        let output = result.combined_output();
        let mut seen: HashSet<String> = existing.clone();
        let mut findings = Vec::new();

        let mut push = |category: &str, severity: FindingSeverity, evidence: &str,
                        findings: &mut Vec<Finding>,
                        seen: &mut HashSet<String>| {
            let evidence = evidence.trim().trim_matches('`');
            if evidence.is_empty() {
                return;
            }
            if seen.insert(fingerprint(category, evidence)) {
                findings.push(Finding::new(
                    category,
                    severity,
                    evidence,
                    &result.task_id,
                    step,
                ));
            }
        };

        for captures in FINDING_RE.captures_iter(&output) {
            let category = captures[1].trim().to_lowercase();
            push(
                &category,
                FindingSeverity::Medium,
                &captures[2],
                &mut findings,
                &mut seen,
            );
        }
        for captures in DISCOVERY_RE.captures_iter(&output) {
            push(
                "discovery",
                FindingSeverity::Info,
                &captures[1],
                &mut findings,
                &mut seen,
            );
        }
        for captures in FLAG_MARKER_RE.captures_iter(&output) {
            push(
                FLAG_CATEGORY,
                FindingSeverity::Critical,
                &captures[1],
                &mut findings,
                &mut seen,
            );
        }
        for matched in FLAG_VALUE_RE.find_iter(&output) {
            push(
                FLAG_CATEGORY,
                FindingSeverity::Critical,
                matched.as_str(),
                &mut findings,
                &mut seen,
            );
        }

        if findings.is_empty() && self.model_assisted && output.len() >= POLICY_MIN_OUTPUT {
            for policy in self.consult_policy(&output).await {
                let severity = policy
                    .severity
                    .as_deref()
                    .map(FindingSeverity::parse_lenient)
                    .unwrap_or(FindingSeverity::Medium);
                let category = policy.category.trim().to_lowercase();
                push(&category, severity, &policy.evidence, &mut findings, &mut seen);
            }
        }

        findings
    }

    /// Model extraction pass. Any failure here means zero findings.
    async fn consult_policy(&self, output: &str) -> Vec<PolicyFinding> {
        let response = match self.model.complete(POLICY_SYSTEM, output).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "extraction policy unavailable");
                return Vec::new();
            }
        };

        let Some(raw) = extract_json(&response) else {
            tracing::debug!("extraction policy returned no JSON");
            return Vec::new();
        };
        match serde_json::from_str::<Vec<PolicyFinding>>(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "extraction policy output unparsable");
                Vec::new()
            }
        }
    }
}
