//! Engagement findings.
//!
//! A [`Finding`] is a single discovered fact worth reporting: an open port,
//! a vulnerable service, a successful exploitation step.  Findings are
//! append-only for the duration of an engagement and feed the final report.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity of a finding, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Immediate compromise or data loss.
    Critical,
    /// Exploitable with significant impact.
    High,
    /// Exploitable with limited impact, or requires chaining.
    Medium,
    /// Informational weakness with low direct impact.
    Low,
    /// Observation with no direct security impact.
    Info,
}

impl Severity {
    /// Parse from the lowercase string stored in the database.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    /// The lowercase string form used in storage and prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

/// A single recorded finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Unique identifier.
    pub id: String,
    /// Engagement phase that produced this finding (e.g. "recon").
    pub phase: String,
    /// Short title.
    pub title: String,
    /// Severity classification.
    pub severity: Severity,
    /// Full description.
    pub description: String,
    /// Supporting evidence fragments (tool output excerpts, URLs).
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Unix timestamp (seconds) when the finding was recorded.
    pub timestamp: i64,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,
}

impl Finding {
    /// Create a new finding stamped with the current time.
    pub fn new(
        phase: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            phase: phase.into(),
            title: title.into(),
            severity,
            description: description.into(),
            evidence: Vec::new(),
            timestamp: Utc::now().timestamp(),
            metadata: Value::Null,
        }
    }

    /// Builder: attach an evidence fragment.
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    /// Builder: attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// One-line form used when injecting recent findings into prompts.
    pub fn prompt_line(&self) -> String {
        format!("[{}] {}", self.severity, self.title)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_round_trip() {
        for s in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ] {
            assert_eq!(Severity::parse(s.as_str()), Some(s));
        }
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Info);
    }

    #[test]
    fn finding_ids_are_unique() {
        let a = Finding::new("recon", "Open port 22", Severity::Info, "ssh exposed");
        let b = Finding::new("recon", "Open port 80", Severity::Info, "http exposed");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn prompt_line_format() {
        let f = Finding::new("scan", "Apache 2.4.49 RCE", Severity::Critical, "CVE-2021-41773");
        assert_eq!(f.prompt_line(), "[critical] Apache 2.4.49 RCE");
    }

    #[test]
    fn builder_attaches_evidence_and_metadata() {
        let f = Finding::new("recon", "t", Severity::Low, "d")
            .with_evidence("nmap output line")
            .with_metadata(serde_json::json!({"port": 22}));
        assert_eq!(f.evidence.len(), 1);
        assert_eq!(f.metadata["port"], 22);
    }
}
