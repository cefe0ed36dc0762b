//! Core data model for a single analysis run
//!
//! One analysis run consumes the artifacts of one browser-test execution and
//! produces six index-aligned arrays: for every `FailureFact` at index i, the
//! other five arrays describe that same failure at index i. A stage that has
//! nothing meaningful to say about a failure emits `None` at that index, never
//! a shorter array.

use serde::{Deserialize, Serialize};

// ============================================================================
// Failure facts
// ============================================================================

/// One failed or timed-out test result, extracted from the test report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureFact {
    /// Test name (spec title, falling back to the test's own title)
    pub test_name: String,
    /// Source file, "Unknown file" when no location could be resolved
    pub file: String,
    /// Title of the first step carrying an error, empty when none did
    pub failed_step: String,
    /// Effective error text for this result
    pub error: String,
    /// Configured timeout for the test, when present and non-zero
    pub timeout_ms: Option<u64>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// Raw stack-trace lines from the error, when present
    pub stack: Option<Vec<String>>,
}

// ============================================================================
// Classification
// ============================================================================

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SelectorNotFound,
    Timeout,
    AssertionFailed,
    NavigationError,
    AuthError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SelectorNotFound => "selector_not_found",
            FailureKind::Timeout => "timeout",
            FailureKind::AssertionFailed => "assertion_failed",
            FailureKind::NavigationError => "navigation_error",
            FailureKind::AuthError => "auth_error",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// Classification verdict for one failure. Exactly one per FailureFact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCategory {
    pub category: FailureKind,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
}

// ============================================================================
// Correlation
// ============================================================================

/// UI-reality assessment for one failure, fused from trace evidence.
///
/// `None` in the run arrays means no trace was supplied for the failure; a
/// populated value with "unknown" fields means correlation ran but degraded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSignals {
    #[serde(alias = "uiState")]
    pub ui_state: String,
    #[serde(alias = "pageState")]
    pub page_state: String,
    /// Ordered list; may carry a "no blocking factors" sentinel entry
    #[serde(alias = "blockingFactors")]
    pub blocking_factors: Vec<String>,
}

/// Sentinel blocking-factor entry emitted when nothing blocking was found
pub const NO_BLOCKING_FACTORS: &str = "no blocking factors detected";

// ============================================================================
// Selector analysis
// ============================================================================

/// Selector quality rating bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorQuality {
    Excellent,
    Good,
    Fragile,
    Poor,
}

impl SelectorQuality {
    /// Map a clamped score to its rating band
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            SelectorQuality::Excellent
        } else if score >= 0.6 {
            SelectorQuality::Good
        } else if score >= 0.4 {
            SelectorQuality::Fragile
        } else {
            SelectorQuality::Poor
        }
    }
}

/// Quality verdict for the selector involved in one failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorAnalysis {
    pub quality: SelectorQuality,
    /// Numeric score in [0, 1]
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default, alias = "suggestedSelector")]
    pub suggested_selector: Option<String>,
    #[serde(default, alias = "suggestionReason")]
    pub suggestion_reason: Option<String>,
    pub confidence: f64,
}

// ============================================================================
// Diagnosis and solution
// ============================================================================

/// Final root-cause verdict for one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    TestIssue,
    AppIssue,
    Unclear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// The verdict for one failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalDiagnosis {
    pub verdict: Verdict,
    /// Free text drawn from a recommended vocabulary: retry, fix selector,
    /// increase timeout, investigate app, check environment, review test
    /// logic, or custom
    #[serde(alias = "recommendedAction")]
    pub recommended_action: String,
    pub urgency: Urgency,
    pub reason: String,
}

/// Concrete fix suggestion for one failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionSuggestion {
    #[serde(default, alias = "suggestedCode")]
    pub suggested_code: Option<String>,
    #[serde(default, alias = "originalCode")]
    pub original_code: Option<String>,
    pub explanation: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub confidence: f64,
}

// ============================================================================
// Image understanding
// ============================================================================

/// Structured output of the image-understanding capability for one screenshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInsight {
    pub page_state: String,
    #[serde(default)]
    pub blocking_elements: Vec<String>,
    #[serde(default)]
    pub visible_content: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

// ============================================================================
// Run result
// ============================================================================

/// Result of one analysis run: six arrays, always equal length, always
/// index-aligned to `failure_facts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub failure_facts: Vec<FailureFact>,
    pub failure_categories: Vec<FailureCategory>,
    pub artifact_signals: Vec<Option<ArtifactSignals>>,
    pub selector_analyses: Vec<Option<SelectorAnalysis>>,
    pub diagnoses: Vec<Option<FinalDiagnosis>>,
    pub solution_suggestions: Vec<Option<SolutionSuggestion>>,
}

impl AnalysisRun {
    /// True when every array has the same length as `failure_facts`
    pub fn is_aligned(&self) -> bool {
        let n = self.failure_facts.len();
        self.failure_categories.len() == n
            && self.artifact_signals.len() == n
            && self.selector_analyses.len() == n
            && self.diagnoses.len() == n
            && self.solution_suggestions.len() == n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_thresholds() {
        assert_eq!(SelectorQuality::from_score(1.0), SelectorQuality::Excellent);
        assert_eq!(SelectorQuality::from_score(0.8), SelectorQuality::Excellent);
        assert_eq!(SelectorQuality::from_score(0.79999), SelectorQuality::Good);
        assert_eq!(SelectorQuality::from_score(0.6), SelectorQuality::Good);
        assert_eq!(SelectorQuality::from_score(0.59), SelectorQuality::Fragile);
        assert_eq!(SelectorQuality::from_score(0.4), SelectorQuality::Fragile);
        assert_eq!(SelectorQuality::from_score(0.39), SelectorQuality::Poor);
        assert_eq!(SelectorQuality::from_score(0.0), SelectorQuality::Poor);
    }

    #[test]
    fn failure_kind_wire_names() {
        let json = serde_json::to_string(&FailureKind::SelectorNotFound).unwrap();
        assert_eq!(json, "\"selector_not_found\"");
        let back: FailureKind = serde_json::from_str("\"navigation_error\"").unwrap();
        assert_eq!(back, FailureKind::NavigationError);
    }

    #[test]
    fn alignment_check() {
        let mut run = AnalysisRun::default();
        assert!(run.is_aligned());
        run.failure_facts.push(FailureFact {
            test_name: "t".into(),
            file: "f".into(),
            failed_step: String::new(),
            error: "e".into(),
            timeout_ms: None,
            line: None,
            column: None,
            stack: None,
        });
        assert!(!run.is_aligned());
    }
}
