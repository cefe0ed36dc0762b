//! Selector heuristics stage
//!
//! Gated on selector-flavored failures. Extraction tries the failed-step
//! text, then the error text, and only then the selector recorded on the
//! nearest failing trace action; no extractable selector is a legitimate
//! "not applicable" outcome, not an error. The heuristic score, issues, and
//! suggestion seed a reasoning call; if that call fails the heuristic values
//! are returned verbatim.

use tracing::{debug, warn};

use triage_common::selector::{
    analyze_selector_quality, classify_raw, extract_selector, suggest_selector, ExtractedSelector,
    SelectorKind,
};
use triage_common::trace::{ActionEvent, DomSnapshot};
use triage_common::{FailureCategory, FailureFact, FailureKind, SelectorAnalysis};

use crate::reasoning::{complete_as, Reasoning, SchemaKind};

/// Confidence assigned to a verbatim heuristic fallback with no suggestion
const FALLBACK_CONFIDENCE: f64 = 0.7;

/// Tokens in step/error text that open the gate for non-selector categories
const GATE_TOKENS: &[&str] = &["selector", "locator", "element"];

/// Analyze the failing selector for one failure.
///
/// Returns `None` when the failure is not selector-related or no selector
/// could be extracted from any source.
pub async fn analyze_selector(
    fact: &FailureFact,
    category: &FailureCategory,
    snapshot: Option<&DomSnapshot>,
    failed_action: Option<&ActionEvent>,
    reasoning: &dyn Reasoning,
) -> Option<SelectorAnalysis> {
    if !gate_open(fact, category) {
        return None;
    }

    let extracted = extract_selector(&fact.failed_step)
        .or_else(|| extract_selector(&fact.error))
        .or_else(|| {
            failed_action
                .and_then(|a| a.selector.as_ref())
                .map(|s| ExtractedSelector {
                    selector: s.clone(),
                    kind: classify_raw(s),
                    matched_text: s.clone(),
                    used_semantic_api: classify_raw(s) == SelectorKind::SemanticLocator,
                })
        })?;

    debug!(
        "Analyzing selector '{}' ({:?})",
        extracted.selector, extracted.kind
    );

    let quality = analyze_selector_quality(&extracted.selector, snapshot.map(|s| s.html.as_str()));
    let suggestion = snapshot.and_then(|s| suggest_selector(&extracted, &s.html));

    let prompt = build_prompt(fact, &extracted, &quality, suggestion.as_ref());
    match complete_as::<SelectorAnalysis>(reasoning, prompt, SchemaKind::SelectorAnalysis).await {
        Ok(mut analysis) => {
            analysis.score = analysis.score.clamp(0.0, 1.0);
            Some(analysis)
        }
        Err(e) => {
            warn!("Selector reasoning failed, returning heuristics: {}", e);
            Some(SelectorAnalysis {
                quality: quality.rating,
                score: quality.score,
                issues: quality.issues,
                suggested_selector: suggestion.as_ref().map(|s| s.selector.clone()),
                suggestion_reason: suggestion.as_ref().map(|s| s.reason.clone()),
                confidence: suggestion
                    .as_ref()
                    .map(|s| s.confidence)
                    .unwrap_or(FALLBACK_CONFIDENCE),
            })
        }
    }
}

fn gate_open(fact: &FailureFact, category: &FailureCategory) -> bool {
    if category.category == FailureKind::SelectorNotFound {
        return true;
    }
    let step = fact.failed_step.to_lowercase();
    let error = fact.error.to_lowercase();
    GATE_TOKENS
        .iter()
        .any(|t| step.contains(t) || error.contains(t))
}

fn build_prompt(
    fact: &FailureFact,
    extracted: &ExtractedSelector,
    quality: &triage_common::selector::QualityBreakdown,
    suggestion: Option<&triage_common::selector::SelectorSuggestion>,
) -> String {
    let mut prompt = format!(
        "Judge the quality of the selector involved in this browser-test \
         failure and produce a final verdict with quality \
         (excellent/good/fragile/poor), score, issues, optional replacement, \
         and confidence.\n\nError: {}\nSelector: {} (family: {:?})\n\
         Heuristic score: {:.2} ({:?})\n",
        fact.error, extracted.selector, extracted.kind, quality.score, quality.rating
    );
    if !quality.issues.is_empty() {
        prompt.push_str(&format!("Heuristic issues: {}\n", quality.issues.join("; ")));
    }
    if !quality.strengths.is_empty() {
        prompt.push_str(&format!(
            "Heuristic strengths: {}\n",
            quality.strengths.join("; ")
        ));
    }
    if let Some(s) = suggestion {
        prompt.push_str(&format!(
            "Heuristic replacement candidate: {} ({}, confidence {:.2})\n",
            s.selector, s.reason, s.confidence
        ));
    }
    prompt
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::reasoning::{ReasoningError, ReasoningRequest};

    struct FailingReasoner;
    #[async_trait]
    impl Reasoning for FailingReasoner {
        async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
            Err(ReasoningError::Provider("down".into()))
        }
    }

    fn fact(step: &str, error: &str) -> FailureFact {
        FailureFact {
            test_name: "t".into(),
            file: "f.spec.ts".into(),
            failed_step: step.into(),
            error: error.into(),
            timeout_ms: None,
            line: None,
            column: None,
            stack: None,
        }
    }

    fn category(kind: FailureKind) -> FailureCategory {
        FailureCategory {
            category: kind,
            confidence: 0.9,
            reasoning: String::new(),
        }
    }

    fn snapshot(html: &str) -> DomSnapshot {
        DomSnapshot {
            html: html.into(),
            timestamp: 0.0,
            url: String::new(),
            viewport: None,
        }
    }

    #[tokio::test]
    async fn gate_closes_for_unrelated_failures() {
        let fact = fact("assert totals", "expected 3, received 2");
        let result = analyze_selector(
            &fact,
            &category(FailureKind::AssertionFailed),
            None,
            None,
            &FailingReasoner,
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn gate_opens_on_selector_mention_even_for_timeouts() {
        let fact = fact("", "waiting for locator '.cart-total' timed out");
        let result = analyze_selector(
            &fact,
            &category(FailureKind::Timeout),
            None,
            None,
            &FailingReasoner,
        )
        .await;
        let analysis = result.unwrap();
        assert!(analysis.score > 0.0);
        assert!(analysis.suggested_selector.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_trace_action_selector() {
        let fact = fact("", "element interaction failed");
        let action = ActionEvent {
            name: "locator.click".into(),
            selector: Some("#pay-now".into()),
            url: None,
            start_ms: 0.0,
            end_ms: 1.0,
            error: Some("boom".into()),
        };
        let analysis = analyze_selector(
            &fact,
            &category(FailureKind::SelectorNotFound),
            None,
            Some(&action),
            &FailingReasoner,
        )
        .await
        .unwrap();
        // heuristic values verbatim on reasoning failure
        assert_eq!(analysis.confidence, 0.7);
        assert!(analysis.score > 0.0);
    }

    #[tokio::test]
    async fn none_when_nothing_extractable() {
        let fact = fact("", "everything exploded");
        let result = analyze_selector(
            &fact,
            &category(FailureKind::SelectorNotFound),
            None,
            None,
            &FailingReasoner,
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn suggestion_flows_into_fallback() {
        let fact = fact("click \"#go\"", "locator '#go' resolved to 0 elements");
        let snap = snapshot(r#"<button id="go" data-testid="submit-order">Go</button>"#);
        let analysis = analyze_selector(
            &fact,
            &category(FailureKind::SelectorNotFound),
            Some(&snap),
            None,
            &FailingReasoner,
        )
        .await
        .unwrap();
        assert_eq!(
            analysis.suggested_selector.as_deref(),
            Some("getByTestId('submit-order')")
        );
        assert!(analysis.confidence > 0.9);
    }
}
