//! Fix synthesis
//!
//! Five rule templates keyed on the diagnosis's recommended action produce
//! ready-made fixes for the common cases; a template at or above 0.8
//! confidence is returned as-is. Everything else goes to the reasoning
//! backend together with the exact original locator text, the test's
//! expected text, and the DOM's actual visible text. When the expected
//! and actual text disagree, the reasoning call is explicitly instructed to
//! build the fix around what the page really renders. A reasoning failure
//! falls back to the below-threshold template, else to nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use triage_common::text::find_similar_text;
use triage_common::{
    ArtifactSignals, FailureCategory, FailureFact, FailureKind, FinalDiagnosis, SelectorAnalysis,
    SolutionSuggestion,
};

use crate::reasoning::{complete_as, Reasoning, SchemaKind};

/// Templates at or above this confidence skip the reasoning call
const TEMPLATE_ACCEPT: f64 = 0.8;

/// Timeout fixes never propose less than this budget, in milliseconds
const TIMEOUT_FLOOR_MS: u64 = 60000;

/// Default timeout assumed when the failing test declared none
const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// Everything the fix stage can see for one failure
pub struct SolutionInput<'a> {
    pub fact: &'a FailureFact,
    pub category: &'a FailureCategory,
    pub signals: Option<&'a ArtifactSignals>,
    pub selector: Option<&'a SelectorAnalysis>,
    pub diagnosis: Option<&'a FinalDiagnosis>,
    /// Visible text extracted once from the nearest DOM snapshot
    pub dom_texts: &'a [String],
}

/// Suggest a concrete fix for one failure. `None` only when no diagnosis was
/// supplied, or when neither a template nor the reasoning backend produced
/// anything.
pub async fn suggest_fix(
    input: &SolutionInput<'_>,
    reasoning: &dyn Reasoning,
) -> Option<SolutionSuggestion> {
    let diagnosis = input.diagnosis?;

    let template = FixTemplate::select(diagnosis, input).map(|t| t.build(input, diagnosis));
    if let Some(suggestion) = &template {
        if suggestion.confidence >= TEMPLATE_ACCEPT {
            debug!("Fix template accepted at {:.2}", suggestion.confidence);
            return template;
        }
    }

    let original_locator = extract_original_locator(input.fact);
    let expected_text = extract_expected_text(&input.fact.error);
    let mismatch = expected_text.as_deref().and_then(|expected| {
        find_similar_text(expected, input.dom_texts)
            .filter(|(actual, score)| *score < 1.0 && actual.as_str() != expected)
    });

    let prompt = build_prompt(
        input,
        diagnosis,
        original_locator.as_deref(),
        expected_text.as_deref(),
        mismatch.as_ref(),
    );

    match complete_as::<SolutionSuggestion>(reasoning, prompt, SchemaKind::SolutionSuggestion).await
    {
        Ok(suggestion) => Some(suggestion),
        Err(e) => {
            warn!("Fix reasoning failed: {}", e);
            template
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// The five ready-made fix shapes, keyed on the recommended action
enum FixTemplate {
    SelectorFix {
        replacement: String,
        reason: Option<String>,
        confidence: f64,
    },
    TimeoutFix,
    TestLogic,
    EnvironmentCheck,
    NavigationInvestigation,
}

impl FixTemplate {
    /// Pick the template matching the diagnosis, if its preconditions hold
    fn select(diagnosis: &FinalDiagnosis, input: &SolutionInput<'_>) -> Option<Self> {
        let action = diagnosis.recommended_action.to_lowercase();
        if action.contains("fix selector") {
            // the copy-paste fix needs a concrete replacement to paste
            let analysis = input.selector?;
            let replacement = analysis.suggested_selector.clone()?;
            return Some(FixTemplate::SelectorFix {
                replacement,
                reason: analysis.suggestion_reason.clone(),
                confidence: analysis.confidence,
            });
        }
        if action.contains("increase timeout") {
            return Some(FixTemplate::TimeoutFix);
        }
        if action.contains("review test logic")
            && input.category.category == FailureKind::AssertionFailed
        {
            return Some(FixTemplate::TestLogic);
        }
        if action.contains("check environment")
            && input.category.category == FailureKind::AuthError
        {
            return Some(FixTemplate::EnvironmentCheck);
        }
        if action.contains("investigate app")
            && input.category.category == FailureKind::NavigationError
        {
            return Some(FixTemplate::NavigationInvestigation);
        }
        None
    }

    fn build(&self, input: &SolutionInput<'_>, diagnosis: &FinalDiagnosis) -> SolutionSuggestion {
        match self {
            FixTemplate::SelectorFix {
                replacement,
                reason,
                confidence,
            } => selector_fix(input, replacement, reason.as_deref(), *confidence),
            FixTemplate::TimeoutFix => timeout_fix(input),
            FixTemplate::TestLogic => test_logic_fix(input),
            FixTemplate::EnvironmentCheck => environment_check(input),
            FixTemplate::NavigationInvestigation => navigation_investigation(input, diagnosis),
        }
    }
}

fn location(fact: &FailureFact) -> String {
    match fact.line {
        Some(line) => format!("{}:{}", fact.file, line),
        None => fact.file.clone(),
    }
}

fn selector_fix(
    input: &SolutionInput<'_>,
    replacement: &str,
    reason: Option<&str>,
    confidence: f64,
) -> SolutionSuggestion {
    let suggested_code = if replacement.starts_with("getBy") {
        format!("await page.{};", replacement)
    } else {
        format!("await page.locator('{}');", replacement)
    };
    let original_code = extract_original_locator(input.fact);

    SolutionSuggestion {
        suggested_code: Some(suggested_code),
        original_code,
        explanation: format!(
            "Replace the failing locator at {} with a semantically anchored \
             one{}.",
            location(input.fact),
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        ),
        steps: vec![
            format!("Open {}", location(input.fact)),
            format!("Swap the failing locator for {}", replacement),
            "Re-run the test".to_string(),
        ],
        alternatives: vec![],
        confidence: confidence * 0.9,
    }
}

fn timeout_fix(input: &SolutionInput<'_>) -> SolutionSuggestion {
    let current = input.fact.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let proposed = (current * 2).max(TIMEOUT_FLOOR_MS);

    SolutionSuggestion {
        suggested_code: Some(format!("test.setTimeout({});", proposed)),
        original_code: input.fact.timeout_ms.map(|t| format!("test.setTimeout({});", t)),
        explanation: format!(
            "The step exceeded its budget; raise the test timeout from {}ms \
             to {}ms while the slow path is investigated.",
            current, proposed
        ),
        steps: vec![
            format!("Open {}", location(input.fact)),
            format!("Raise the timeout to {}ms", proposed),
            "Profile the slow interaction before trusting the green run".to_string(),
        ],
        alternatives: vec![
            format!("await expect(locator).toBeVisible({{ timeout: {} }});", proposed),
            format!("await page.goto(url, {{ timeout: {} }});", proposed),
            format!("test.setTimeout({}); // file-level", proposed),
        ],
        confidence: 0.85,
    }
}

fn test_logic_fix(input: &SolutionInput<'_>) -> SolutionSuggestion {
    SolutionSuggestion {
        suggested_code: None,
        original_code: None,
        explanation: format!(
            "The assertion at {} failed on an otherwise healthy page; the \
             expected values have likely drifted from the application.",
            location(input.fact)
        ),
        steps: vec![
            "Compare the asserted values against the current page content".to_string(),
            "Update the expectation, or the fixture that feeds it".to_string(),
            "Re-run the test".to_string(),
        ],
        alternatives: vec![],
        confidence: 0.7,
    }
}

fn environment_check(input: &SolutionInput<'_>) -> SolutionSuggestion {
    SolutionSuggestion {
        suggested_code: None,
        original_code: None,
        explanation: format!(
            "Authentication failed before '{}' could run; the test \
             environment's credentials or session bootstrap are broken.",
            input.fact.test_name
        ),
        steps: vec![
            "Verify the test user's credentials are valid in this environment".to_string(),
            "Check whether the auth/session service is reachable".to_string(),
            "Confirm storage state or token fixtures have not expired".to_string(),
        ],
        alternatives: vec![],
        confidence: 0.75,
    }
}

fn navigation_investigation(
    input: &SolutionInput<'_>,
    diagnosis: &FinalDiagnosis,
) -> SolutionSuggestion {
    SolutionSuggestion {
        suggested_code: None,
        original_code: None,
        explanation: format!(
            "Navigation failed ({}); this points at the application or its \
             environment, not the test. {}",
            input.fact.error, diagnosis.reason
        ),
        steps: vec![
            "Confirm the application is running and reachable at the tested URL".to_string(),
            "Check recent deploys and reverse-proxy configuration".to_string(),
            "Retry once the endpoint responds".to_string(),
        ],
        alternatives: vec![],
        confidence: 0.75,
    }
}

// ============================================================================
// Context extraction
// ============================================================================

static LOCATOR_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"Locator:\s*(.+)").unwrap());
static LOCATOR_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:getBy\w+|locator)\(\s*['\x22][^'\x22]+['\x22](?:\s*,\s*\{[^}]*\})?\s*\)")
        .unwrap()
});
static EXPECTED_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"name:\s*'([^']+)'").unwrap());

/// Best-effort extraction of the exact original locator text: an explicit
/// "Locator:" label wins, then semantic-locator calls with their full options
/// object, searched in the failed step before the error text.
fn extract_original_locator(fact: &FailureFact) -> Option<String> {
    for text in [&fact.failed_step, &fact.error] {
        if let Some(caps) = LOCATOR_LABEL.captures(text) {
            return Some(caps[1].trim().to_string());
        }
    }
    for text in [&fact.failed_step, &fact.error] {
        if let Some(m) = LOCATOR_CALL.find(text) {
            return Some(m.as_str().to_string());
        }
    }
    None
}

/// The expected text the test was looking for, from a `name: '...'` pattern
fn extract_expected_text(error: &str) -> Option<String> {
    EXPECTED_NAME
        .captures(error)
        .map(|caps| caps[1].to_string())
}

fn build_prompt(
    input: &SolutionInput<'_>,
    diagnosis: &FinalDiagnosis,
    original_locator: Option<&str>,
    expected_text: Option<&str>,
    mismatch: Option<&(String, f64)>,
) -> String {
    let mut prompt = format!(
        "Craft a concrete code-level fix for this browser-test failure. \
         Respond with suggested code, the original code if known, an \
         explanation, ordered steps, alternatives, and confidence.\n\n\
         Test: {} ({})\nError: {}\nCategory: {}\nVerdict: {:?}, action: {}, \
         urgency: {:?}\nReason: {}\n",
        input.fact.test_name,
        location(input.fact),
        input.fact.error,
        input.category.category.as_str(),
        diagnosis.verdict,
        diagnosis.recommended_action,
        diagnosis.urgency,
        diagnosis.reason,
    );
    if let Some(signals) = input.signals {
        prompt.push_str(&format!(
            "UI state: {} / page state: {}\n",
            signals.ui_state, signals.page_state
        ));
    }
    if let Some(selector) = input.selector {
        if let Some(suggested) = &selector.suggested_selector {
            prompt.push_str(&format!("Known-good replacement selector: {}\n", suggested));
        }
    }
    if let Some(locator) = original_locator {
        prompt.push_str(&format!("Original locator: {}\n", locator));
    }
    if let Some(expected) = expected_text {
        prompt.push_str(&format!("Text the test expects: '{}'\n", expected));
    }
    if !input.dom_texts.is_empty() {
        let sample: Vec<&str> = input
            .dom_texts
            .iter()
            .take(30)
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!("Text the page actually renders: {:?}\n", sample));
    }
    if let Some((actual, score)) = mismatch {
        prompt.push_str(&format!(
            "\nThe expected text does not appear on the page, but '{}' does \
             (similarity {:.2}). The test's expectation is likely wrong: use \
             the actual page text '{}' in the suggested fix, not the test's \
             version.\n",
            actual, score, actual
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
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use triage_common::{SelectorQuality, Urgency, Verdict};

    use crate::reasoning::{ReasoningError, ReasoningRequest};

    struct FailingReasoner;
    #[async_trait]
    impl Reasoning for FailingReasoner {
        async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
            Err(ReasoningError::Provider("down".into()))
        }
    }

    /// Captures the prompt and answers like a compliant backend would: when
    /// told to prefer the actual page text, it builds the fix around it.
    struct EchoingReasoner {
        prompts: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl Reasoning for EchoingReasoner {
        async fn complete(&self, req: ReasoningRequest) -> Result<Value, ReasoningError> {
            let actual = req
                .prompt
                .lines()
                .find(|l| l.contains("use the actual page text"))
                .and_then(|l| l.split('\'').nth(1).map(str::to_string));
            self.prompts.lock().push(req.prompt);
            let code = match actual {
                Some(text) => format!("await expect(page.getByText('{}')).toBeVisible();", text),
                None => "await page.reload();".to_string(),
            };
            Ok(json!({
                "suggested_code": code,
                "explanation": "use what the page renders",
                "steps": ["edit", "run"],
                "confidence": 0.6
            }))
        }
    }

    fn fact(error: &str) -> FailureFact {
        FailureFact {
            test_name: "order confirmation".into(),
            file: "order.spec.ts".into(),
            failed_step: String::new(),
            error: error.into(),
            timeout_ms: None,
            line: Some(42),
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

    fn diagnosis(action: &str) -> FinalDiagnosis {
        FinalDiagnosis {
            verdict: Verdict::TestIssue,
            recommended_action: action.into(),
            urgency: Urgency::Medium,
            reason: "r".into(),
        }
    }

    fn selector_with_suggestion(confidence: f64) -> SelectorAnalysis {
        SelectorAnalysis {
            quality: SelectorQuality::Poor,
            score: 0.3,
            issues: vec![],
            suggested_selector: Some("getByTestId('submit-order')".into()),
            suggestion_reason: Some("dedicated test id".into()),
            confidence,
        }
    }

    #[tokio::test]
    async fn no_diagnosis_means_no_suggestion() {
        let fact = fact("boom");
        let category = category(FailureKind::Unknown);
        let input = SolutionInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: None,
            diagnosis: None,
            dom_texts: &[],
        };
        assert!(suggest_fix(&input, &FailingReasoner).await.is_none());
    }

    #[tokio::test]
    async fn selector_template_emits_copy_paste_code() {
        let fact = fact("locator('#old') resolved to 0 elements");
        let category = category(FailureKind::SelectorNotFound);
        let selector = selector_with_suggestion(0.95);
        let diagnosis = diagnosis("fix selector");
        let input = SolutionInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: Some(&selector),
            diagnosis: Some(&diagnosis),
            dom_texts: &[],
        };
        let suggestion = suggest_fix(&input, &FailingReasoner).await.unwrap();
        assert!(suggestion
            .suggested_code
            .as_deref()
            .unwrap()
            .contains("getByTestId('submit-order')"));
        assert!(suggestion.explanation.contains("order.spec.ts:42"));
        // confidence = selector confidence x 0.9
        assert!((suggestion.confidence - 0.855).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timeout_template_doubles_with_floor() {
        let mut f = fact("Timeout 20000ms exceeded");
        f.timeout_ms = Some(20000);
        let category = category(FailureKind::Timeout);
        let diagnosis = diagnosis("increase timeout");
        let input = SolutionInput {
            fact: &f,
            category: &category,
            signals: None,
            selector: None,
            diagnosis: Some(&diagnosis),
            dom_texts: &[],
        };
        let suggestion = suggest_fix(&input, &FailingReasoner).await.unwrap();
        // 2 x 20000 = 40000 is below the 60000 floor
        assert!(suggestion.suggested_code.as_deref().unwrap().contains("60000"));
        assert_eq!(suggestion.alternatives.len(), 3);

        let mut f = fact("Timeout 45000ms exceeded");
        f.timeout_ms = Some(45000);
        let input = SolutionInput {
            fact: &f,
            category: &category,
            signals: None,
            selector: None,
            diagnosis: Some(&diagnosis),
            dom_texts: &[],
        };
        let suggestion = suggest_fix(&input, &FailingReasoner).await.unwrap();
        assert!(suggestion.suggested_code.as_deref().unwrap().contains("90000"));
    }

    #[tokio::test]
    async fn below_threshold_template_survives_reasoning_failure() {
        let fact = fact("locator('#old') resolved to 0 elements");
        let category = category(FailureKind::SelectorNotFound);
        // 0.6 x 0.9 = 0.54, below the 0.8 acceptance threshold
        let selector = selector_with_suggestion(0.6);
        let diagnosis = diagnosis("fix selector");
        let input = SolutionInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: Some(&selector),
            diagnosis: Some(&diagnosis),
            dom_texts: &[],
        };
        let suggestion = suggest_fix(&input, &FailingReasoner).await.unwrap();
        assert!((suggestion.confidence - 0.54).abs() < 1e-9);
    }

    #[tokio::test]
    async fn text_mismatch_steers_the_fix_to_actual_page_text() {
        let fact = fact(
            "expect(getByRole('heading', { name: 'Thank you for orderRING!' })).toBeVisible() failed",
        );
        let category = category(FailureKind::AssertionFailed);
        let diagnosis = diagnosis("review test logic");
        let dom_texts = vec![
            "Continue shopping".to_string(),
            "Thank you for your order!".to_string(),
        ];
        let reasoner = EchoingReasoner {
            prompts: Mutex::new(Vec::new()),
        };
        let input = SolutionInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: None,
            diagnosis: Some(&diagnosis),
            dom_texts: &dom_texts,
        };
        let suggestion = suggest_fix(&input, &reasoner).await.unwrap();

        let prompts = reasoner.prompts.lock();
        // the stage surfaced the mismatch and the real page text
        assert!(prompts[0].contains("Thank you for your order!"));
        assert!(prompts[0].contains("use the actual page text"));
        // and the resulting fix uses the actual string, not the expectation
        let code = suggestion.suggested_code.unwrap();
        assert!(code.contains("Thank you for your order!"));
        assert!(!code.contains("orderRING"));
    }

    #[test]
    fn original_locator_extraction_priority() {
        let labelled = fact("failed. Locator: getByRole('button', { name: 'Pay' })");
        assert_eq!(
            extract_original_locator(&labelled).as_deref(),
            Some("getByRole('button', { name: 'Pay' })")
        );

        let call_only = fact("expect(locator('#pay')).toBeVisible() failed");
        assert_eq!(
            extract_original_locator(&call_only).as_deref(),
            Some("locator('#pay')")
        );

        assert_eq!(extract_original_locator(&fact("nothing here")), None);
    }

    #[test]
    fn expected_text_comes_from_name_option() {
        assert_eq!(
            extract_expected_text("getByRole('button', { name: 'Buy now' }) not found"),
            Some("Buy now".to_string())
        );
        assert_eq!(extract_expected_text("no options in sight"), None);
    }
}
