//! Failure classification
//!
//! Rule-based pattern scoring over error/step/stack text, with a reasoning
//! fallback for the ambiguous band. The ordered rule table scores the five
//! known categories independently; the winner is capped at 0.95 confidence.
//! At or above 0.8 the rule verdict stands alone; between 0.5 and 0.8 the
//! reasoning backend refines it with the rule winner as a hint; below 0.5 it
//! classifies from scratch. This stage never fails: a reasoning error
//! degrades to `unknown` at confidence 0.0 with the error text preserved.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use triage_common::{FailureCategory, FailureFact, FailureKind};

use crate::reasoning::{complete_as, Reasoning, SchemaKind};

/// Rule verdicts at or above this confidence skip the reasoning call
const RULE_ACCEPT: f64 = 0.8;

/// Rule verdicts at or above this confidence are passed on as a hint
const RULE_HINT: f64 = 0.5;

/// Cap applied to every rule-derived confidence
const RULE_CAP: f64 = 0.95;

/// Corroborating-signal bonus
const CORROBORATION_BONUS: f64 = 0.15;

struct CategoryRule {
    kind: FailureKind,
    patterns: Vec<(Regex, f64)>,
}

fn rule(kind: FailureKind, patterns: &[(&str, f64)]) -> CategoryRule {
    CategoryRule {
        kind,
        patterns: patterns
            .iter()
            .map(|(p, w)| (Regex::new(p).expect("category pattern"), *w))
            .collect(),
    }
}

static RULES: Lazy<Vec<CategoryRule>> = Lazy::new(|| {
    vec![
        rule(
            FailureKind::SelectorNotFound,
            &[
                (r"(?i)waiting for (?:selector|locator|element)", 0.85),
                (r"(?i)resolved to 0 elements", 0.9),
                (r"(?i)no (?:element|node) (?:matches|found)", 0.85),
                (r"(?i)element\(s\) not found", 0.85),
                (r"(?i)strict mode violation", 0.7),
                (r"(?i)element is not attached", 0.7),
                (r"waitForSelector", 0.5),
                (r"locator\.", 0.4),
            ],
        ),
        rule(
            FailureKind::Timeout,
            &[
                (r"(?i)timeout \d+ms exceeded", 0.8),
                (r"(?i)timed out", 0.7),
                (r"(?i)deadline exceeded", 0.6),
                (r"(?i)operation timed? ?out", 0.6),
            ],
        ),
        rule(
            FailureKind::AssertionFailed,
            &[
                (r"AssertionError", 0.9),
                (r"(?i)assertion failed", 0.85),
                (r"expect\(", 0.8),
                (r"to(?:Be|Equal|HaveText|ContainText|BeVisible|HaveCount)", 0.7),
                (r"(?i)expected .+ (?:but )?(?:received|got)", 0.7),
            ],
        ),
        rule(
            FailureKind::NavigationError,
            &[
                (r"net::ERR_[A-Z_]+", 0.9),
                (r"NS_ERROR_[A-Z_]+", 0.8),
                (r"(?i)navigation (?:failed|timeout|aborted)", 0.8),
                (r"(?i)dns.{0,20}(?:fail|error)", 0.5),
                (r"page\.goto", 0.4),
            ],
        ),
        rule(
            FailureKind::AuthError,
            &[
                (r"(?i)401 unauthorized", 0.85),
                (r"(?i)403 forbidden", 0.85),
                (r"(?i)session expired", 0.8),
                (r"(?i)authentication", 0.7),
                (r"(?i)unauthorized", 0.7),
                (r"(?i)forbidden", 0.6),
                (r"(?i)csrf", 0.6),
                (r"(?i)login", 0.4),
            ],
        ),
    ]
});

static STEP_ASSERTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)expect|assert").unwrap());

/// Score the rule table against one failure. `None` when nothing matched.
pub(crate) fn rule_classify(fact: &FailureFact) -> Option<FailureCategory> {
    let stack = fact
        .stack
        .as_ref()
        .map(|lines| lines.join("\n"))
        .unwrap_or_default();
    let text = format!("{}\n{}\n{}", fact.error, fact.failed_step, stack);

    let mut best: Option<(FailureKind, f64, Vec<String>)> = None;
    for rule in RULES.iter() {
        let mut score = 0.0;
        let mut matched = Vec::new();
        for (pattern, weight) in &rule.patterns {
            if pattern.is_match(&text) {
                score += weight;
                matched.push(pattern.as_str().to_string());
            }
        }
        if score == 0.0 {
            continue;
        }

        // Corroborating signals
        if rule.kind == FailureKind::Timeout && fact.timeout_ms.is_some() {
            score += CORROBORATION_BONUS;
            matched.push("configured timeout present".to_string());
        }
        if rule.kind == FailureKind::AssertionFailed && STEP_ASSERTION.is_match(&fact.failed_step) {
            score += CORROBORATION_BONUS;
            matched.push("assertion token in failed step".to_string());
        }

        if best.as_ref().map(|(_, b, _)| score > *b).unwrap_or(true) {
            best = Some((rule.kind, score, matched));
        }
    }

    best.map(|(kind, score, matched)| FailureCategory {
        category: kind,
        confidence: score.min(RULE_CAP),
        reasoning: format!("matched {}: {}", kind.as_str(), matched.join("; ")),
    })
}

/// Classify one failure. Never fails.
pub async fn classify(fact: &FailureFact, reasoning: &dyn Reasoning) -> FailureCategory {
    let heuristic = rule_classify(fact);

    if let Some(category) = &heuristic {
        if category.confidence >= RULE_ACCEPT {
            debug!(
                "Rule classification accepted: {} at {:.2}",
                category.category.as_str(),
                category.confidence
            );
            return category.clone();
        }
    }

    let hint = heuristic.filter(|c| c.confidence >= RULE_HINT);
    let prompt = build_prompt(fact, hint.as_ref());

    match complete_as::<FailureCategory>(reasoning, prompt, SchemaKind::FailureCategory).await {
        Ok(mut category) => {
            category.confidence = category.confidence.clamp(0.0, 1.0);
            category
        }
        Err(e) => {
            warn!("Classification reasoning failed: {}", e);
            FailureCategory {
                category: FailureKind::Unknown,
                confidence: 0.0,
                reasoning: format!("reasoning call failed: {}", e),
            }
        }
    }
}

fn build_prompt(fact: &FailureFact, hint: Option<&FailureCategory>) -> String {
    let mut prompt = format!(
        "Classify this browser-test failure into exactly one category of \
         selector_not_found, timeout, assertion_failed, navigation_error, \
         auth_error, unknown.\n\nTest: {}\nFailed step: {}\nError: {}\n",
        fact.test_name, fact.failed_step, fact.error
    );
    if let Some(stack) = &fact.stack {
        prompt.push_str(&format!("Stack:\n{}\n", stack.join("\n")));
    }
    if let Some(hint) = hint {
        prompt.push_str(&format!(
            "\nPattern rules tentatively matched '{}' at confidence {:.2} ({}); \
             confirm or correct that call.\n",
            hint.category.as_str(),
            hint.confidence,
            hint.reasoning
        ));
    }
    prompt.push_str("\nRespond with category, confidence in [0,1], and one-paragraph reasoning.");
    prompt
}

// ============================================================================
// Tests
// ============================================================================
