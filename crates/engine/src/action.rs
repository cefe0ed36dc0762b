//! Verdict synthesis
//!
//! Eight ordered heuristic rules, evaluated as a (predicate, builder) list
//! with first match winning. When no rule fires, the reasoning backend
//! synthesizes the verdict from all upstream signals, seeded with any
//! near-miss rule output as a non-binding hint. This stage always returns a
//! diagnosis: reasoning failure degrades to the near-miss hint if one
//! existed, else to an unclear/low verdict carrying the error text.

use tracing::{debug, warn};

use triage_common::{
    ArtifactSignals, FailureCategory, FailureFact, FailureKind, FinalDiagnosis, SelectorAnalysis,
    SelectorQuality, Urgency, Verdict, NO_BLOCKING_FACTORS,
};

use crate::reasoning::{complete_as, Reasoning, SchemaKind};

/// Everything the synthesis stage can see for one failure
pub struct SynthesisInput<'a> {
    pub fact: &'a FailureFact,
    pub category: &'a FailureCategory,
    pub signals: Option<&'a ArtifactSignals>,
    pub selector: Option<&'a SelectorAnalysis>,
}

impl SynthesisInput<'_> {
    fn page_state(&self) -> &str {
        self.signals.map(|s| s.page_state.as_str()).unwrap_or("")
    }

    fn ui_state(&self) -> &str {
        self.signals.map(|s| s.ui_state.as_str()).unwrap_or("")
    }

    /// Blocking factors minus the "none found" sentinel
    fn real_blocking_factors(&self) -> Vec<&str> {
        self.signals
            .map(|s| {
                s.blocking_factors
                    .iter()
                    .map(String::as_str)
                    .filter(|f| *f != NO_BLOCKING_FACTORS)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn selector_flagged_fragile(&self) -> bool {
        matches!(
            self.selector.map(|s| s.quality),
            Some(SelectorQuality::Fragile) | Some(SelectorQuality::Poor)
        )
    }
}

struct HeuristicRule {
    name: &'static str,
    /// Category-level precondition; a rule whose primary holds but whose full
    /// predicate does not is a near-miss and seeds the reasoning hint
    primary: fn(&SynthesisInput) -> bool,
    applies: fn(&SynthesisInput) -> bool,
    build: fn(&SynthesisInput) -> FinalDiagnosis,
}

fn diagnosis(verdict: Verdict, action: &str, urgency: Urgency, reason: String) -> FinalDiagnosis {
    FinalDiagnosis {
        verdict,
        recommended_action: action.to_string(),
        urgency,
        reason,
    }
}

/// The ordered rule list. First match wins; order is part of the contract.
static RULES: &[HeuristicRule] = &[
    HeuristicRule {
        name: "navigation-error",
        primary: |i| i.category.category == FailureKind::NavigationError,
        applies: |i| i.category.category == FailureKind::NavigationError,
        build: |i| {
            diagnosis(
                Verdict::AppIssue,
                "investigate app",
                Urgency::High,
                format!(
                    "the application was unreachable or navigation failed: {}",
                    i.fact.error
                ),
            )
        },
    },
    HeuristicRule {
        name: "auth-error",
        primary: |i| i.category.category == FailureKind::AuthError,
        applies: |i| i.category.category == FailureKind::AuthError,
        build: |i| {
            diagnosis(
                Verdict::AppIssue,
                "check environment",
                Urgency::High,
                format!(
                    "authentication failed before the test could proceed: {}",
                    i.fact.error
                ),
            )
        },
    },
    HeuristicRule {
        name: "selector-missing-on-loaded-page",
        primary: |i| i.category.category == FailureKind::SelectorNotFound,
        applies: |i| {
            i.category.category == FailureKind::SelectorNotFound
                && i.page_state() == "loaded"
                && i.ui_state().contains("missing")
        },
        build: |i| {
            // urgency is unaffected by selector fragility, but the action and
            // reasoning change when the locator is independently suspect
            if i.selector_flagged_fragile() {
                diagnosis(
                    Verdict::TestIssue,
                    "fix selector",
                    Urgency::Medium,
                    "the page loaded but the element is absent, and the locator \
                     is independently rated fragile; rewrite it against stable \
                     semantics"
                        .to_string(),
                )
            } else {
                diagnosis(
                    Verdict::TestIssue,
                    "review test logic",
                    Urgency::Medium,
                    "the page loaded but the element the test expects is absent; \
                     the locator looks sound, so the expectation itself is \
                     probably stale"
                        .to_string(),
                )
            }
        },
    },
    HeuristicRule {
        name: "selector-blocked-by-overlay",
        primary: |i| i.category.category == FailureKind::SelectorNotFound,
        applies: |i| {
            i.category.category == FailureKind::SelectorNotFound
                && !i.real_blocking_factors().is_empty()
        },
        build: |i| {
            diagnosis(
                Verdict::AppIssue,
                "investigate app",
                Urgency::High,
                format!(
                    "the element lookup failed while the page showed blocking \
                     factors: {}",
                    i.real_blocking_factors().join("; ")
                ),
            )
        },
    },
    HeuristicRule {
        name: "timeout-while-loading",
        primary: |i| i.category.category == FailureKind::Timeout,
        applies: |i| {
            i.category.category == FailureKind::Timeout
                && matches!(i.page_state(), "loading" | "timeout")
        },
        build: |_| {
            diagnosis(
                Verdict::AppIssue,
                "increase timeout",
                Urgency::Medium,
                "the page never reached a loaded state within the test budget; \
                 the application is slow or stuck"
                    .to_string(),
            )
        },
    },
    HeuristicRule {
        name: "assertion-on-healthy-page",
        primary: |i| i.category.category == FailureKind::AssertionFailed,
        applies: |i| {
            i.category.category == FailureKind::AssertionFailed
                && i.page_state() == "loaded"
                && !i.ui_state().contains("error")
        },
        build: |_| {
            diagnosis(
                Verdict::TestIssue,
                "review test logic",
                Urgency::Medium,
                "the page loaded cleanly and showed no error state, yet the \
                 assertion failed; the expected values are probably outdated"
                    .to_string(),
            )
        },
    },
    HeuristicRule {
        name: "fragile-selector",
        primary: |i| i.selector.is_some(),
        applies: |i| i.selector_flagged_fragile(),
        build: |i| {
            diagnosis(
                Verdict::TestIssue,
                "fix selector",
                Urgency::Low,
                format!(
                    "the locator scored {:.2} and is rated {:?}; it will keep \
                     breaking on unrelated changes",
                    i.selector.map(|s| s.score).unwrap_or(0.0),
                    i.selector.map(|s| s.quality).unwrap_or(SelectorQuality::Poor)
                ),
            )
        },
    },
    HeuristicRule {
        name: "page-error-with-network-failure",
        primary: |i| matches!(i.page_state(), "error" | "failed" | "timeout"),
        applies: |i| {
            matches!(i.page_state(), "error" | "failed" | "timeout")
                && i.real_blocking_factors().iter().any(|f| {
                    let f = f.to_lowercase();
                    f.contains("error") || f.contains("net::") || f.contains("failed")
                })
        },
        build: |i| {
            diagnosis(
                Verdict::AppIssue,
                "investigate app",
                Urgency::High,
                format!(
                    "the page was in state '{}' with failing traffic: {}",
                    i.page_state(),
                    i.real_blocking_factors().join("; ")
                ),
            )
        },
    },
];

/// Synthesize the final diagnosis for one failure. Never returns `None`.
pub async fn synthesize(input: &SynthesisInput<'_>, reasoning: &dyn Reasoning) -> FinalDiagnosis {
    for rule in RULES {
        if (rule.applies)(input) {
            debug!("Synthesis rule fired: {}", rule.name);
            return (rule.build)(input);
        }
    }

    // A rule whose category precondition held but whose evidence conditions
    // did not becomes a non-binding hint for the reasoning call.
    let hint = RULES
        .iter()
        .find(|r| (r.primary)(input))
        .map(|r| (r.name, (r.build)(input)));

    let prompt = build_prompt(input, hint.as_ref());
    match complete_as::<FinalDiagnosis>(reasoning, prompt, SchemaKind::FinalDiagnosis).await {
        Ok(diagnosis) => diagnosis,
        Err(e) => {
            warn!("Synthesis reasoning failed: {}", e);
            match hint {
                Some((name, mut fallback)) => {
                    fallback.reason = format!(
                        "{} (reasoning unavailable, best-effort from rule '{}')",
                        fallback.reason, name
                    );
                    fallback
                }
                None => diagnosis(
                    Verdict::Unclear,
                    "review failure details manually",
                    Urgency::Low,
                    format!("no heuristic rule applied and reasoning failed: {}", e),
                ),
            }
        }
    }
}

fn build_prompt(input: &SynthesisInput<'_>, hint: Option<&(&str, FinalDiagnosis)>) -> String {
    let mut prompt = format!(
        "Decide whether this browser-test failure is a test_issue, app_issue, \
         or unclear, pick a recommended action (retry, fix selector, increase \
         timeout, investigate app, check environment, review test logic, or a \
         custom action), and an urgency of low, medium, or high.\n\n\
         Test: {}\nError: {}\nCategory: {} (confidence {:.2})\n",
        input.fact.test_name,
        input.fact.error,
        input.category.category.as_str(),
        input.category.confidence,
    );
    if let Some(signals) = input.signals {
        prompt.push_str(&format!(
            "UI state: {}\nPage state: {}\nBlocking factors: {}\n",
            signals.ui_state,
            signals.page_state,
            signals.blocking_factors.join("; ")
        ));
    }
    if let Some(selector) = input.selector {
        prompt.push_str(&format!(
            "Selector quality: {:?} (score {:.2})\n",
            selector.quality, selector.score
        ));
    }
    if let Some((name, diagnosis)) = hint {
        prompt.push_str(&format!(
            "\nA heuristic rule ('{}') almost applied and would have said: \
             {:?}/{}/{:?}. Treat that as a hint, not a constraint.\n",
            name, diagnosis.verdict, diagnosis.recommended_action, diagnosis.urgency
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
    use serde_json::{json, Value};

    use crate::reasoning::{ReasoningError, ReasoningRequest};

    struct FailingReasoner;
    #[async_trait]
    impl Reasoning for FailingReasoner {
        async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
            Err(ReasoningError::Timeout)
        }
    }

    fn fact() -> FailureFact {
        FailureFact {
            test_name: "t".into(),
            file: "f.spec.ts".into(),
            failed_step: String::new(),
            error: "boom".into(),
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

    fn signals(ui: &str, page: &str, blocking: &[&str]) -> ArtifactSignals {
        ArtifactSignals {
            ui_state: ui.into(),
            page_state: page.into(),
            blocking_factors: blocking.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn selector(quality: SelectorQuality, score: f64) -> SelectorAnalysis {
        SelectorAnalysis {
            quality,
            score,
            issues: vec![],
            suggested_selector: None,
            suggestion_reason: None,
            confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn navigation_error_fires_rule_one() {
        let fact = fact();
        let category = category(FailureKind::NavigationError);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: None,
        };
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert_eq!(diagnosis.verdict, Verdict::AppIssue);
        assert_eq!(diagnosis.urgency, Urgency::High);
    }

    #[tokio::test]
    async fn selector_missing_on_loaded_page_is_test_issue() {
        let fact = fact();
        let category = category(FailureKind::SelectorNotFound);
        let signals = signals("element missing", "loaded", &[NO_BLOCKING_FACTORS]);

        let clean = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: Some(&signals),
            selector: None,
        };
        let d1 = synthesize(&clean, &FailingReasoner).await;
        assert_eq!(d1.verdict, Verdict::TestIssue);
        assert_eq!(d1.urgency, Urgency::Medium);

        let fragile = selector(SelectorQuality::Poor, 0.2);
        let flagged = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: Some(&signals),
            selector: Some(&fragile),
        };
        let d2 = synthesize(&flagged, &FailingReasoner).await;
        assert_eq!(d2.verdict, Verdict::TestIssue);
        // urgency unchanged, action differs
        assert_eq!(d2.urgency, d1.urgency);
        assert_ne!(d2.recommended_action, d1.recommended_action);
    }

    #[tokio::test]
    async fn blocking_overlay_beats_fragile_selector() {
        let fact = fact();
        let category = category(FailureKind::SelectorNotFound);
        let signals = signals("unknown", "loaded", &["modal element <div class=\"modal\">"]);
        let fragile = selector(SelectorQuality::Fragile, 0.45);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: Some(&signals),
            selector: Some(&fragile),
        };
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert_eq!(diagnosis.verdict, Verdict::AppIssue);
        assert_eq!(diagnosis.urgency, Urgency::High);
    }

    #[tokio::test]
    async fn sentinel_blocking_factor_does_not_count() {
        let fact = fact();
        let category = category(FailureKind::SelectorNotFound);
        let signals = signals("unknown", "loading", &[NO_BLOCKING_FACTORS]);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: Some(&signals),
            selector: None,
        };
        // rules 3 and 4 both miss; the reasoning also fails, so the near-miss
        // hint from the selector_not_found family is used
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert!(diagnosis.reason.contains("reasoning unavailable"));
    }

    #[tokio::test]
    async fn timeout_while_loading_is_app_issue() {
        let fact = fact();
        let category = category(FailureKind::Timeout);
        let signals = signals("unknown", "loading", &[]);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: Some(&signals),
            selector: None,
        };
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert_eq!(diagnosis.verdict, Verdict::AppIssue);
        assert_eq!(diagnosis.recommended_action, "increase timeout");
        assert_eq!(diagnosis.urgency, Urgency::Medium);
    }

    #[tokio::test]
    async fn fragile_selector_alone_fires_rule_seven() {
        let fact = fact();
        let category = category(FailureKind::Unknown);
        let fragile = selector(SelectorQuality::Fragile, 0.45);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: Some(&fragile),
        };
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert_eq!(diagnosis.verdict, Verdict::TestIssue);
        assert_eq!(diagnosis.urgency, Urgency::Low);
    }

    #[tokio::test]
    async fn reasoning_synthesis_when_no_rule_fires() {
        let fact = fact();
        let category = category(FailureKind::Unknown);
        struct Synth;
        #[async_trait]
        impl Reasoning for Synth {
            async fn complete(&self, req: ReasoningRequest) -> Result<Value, ReasoningError> {
                assert!(req.prompt.contains("test_issue"));
                Ok(json!({
                    "verdict": "unclear",
                    "recommended_action": "retry",
                    "urgency": "low",
                    "reason": "single flake, nothing conclusive"
                }))
            }
        }
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: None,
        };
        let diagnosis = synthesize(&input, &Synth).await;
        assert_eq!(diagnosis.verdict, Verdict::Unclear);
        assert_eq!(diagnosis.recommended_action, "retry");
    }

    #[tokio::test]
    async fn degrades_to_manual_review_without_hint() {
        let fact = fact();
        let category = category(FailureKind::Unknown);
        let input = SynthesisInput {
            fact: &fact,
            category: &category,
            signals: None,
            selector: None,
        };
        let diagnosis = synthesize(&input, &FailingReasoner).await;
        assert_eq!(diagnosis.verdict, Verdict::Unclear);
        assert_eq!(diagnosis.recommended_action, "review failure details manually");
        assert_eq!(diagnosis.urgency, Urgency::Low);
    }
}
