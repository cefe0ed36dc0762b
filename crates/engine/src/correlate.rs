//! Trace correlation
//!
//! Combines the decoded trace, DOM heuristics, and an image-understanding
//! pass over the first screenshot into one coherent UI-state judgment. This
//! is the only stage allowed to short-circuit on missing input: no trace
//! means `None`. Everything else degrades: a fusion failure falls back to a
//! deterministic synthesis of the collected evidence, and an unreadable
//! trace still yields a populated signal describing the problem. Correlation
//! never errors out.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use triage_common::dom::{
    blocking_elements, element_visibility, navigation_events, page_load_state, redirects,
    ElementVisibility, PageLoadState,
};
use triage_common::trace::{DomSnapshot, TraceData};
use triage_common::{ArtifactSignals, FailureFact, ImageInsight, NO_BLOCKING_FACTORS};

use crate::reasoning::{complete_as, ImageUnderstanding, Reasoning, SchemaKind};

/// Trace availability for one analysis run
pub enum TraceEvidence {
    /// No trace artifact was supplied
    Absent,
    /// A trace was supplied but could not be decoded
    Unreadable(String),
    /// Decoded once, shared read-only across stages
    Decoded(Arc<TraceData>),
}

static QUOTED_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());

/// Correlate one failure against the recorded UI state.
pub async fn correlate(
    fact: &FailureFact,
    evidence: &TraceEvidence,
    snapshot: Option<&DomSnapshot>,
    screenshots: &[Vec<u8>],
    reasoning: &dyn Reasoning,
    vision: &dyn ImageUnderstanding,
) -> Option<ArtifactSignals> {
    let trace = match evidence {
        TraceEvidence::Absent => return None,
        TraceEvidence::Unreadable(error) => {
            warn!("Correlating without a readable trace: {}", error);
            return Some(ArtifactSignals {
                ui_state: "unknown".to_string(),
                page_state: "unknown".to_string(),
                blocking_factors: vec![format!("trace could not be decoded: {}", error)],
            });
        }
        TraceEvidence::Decoded(trace) => trace,
    };

    let page = page_load_state(trace);
    let navigations = navigation_events(trace);
    let redirect_list = redirects(trace);

    // When the failed step names a concrete token, check it against the DOM
    let visibility = snapshot.and_then(|snap| {
        QUOTED_TOKEN
            .captures(&fact.failed_step)
            .and_then(|c| c.get(1))
            .map(|token| element_visibility(&snap.html, token.as_str()))
    });

    let blocking_descriptions: Vec<String> = snapshot
        .map(|snap| blocking_elements(&snap.html))
        .unwrap_or_default()
        .into_iter()
        .map(|b| b.description)
        .collect();

    let image = match screenshots.first() {
        Some(bytes) => match vision
            .analyze_image(bytes, &image_prompt(fact))
            .await
        {
            Ok(insight) => Some(insight),
            Err(e) => {
                warn!("Image analysis failed, continuing without it: {}", e);
                None
            }
        },
        None => None,
    };

    let prompt = fusion_prompt(
        fact,
        &page,
        navigations.len(),
        redirect_list.len(),
        visibility.as_ref(),
        &blocking_descriptions,
        image.as_ref(),
    );

    match complete_as::<ArtifactSignals>(reasoning, prompt, SchemaKind::ArtifactSignals).await {
        Ok(signals) => {
            debug!("Correlation fused: ui='{}' page='{}'", signals.ui_state, signals.page_state);
            Some(signals)
        }
        Err(e) => {
            warn!("Correlation fusion failed, synthesizing deterministically: {}", e);
            Some(deterministic_signals(
                &page,
                visibility.as_ref(),
                &blocking_descriptions,
                image.as_ref(),
            ))
        }
    }
}

/// Deterministic fallback synthesis used when fusion fails. Blocking factors
/// from the three sources are concatenated, not set-deduplicated.
fn deterministic_signals(
    page: &PageLoadState,
    visibility: Option<&ElementVisibility>,
    blocking_descriptions: &[String],
    image: Option<&ImageInsight>,
) -> ArtifactSignals {
    let mut blocking_factors: Vec<String> = Vec::new();
    blocking_factors.extend(page.network_errors.iter().cloned());
    blocking_factors.extend(blocking_descriptions.iter().cloned());
    if let Some(insight) = image {
        blocking_factors.extend(insight.blocking_elements.iter().cloned());
    }
    if blocking_factors.is_empty() {
        blocking_factors.push(NO_BLOCKING_FACTORS.to_string());
    }

    let ui_state = match visibility {
        Some(v) if !v.exists => "element missing".to_string(),
        Some(v) if !v.visible => "element hidden".to_string(),
        Some(_) => "element visible".to_string(),
        None => "unknown".to_string(),
    };

    ArtifactSignals {
        ui_state,
        page_state: page.state.as_str().to_string(),
        blocking_factors,
    }
}

fn image_prompt(fact: &FailureFact) -> String {
    format!(
        "This screenshot was captured when the browser test '{}' failed with: {}. \
         Describe the page state, any blocking overlays, and the visible content.",
        fact.test_name, fact.error
    )
}

#[allow(clippy::too_many_arguments)]
fn fusion_prompt(
    fact: &FailureFact,
    page: &PageLoadState,
    navigation_count: usize,
    redirect_count: usize,
    visibility: Option<&ElementVisibility>,
    blocking: &[String],
    image: Option<&ImageInsight>,
) -> String {
    let mut prompt = format!(
        "Fuse the evidence below into a UI-state judgment for a failed browser \
         test. Respond with uiState, pageState, and blockingFactors.\n\n\
         Test: {}\nFailed step: {}\nError: {}\n\nPage load state: {} \
         (network errors: {}, failed requests: {})\nNavigations: {}\nRedirects: {}\n",
        fact.test_name,
        fact.failed_step,
        fact.error,
        page.state.as_str(),
        page.network_errors.len(),
        page.failed_requests.len(),
        navigation_count,
        redirect_count,
    );
    if let Some(v) = visibility {
        prompt.push_str(&format!(
            "Target element: exists={} visible={} ({})\n",
            v.exists, v.visible, v.reason
        ));
    }
    if !blocking.is_empty() {
        prompt.push_str(&format!("Blocking elements: {}\n", blocking.join("; ")));
    }
    if let Some(insight) = image {
        prompt.push_str(&format!(
            "Screenshot analysis: page '{}', blocking {:?}, visible {:?}\n",
            insight.page_state, insight.blocking_elements, insight.visible_content
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
    use triage_common::trace::{ActionEvent, NetworkEvent};

    struct FailingReasoner;
    #[async_trait]
    impl Reasoning for FailingReasoner {
        async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
            Err(ReasoningError::Timeout)
        }
    }
    #[async_trait]
    impl ImageUnderstanding for FailingReasoner {
        async fn analyze_image(
            &self,
            _: &[u8],
            _: &str,
        ) -> Result<ImageInsight, ReasoningError> {
            Err(ReasoningError::Timeout)
        }
    }

    struct CannedVision(ImageInsight);
    #[async_trait]
    impl ImageUnderstanding for CannedVision {
        async fn analyze_image(
            &self,
            _: &[u8],
            _: &str,
        ) -> Result<ImageInsight, ReasoningError> {
            Ok(self.0.clone())
        }
    }
    #[async_trait]
    impl Reasoning for CannedVision {
        async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
            Err(ReasoningError::Timeout)
        }
    }

    fn fact() -> FailureFact {
        FailureFact {
            test_name: "cart updates".into(),
            file: "cart.spec.ts".into(),
            failed_step: "click \"#checkout\"".into(),
            error: "locator.click: Timeout 5000ms exceeded".into(),
            timeout_ms: None,
            line: None,
            column: None,
            stack: None,
        }
    }

    fn trace_with_snapshot() -> (Arc<TraceData>, DomSnapshot) {
        let mut trace = TraceData::default();
        trace.actions.push(ActionEvent {
            name: "locator.click".into(),
            selector: Some("#checkout".into()),
            url: None,
            start_ms: 100.0,
            end_ms: 5100.0,
            error: Some("Timeout 5000ms exceeded".into()),
        });
        trace.network.push(NetworkEvent {
            url: "https://shop.example/api/cart".into(),
            method: "POST".into(),
            status: None,
            failure: Some("net::ERR_FAILED".into()),
            resource_type: Some("xhr".into()),
            location: None,
            timestamp: 4000.0,
        });
        let snapshot = DomSnapshot {
            html: r#"<div class="modal" style="position: fixed; z-index: 999">Cookies?</div><p>Cart</p>"#
                .into(),
            timestamp: 5000.0,
            url: "https://shop.example/cart".into(),
            viewport: None,
        };
        (Arc::new(trace), snapshot)
    }

    #[tokio::test]
    async fn returns_none_without_trace() {
        let result = correlate(
            &fact(),
            &TraceEvidence::Absent,
            None,
            &[],
            &FailingReasoner,
            &FailingReasoner,
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unreadable_trace_yields_degraded_signal() {
        let evidence = TraceEvidence::Unreadable("zip: invalid local header".into());
        let signals = correlate(&fact(), &evidence, None, &[], &FailingReasoner, &FailingReasoner)
            .await
            .unwrap();
        assert_eq!(signals.ui_state, "unknown");
        assert_eq!(signals.page_state, "unknown");
        assert_eq!(signals.blocking_factors.len(), 1);
        assert!(signals.blocking_factors[0].contains("invalid local header"));
    }

    #[tokio::test]
    async fn fusion_failure_falls_back_deterministically() {
        let (trace, snapshot) = trace_with_snapshot();
        let signals = correlate(
            &fact(),
            &TraceEvidence::Decoded(trace),
            Some(&snapshot),
            &[],
            &FailingReasoner,
            &FailingReasoner,
        )
        .await
        .unwrap();

        // quoted token "#checkout" is absent from the snapshot HTML
        assert_eq!(signals.ui_state, "element missing");
        assert_eq!(signals.page_state, "timeout");
        // network error and modal both surface, concatenated
        assert!(signals
            .blocking_factors
            .iter()
            .any(|b| b.contains("net::ERR_FAILED")));
        assert!(signals.blocking_factors.iter().any(|b| b.contains("modal")));
    }

    #[tokio::test]
    async fn image_blocking_list_joins_fallback() {
        let (trace, snapshot) = trace_with_snapshot();
        let vision = CannedVision(ImageInsight {
            page_state: "obscured".into(),
            blocking_elements: vec!["full-screen cookie banner".into()],
            visible_content: vec![],
            confidence: 0.9,
        });
        let signals = correlate(
            &fact(),
            &TraceEvidence::Decoded(trace),
            Some(&snapshot),
            &[vec![0u8; 8]],
            &vision,
            &vision,
        )
        .await
        .unwrap();
        assert!(signals
            .blocking_factors
            .iter()
            .any(|b| b.contains("cookie banner")));
    }

    #[tokio::test]
    async fn fusion_success_passes_through() {
        struct Fuser;
        #[async_trait]
        impl Reasoning for Fuser {
            async fn complete(&self, req: ReasoningRequest) -> Result<Value, ReasoningError> {
                assert!(req.prompt.contains("Page load state"));
                Ok(json!({
                    "ui_state": "element hidden behind modal",
                    "page_state": "loaded",
                    "blocking_factors": ["cookie modal"]
                }))
            }
        }
        #[async_trait]
        impl ImageUnderstanding for Fuser {
            async fn analyze_image(
                &self,
                _: &[u8],
                _: &str,
            ) -> Result<ImageInsight, ReasoningError> {
                Err(ReasoningError::Timeout)
            }
        }

        let (trace, snapshot) = trace_with_snapshot();
        let signals = correlate(
            &fact(),
            &TraceEvidence::Decoded(trace),
            Some(&snapshot),
            &[],
            &Fuser,
            &Fuser,
        )
        .await
        .unwrap();
        assert_eq!(signals.ui_state, "element hidden behind modal");
        assert_eq!(signals.blocking_factors, vec!["cookie modal".to_string()]);
    }
}
