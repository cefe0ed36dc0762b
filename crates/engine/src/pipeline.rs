//! Pipeline orchestration
//!
//! One analysis run: parse the report, decode the trace once, then per
//! failure run classification and correlation concurrently across the whole
//! failure array, followed by the sequential selector-heuristics →
//! action-synthesis → solution-synthesis chain, itself fanned out across
//! failures. Results are written back by index, so the six output arrays
//! stay aligned regardless of completion order. The entire run shares one
//! timeout budget; dropping the returned future abandons every in-flight
//! reasoning call with it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tracing::{debug, info, warn};

use triage_common::dom::{nearest_snapshot, visible_text};
use triage_common::error::{Error, Result};
use triage_common::trace::{read_trace, ActionEvent, DomSnapshot, TraceError};
use triage_common::{parse_report, AnalysisRun};

use crate::action::{synthesize, SynthesisInput};
use crate::classify::classify;
use crate::config::EngineConfig;
use crate::correlate::{correlate, TraceEvidence};
use crate::reasoning::{ImageUnderstanding, Reasoning};
use crate::selector_stage::analyze_selector;
use crate::solution::{suggest_fix, SolutionInput};

/// The artifacts of one browser-test run, as handed over by the upload
/// boundary
#[derive(Debug, Clone, Default)]
pub struct AnalysisArtifacts {
    /// Raw report JSON (required)
    pub report: Vec<u8>,
    /// Raw trace archive, when recorded
    pub trace: Option<Vec<u8>>,
    /// Screenshots in upload order; correlation consumes the first
    pub screenshots: Vec<Vec<u8>>,
    /// Recorded video, carried for the presentation layer
    pub video: Option<Vec<u8>>,
    /// Free-text context supplied by the uploader
    pub context: Option<String>,
}

/// The failure-analysis engine
pub struct AnalysisEngine {
    reasoning: Arc<dyn Reasoning>,
    vision: Arc<dyn ImageUnderstanding>,
    config: EngineConfig,
}

impl AnalysisEngine {
    pub fn new(
        reasoning: Arc<dyn Reasoning>,
        vision: Arc<dyn ImageUnderstanding>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reasoning,
            vision,
            config,
        }
    }

    /// Run the full analysis pipeline over one set of artifacts.
    ///
    /// Either succeeds with a fully index-aligned result set (some entries
    /// legitimately `None`) or fails outright with one explanatory error.
    pub async fn run_analysis(&self, artifacts: &AnalysisArtifacts) -> Result<AnalysisRun> {
        let budget = Duration::from_secs(self.config.run_timeout_secs);
        tokio::time::timeout(budget, self.run_inner(artifacts))
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.config.run_timeout_secs,
            })?
    }

    async fn run_inner(&self, artifacts: &AnalysisArtifacts) -> Result<AnalysisRun> {
        let facts = parse_report(&artifacts.report)?;
        info!("Parsed report: {} failing result(s)", facts.len());
        if facts.is_empty() {
            return Ok(AnalysisRun::default());
        }

        // Decode the trace once; stages share it by reference. A trace with
        // no event log is malformed input and fatal; other decode problems
        // degrade into correlation evidence.
        let evidence = match &artifacts.trace {
            None => TraceEvidence::Absent,
            Some(bytes) => match read_trace(bytes) {
                Ok(trace) => TraceEvidence::Decoded(Arc::new(trace)),
                Err(e @ TraceError::MissingEventLog { .. }) => return Err(e.into()),
                Err(other) => {
                    warn!("Trace supplied but undecodable: {}", other);
                    TraceEvidence::Unreadable(other.to_string())
                }
            },
        };

        // DOM extraction happens once per trace, not once per stage
        let (snapshot, dom_texts, failed_action) = prepare_dom_context(&evidence);

        let screenshots = &artifacts.screenshots
            [..artifacts.screenshots.len().min(self.config.screenshot_limit)];

        // Classification and correlation are independent per failure and fan
        // out across the array; join_all writes results back in index order.
        let categories_fut = join_all(
            facts
                .iter()
                .map(|fact| classify(fact, self.reasoning.as_ref())),
        );
        let signals_fut = join_all(facts.iter().map(|fact| {
            correlate(
                fact,
                &evidence,
                snapshot.as_ref(),
                screenshots,
                self.reasoning.as_ref(),
                self.vision.as_ref(),
            )
        }));
        let (categories, signals) = tokio::join!(categories_fut, signals_fut);

        // The remaining stages form a per-failure chain with strict ordering
        // inside one failure, fanned out across failures.
        let chains = join_all(facts.iter().enumerate().map(|(i, fact)| {
            let category = &categories[i];
            let signal = signals[i].as_ref();
            let snapshot = snapshot.as_ref();
            let failed_action = failed_action.as_ref();
            let dom_texts = dom_texts.as_slice();
            async move {
                let selector = analyze_selector(
                    fact,
                    category,
                    snapshot,
                    failed_action,
                    self.reasoning.as_ref(),
                )
                .await;

                let diagnosis = synthesize(
                    &SynthesisInput {
                        fact,
                        category,
                        signals: signal,
                        selector: selector.as_ref(),
                    },
                    self.reasoning.as_ref(),
                )
                .await;

                let solution = suggest_fix(
                    &SolutionInput {
                        fact,
                        category,
                        signals: signal,
                        selector: selector.as_ref(),
                        diagnosis: Some(&diagnosis),
                        dom_texts,
                    },
                    self.reasoning.as_ref(),
                )
                .await;

                (selector, Some(diagnosis), solution)
            }
        }))
        .await;

        let mut run = AnalysisRun {
            failure_facts: facts,
            failure_categories: categories,
            artifact_signals: signals,
            ..Default::default()
        };
        for (selector, diagnosis, solution) in chains {
            run.selector_analyses.push(selector);
            run.diagnoses.push(diagnosis);
            run.solution_suggestions.push(solution);
        }
        debug_assert!(run.is_aligned());
        debug!(
            "Run complete: {} failures analyzed",
            run.failure_facts.len()
        );
        Ok(run)
    }
}

/// Pick the snapshot anchor and derive the shared DOM context: the anchor is
/// the trace end time, else the latest action timestamp, else wall-clock now.
fn prepare_dom_context(
    evidence: &TraceEvidence,
) -> (Option<DomSnapshot>, Vec<String>, Option<ActionEvent>) {
    let trace = match evidence {
        TraceEvidence::Decoded(trace) => trace,
        _ => return (None, Vec::new(), None),
    };

    let anchor = trace
        .meta
        .as_ref()
        .map(|m| m.end_time)
        .or_else(|| {
            trace
                .actions
                .iter()
                .map(|a| a.end_ms)
                .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |m| m.max(t))))
        })
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as f64
        });

    let snapshot = nearest_snapshot(trace, anchor).cloned();
    let dom_texts = snapshot
        .as_ref()
        .map(|s| visible_text(&s.html))
        .unwrap_or_default();

    // The failing action nearest the end of the run carries the selector the
    // selector stage falls back to
    let failed_action = trace
        .actions
        .iter()
        .filter(|a| a.error.is_some())
        .last()
        .cloned();

    (snapshot, dom_texts, failed_action)
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
    use triage_common::ImageInsight;

    struct FailingReasoner;
    #[async_trait]
    impl Reasoning for FailingReasoner {
        async fn complete(&self, _: ReasoningRequest) -> std::result::Result<Value, ReasoningError> {
            Err(ReasoningError::Provider("offline".into()))
        }
    }
    #[async_trait]
    impl ImageUnderstanding for FailingReasoner {
        async fn analyze_image(
            &self,
            _: &[u8],
            _: &str,
        ) -> std::result::Result<ImageInsight, ReasoningError> {
            Err(ReasoningError::Provider("offline".into()))
        }
    }

    fn engine() -> AnalysisEngine {
        AnalysisEngine::new(
            Arc::new(FailingReasoner),
            Arc::new(FailingReasoner),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn malformed_report_is_fatal() {
        let artifacts = AnalysisArtifacts {
            report: b"{oops".to_vec(),
            ..Default::default()
        };
        assert!(matches!(
            engine().run_analysis(&artifacts).await,
            Err(Error::ReportParse(_))
        ));
    }

    #[tokio::test]
    async fn empty_report_yields_empty_aligned_run() {
        let artifacts = AnalysisArtifacts {
            report: br#"{"suites": []}"#.to_vec(),
            ..Default::default()
        };
        let run = engine().run_analysis(&artifacts).await.unwrap();
        assert!(run.is_aligned());
        assert!(run.failure_facts.is_empty());
    }
}
