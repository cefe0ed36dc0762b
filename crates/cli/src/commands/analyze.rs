//! `triage analyze` - run the pipeline against local artifact files

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use serde_json::Value;
use tracing::debug;

use triage_common::{AnalysisRun, ImageInsight};
use triage_engine::reasoning::{
    ImageUnderstanding, Reasoning, ReasoningError, ReasoningRequest,
};
use triage_engine::{AnalysisArtifacts, AnalysisEngine, EngineConfig, HttpReasoner};

use crate::output::{print_heading, print_kv_table, OutputFormat};

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Path to the JSON test report
    #[arg(long)]
    pub report: PathBuf,

    /// Path to the recorded trace archive
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Screenshot file(s); the first one feeds image analysis
    #[arg(long = "screenshot")]
    pub screenshots: Vec<PathBuf>,

    /// Free-text context file
    #[arg(long)]
    pub context: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run heuristics only; every reasoning call takes its documented
    /// fallback path
    #[arg(long)]
    pub no_reasoning: bool,
}

/// Reasoner that declines every call, exercising the heuristic fallbacks
struct OfflineReasoner;

#[async_trait]
impl Reasoning for OfflineReasoner {
    async fn complete(&self, _: ReasoningRequest) -> Result<Value, ReasoningError> {
        Err(ReasoningError::Provider("reasoning disabled".into()))
    }
}

#[async_trait]
impl ImageUnderstanding for OfflineReasoner {
    async fn analyze_image(&self, _: &[u8], _: &str) -> Result<ImageInsight, ReasoningError> {
        Err(ReasoningError::Provider("reasoning disabled".into()))
    }
}

pub async fn run(args: AnalyzeArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let artifacts = AnalysisArtifacts {
        report: std::fs::read(&args.report)?,
        trace: args.trace.as_ref().map(std::fs::read).transpose()?,
        screenshots: args
            .screenshots
            .iter()
            .map(std::fs::read)
            .collect::<std::io::Result<_>>()?,
        video: None,
        context: args
            .context
            .as_ref()
            .map(std::fs::read_to_string)
            .transpose()?,
    };

    let engine = if args.no_reasoning {
        debug!("Reasoning disabled; heuristics only");
        AnalysisEngine::new(Arc::new(OfflineReasoner), Arc::new(OfflineReasoner), config)
    } else {
        let reasoner = Arc::new(HttpReasoner::new(config.reasoning.clone()));
        AnalysisEngine::new(reasoner.clone(), reasoner, config)
    };

    let run = engine.run_analysis(&artifacts).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
        OutputFormat::Table => print_run(&run),
    }
    Ok(())
}

fn print_run(run: &AnalysisRun) {
    if run.failure_facts.is_empty() {
        println!("No failing results in this report.");
        return;
    }

    for (i, fact) in run.failure_facts.iter().enumerate() {
        print_heading(&format!("Failure {}: {}", i + 1, fact.test_name));

        let category = &run.failure_categories[i];
        let mut rows = vec![
            ("Location", format!("{}{}", fact.file, fact.line.map(|l| format!(":{}", l)).unwrap_or_default())),
            ("Error", fact.error.clone()),
            (
                "Category",
                format!("{} ({:.0}%)", category.category.as_str(), category.confidence * 100.0),
            ),
        ];

        if let Some(signals) = &run.artifact_signals[i] {
            rows.push(("UI state", signals.ui_state.clone()));
            rows.push(("Page state", signals.page_state.clone()));
            rows.push(("Blocking", signals.blocking_factors.join("; ")));
        }
        if let Some(selector) = &run.selector_analyses[i] {
            rows.push(("Selector", format!("{:?} ({:.2})", selector.quality, selector.score)));
            if let Some(suggested) = &selector.suggested_selector {
                rows.push(("Suggested", suggested.clone()));
            }
        }
        if let Some(diagnosis) = &run.diagnoses[i] {
            rows.push(("Verdict", format!("{:?}", diagnosis.verdict)));
            rows.push(("Action", diagnosis.recommended_action.clone()));
            rows.push(("Urgency", format!("{:?}", diagnosis.urgency)));
            rows.push(("Why", diagnosis.reason.clone()));
        }
        if let Some(solution) = &run.solution_suggestions[i] {
            if let Some(code) = &solution.suggested_code {
                rows.push(("Fix", code.clone()));
            }
            rows.push(("Explanation", solution.explanation.clone()));
        }

        print_kv_table(&rows);
        println!();
    }
}
