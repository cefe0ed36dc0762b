//! Test-report parsing
//!
//! Walks a Playwright-style JSON report tree (suites nest arbitrarily, steps
//! nest arbitrarily) and emits one `FailureFact` per failed or timed-out test
//! result. Parsing is fully deterministic: identical report bytes always
//! yield identical output, with no clocks, randomness, or external calls.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::FailureFact;

// ============================================================================
// Raw report model
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawReport {
    #[serde(default)]
    suites: Vec<RawSuite>,
    #[serde(default)]
    stats: Option<RawStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    expected: u64,
    #[serde(default)]
    unexpected: u64,
    #[serde(default)]
    skipped: u64,
    #[serde(default)]
    flaky: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawSuite {
    #[serde(default)]
    suites: Vec<RawSuite>,
    #[serde(default)]
    specs: Vec<RawSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    title: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    tests: Vec<RawTest>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Debug, Default, Deserialize)]
struct RawResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<RawError>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStep {
    #[serde(default)]
    title: String,
    #[serde(default)]
    error: Option<RawError>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct RawError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Error sentinel used when a failed result carries no error text anywhere
const UNKNOWN_ERROR: &str = "Unknown error";

/// `at name (file:line:column)` / `at file:line:column` stack frame
static STACK_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*at\s+(?:[^(\n]+\()?([^()\s:]+):(\d+):(\d+)\)?").expect("stack regex")
});

/// Bare `file:line:column` occurrence, for error text without frames
static BARE_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^()\s:]+):(\d+):(\d+)").expect("location regex"));

/// Parse report bytes into one `FailureFact` per failed/timed-out result.
///
/// Array ordering matches report traversal order. Unparsable JSON is fatal.
pub fn parse_report(raw: &[u8]) -> Result<Vec<FailureFact>> {
    let report: RawReport =
        serde_json::from_slice(raw).map_err(|e| Error::ReportParse(e.to_string()))?;

    let mut facts = Vec::new();
    for suite in &report.suites {
        walk_suite(suite, &mut facts);
    }
    Ok(facts)
}

fn walk_suite(suite: &RawSuite, facts: &mut Vec<FailureFact>) {
    for nested in &suite.suites {
        walk_suite(nested, facts);
    }
    for spec in &suite.specs {
        for test in &spec.tests {
            for result in &test.results {
                if result_failed(result) {
                    facts.push(build_fact(spec, test, result));
                }
            }
        }
    }
}

/// A result qualifies as a failure iff its status is failed/timedOut, or any
/// of its steps (recursively) carries an error.
fn result_failed(result: &RawResult) -> bool {
    matches!(result.status.as_str(), "failed" | "timedOut")
        || first_step_error(&result.steps).is_some()
}

/// Depth-first, first-match search for a step carrying an error
fn first_step_error(steps: &[RawStep]) -> Option<&RawStep> {
    for step in steps {
        if step.error.is_some() {
            return Some(step);
        }
        if let Some(found) = first_step_error(&step.steps) {
            return Some(found);
        }
    }
    None
}

fn build_fact(spec: &RawSpec, test: &RawTest, result: &RawResult) -> FailureFact {
    let failing_step = first_step_error(&result.steps);

    let error = result
        .error
        .clone()
        .or_else(|| failing_step.and_then(|s| s.error.clone()))
        .unwrap_or(RawError {
            message: UNKNOWN_ERROR.to_string(),
            stack: None,
        });

    let stack_lines: Option<Vec<String>> = error
        .stack
        .as_ref()
        .map(|s| s.lines().map(str::to_string).collect());

    let location = error
        .stack
        .as_deref()
        .or(Some(error.message.as_str()))
        .and_then(parse_stack_location);

    let (file, line, column) = match location {
        Some((f, l, c)) => (f, Some(l), Some(c)),
        None => (
            spec.file
                .clone()
                .unwrap_or_else(|| "Unknown file".to_string()),
            spec.line,
            None,
        ),
    };

    let test_name = if !spec.title.is_empty() {
        spec.title.clone()
    } else if !test.title.is_empty() {
        test.title.clone()
    } else {
        "Unknown test".to_string()
    };

    FailureFact {
        test_name,
        file,
        failed_step: failing_step.map(|s| s.title.clone()).unwrap_or_default(),
        error: error.message,
        timeout_ms: test.timeout.filter(|t| *t > 0),
        line,
        column,
        stack: stack_lines,
    }
}

fn parse_stack_location(stack: &str) -> Option<(String, u32, u32)> {
    let caps = STACK_FRAME
        .captures(stack)
        .or_else(|| BARE_LOCATION.captures(stack))?;
    let file = caps.get(1)?.as_str().to_string();
    let line = caps.get(2)?.as_str().parse().ok()?;
    let column = caps.get(3)?.as_str().parse().ok()?;
    Some((file, line, column))
}

// ============================================================================
// Counts
// ============================================================================

/// Aggregate pass/fail counts for a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReportCounts {
    pub total: u64,
    pub failed: u64,
    pub passed: u64,
    pub skipped: u64,
}

/// Compute run counts, preferring the report's `stats` block over manual
/// traversal when present.
pub fn report_counts(raw: &[u8]) -> Result<ReportCounts> {
    let report: RawReport =
        serde_json::from_slice(raw).map_err(|e| Error::ReportParse(e.to_string()))?;

    if let Some(stats) = &report.stats {
        return Ok(ReportCounts {
            total: stats.expected + stats.unexpected + stats.skipped + stats.flaky,
            failed: stats.unexpected,
            passed: stats.expected,
            skipped: stats.skipped,
        });
    }

    let mut counts = ReportCounts::default();
    for suite in &report.suites {
        count_suite(suite, &mut counts);
    }
    Ok(counts)
}

fn count_suite(suite: &RawSuite, counts: &mut ReportCounts) {
    for nested in &suite.suites {
        count_suite(nested, counts);
    }
    for spec in &suite.specs {
        for test in &spec.tests {
            for result in &test.results {
                counts.total += 1;
                if result_failed(result) {
                    counts.failed += 1;
                } else if result.status == "skipped" {
                    counts.skipped += 1;
                } else {
                    counts.passed += 1;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
