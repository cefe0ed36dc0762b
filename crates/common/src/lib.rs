//! TraceTriage Common Library
//!
//! Shared types and deterministic artifact tooling for the TraceTriage
//! platform: test-report parsing, trace decoding, DOM/page-state heuristics,
//! and selector analysis.

pub mod dom;
pub mod error;
pub mod report;
pub mod selector;
pub mod text;
pub mod trace;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use report::{parse_report, report_counts, ReportCounts};
pub use trace::{read_trace, TraceData, TraceError};
pub use types::*;

/// TraceTriage version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
