//! TraceTriage Analysis Engine
//!
//! The failure-analysis pipeline: per failure, a fixed sequence of
//! conditionally-executed stages classifies the failure, correlates the
//! test's expectations against the recorded UI state, judges the failing
//! locator, synthesizes a verdict, and drafts a concrete fix. Deterministic
//! pattern rules run first at every stage; an external reasoning backend
//! covers the ambiguous remainder and every reasoning failure degrades to a
//! defined heuristic fallback.

pub mod action;
pub mod classify;
pub mod config;
pub mod correlate;
pub mod pipeline;
pub mod reasoning;
pub mod selector_stage;
pub mod solution;

pub use config::{EngineConfig, ReasoningConfig};
pub use pipeline::{AnalysisArtifacts, AnalysisEngine};
pub use reasoning::{
    HttpReasoner, ImageUnderstanding, Reasoning, ReasoningError, ReasoningRequest, SchemaKind,
};
