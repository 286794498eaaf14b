//! `meetflow-ai`
//!
//! **Responsibility:** the downstream collaborator boundary of the job engine.
//!
//! - Payload types handed to collaborators (sanitized before they get here).
//! - Async traits for the LLM analysis call, the issue tracker and the
//!   metrics sink. The engine treats every call as opaque and only looks at
//!   success/failure and [`AiError::is_retryable`].
//! - A deterministic [`KeywordAnalyzer`] for local runs without an LLM.

pub mod analyzer;
pub mod keyword;
pub mod payload;
pub mod result;
pub mod tracker;

pub use analyzer::TranscriptAnalyzer;
pub use keyword::KeywordAnalyzer;
pub use payload::{IssueFields, MetricsSample, TranscriptPayload, sanitize_text};
pub use result::{AiError, AnalysisOutcome, CreatedIssue, ExtractedIssue, TokenUsage};
pub use tracker::{IssueTracker, MetricsSink};
