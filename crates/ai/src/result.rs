use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One work item extracted from a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedIssue {
    pub summary: String,
    pub description: String,
    /// Tracker issue type (e.g. "task", "bug").
    pub issue_type: String,
    pub labels: Vec<String>,
}

/// Token accounting reported by the model provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of an analysis call.
///
/// `success == false` means the provider answered but the extraction is not
/// usable (e.g. malformed structured output); the engine retries it like a
/// failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub issues: Vec<ExtractedIssue>,
    pub success: bool,
    pub usage: TokenUsage,
}

impl AnalysisOutcome {
    pub fn new(issues: Vec<ExtractedIssue>, usage: TokenUsage) -> Self {
        Self {
            issues,
            success: true,
            usage,
        }
    }

    pub fn unsuccessful(usage: TokenUsage) -> Self {
        Self {
            issues: Vec::new(),
            success: false,
            usage,
        }
    }
}

/// Result of filing one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIssue {
    /// Tracker key of the new issue (e.g. "OPS-142").
    pub key: String,
    pub success: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    /// The request can never succeed as sent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The collaborator refused the request (auth, schema, permissions).
    #[error("rejected by collaborator: {0}")]
    Rejected(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// Network failure, timeout or upstream overload.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AiError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::InferenceFailed(_) | AiError::Unavailable(_) | AiError::Internal(_)
        )
    }
}
