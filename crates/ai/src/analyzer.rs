use async_trait::async_trait;

use crate::payload::TranscriptPayload;
use crate::result::{AiError, AnalysisOutcome};

/// Structured extraction over a meeting transcript (one LLM round trip).
///
/// Implementations own their request deadline; a timeout surfaces as an
/// ordinary retryable [`AiError`].
#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync + 'static {
    /// Run extraction on an already sanitized payload.
    ///
    /// Must not mutate any engine state.
    async fn analyze(&self, payload: &TranscriptPayload) -> Result<AnalysisOutcome, AiError>;
}
