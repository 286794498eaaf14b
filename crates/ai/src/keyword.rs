use async_trait::async_trait;

use crate::analyzer::TranscriptAnalyzer;
use crate::payload::TranscriptPayload;
use crate::result::{AiError, AnalysisOutcome, ExtractedIssue, TokenUsage};

/// Deterministic, offline extraction for dev runs and tests.
///
/// Model:
/// - Scan the transcript line by line.
/// - A line whose first word (after an optional speaker prefix and list
///   bullet) is one of the configured markers becomes an issue.
/// - `bug:`-style markers map to the "bug" issue type; everything else uses
///   the payload's default issue type.
/// - Usage is reported as whitespace-separated words in and out.
#[derive(Debug, Clone)]
pub struct KeywordAnalyzer {
    markers: Vec<String>,
    bug_markers: Vec<String>,
    /// Summaries longer than this are cut at a char boundary.
    max_summary_chars: usize,
}

impl Default for KeywordAnalyzer {
    fn default() -> Self {
        Self {
            markers: ["action", "todo", "follow-up", "followup"]
                .into_iter()
                .map(String::from)
                .collect(),
            bug_markers: vec!["bug".to_string()],
            max_summary_chars: 120,
        }
    }
}

impl KeywordAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into().to_lowercase());
        self
    }

    pub fn with_max_summary_chars(mut self, max: usize) -> Self {
        self.max_summary_chars = max;
        self
    }

    fn extract_line(&self, line: &str, default_type: &str) -> Option<ExtractedIssue> {
        let body = strip_speaker(line.trim().trim_start_matches(['-', '*', '•']).trim());
        let (head, rest) = body.split_once(':')?;
        let marker = head.trim().to_lowercase();
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }

        let issue_type = if self.bug_markers.contains(&marker) {
            "bug"
        } else if self.markers.contains(&marker) {
            default_type
        } else {
            return None;
        };

        let summary: String = rest.chars().take(self.max_summary_chars).collect();
        Some(ExtractedIssue {
            summary,
            description: rest.to_string(),
            issue_type: issue_type.to_string(),
            labels: vec![format!("from:{marker}")],
        })
    }
}

#[async_trait]
impl TranscriptAnalyzer for KeywordAnalyzer {
    async fn analyze(&self, payload: &TranscriptPayload) -> Result<AnalysisOutcome, AiError> {
        if self.max_summary_chars == 0 {
            return Err(AiError::InvalidInput(
                "max_summary_chars must be positive".to_string(),
            ));
        }

        let issues: Vec<ExtractedIssue> = payload
            .transcript
            .lines()
            .filter_map(|line| self.extract_line(line, &payload.issue_type))
            .collect();

        let usage = TokenUsage {
            input_tokens: payload.transcript.split_whitespace().count() as u64,
            output_tokens: issues
                .iter()
                .map(|i| i.description.split_whitespace().count() as u64)
                .sum(),
        };

        Ok(AnalysisOutcome::new(issues, usage))
    }
}

/// Drop a leading "Name:" speaker tag when another colon follows it.
fn strip_speaker(line: &str) -> &str {
    match line.split_once(':') {
        Some((speaker, rest))
            if rest.contains(':') && !speaker.trim().is_empty() && !speaker.contains(' ') =>
        {
            rest.trim()
        }
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_marked_lines() {
        let payload = TranscriptPayload::new(
            "Alice: yesterday I fixed the build\n\
             Bob: action: update the runbook\n\
             - TODO: rotate the staging keys\n\
             Carol: bug: login page 500s on Safari\n\
             Dave: no blockers",
            "standup",
            "task",
        );

        let outcome = KeywordAnalyzer::new().analyze(&payload).await.unwrap();
        assert!(outcome.success);
        let summaries: Vec<_> = outcome.issues.iter().map(|i| i.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "update the runbook",
                "rotate the staging keys",
                "login page 500s on Safari"
            ]
        );
        assert_eq!(outcome.issues[0].issue_type, "task");
        assert_eq!(outcome.issues[2].issue_type, "bug");
        assert!(outcome.usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn no_markers_means_no_issues() {
        let payload = TranscriptPayload::new("just chatting: nothing to do", "retro", "task");
        let outcome = KeywordAnalyzer::new().analyze(&payload).await.unwrap();
        assert!(outcome.issues.is_empty());
    }

    #[tokio::test]
    async fn summaries_are_truncated() {
        let payload = TranscriptPayload::new("todo: abcdefghij", "retro", "task");
        let outcome = KeywordAnalyzer::new()
            .with_max_summary_chars(4)
            .analyze(&payload)
            .await
            .unwrap();
        assert_eq!(outcome.issues[0].summary, "abcd");
        assert_eq!(outcome.issues[0].description, "abcdefghij");
    }
}
