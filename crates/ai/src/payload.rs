//! Payloads handed to downstream collaborators.

use serde::{Deserialize, Serialize};

use crate::result::{AiError, ExtractedIssue};

/// A meeting transcript plus its classifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub transcript: String,
    /// Meeting classifier (e.g. "standup", "retro", "incident").
    pub meeting_type: String,
    /// Default issue type for extracted items (e.g. "task", "bug").
    pub issue_type: String,
    /// Tracker project extracted issues are filed under.
    pub project: Option<String>,
    /// File every extracted issue in the tracker once analysis completes.
    pub file_issues: bool,
}

impl TranscriptPayload {
    pub fn new(
        transcript: impl Into<String>,
        meeting_type: impl Into<String>,
        issue_type: impl Into<String>,
    ) -> Self {
        Self {
            transcript: transcript.into(),
            meeting_type: meeting_type.into(),
            issue_type: issue_type.into(),
            project: None,
            file_issues: false,
        }
    }

    /// File extracted issues into `project` after analysis.
    pub fn filing_into(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self.file_issues = true;
        self
    }

    /// Strip unsafe characters and enforce the size bound.
    pub fn sanitized(mut self, max_chars: usize) -> Result<Self, AiError> {
        self.transcript = sanitize_text(&self.transcript);
        self.meeting_type = normalize_label(&self.meeting_type);
        self.issue_type = normalize_label(&self.issue_type);
        check_len("transcript", &self.transcript, max_chars)?;
        if self.meeting_type.is_empty() {
            return Err(AiError::InvalidInput("meeting_type is required".to_string()));
        }
        if self.file_issues && self.project.as_deref().is_none_or(|p| p.trim().is_empty()) {
            return Err(AiError::InvalidInput(
                "file_issues requires a tracker project".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Tracker fields for a single issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFields {
    pub project: String,
    pub summary: String,
    pub description: String,
    pub issue_type: String,
    pub labels: Vec<String>,
}

impl IssueFields {
    pub fn from_extracted(project: impl Into<String>, issue: &ExtractedIssue) -> Self {
        Self {
            project: project.into(),
            summary: issue.summary.clone(),
            description: issue.description.clone(),
            issue_type: issue.issue_type.clone(),
            labels: issue.labels.clone(),
        }
    }

    pub fn sanitized(mut self, max_chars: usize) -> Result<Self, AiError> {
        self.project = self.project.trim().to_string();
        self.summary = sanitize_text(&self.summary);
        self.description = sanitize_text(&self.description);
        self.issue_type = normalize_label(&self.issue_type);
        if self.project.is_empty() {
            return Err(AiError::InvalidInput("project is required".to_string()));
        }
        check_len("summary", &self.summary, max_chars)?;
        if self.summary.chars().count() + self.description.chars().count() > max_chars {
            return Err(AiError::InvalidInput(format!(
                "issue exceeds {max_chars} characters"
            )));
        }
        Ok(self)
    }
}

/// A single named measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub name: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

impl MetricsSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn sanitized(mut self) -> Result<Self, AiError> {
        self.name = normalize_label(&self.name);
        if self.name.is_empty() {
            return Err(AiError::InvalidInput("metric name is required".to_string()));
        }
        if !self.value.is_finite() {
            return Err(AiError::InvalidInput(format!(
                "metric {} has a non-finite value",
                self.name
            )));
        }
        Ok(self)
    }
}

/// Remove control characters (keeping newlines and tabs) and trim.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

fn normalize_label(input: &str) -> String {
    sanitize_text(input).to_lowercase()
}

fn check_len(field: &str, value: &str, max_chars: usize) -> Result<(), AiError> {
    if value.is_empty() {
        return Err(AiError::InvalidInput(format!("{field} is empty")));
    }
    let len = value.chars().count();
    if len > max_chars {
        return Err(AiError::InvalidInput(format!(
            "{field} has {len} characters (max {max_chars})"
        )));
    }
    Ok(())
}
