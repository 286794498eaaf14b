use async_trait::async_trait;

use crate::payload::{IssueFields, MetricsSample};
use crate::result::{AiError, CreatedIssue};

/// External issue tracker. One call files one issue.
#[async_trait]
pub trait IssueTracker: Send + Sync + 'static {
    async fn create_issue(&self, fields: &IssueFields) -> Result<CreatedIssue, AiError>;
}

/// Destination for usage/quality metrics samples.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn record(&self, sample: &MetricsSample) -> Result<(), AiError>;
}
