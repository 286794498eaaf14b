//! Core job types and the job state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use meetflow_ai::{AiError, AnalysisOutcome, CreatedIssue, IssueFields, MetricsSample, TranscriptPayload};
use meetflow_core::{BatchId, JobId, SubjectId};

/// Resource class of a job: picks the pool, the retry policy and the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    IssueCreation,
    Metrics,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Analysis, JobKind::IssueCreation, JobKind::Metrics];

    /// Action name used for rate limiting and config keys.
    pub fn action_name(&self) -> &'static str {
        match self {
            JobKind::Analysis => "analysis",
            JobKind::IssueCreation => "issue_creation",
            JobKind::Metrics => "metrics",
        }
    }

    /// Metrics samples are side effects, so replaying a cached result would drop them.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, JobKind::Metrics)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.action_name())
    }
}

/// Service tier of the caller; feeds job priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerTier {
    Premium,
    #[default]
    Standard,
    Free,
}

/// Job execution status.
///
/// ```text
/// Queued -> Processing -> Completed
///                      -> Retrying -> Queued
///                      -> Failed
/// Queued | Processing  -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for batching or a pool slot
    Queued,
    /// Claimed by a pool; downstream call in flight
    Processing,
    /// Failed, waiting for the backoff delay before re-entering the queue
    Retrying,
    /// Downstream call succeeded; result persisted and cached
    Completed,
    /// Attempts exhausted or the failure cannot be retried
    Failed,
    /// Cancelled by the caller before a result was applied
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Retrying, Queued)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from:?} -> {to:?} for job {job_id}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Deterministic cache key derived from a normalized payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind-specific immutable job input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Analysis(TranscriptPayload),
    IssueCreation(IssueFields),
    Metrics(MetricsSample),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Analysis(_) => JobKind::Analysis,
            JobPayload::IssueCreation(_) => JobKind::IssueCreation,
            JobPayload::Metrics(_) => JobKind::Metrics,
        }
    }

    /// Classifier fields. Jobs are only batched with identical classifiers.
    pub fn classifier(&self) -> Vec<&str> {
        match self {
            JobPayload::Analysis(p) => vec![&p.meeting_type, &p.issue_type],
            JobPayload::IssueCreation(f) => vec![&f.project, &f.issue_type],
            JobPayload::Metrics(m) => vec![&m.name],
        }
    }

    /// The classifier value routing checks against the low-latency list.
    pub fn category(&self) -> &str {
        match self {
            JobPayload::Analysis(p) => &p.meeting_type,
            JobPayload::IssueCreation(f) => &f.issue_type,
            JobPayload::Metrics(m) => &m.name,
        }
    }

    /// Payload size in characters.
    pub fn content_len(&self) -> usize {
        match self {
            JobPayload::Analysis(p) => p.transcript.chars().count(),
            JobPayload::IssueCreation(f) => {
                f.summary.chars().count() + f.description.chars().count()
            }
            JobPayload::Metrics(m) => {
                m.name.chars().count()
                    + m.labels
                        .iter()
                        .map(|(k, v)| k.chars().count() + v.chars().count())
                        .sum::<usize>()
            }
        }
    }

    /// Sanitize text fields and enforce size bounds.
    pub fn sanitized(self, max_chars: usize) -> Result<Self, AiError> {
        Ok(match self {
            JobPayload::Analysis(p) => JobPayload::Analysis(p.sanitized(max_chars)?),
            JobPayload::IssueCreation(f) => JobPayload::IssueCreation(f.sanitized(max_chars)?),
            JobPayload::Metrics(m) => JobPayload::Metrics(m.sanitized()?),
        })
    }

    /// SHA-256 over kind, classifiers and whitespace/case-normalized content.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().action_name().as_bytes());
        for part in self.classifier() {
            hasher.update([0u8]);
            hasher.update(part.to_lowercase().as_bytes());
        }
        hasher.update([0u8, 0u8]);

        match self {
            JobPayload::Analysis(p) => {
                hasher.update(normalize(&p.transcript).as_bytes());
                hasher.update([0u8]);
                if p.file_issues {
                    hasher.update(p.project.as_deref().unwrap_or_default().as_bytes());
                }
            }
            JobPayload::IssueCreation(f) => {
                hasher.update(normalize(&f.summary).as_bytes());
                hasher.update([0u8]);
                hasher.update(normalize(&f.description).as_bytes());
                let mut labels: Vec<String> = f.labels.iter().map(|l| normalize(l)).collect();
                labels.sort();
                for label in labels {
                    hasher.update([0u8]);
                    hasher.update(label.as_bytes());
                }
            }
            JobPayload::Metrics(m) => {
                hasher.update(m.value.to_bits().to_be_bytes());
                for (k, v) in &m.labels {
                    hasher.update([0u8]);
                    hasher.update(normalize(k).as_bytes());
                    hasher.update(b"=");
                    hasher.update(normalize(v).as_bytes());
                }
            }
        }

        Fingerprint(hex::encode(hasher.finalize()))
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Successful downstream result; the only thing ever cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Analysis(AnalysisOutcome),
    IssueCreated(CreatedIssue),
    MetricsRecorded,
}

/// A tracked unit of work (the persisted record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subject: SubjectId,
    pub tier: CallerTier,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub fingerprint: Fingerprint,
    /// Lower = more urgent. Computed once at submission.
    pub priority: u32,
    pub status: JobStatus,
    /// Number of downstream calls started so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Batch the job was last dispatched with (None for immediate dispatch)
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First time the job entered Processing
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub output: Option<JobOutput>,
}

impl Job {
    /// Create a queued job from a sanitized payload.
    pub fn new(
        subject: SubjectId,
        tier: CallerTier,
        payload: JobPayload,
        priority: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            subject,
            tier,
            kind: payload.kind(),
            fingerprint: payload.fingerprint(),
            payload,
            priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            batch_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            output: None,
        }
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Claim the job for a downstream call; counts one attempt.
    pub fn mark_processing(
        &mut self,
        batch_id: Option<BatchId>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing, now)?;
        self.attempts += 1;
        self.batch_id = batch_id;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, output: JobOutput, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed, now)?;
        self.output = Some(output);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_retrying(&mut self, error: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Retrying, now)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Backoff elapsed: back to the queue.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Queued, now)
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed, now)?;
        self.last_error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Caller-facing snapshot.
    pub fn view(&self) -> JobView {
        JobView {
            id: Some(self.id),
            kind: self.kind,
            status: self.status,
            priority: self.priority,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            batch_id: self.batch_id,
            cached: false,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            processing_time: match (self.started_at, self.completed_at) {
                (Some(start), Some(end)) => (end - start).to_std().ok(),
                _ => None,
            },
            last_error: self.last_error.clone(),
            output: self.output.clone(),
        }
    }
}

/// What `GetStatus` returns: the persisted record minus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    /// `None` for cache hits, which never create a job.
    pub id: Option<JobId>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub batch_id: Option<BatchId>,
    pub cached: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time: Option<Duration>,
    pub last_error: Option<String>,
    pub output: Option<JobOutput>,
}

impl JobView {
    /// A completed view served straight from the result cache.
    pub fn cached(kind: JobKind, output: JobOutput, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            kind,
            status: JobStatus::Completed,
            priority: 0,
            attempts: 0,
            max_attempts: 0,
            batch_id: None,
            cached: true,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: Some(now),
            processing_time: Some(Duration::ZERO),
            last_error: None,
            output: Some(output),
        }
    }
}
