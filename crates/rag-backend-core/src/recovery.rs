//! Checkpoint capture and resume planning for interrupted ingestion jobs.
//!
//! The [`JobRecoveryService`] never mutates its inputs. It turns a job plus
//! the canonical, ordered list of work identifiers into either a
//! [`Checkpoint`] (while the job runs) or a resumed job and its
//! [`ResumePlan`] (after an interruption).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::models::{IngestionJob, IngestionStatus};

/// Precondition violations surfaced directly to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("only running jobs can be checkpointed (job {job_id} is {status})")]
    NotRunning {
        job_id: String,
        status: IngestionStatus,
    },

    #[error("checkpoint state is required to resume ingestion")]
    MissingCheckpoint,

    #[error("only running or failed jobs can be resumed (job {job_id} is {status})")]
    NotResumable {
        job_id: String,
        status: IngestionStatus,
    },

    #[error("document_ids must contain at least one entry")]
    EmptyWorkload,
}

/// Progress captured while a job is running.
///
/// `processed_document_ids` follows the caller's canonical order, not the
/// order in which work happened to finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed_document_ids: Vec<String>,
    pub percent_complete: f64,
    pub captured_at: DateTime<Utc>,
}

/// Work remaining after an interruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePlan {
    pub remaining_document_ids: Vec<String>,
    pub percent_complete: f64,
    pub resume_stage: String,
    pub recovery_started_at: DateTime<Utc>,
}

pub struct JobRecoveryService {
    clock: Arc<dyn Clock>,
}

impl Default for JobRecoveryService {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl JobRecoveryService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Capture the current progress of a running job.
    ///
    /// `percent_complete` is `|processed ∩ ordered| / |ordered| * 100`, or
    /// `0.0` for an empty workload.
    pub fn record_progress<I, S>(
        &self,
        job: &IngestionJob,
        processed_ids: I,
        ordered_ids: &[String],
    ) -> Result<Checkpoint, RecoveryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if job.status != IngestionStatus::Running {
            return Err(RecoveryError::NotRunning {
                job_id: job.job_id.clone(),
                status: job.status,
            });
        }

        let processed: HashSet<String> = processed_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        let ordered_processed: Vec<String> = ordered_ids
            .iter()
            .filter(|id| processed.contains(id.as_str()))
            .cloned()
            .collect();

        let percent_complete = if ordered_ids.is_empty() {
            0.0
        } else {
            ordered_processed.len() as f64 / ordered_ids.len() as f64 * 100.0
        };

        tracing::debug!(
            job_id = %job.job_id,
            processed = ordered_processed.len(),
            total = ordered_ids.len(),
            percent_complete,
            "checkpoint captured"
        );

        Ok(Checkpoint {
            processed_document_ids: ordered_processed,
            percent_complete,
            captured_at: self.clock.now(),
        })
    }

    /// Compute the work left for a job given its last checkpoint.
    pub fn plan_resume(
        &self,
        job: &IngestionJob,
        checkpoint: Option<&Checkpoint>,
        ordered_ids: &[String],
    ) -> Result<ResumePlan, RecoveryError> {
        let checkpoint = checkpoint.ok_or(RecoveryError::MissingCheckpoint)?;

        if !matches!(job.status, IngestionStatus::Running | IngestionStatus::Failed) {
            return Err(RecoveryError::NotResumable {
                job_id: job.job_id.clone(),
                status: job.status,
            });
        }

        let processed: HashSet<&str> = checkpoint
            .processed_document_ids
            .iter()
            .map(String::as_str)
            .collect();
        let remaining: Vec<String> = ordered_ids
            .iter()
            .filter(|id| !processed.contains(id.as_str()))
            .cloned()
            .collect();

        let plan = ResumePlan {
            remaining_document_ids: remaining,
            percent_complete: checkpoint.percent_complete,
            resume_stage: resume_stage(job),
            recovery_started_at: self.clock.now(),
        };
        tracing::debug!(
            job_id = %job.job_id,
            resume_stage = %plan.resume_stage,
            remaining = plan.remaining_document_ids.len(),
            "resume plan created"
        );
        Ok(plan)
    }

    /// Prepare a job to continue after an interruption.
    ///
    /// - no checkpoint: restart from scratch (all ids remaining, 0%, fresh
    ///   `started_at`);
    /// - checkpoint with nothing remaining: promote straight to `Succeeded`;
    /// - otherwise: a `Running` job keeping the original `started_at`.
    pub fn resume(
        &self,
        job: &IngestionJob,
        ordered_ids: &[String],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(IngestionJob, ResumePlan), RecoveryError> {
        if ordered_ids.is_empty() {
            return Err(RecoveryError::EmptyWorkload);
        }

        let Some(checkpoint) = checkpoint else {
            let now = self.clock.now();
            let plan = ResumePlan {
                remaining_document_ids: ordered_ids.to_vec(),
                percent_complete: 0.0,
                resume_stage: resume_stage(job),
                recovery_started_at: now,
            };
            let restarted = IngestionJob {
                status: IngestionStatus::Running,
                stage: Some(plan.resume_stage.clone()),
                started_at: Some(now),
                completed_at: None,
                documents_processed: 0,
                percent_complete: Some(0.0),
                error_message: None,
                ..job.clone()
            };
            return Ok((restarted, plan));
        };

        let plan = self.plan_resume(job, Some(checkpoint), ordered_ids)?;

        if plan.remaining_document_ids.is_empty() {
            let completed = IngestionJob {
                status: IngestionStatus::Succeeded,
                completed_at: Some(self.clock.now()),
                documents_processed: ordered_ids.len() as u64,
                stage: Some("completed".to_string()),
                percent_complete: Some(100.0),
                error_message: None,
                ..job.clone()
            };
            return Ok((completed, plan));
        }

        let resumed = IngestionJob {
            status: IngestionStatus::Running,
            stage: Some(plan.resume_stage.clone()),
            started_at: job.started_at.or(Some(plan.recovery_started_at)),
            completed_at: None,
            documents_processed: checkpoint.processed_document_ids.len() as u64,
            percent_complete: Some(plan.percent_complete),
            error_message: None,
            ..job.clone()
        };
        Ok((resumed, plan))
    }
}

fn resume_stage(job: &IngestionJob) -> String {
    match job.stage.as_deref() {
        Some(stage) if !stage.is_empty() => format!("resuming_{}", stage),
        _ => "resuming_ingestion".to_string(),
    }
}
