//! Build job payload and its state machine.
//!
//! A [`BuildJob`] is the persisted record of one build attempt. It moves
//! through `WAITING -> RUNNING -> DONE` and never leaves `DONE`; a retry is
//! always a new job with a new id (see [`BuildJob::requeued_copy`]).

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{BuildOutput, Error, JobId, Result};

/// Lifecycle state of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[display("WAITING")]
    Waiting,
    #[display("RUNNING")]
    Running,
    #[display("DONE")]
    Done,
}

/// Record of a worker that died while holding a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Identity of the worker that held the job.
    pub worker: String,
    /// Queue the job was claimed from.
    pub queue: String,
    pub failed_at: DateTime<Utc>,
    /// Top-level error message.
    pub error: String,
    /// Error chain, outermost first.
    pub backtrace: Vec<String>,
}

impl JobFailure {
    /// Build a failure record from an error and its source chain.
    pub fn from_error(
        worker: impl Into<String>,
        queue: impl Into<String>,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut backtrace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            backtrace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            worker: worker.into(),
            queue: queue.into(),
            failed_at: Utc::now(),
            error: err.to_string(),
            backtrace,
        }
    }
}

/// What a job view should show for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "return_code")]
pub enum BuildOutcome {
    Waiting,
    Processing,
    Succeeded,
    Failed(i32),
    SystemError,
}

impl BuildOutcome {
    /// Short human-readable label.
    pub fn label(&self) -> String {
        match self {
            BuildOutcome::Waiting => "waiting".to_string(),
            BuildOutcome::Processing => "processing".to_string(),
            BuildOutcome::Succeeded => "succeeded".to_string(),
            BuildOutcome::Failed(code) => format!("failed ({})", code),
            BuildOutcome::SystemError => "system error".to_string(),
        }
    }
}

/// The persisted payload of a build job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: JobId,
    pub project: String,
    pub queue: String,
    /// Creation time of this job instance.
    pub timestamp: DateTime<Utc>,
    /// Raw webhook payload that caused the build.
    pub trigger_event: serde_json::Value,
    /// Description of the trigger rule that matched.
    pub triggered_by: String,
    pub status: JobStatus,
    pub return_code: Option<i32>,
    /// Combined output of the build script.
    pub output: Option<String>,
    /// Set once a newer job has been created from this one.
    pub requeued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl BuildJob {
    /// Create a fresh job in `WAITING`.
    pub fn new(
        id: JobId,
        project: impl Into<String>,
        queue: impl Into<String>,
        trigger_event: serde_json::Value,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            id,
            project: project.into(),
            queue: queue.into(),
            timestamp: Utc::now(),
            trigger_event,
            triggered_by: triggered_by.into(),
            status: JobStatus::Waiting,
            return_code: None,
            output: None,
            requeued: false,
            error: None,
        }
    }

    /// `WAITING -> RUNNING`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Waiting, JobStatus::Running)
    }

    /// `RUNNING -> DONE` with the build's exit code and output.
    pub fn finish(&mut self, build: BuildOutput) -> Result<()> {
        self.transition(JobStatus::Running, JobStatus::Done)?;
        self.return_code = Some(build.exit_code);
        self.output = Some(build.output);
        Ok(())
    }

    /// Finalize a job whose worker died before it could record a result.
    ///
    /// Rejected when a return code was already recorded, so `return_code`
    /// and `error` never coexist.
    pub fn abandon(&mut self, failure: JobFailure) -> Result<()> {
        if self.return_code.is_some() {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: JobStatus::Done,
            });
        }
        self.status = JobStatus::Done;
        self.error = Some(failure);
        Ok(())
    }

    /// A new `WAITING` job with this job's routing and trigger fields.
    pub fn requeued_copy(&self, id: JobId) -> BuildJob {
        BuildJob::new(
            id,
            self.project.clone(),
            self.queue.clone(),
            self.trigger_event.clone(),
            self.triggered_by.clone(),
        )
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn outcome(&self) -> BuildOutcome {
        match (self.status, self.return_code, &self.error) {
            (_, Some(0), _) => BuildOutcome::Succeeded,
            (_, Some(code), _) => BuildOutcome::Failed(code),
            (_, None, Some(_)) => BuildOutcome::SystemError,
            (JobStatus::Waiting, None, None) => BuildOutcome::Waiting,
            (JobStatus::Running, None, None) => BuildOutcome::Processing,
            (JobStatus::Done, None, None) => BuildOutcome::SystemError,
        }
    }

    fn transition(&mut self, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
