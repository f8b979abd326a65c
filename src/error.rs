//! Structured error types for the pipeline
//!
//! Two layers: [`PipelineError`] covers coordination failures (store,
//! records, wire payloads), while [`TaskError`] classifies failures inside a
//! running map or reduce task as fatal or transient. That classification is
//! the single contract governing retry: transient errors re-post the task
//! until the job's retry budget runs out, fatal errors fail the job at once.

use thiserror::Error;

use crate::job::{JobId, Stage, TaskId, TaskStatus};

/// Errors raised by the coordination plane.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input readers")]
    NoInputReaders,

    #[error("no output writers")]
    NoOutputWriters,

    #[error("forming reader names: {0}")]
    ReaderNames(#[source] anyhow::Error),

    #[error("forming writer names: {0}")]
    WriterNames(#[source] anyhow::Error),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("job {job_id}: expected stage {expected}, found {found}")]
    StageMismatch {
        job_id: JobId,
        expected: Stage,
        found: Stage,
    },

    #[error("task {task_id}: expected status {expected}, found {found}")]
    StatusMismatch {
        task_id: TaskId,
        expected: TaskStatus,
        found: TaskStatus,
    },

    #[error("missing required parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("corrupt shard name payload: {0}")]
    CorruptShardNames(String),

    #[error("task ids {first}..{first}+{count} fall outside the job's allocated window")]
    TaskIdOutsideWindow { first: TaskId, count: usize },

    #[error("datastore: {0}")]
    Store(#[source] anyhow::Error),

    #[error("transport: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Outcome classification for an error inside a map or reduce task.
///
/// User code returns this from `map`/`reduce`; plain errors convert into
/// [`TaskError::TryAgain`], so fatality is always an explicit choice. The
/// engines never classify anywhere else: whatever variant reaches the end of
/// a task decides between the retry path and immediate job failure.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task must not be retried; the job fails.
    #[error("{source}")]
    Fatal { source: anyhow::Error },

    /// The task may be re-posted until the retry budget is exhausted.
    #[error("{source}")]
    TryAgain { source: anyhow::Error },
}

impl TaskError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Fatal { source: err.into() }
    }

    pub fn try_again(err: impl Into<anyhow::Error>) -> Self {
        TaskError::TryAgain { source: err.into() }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Fatal { .. })
    }

    /// Unwraps the underlying error, discarding the classification.
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            TaskError::Fatal { source } => source,
            TaskError::TryAgain { source } => source,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::TryAgain { source: err }
    }
}

impl From<PipelineError> for TaskError {
    fn from(err: PipelineError) -> Self {
        match err {
            // A payload or parameter problem will not heal on retry.
            PipelineError::MissingParameter(_)
            | PipelineError::InvalidParameter { .. }
            | PipelineError::CorruptShardNames(_) => TaskError::fatal(err),
            other => TaskError::try_again(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn plain_errors_default_to_transient() {
        let err: TaskError = anyhow!("intermittent storage hiccup").into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_survives_unwrapping() {
        let err = TaskError::fatal(anyhow!("bad record"));
        assert!(err.is_fatal());
        assert_eq!(err.into_inner().to_string(), "bad record");
    }

    #[test]
    fn parameter_errors_promote_to_fatal() {
        let err: TaskError = PipelineError::MissingParameter("reader").into();
        assert!(err.is_fatal());

        let err: TaskError = PipelineError::Store(anyhow!("lease expired")).into();
        assert!(!err.is_fatal());
    }
}
