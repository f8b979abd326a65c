//! Job and task records
//!
//! The two entity kinds persisted by the pipeline. A `Job` tracks one
//! pipeline invocation through its stages; a `JobTask` is one independently
//! scheduled unit of map or reduce work. All cross-worker coordination goes
//! through these records, so their transitions use compare-and-set semantics
//! enforced by the [`Datastore`](crate::store::Datastore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type JobId = u64;
pub type TaskId = u64;

/// Lifecycle stage of a job. Stages only move forward; a job is never
/// resurrected out of `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Created, initial task batch not yet persisted.
    Init,
    /// Map tasks created and queued.
    Mapping,
    /// Reduce tasks created and queued.
    Reducing,
    /// All reduce tasks finished.
    Done,
    /// Terminal failure; no further work is enqueued.
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Mapping => "mapping",
            Stage::Reducing => "reducing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Map,
    Reduce,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Map => f.write_str("map"),
            TaskType::Reduce => f.write_str("reduce"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Parameters for one pipeline invocation, supplied to
/// [`run`](crate::controller::run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Base url path for this job's task and monitor endpoints. Must match
    /// the base url the request handler was mounted at.
    pub url_prefix: String,

    /// If set, posted on completion with `status=done` or
    /// `status=error;error=<message>`. When unset the caller is expected to
    /// poll the job record.
    #[serde(default)]
    pub on_complete_url: Option<String>,

    /// How many times an individual task may execute. `1` means a task is
    /// never retried; fatal errors ignore this budget entirely.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Pass each mapped row to `reduce` on its own instead of collapsing
    /// rows that share a key into one call.
    #[serde(default)]
    pub separate_reduce_items: bool,

    /// Opaque parameters handed to the map, shard, and reduce handlers.
    /// Assumed to be JSON, though nothing enforces that.
    #[serde(default)]
    pub json_parameters: String,
}

fn default_retry_count() -> u32 {
    3
}

impl JobConfig {
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            on_complete_url: None,
            retry_count: default_retry_count(),
            separate_reduce_items: false,
            json_parameters: String::new(),
        }
    }
}

/// Tuning knobs for the engines and monitors. Embedders mostly leave the
/// defaults alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Cumulative dumped-value bytes a map task buffers before spilling.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold_bytes: usize,

    /// Attempts for the spill merge before the task surfaces a transient
    /// failure.
    #[serde(default = "default_merge_attempts")]
    pub merge_attempts: u32,

    /// How long one monitor invocation polls before re-enqueueing itself.
    #[serde(default = "default_poll_timeout_secs")]
    pub monitor_poll_timeout_secs: u64,

    /// Delay between job status reads inside the monitor poll loop.
    #[serde(default = "default_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,
}

fn default_spill_threshold() -> usize {
    4 * 1024 * 1024
}

fn default_merge_attempts() -> u32 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            spill_threshold_bytes: default_spill_threshold(),
            merge_attempts: default_merge_attempts(),
            monitor_poll_timeout_secs: default_poll_timeout_secs(),
            monitor_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }
}

/// One pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub url_prefix: String,
    pub stage: Stage,

    /// One writer name per reducer partition; the length fixes the shard
    /// count for the whole job.
    pub writer_names: Vec<String>,

    pub on_complete_url: Option<String>,
    pub retry_count: u32,
    pub separate_reduce_items: bool,
    pub json_parameters: String,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// First id of the contiguous task-id window for the current stage.
    /// Range scans over `first_task_id .. first_task_id + task_count`
    /// recover the stage's tasks without an index.
    pub first_task_id: TaskId,
    pub task_count: usize,

    /// Explanation recorded when the job enters `Failed`.
    pub failure: Option<String>,
}

impl Job {
    pub fn new(config: JobConfig, writer_names: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            url_prefix: config.url_prefix,
            stage: Stage::Init,
            writer_names,
            on_complete_url: config.on_complete_url,
            retry_count: config.retry_count,
            separate_reduce_items: config.separate_reduce_items,
            json_parameters: config.json_parameters,
            started_at: now,
            updated_at: now,
            first_task_id: 0,
            task_count: 0,
            failure: None,
        }
    }

    /// Number of reducer partitions for this job.
    pub fn partition_count(&self) -> usize {
        self.writer_names.len()
    }
}

/// One independently scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub id: TaskId,
    pub job: JobId,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Fully formed target url including the task key and per-task
    /// parameters; re-posted verbatim on retry.
    pub url: String,

    /// Executions so far that ended in a transient failure.
    pub retries: u32,
    pub updated_at: DateTime<Utc>,

    /// Last free-form status message from the running task.
    pub info: String,

    /// Opaque payload produced on `Done`. For map tasks this is the JSON
    /// `{shard name: partition}` object; for reduce tasks the writer's
    /// final name.
    pub result: Option<String>,

    /// zlib-compressed JSON list of intermediate shard names to read;
    /// reduce tasks only.
    pub read_from: Option<Vec<u8>>,

    /// Copied from the job at creation so the reduce engine does not need a
    /// job read on the hot path.
    pub separate_reduce_items: bool,
}

impl JobTask {
    pub fn new(id: TaskId, job: JobId, task_type: TaskType, url: String) -> Self {
        Self {
            id,
            job,
            task_type,
            status: TaskStatus::Pending,
            url,
            retries: 0,
            updated_at: Utc::now(),
            info: String::new(),
            result: None,
            read_from: None,
            separate_reduce_items: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_defaults_to_three() {
        let config: JobConfig = serde_json::from_str(r#"{"url_prefix": "/wordcount"}"#).unwrap();
        assert_eq!(config.retry_count, 3);
        assert!(!config.separate_reduce_items);
        assert!(config.on_complete_url.is_none());
    }

    #[test]
    fn stage_display_matches_wire_names() {
        assert_eq!(Stage::Mapping.to_string(), "mapping");
        assert_eq!(TaskStatus::Done.to_string(), "done");
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Reducing.is_terminal());
    }

    #[test]
    fn pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.spill_threshold_bytes, 4 * 1024 * 1024);
        assert_eq!(config.merge_attempts, 5);
        assert_eq!(config.poll_timeout(), Duration::from_secs(300));
    }
}
