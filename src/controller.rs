//! Job controller
//!
//! Owns the edges of a task's life: `run` creates a job with its map task
//! batch and first monitor, the engines report their outcomes through
//! [`report_task_outcome`], and [`handle_task_completion`] applies the
//! retry policy when those reports come back over the queue. Transient
//! failures re-post the task until the job's retry budget runs out; fatal
//! failures take the whole job down at once.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{PipelineError, TaskError};
use crate::job::{Job, JobConfig, JobId, JobTask, Stage, TaskId, TaskStatus, TaskType};
use crate::pipeline::MapReducePipeline;
use crate::store::Datastore;
use crate::wire::escape;

/// Start a pipeline invocation: create the job record, its map task batch,
/// and the map monitor. Returns the job id; the caller polls the job or
/// waits for the completion callback.
pub async fn run<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    config: JobConfig,
) -> Result<JobId, PipelineError> {
    let reader_names = pipeline
        .reader_names()
        .await
        .map_err(PipelineError::ReaderNames)?;
    if reader_names.is_empty() {
        return Err(PipelineError::NoInputReaders);
    }

    let writer_names = pipeline
        .writer_names()
        .await
        .map_err(PipelineError::WriterNames)?;
    if writer_names.is_empty() {
        return Err(PipelineError::NoOutputWriters);
    }
    let partitions = writer_names.len();

    let job = Job::new(config, writer_names);
    let job_id = store.create_job(job.clone()).await?;

    let first = store.allocate_task_ids(reader_names.len()).await?;
    let tasks: Vec<JobTask> = reader_names
        .iter()
        .enumerate()
        .map(|(i, reader_name)| {
            let id = first + i as TaskId;
            let url = format!(
                "{}/map?taskKey={};reader={};shards={}",
                job.url_prefix,
                id,
                escape(reader_name),
                partitions,
            );
            JobTask::new(id, job_id, TaskType::Map, url)
        })
        .collect();

    let task_urls: Vec<String> = tasks.iter().map(|t| t.url.clone()).collect();
    if let Err(err) = store
        .create_tasks(job_id, Stage::Init, Stage::Mapping, first, tasks)
        .await
    {
        job_failed(pipeline, store, job_id, &err.to_string()).await;
        return Err(err);
    }

    for url in &task_urls {
        if let Err(err) = pipeline.post_task(url, &job.json_parameters).await {
            job_failed(pipeline, store, job_id, &format!("posting task: {err}")).await;
            return Err(PipelineError::Transport(err));
        }
    }

    let monitor_url = format!("{}/map-monitor?jobKey={job_id}", job.url_prefix);
    if let Err(err) = pipeline.post_status(&monitor_url).await {
        job_failed(pipeline, store, job_id, &format!("starting map monitor: {err}")).await;
        return Err(PipelineError::Transport(err));
    }

    info!(job_id, map_tasks = task_urls.len(), partitions, "job started");
    Ok(job_id)
}

/// Record a finished engine run and post the matching completion callback.
/// `outcome` carries the result payload on success.
pub(crate) async fn report_task_outcome<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    base_url: &str,
    task_id: TaskId,
    task_type: TaskType,
    outcome: Result<String, TaskError>,
) -> Result<(), PipelineError> {
    let endpoint = match task_type {
        TaskType::Map => "mapcomplete",
        TaskType::Reduce => "reducecomplete",
    };

    let callback = match outcome {
        Ok(result) => {
            match store.complete_task(task_id, result).await {
                Ok(task) => pipeline.status(task.job, &task),
                Err(PipelineError::StatusMismatch { found, .. }) => {
                    // A concurrent duplicate already finished this task.
                    warn!(task_id, %found, "task no longer running, dropping result");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            format!("{base_url}/{endpoint}?taskKey={task_id};status=done")
        }
        Err(err) if err.is_fatal() => {
            let msg = err.into_inner().to_string();
            error!(task_id, %msg, "task failed fatally");
            store.fail_task(task_id, &msg).await?;
            format!(
                "{base_url}/{endpoint}?taskKey={task_id};status=error;error={}",
                escape(&msg)
            )
        }
        Err(err) => {
            let msg = err.into_inner().to_string();
            warn!(task_id, %msg, "task failed, requesting retry");
            format!(
                "{base_url}/{endpoint}?taskKey={task_id};status=again;error={}",
                escape(&msg)
            )
        }
    };

    pipeline
        .post_status(&callback)
        .await
        .map_err(PipelineError::Transport)
}

/// Apply the retry policy to a completion callback. `status` is the wire
/// value (`done`, `error`, or `again`).
pub async fn handle_task_completion<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    task_id: TaskId,
    status: &str,
    error_msg: Option<&str>,
) -> Result<(), PipelineError> {
    let task = store.task(task_id).await?;
    let job = store.job(task.job).await?;

    match status {
        // The task already wrote its terminal record; the stage monitor
        // observes completion on its own.
        "done" => Ok(()),

        "error" => {
            let msg = error_msg.unwrap_or("task failed");
            job_failed(pipeline, store, job.id, msg).await;
            Ok(())
        }

        "again" => {
            if job.stage.is_terminal() {
                // The job already failed or finished; do not feed it more
                // work.
                info!(task_id, stage = %job.stage, "dropping retry for terminal job");
                return Ok(());
            }

            let task = match store.retry_task(task_id).await {
                Ok(task) => task,
                Err(PipelineError::StatusMismatch {
                    found: TaskStatus::Pending,
                    ..
                }) => {
                    // The run died before claiming the task (or a duplicate
                    // callback raced us). Re-posting a Pending task is safe:
                    // the Pending→Running guard drops the extra delivery.
                    info!(task_id, "re-posting unclaimed task");
                    return pipeline
                        .post_task(&task.url, &job.json_parameters)
                        .await
                        .map_err(PipelineError::Transport);
                }
                Err(PipelineError::StatusMismatch { found, .. }) => {
                    // The task already resolved; nothing to retry.
                    info!(task_id, %found, "stale retry request dropped");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            if task.retries >= job.retry_count {
                let msg = format!(
                    "too many retries of task {task_id}: {}",
                    error_msg.unwrap_or("unknown error")
                );
                store.fail_task(task_id, &msg).await?;
                job_failed(pipeline, store, job.id, &msg).await;
                return Ok(());
            }

            info!(task_id, retries = task.retries, "re-posting task");
            pipeline
                .post_task(&task.url, &job.json_parameters)
                .await
                .map_err(PipelineError::Transport)
        }

        other => Err(PipelineError::InvalidParameter {
            name: "status",
            reason: format!("unknown completion status {other:?}"),
        }),
    }
}

/// Move the job to `Failed` and fire its completion callback with the
/// error. Exactly one caller wins the transition; the rest are no-ops, so
/// concurrent failure paths produce a single callback.
pub(crate) async fn job_failed<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    job_id: JobId,
    reason: &str,
) {
    error!(job_id, %reason, "job failed");

    let job = match store.mark_job_failed(job_id, reason).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(err) => {
            error!(job_id, %err, "failed to record job failure");
            return;
        }
    };

    if let Some(on_complete) = &job.on_complete_url {
        let url = format!(
            "{on_complete}?status=error;error={};id={job_id}",
            escape(reason)
        );
        if let Err(err) = pipeline.post_status(&url).await {
            warn!(job_id, %err, "failed to post failure callback");
        }
    }
}

/// Point-in-time task counts for a job, for dashboards and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// Task counts by status for the job's current stage.
pub async fn job_summary(store: &Arc<dyn Datastore>, job_id: JobId) -> Result<JobSummary, PipelineError> {
    let job = store.job(job_id).await?;
    let tasks = store.tasks_for_job(&job).await?;

    let mut summary = JobSummary::default();
    for task in tasks {
        match task.status {
            TaskStatus::Pending => summary.pending += 1,
            TaskStatus::Running => summary.running += 1,
            TaskStatus::Done => summary.done += 1,
            TaskStatus::Failed => summary.failed += 1,
        }
    }
    Ok(summary)
}
