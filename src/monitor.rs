//! Stage completion monitors
//!
//! Each active stage has one self-rescheduling monitor task on the queue.
//! A monitor invocation polls the job until every task of its stage has
//! terminated or its poll window expires; on expiry it re-enqueues itself,
//! on completion it performs the stage barrier. Stage transitions belong to
//! the monitors, not to task completion callbacks, and the compare-and-set
//! embedded in the store operations makes each barrier single-winner under
//! duplicate queue delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::controller::job_failed;
use crate::error::PipelineError;
use crate::job::{Job, JobId, JobTask, PipelineConfig, Stage, TaskStatus, TaskType};
use crate::pipeline::MapReducePipeline;
use crate::store::Datastore;
use crate::wire::{encode_shard_names, escape, escape_bytes};

/// Why a poll loop returned.
#[derive(Debug)]
pub(crate) enum StageWait {
    /// Every task of the expected stage is `Done`; the stage barrier may
    /// run. The job is still at the expected stage.
    Completed(Job),
    /// Another worker already advanced the job past the expected stage.
    Advanced(Job),
    /// The job reached `Failed`.
    Failed(Job),
    /// The poll window expired with work still outstanding.
    TimedOut(Job),
}

/// Poll the job until its stage advances, it fails, or every task of
/// `expected` terminates. Checks immediately before the first sleep, so a
/// stage whose tasks already finished completes within one invocation.
pub(crate) async fn wait_for_stage_completion(
    store: &Arc<dyn Datastore>,
    job_id: JobId,
    expected: Stage,
    config: &PipelineConfig,
) -> Result<StageWait, PipelineError> {
    let deadline = Instant::now() + config.poll_timeout();

    loop {
        let job = store.job(job_id).await?;
        if job.stage == Stage::Failed {
            return Ok(StageWait::Failed(job));
        }
        if job.stage != expected {
            return Ok(StageWait::Advanced(job));
        }

        let tasks = store.tasks_for_job(&job).await?;
        if tasks.iter().all(|t| t.status == TaskStatus::Done) {
            return Ok(StageWait::Completed(job));
        }

        if Instant::now() >= deadline {
            return Ok(StageWait::TimedOut(job));
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}

/// `/map-monitor` tick: watch the map stage, then build and launch the
/// reduce stage.
pub async fn map_monitor<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    config: &PipelineConfig,
    job_id: JobId,
) -> Result<(), PipelineError> {
    let start = Instant::now();

    let job = match wait_for_stage_completion(store, job_id, Stage::Mapping, config).await? {
        StageWait::Completed(job) => job,
        StageWait::Advanced(job) => {
            info!(job_id, stage = %job.stage, "map stage already advanced");
            return Ok(());
        }
        StageWait::Failed(_) => return Ok(()),
        StageWait::TimedOut(job) => {
            info!(job_id, "map monitor wait timed out, restarting");
            let url = format!("{}/map-monitor?jobKey={}", job.url_prefix, job_id);
            return pipeline
                .post_status(&url)
                .await
                .map_err(PipelineError::Transport);
        }
    };

    if let Err(err) = launch_reduce_stage(pipeline, store, &job).await {
        error!(job_id, %err, "failed to start reduce stage");
        job_failed(pipeline, store, job_id, &err.to_string()).await;
        return Ok(());
    }

    info!(job_id, elapsed = ?start.elapsed(), "mapping complete");
    Ok(())
}

/// The map → reduce barrier: gather every map result, group shard names by
/// partition, create one reduce task per non-empty partition, and flip the
/// job to `Reducing` atomically with the task batch.
async fn launch_reduce_stage<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    job: &Job,
) -> Result<(), PipelineError> {
    let map_tasks = store.tasks_for_job(job).await?;
    let partitions = job.partition_count();

    let mut storage_names: Vec<Vec<String>> = vec![Vec::new(); partitions];
    for task in &map_tasks {
        let result = task.result.as_deref().unwrap_or("{}");
        let shard_names: HashMap<String, usize> =
            serde_json::from_str(result).map_err(|err| {
                PipelineError::CorruptShardNames(format!(
                    "map task {} result: {err}",
                    task.id
                ))
            })?;
        for (name, partition) in shard_names {
            if partition >= partitions {
                return Err(PipelineError::CorruptShardNames(format!(
                    "map task {} routed {name} to partition {partition} of {partitions}",
                    task.id
                )));
            }
            storage_names[partition].push(name);
        }
    }

    let first = store.allocate_task_ids(partitions).await?;
    let mut tasks: Vec<JobTask> = Vec::new();

    for (partition, names) in storage_names.iter().enumerate() {
        if names.is_empty() {
            continue;
        }
        let id = first + tasks.len() as u64;
        let read_from = encode_shard_names(names)?;
        let url = format!(
            "{}/reduce?taskKey={};shard={};writer={};shards={}",
            job.url_prefix,
            id,
            partition,
            escape(&job.writer_names[partition]),
            escape_bytes(&read_from),
        );

        let mut task = JobTask::new(id, job.id, TaskType::Reduce, url);
        task.read_from = Some(read_from);
        task.separate_reduce_items = job.separate_reduce_items;
        tasks.push(task);
    }

    let task_urls: Vec<String> = tasks.iter().map(|t| t.url.clone()).collect();
    match store
        .create_tasks(job.id, Stage::Mapping, Stage::Reducing, first, tasks)
        .await
    {
        Ok(_) => {}
        Err(PipelineError::StageMismatch { found, .. }) => {
            // A duplicate monitor won the barrier.
            info!(job_id = job.id, stage = %found, "reduce stage already created");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    for url in &task_urls {
        pipeline
            .post_task(url, &job.json_parameters)
            .await
            .map_err(PipelineError::Transport)?;
    }

    let monitor_url = format!("{}/reduce-monitor?jobKey={}", job.url_prefix, job.id);
    pipeline
        .post_status(&monitor_url)
        .await
        .map_err(PipelineError::Transport)?;

    info!(job_id = job.id, reduce_tasks = task_urls.len(), "reduce stage launched");
    Ok(())
}

/// `/reduce-monitor` tick: watch the reduce stage, then finish the job.
pub async fn reduce_monitor<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    config: &PipelineConfig,
    job_id: JobId,
) -> Result<(), PipelineError> {
    let job = match wait_for_stage_completion(store, job_id, Stage::Reducing, config).await? {
        StageWait::Completed(job) => job,
        StageWait::Advanced(job) => {
            info!(job_id, stage = %job.stage, "reduce stage already advanced");
            return Ok(());
        }
        StageWait::Failed(_) => return Ok(()),
        StageWait::TimedOut(job) => {
            info!(job_id, "reduce monitor wait timed out, restarting");
            let url = format!("{}/reduce-monitor?jobKey={}", job.url_prefix, job_id);
            return pipeline
                .post_status(&url)
                .await
                .map_err(PipelineError::Transport);
        }
    };

    match store
        .transition_stage(job_id, Stage::Reducing, Stage::Done)
        .await
    {
        Ok(_) => {}
        Err(PipelineError::StageMismatch { found, .. }) => {
            info!(job_id, stage = %found, "job already finished");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    info!(job_id, "job done");

    if let Some(on_complete) = &job.on_complete_url {
        let url = format!("{on_complete}?status={};id={job_id}", TaskStatus::Done);
        if let Err(err) = pipeline.post_status(&url).await {
            // The job is already Done; the caller can still poll for it.
            warn!(job_id, %err, "failed to post completion callback");
        }
    }

    Ok(())
}
