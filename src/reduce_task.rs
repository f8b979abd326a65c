//! Reduce task engine
//!
//! One invocation opens every intermediate shard advertised for its
//! partition, merges them into a single non-decreasing key stream, groups
//! adjacent equal keys, and drives the user's reduce function, writing
//! results through the output writer. Shards are deleted once consumed;
//! deletion failures are advisory.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::controller::report_task_outcome;
use crate::error::{PipelineError, TaskError};
use crate::job::{JobTask, TaskId, TaskType};
use crate::merge::Merger;
use crate::pipeline::{MapReducePipeline, SingleOutputWriter};
use crate::status::StatusUpdater;
use crate::store::Datastore;
use crate::wire::{decode_shard_names, Params};

/// Entry point for a `/reduce` request.
pub async fn run_reduce_task<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    base_url: &str,
    task_id: TaskId,
    params: &Params,
) -> Result<(), PipelineError> {
    let start = Instant::now();

    let json = params.get("json").unwrap_or("");
    pipeline.set_reduce_parameters(json);

    let task = match store.start_task(task_id).await {
        Ok(task) => task,
        Err(PipelineError::StatusMismatch { found, .. }) => {
            info!(task_id, %found, "reduce task already claimed, dropping duplicate");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    pipeline.status(task.job, &task);

    let outcome = reduce_engine(pipeline, store, &task, params).await;

    report_task_outcome(pipeline, store, base_url, task_id, TaskType::Reduce, outcome).await?;

    info!(task_id, elapsed = ?start.elapsed(), "reducer done");
    Ok(())
}

/// Merge, group, reduce, write. Returns the writer's final name for the
/// task result.
async fn reduce_engine<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    task: &JobTask,
    params: &Params,
) -> Result<String, TaskError> {
    let writer_name = params.require("writer")?;
    let shard_names = decode_shard_names(params.require_bytes("shards")?)?;

    let mut writer = pipeline
        .writer_from_name(writer_name)
        .await
        .map_err(TaskError::fatal)?;

    let status = StatusUpdater::new(Arc::clone(store), task.id);
    let result = drive_reduce(pipeline, task, &shard_names, writer.as_mut(), &status).await;

    if let Err(err) = writer.close().await {
        // A failed close poisons a successful run; a failed run keeps its
        // original error.
        if result.is_ok() {
            return Err(TaskError::try_again(err));
        }
        warn!(task_id = task.id, %err, "failed to close writer after error");
    }
    result?;

    remove_shards(pipeline, &shard_names, task.id).await;
    Ok(writer.to_name())
}

async fn drive_reduce<P: MapReducePipeline>(
    pipeline: &P,
    task: &JobTask,
    shard_names: &[String],
    writer: &mut dyn SingleOutputWriter<P::Output>,
    status: &StatusUpdater,
) -> Result<(), TaskError> {
    let mut merger = Merger::new(pipeline);
    for name in shard_names {
        let iter = pipeline.iterator(name).await.map_err(TaskError::try_again)?;
        // Empty shards drop out of the merge entirely.
        merger.add_source(iter).await.map_err(TaskError::try_again)?;
    }

    if merger.is_empty() {
        return Ok(());
    }

    let first = merger
        .next()
        .await
        .map_err(TaskError::try_again)?
        .expect("merger with sources yields at least one item");
    let mut key = first.key;
    let mut values = vec![first.value];

    while let Some(item) = merger.next().await.map_err(TaskError::try_again)? {
        if !task.separate_reduce_items && pipeline.equal(&key, &item.key) {
            values.push(item.value);
            continue;
        }

        let group_key = std::mem::replace(&mut key, item.key);
        let group_values = std::mem::replace(&mut values, vec![item.value]);
        if let Some(result) = pipeline.reduce(group_key, group_values, status).await? {
            writer.write(result).await.map_err(TaskError::try_again)?;
        }
    }

    if let Some(result) = pipeline.reduce(key, values, status).await? {
        writer.write(result).await.map_err(TaskError::try_again)?;
    }

    for result in pipeline.reduce_complete(status).await? {
        writer.write(result).await.map_err(TaskError::try_again)?;
    }

    Ok(())
}

/// Best-effort cleanup; shards are written-once and deletion is
/// idempotent, so a miss here only leaves garbage for a later sweep.
async fn remove_shards<P: MapReducePipeline>(pipeline: &P, names: &[String], task_id: TaskId) {
    for name in names {
        if let Err(err) = pipeline.remove(name).await {
            warn!(task_id, %name, %err, "failed to remove intermediate shard");
        }
    }
}
