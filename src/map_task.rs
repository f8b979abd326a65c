//! Map task engine
//!
//! One invocation drives a single input shard through the user's map
//! function, partitions the output by key, spills sorted runs to
//! intermediate storage under a memory budget, and merges the spills down
//! to one shard per reducer partition. The task's result is the JSON
//! `{shard name: partition}` object the map monitor later assembles into
//! per-reducer read lists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::controller::report_task_outcome;
use crate::error::{PipelineError, TaskError};
use crate::job::{JobTask, PipelineConfig, TaskId, TaskType};
use crate::pipeline::MapReducePipeline;
use crate::spill::{merge_spills, write_spill, PartitionBuffers, Spill};
use crate::status::StatusUpdater;
use crate::store::Datastore;
use crate::wire::Params;

/// Entry point for a `/map` request.
pub async fn run_map_task<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    config: &PipelineConfig,
    base_url: &str,
    task_id: TaskId,
    params: &Params,
) -> Result<(), PipelineError> {
    let start = Instant::now();

    // Parameters go in before the task starts so the status observer sees a
    // fully configured pipeline.
    let json = params.get("json").unwrap_or("");
    pipeline.set_map_parameters(json);
    pipeline.set_shard_parameters(json);

    let task = match store.start_task(task_id).await {
        Ok(task) => task,
        Err(PipelineError::StatusMismatch { found, .. }) => {
            // Duplicate queue delivery; another invocation owns this task.
            info!(task_id, %found, "map task already claimed, dropping duplicate");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    pipeline.status(task.job, &task);

    let outcome = map_engine(pipeline, store, config, &task, params).await;
    let outcome = outcome.and_then(|names| {
        serde_json::to_string(&names)
            .map_err(|err| TaskError::try_again(anyhow::Error::new(err)))
    });

    report_task_outcome(pipeline, store, base_url, task_id, TaskType::Map, outcome).await?;

    info!(task_id, elapsed = ?start.elapsed(), "mapper done");
    Ok(())
}

/// Run the read → map → partition → spill loop and merge the spills.
/// Returns the `{shard name: partition}` map for the task result.
async fn map_engine<P: MapReducePipeline>(
    pipeline: &P,
    store: &Arc<dyn Datastore>,
    config: &PipelineConfig,
    task: &JobTask,
    params: &Params,
) -> Result<HashMap<String, usize>, TaskError> {
    let reader_name = params.require("reader")?;
    let shard_count: usize = params
        .require("shards")?
        .parse()
        .map_err(|err: std::num::ParseIntError| {
            TaskError::from(PipelineError::InvalidParameter {
                name: "shards",
                reason: err.to_string(),
            })
        })?;

    let mut reader = pipeline
        .reader_from_name(reader_name)
        .await
        .map_err(TaskError::fatal)?;

    let status = StatusUpdater::new(Arc::clone(store), task.id);
    let mut buffers = PartitionBuffers::new(shard_count, config.spill_threshold_bytes);
    let mut spills: Vec<Spill> = Vec::new();
    let mut spilled_items = 0usize;

    while let Some(item) = reader.next().await.map_err(TaskError::try_again)? {
        let mapped = pipeline.map(item, &status).await?;
        for datum in mapped {
            let dumped = pipeline.value_dump(&datum.value).map_err(TaskError::try_again)?;
            let partition = pipeline.shard(&datum.key, shard_count);
            buffers.push(partition, datum, dumped.len());
            spilled_items += 1;
        }

        if buffers.over_threshold() {
            let spill = write_spill(pipeline, &mut buffers)
                .await
                .map_err(TaskError::try_again)?;
            info!(task_id = task.id, items = spilled_items, "wrote spill");
            spills.push(spill);
            spilled_items = 0;
        }
    }

    if let Err(err) = reader.close().await {
        warn!(task_id = task.id, %err, "failed to close reader");
    }

    let completion = pipeline.map_complete(&status).await?;
    for datum in completion {
        let dumped = pipeline.value_dump(&datum.value).map_err(TaskError::try_again)?;
        let partition = pipeline.shard(&datum.key, shard_count);
        buffers.push(partition, datum, dumped.len());
    }

    // Final spill runs even when the buffers are empty so every emitted
    // datum is on storage before the merge.
    let spill = write_spill(pipeline, &mut buffers)
        .await
        .map_err(TaskError::try_again)?;
    spills.push(spill);

    let mut last_err = None;
    let attempts = config.merge_attempts.max(1);
    for attempt in 1..=attempts {
        match merge_spills(pipeline, &spills, shard_count).await {
            Ok(names) => {
                let final_names = names
                    .into_iter()
                    .map(|(partition, name)| (name, partition))
                    .collect();
                return Ok(final_names);
            }
            Err(err) => {
                warn!(task_id = task.id, attempt, %err, "spill merge failed");
                last_err = Some(err);
            }
        }
    }

    Err(TaskError::try_again(
        last_err.expect("merge_attempts is at least one"),
    ))
}
