//! Map-side external-memory sort
//!
//! A map task accumulates its output in per-partition buffers; when the
//! cumulative dumped-value size crosses the spill threshold the buffers are
//! sorted and flushed to intermediate storage as one sorted shard per
//! non-empty partition. After the reader is exhausted a final spill runs
//! unconditionally, and the spills for each partition are merged down to at
//! most one surviving shard so every reduce task reads one shard per map
//! task.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::merge::Merger;
use crate::pipeline::{IntermediateStorage, KeyHandler, MappedDatum};

/// One flush of the in-memory buffers: the shard name written for each
/// partition that had data.
#[derive(Debug, Default)]
pub(crate) struct Spill {
    pub names: HashMap<usize, String>,
}

/// Per-partition accumulation for one map task.
pub(crate) struct PartitionBuffers<K, V> {
    buffers: Vec<Vec<MappedDatum<K, V>>>,
    dumped_bytes: usize,
    threshold: usize,
}

impl<K, V> PartitionBuffers<K, V> {
    pub fn new(partitions: usize, threshold: usize) -> Self {
        Self {
            buffers: (0..partitions).map(|_| Vec::new()).collect(),
            dumped_bytes: 0,
            threshold,
        }
    }

    pub fn push(&mut self, partition: usize, datum: MappedDatum<K, V>, dumped_len: usize) {
        self.buffers[partition].push(datum);
        self.dumped_bytes += dumped_len;
    }

    pub fn over_threshold(&self) -> bool {
        self.dumped_bytes > self.threshold
    }
}

/// Sort each buffer and persist the non-empty ones, clearing the buffers
/// for reuse. The sort is stable, so equal keys keep emission order.
pub(crate) async fn write_spill<P>(
    pipeline: &P,
    buffers: &mut PartitionBuffers<P::Key, P::Value>,
) -> Result<Spill>
where
    P: IntermediateStorage,
{
    let mut spill = Spill::default();

    for (partition, buffer) in buffers.buffers.iter_mut().enumerate() {
        if buffer.is_empty() {
            continue;
        }
        buffer.sort_by(|a, b| {
            if pipeline.less(&a.key, &b.key) {
                std::cmp::Ordering::Less
            } else if pipeline.less(&b.key, &a.key) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let items = std::mem::take(buffer);
        let name = pipeline
            .store(items)
            .await
            .with_context(|| format!("storing spill for partition {partition}"))?;
        debug!(partition, %name, "wrote spill shard");
        spill.names.insert(partition, name);
    }

    buffers.dumped_bytes = 0;
    Ok(spill)
}

/// Collapse `spills` to at most one shard per partition, deleting merged
/// inputs. Partitions with a single spill shard keep it untouched.
pub(crate) async fn merge_spills<P>(
    pipeline: &P,
    spills: &[Spill],
    partitions: usize,
) -> Result<HashMap<usize, String>>
where
    P: IntermediateStorage,
{
    let mut merged = HashMap::new();

    for partition in 0..partitions {
        let names: Vec<&String> = spills
            .iter()
            .filter_map(|spill| spill.names.get(&partition))
            .collect();

        match names.len() {
            0 => {}
            1 => {
                merged.insert(partition, names[0].clone());
            }
            _ => {
                let name = merge_partition(pipeline, &names, partition).await?;
                merged.insert(partition, name);
            }
        }
    }

    Ok(merged)
}

async fn merge_partition<P>(pipeline: &P, names: &[&String], partition: usize) -> Result<String>
where
    P: IntermediateStorage,
{
    let mut merger = Merger::new(pipeline);
    for name in names {
        let iter = pipeline
            .iterator(name)
            .await
            .with_context(|| format!("opening spill shard {name}"))?;
        merger.add_source(iter).await?;
    }

    let mut items = Vec::new();
    while let Some(item) = merger.next().await? {
        items.push(item);
    }

    let merged_name = pipeline
        .store(items)
        .await
        .with_context(|| format!("storing merged shard for partition {partition}"))?;

    for name in names {
        pipeline
            .remove(name)
            .await
            .with_context(|| format!("removing merged spill input {name}"))?;
    }

    info!(partition, inputs = names.len(), %merged_name, "merged spill shards");
    Ok(merged_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryShardStore;
    use crate::pipeline::{ShardIterator, ValueHandler};
    use crate::keyhandlers::{I64ValueHandler, StringKeyHandler};

    struct SpillPipeline {
        shards: MemoryShardStore,
    }

    impl KeyHandler for SpillPipeline {
        type Key = String;
        fn less(&self, a: &String, b: &String) -> bool {
            StringKeyHandler.less(a, b)
        }
        fn equal(&self, a: &String, b: &String) -> bool {
            StringKeyHandler.equal(a, b)
        }
        fn key_dump(&self, key: &String) -> Vec<u8> {
            StringKeyHandler.key_dump(key)
        }
        fn key_load(&self, raw: &[u8]) -> Result<String> {
            StringKeyHandler.key_load(raw)
        }
        fn shard(&self, key: &String, shard_count: usize) -> usize {
            StringKeyHandler.shard(key, shard_count)
        }
    }

    impl ValueHandler for SpillPipeline {
        type Value = i64;
        fn value_dump(&self, value: &i64) -> Result<Vec<u8>> {
            I64ValueHandler.value_dump(value)
        }
        fn value_load(&self, raw: &[u8]) -> Result<i64> {
            I64ValueHandler.value_load(raw)
        }
    }

    #[async_trait::async_trait]
    impl IntermediateStorage for SpillPipeline {
        async fn store(&self, items: Vec<MappedDatum<String, i64>>) -> Result<String> {
            self.shards.store(&items, self).await
        }
        async fn iterator(&self, name: &str) -> Result<Box<dyn ShardIterator<String, i64>>> {
            self.shards.iterator(name, self)
        }
        async fn remove(&self, name: &str) -> Result<()> {
            self.shards.remove(name).await
        }
    }

    fn datum(key: &str, value: i64) -> MappedDatum<String, i64> {
        MappedDatum::new(key.to_string(), value)
    }

    async fn shard_contents(
        pipeline: &SpillPipeline,
        name: &str,
    ) -> Vec<(String, i64)> {
        let mut iter = pipeline.iterator(name).await.unwrap();
        let mut out = Vec::new();
        while let Some(item) = iter.next().await.unwrap() {
            out.push((item.key, item.value));
        }
        out
    }

    #[tokio::test]
    async fn spill_sorts_and_skips_empty_partitions() {
        let pipeline = SpillPipeline {
            shards: MemoryShardStore::new(),
        };
        let mut buffers = PartitionBuffers::new(3, 1024);
        buffers.push(0, datum("pear", 2), 1);
        buffers.push(0, datum("apple", 1), 1);
        buffers.push(2, datum("fig", 3), 1);

        let spill = write_spill(&pipeline, &mut buffers).await.unwrap();
        assert_eq!(spill.names.len(), 2);
        assert!(!spill.names.contains_key(&1));

        let contents = shard_contents(&pipeline, &spill.names[&0]).await;
        assert_eq!(
            contents,
            vec![("apple".to_string(), 1), ("pear".to_string(), 2)]
        );

        // Buffers are reusable after a spill.
        assert!(!buffers.over_threshold());
    }

    #[tokio::test]
    async fn threshold_tracks_dumped_bytes() {
        let mut buffers: PartitionBuffers<String, i64> = PartitionBuffers::new(1, 10);
        buffers.push(0, datum("a", 1), 6);
        assert!(!buffers.over_threshold());
        buffers.push(0, datum("b", 2), 6);
        assert!(buffers.over_threshold());
    }

    #[tokio::test]
    async fn merge_collapses_to_one_shard_per_partition() {
        let pipeline = SpillPipeline {
            shards: MemoryShardStore::new(),
        };

        let mut spills = Vec::new();
        for round in 0..3 {
            let mut buffers = PartitionBuffers::new(2, 1024);
            buffers.push(0, datum("a", round), 1);
            buffers.push(0, datum("m", round + 10), 1);
            buffers.push(1, datum("z", round + 20), 1);
            spills.push(write_spill(&pipeline, &mut buffers).await.unwrap());
        }

        let merged = merge_spills(&pipeline, &spills, 2).await.unwrap();
        assert_eq!(merged.len(), 2);

        let contents = shard_contents(&pipeline, &merged[&0]).await;
        assert_eq!(contents.len(), 6);
        for window in contents.windows(2) {
            assert!(window[0].0 <= window[1].0);
        }

        // The merged inputs are gone; only the survivors remain.
        assert_eq!(pipeline.shards.len().await, 2);
    }

    #[tokio::test]
    async fn single_spill_is_left_in_place() {
        let pipeline = SpillPipeline {
            shards: MemoryShardStore::new(),
        };
        let mut buffers = PartitionBuffers::new(1, 1024);
        buffers.push(0, datum("only", 1), 1);
        let spill = write_spill(&pipeline, &mut buffers).await.unwrap();
        let original = spill.names[&0].clone();

        let merged = merge_spills(&pipeline, &[spill], 1).await.unwrap();
        assert_eq!(merged[&0], original);
    }
}
