//! The pipeline trait bundle
//!
//! A pipeline is one object implementing every capability the engines need:
//! reading input, mapping, intermediate storage, reducing, writing output,
//! key/value serialization and ordering, task-queue transport, and the
//! optional task-status observer. The component traits share their
//! associated types through supertrait chains, so a single `impl` block per
//! trait on one struct wires up a complete pipeline.
//!
//! No per-job information flows through these traits; everything a task
//! needs arrives via its request parameters and the persisted records.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::TaskError;
use crate::job::{JobId, JobTask};
use crate::status::StatusUpdater;

/// A `(key, value)` pair carried through the shuffle. The pipeline moves
/// these between map output, sorted intermediate shards, and grouped reduce
/// calls; it never looks inside them except through the handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDatum<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> MappedDatum<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Ordering, serialization, and partition selection for keys.
///
/// `equal` must be consistent with `less` (a strict weak order), and
/// `shard` must be deterministic and pure: every worker that sees a key
/// must route it to the same partition.
pub trait KeyHandler: Send + Sync {
    type Key: Clone + Send + Sync + 'static;

    fn less(&self, a: &Self::Key, b: &Self::Key) -> bool;

    fn equal(&self, a: &Self::Key, b: &Self::Key) -> bool;

    fn key_dump(&self, key: &Self::Key) -> Vec<u8>;

    fn key_load(&self, raw: &[u8]) -> Result<Self::Key>;

    /// Partition for `key` given the job's partition count.
    fn shard(&self, key: &Self::Key, shard_count: usize) -> usize;

    /// Job parameters, applied once per task before any `shard` call.
    fn set_shard_parameters(&self, _json_parameters: &str) {}
}

/// Serialization for values.
pub trait ValueHandler: Send + Sync {
    type Value: Clone + Send + Sync + 'static;

    fn value_dump(&self, value: &Self::Value) -> Result<Vec<u8>>;

    fn value_load(&self, raw: &[u8]) -> Result<Self::Value>;
}

/// One open input shard.
#[async_trait]
pub trait SingleInputReader<T>: Send {
    /// Next item, or `None` on exhaustion.
    async fn next(&mut self) -> Result<Option<T>>;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for input shards. `reader_names` fixes the number of map tasks;
/// each name must round-trip through a task url and `reader_from_name`.
#[async_trait]
pub trait InputReader: Send + Sync {
    type Item: Send + 'static;

    async fn reader_names(&self) -> Result<Vec<String>>;

    async fn reader_from_name(
        &self,
        name: &str,
    ) -> Result<Box<dyn SingleInputReader<Self::Item>>>;
}

/// One open output destination.
#[async_trait]
pub trait SingleOutputWriter<T>: Send {
    async fn write(&mut self, output: T) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Final addressable name, recorded as the reduce task's result. Only
    /// meaningful after `close`.
    fn to_name(&self) -> String;
}

/// Factory for output destinations. `writer_names` fixes the reducer
/// partition count for the whole job.
#[async_trait]
pub trait OutputWriter: Send + Sync {
    type Output: Send + 'static;

    async fn writer_names(&self) -> Result<Vec<String>>;

    async fn writer_from_name(
        &self,
        name: &str,
    ) -> Result<Box<dyn SingleOutputWriter<Self::Output>>>;
}

/// The user's map function plus its parameter hook.
#[async_trait]
pub trait Mapper: InputReader + KeyHandler + ValueHandler {
    /// Map one input item to zero or more keyed data.
    async fn map(
        &self,
        item: Self::Item,
        status: &StatusUpdater,
    ) -> Result<Vec<MappedDatum<Self::Key, Self::Value>>, TaskError>;

    /// Called once after the reader is exhausted; emissions are routed
    /// through the same partitioner as `map` output.
    async fn map_complete(
        &self,
        _status: &StatusUpdater,
    ) -> Result<Vec<MappedDatum<Self::Key, Self::Value>>, TaskError> {
        Ok(Vec::new())
    }

    /// Job parameters, applied once per map task before the task starts.
    fn set_map_parameters(&self, _json_parameters: &str) {}
}

/// The user's reduce function plus its parameter hook.
#[async_trait]
pub trait Reducer: OutputWriter + KeyHandler + ValueHandler {
    /// Called once per key group with every value for that key, unless the
    /// job sets `separate_reduce_items`, in which case each value arrives
    /// in its own singleton call. Returning `None` writes nothing.
    async fn reduce(
        &self,
        key: Self::Key,
        values: Vec<Self::Value>,
        status: &StatusUpdater,
    ) -> Result<Option<Self::Output>, TaskError>;

    /// Called once after the last group; each returned item is written to
    /// the output writer.
    async fn reduce_complete(
        &self,
        _status: &StatusUpdater,
    ) -> Result<Vec<Self::Output>, TaskError> {
        Ok(Vec::new())
    }

    /// Job parameters, applied once per reduce task before the task starts.
    fn set_reduce_parameters(&self, _json_parameters: &str) {}
}

/// A sequential cursor over one persisted intermediate shard. Items arrive
/// in non-decreasing key order.
#[async_trait]
pub trait ShardIterator<K, V>: Send {
    async fn next(&mut self) -> Result<Option<MappedDatum<K, V>>>;
}

/// Write-once storage for sorted intermediate shards. Names are opaque;
/// the store invents them. `remove` must be idempotent.
#[async_trait]
pub trait IntermediateStorage: KeyHandler + ValueHandler {
    /// Persist `items` (already sorted by key) as a new shard and return
    /// its name.
    async fn store(
        &self,
        items: Vec<MappedDatum<Self::Key, Self::Value>>,
    ) -> Result<String>;

    async fn iterator(
        &self,
        name: &str,
    ) -> Result<Box<dyn ShardIterator<Self::Key, Self::Value>>>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// Task-queue transport. `post_task` enqueues a worker invocation with the
/// job parameters as its body; `post_status` enqueues a bare url (monitor
/// ticks, completion callbacks). Both are at-least-once.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn post_task(&self, url: &str, json_parameters: &str) -> Result<()>;

    async fn post_status(&self, url: &str) -> Result<()>;
}

/// Observer notified when a task transitions into `Running` or `Done`.
/// Always invoked after the map/shard or reduce parameters have been
/// applied, so the observer sees a fully configured pipeline.
pub trait TaskStatusChange: Send + Sync {
    fn status(&self, job_id: JobId, task: &JobTask);
}

/// A [`TaskStatusChange`] that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreTaskStatusChange;

impl TaskStatusChange for IgnoreTaskStatusChange {
    fn status(&self, _job_id: JobId, _task: &JobTask) {}
}

/// The complete pipeline: everything the engines, monitors, and dispatcher
/// require, as one bound. Implemented automatically for any type that
/// implements the component traits.
pub trait MapReducePipeline:
    Mapper + Reducer + IntermediateStorage + TaskTransport + TaskStatusChange + 'static
{
}

impl<T> MapReducePipeline for T where
    T: Mapper + Reducer + IntermediateStorage + TaskTransport + TaskStatusChange + 'static
{
}
