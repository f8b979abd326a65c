//! In-memory pipeline building blocks
//!
//! Reference implementations of intermediate storage, input readers, output
//! writers, and the task-queue transport, all backed by process memory.
//! Single-node deployments compose a pipeline from these directly; the test
//! suite uses them to drive the whole url surface without real
//! infrastructure. Shards round-trip through the handlers' dump/load
//! codecs, so a pipeline built on these exercises the same serialization
//! paths a blob-store deployment would.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::pipeline::{
    KeyHandler, MappedDatum, ShardIterator, SingleInputReader, SingleOutputWriter, TaskTransport,
    ValueHandler,
};
use crate::wire::escape;

/////////////////////////////////////////////////////////////////////////////
// Intermediate storage
/////////////////////////////////////////////////////////////////////////////

/// Write-once shard store holding dumped `(key, value)` frames.
#[derive(Default)]
pub struct MemoryShardStore {
    shards: Mutex<HashMap<String, Arc<Vec<(Vec<u8>, Vec<u8>)>>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dump `items` through the handler codecs and persist them under a
    /// fresh name.
    pub async fn store<H>(&self, items: &[MappedDatum<H::Key, H::Value>], handler: &H) -> Result<String>
    where
        H: KeyHandler + ValueHandler,
    {
        let mut frames = Vec::with_capacity(items.len());
        for item in items {
            let key = handler.key_dump(&item.key);
            let value = handler.value_dump(&item.value)?;
            frames.push((key, value));
        }

        let name = format!("shard-{}", Uuid::new_v4());
        self.shards
            .lock()
            .unwrap()
            .insert(name.clone(), Arc::new(frames));
        Ok(name)
    }

    /// Open a cursor over a shard, loading frames back through the handler.
    pub fn iterator<H>(
        &self,
        name: &str,
        handler: &H,
    ) -> Result<Box<dyn ShardIterator<H::Key, H::Value>>>
    where
        H: KeyHandler + ValueHandler,
    {
        let frames = self
            .shards
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such shard: {name}"))?;

        let mut items = Vec::with_capacity(frames.len());
        for (key, value) in frames.iter() {
            items.push(MappedDatum::new(
                handler.key_load(key).context("loading shard key")?,
                handler.value_load(value).context("loading shard value")?,
            ));
        }
        Ok(Box::new(VecShardIterator(items.into_iter())))
    }

    /// Delete a shard. Deleting a name that is already gone succeeds.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.shards.lock().unwrap().remove(name);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.shards.lock().unwrap().len()
    }
}

struct VecShardIterator<K, V>(std::vec::IntoIter<MappedDatum<K, V>>);

#[async_trait]
impl<K: Send + 'static, V: Send + 'static> ShardIterator<K, V> for VecShardIterator<K, V> {
    async fn next(&mut self) -> Result<Option<MappedDatum<K, V>>> {
        Ok(self.0.next())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Input
/////////////////////////////////////////////////////////////////////////////

/// Named input shards held in memory. Each name becomes one map task.
pub struct MemoryInput<T> {
    names: Vec<String>,
    shards: HashMap<String, Vec<T>>,
}

impl<T: Clone + Send + 'static> MemoryInput<T> {
    pub fn new<N: Into<String>>(shards: Vec<(N, Vec<T>)>) -> Self {
        let mut names = Vec::new();
        let mut map = HashMap::new();
        for (name, items) in shards {
            let name = name.into();
            names.push(name.clone());
            map.insert(name, items);
        }
        Self { names, shards: map }
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn reader(&self, name: &str) -> Result<Box<dyn SingleInputReader<T>>> {
        let items = self
            .shards
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such reader: {name}"))?;
        Ok(Box::new(VecReader(items.into_iter())))
    }
}

struct VecReader<T>(std::vec::IntoIter<T>);

#[async_trait]
impl<T: Send + 'static> SingleInputReader<T> for VecReader<T> {
    async fn next(&mut self) -> Result<Option<T>> {
        Ok(self.0.next())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Output
/////////////////////////////////////////////////////////////////////////////

/// Output collector with one named destination per reducer partition.
pub struct MemoryOutput<T> {
    names: Vec<String>,
    written: Arc<Mutex<HashMap<String, Vec<T>>>>,
}

impl<T: Clone + Send + 'static> MemoryOutput<T> {
    /// `count` destinations named `out-0 .. out-{count-1}`.
    pub fn new(count: usize) -> Self {
        Self {
            names: (0..count).map(|i| format!("out-{i}")).collect(),
            written: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn writer_names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn writer(&self, name: &str) -> Result<Box<dyn SingleOutputWriter<T>>> {
        if !self.names.iter().any(|n| n == name) {
            return Err(anyhow!("no such writer: {name}"));
        }
        Ok(Box::new(MemoryWriter {
            name: name.to_string(),
            buffer: Vec::new(),
            written: Arc::clone(&self.written),
        }))
    }

    /// Everything written to `name`, in write order.
    pub fn outputs(&self, name: &str) -> Vec<T> {
        self.written
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Every output across destinations, keyed by destination name.
    pub fn all_outputs(&self) -> HashMap<String, Vec<T>> {
        self.written.lock().unwrap().clone()
    }
}

struct MemoryWriter<T> {
    name: String,
    buffer: Vec<T>,
    written: Arc<Mutex<HashMap<String, Vec<T>>>>,
}

#[async_trait]
impl<T: Clone + Send + 'static> SingleOutputWriter<T> for MemoryWriter<T> {
    async fn write(&mut self, output: T) -> Result<()> {
        self.buffer.push(output);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        written
            .entry(self.name.clone())
            .or_default()
            .extend(self.buffer.drain(..));
        Ok(())
    }

    fn to_name(&self) -> String {
        self.name.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Task queue
/////////////////////////////////////////////////////////////////////////////

/// One enqueued worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCall {
    pub url: String,
    /// Form-encoded request body.
    pub body: String,
}

/// FIFO task queue. Deployments pump it with their own dispatch loop; the
/// tests drain it through the request handler.
#[derive(Default)]
pub struct MemoryTaskQueue {
    entries: Mutex<VecDeque<QueuedCall>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<QueuedCall> {
        self.entries.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl TaskTransport for MemoryTaskQueue {
    async fn post_task(&self, url: &str, json_parameters: &str) -> Result<()> {
        let body = if json_parameters.is_empty() {
            String::new()
        } else {
            format!("json={}", escape(json_parameters))
        };
        self.entries
            .lock()
            .unwrap()
            .push_back(QueuedCall {
                url: url.to_string(),
                body,
            });
        Ok(())
    }

    async fn post_status(&self, url: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push_back(QueuedCall {
                url: url.to_string(),
                body: String::new(),
            });
        Ok(())
    }
}
