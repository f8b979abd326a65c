//! Shared test pipeline
//!
//! A complete in-memory [`MapReducePipeline`] with injectable failure
//! behavior, plus a queue pump that drains the task queue through the url
//! dispatcher the way a real task-queue service would.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use gristmill::keyhandlers::{I64ValueHandler, StringKeyHandler};
use gristmill::memory::{MemoryInput, MemoryOutput, MemoryShardStore, MemoryTaskQueue, QueuedCall};
use gristmill::{
    InputReader, IntermediateStorage, JobId, JobTask, KeyHandler, MapReduceService, MappedDatum,
    Mapper, OutputWriter, PipelineConfig, Reducer, ShardIterator, SingleInputReader,
    SingleOutputWriter, StatusUpdater, TaskError, TaskStatus, TaskStatusChange, TaskTransport,
    ValueHandler,
};

pub const BASE_URL: &str = "/mr/test";

type RouterFn = Box<dyn Fn(&String, usize) -> usize + Send + Sync>;

/// Pipeline over `(key, value)` input items with hooks for failure
/// injection and call recording.
pub struct TestPipeline {
    pub input: MemoryInput<(String, i64)>,
    pub output: MemoryOutput<String>,
    pub shards: MemoryShardStore,
    pub queue: MemoryTaskQueue,

    /// Every `reduce` call as `(key, values)`, in call order.
    pub reduce_calls: Mutex<Vec<(String, Vec<i64>)>>,
    /// Observer notifications as `(task id, status)`.
    pub transitions: Mutex<Vec<(u64, TaskStatus)>>,
    /// `/map` dispatches seen, counted via the map-parameter hook.
    pub map_executions: AtomicU32,
    pub map_params: Mutex<String>,
    pub reduce_params: Mutex<String>,

    /// Remaining `map` calls that should fail transiently.
    pub transient_map_failures: AtomicU32,
    /// Every `map` call fails fatally.
    pub map_fatal: AtomicBool,

    router: RouterFn,
}

impl TestPipeline {
    pub fn new(inputs: Vec<(&str, Vec<(&str, i64)>)>, partitions: usize) -> Arc<Self> {
        Self::with_router(
            inputs,
            partitions,
            Box::new(|key, count| StringKeyHandler.shard(key, count)),
        )
    }

    pub fn with_router(
        inputs: Vec<(&str, Vec<(&str, i64)>)>,
        partitions: usize,
        router: RouterFn,
    ) -> Arc<Self> {
        let shards = inputs
            .into_iter()
            .map(|(name, items)| {
                let items: Vec<(String, i64)> = items
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                (name.to_string(), items)
            })
            .collect();

        Arc::new(Self {
            input: MemoryInput::new(shards),
            output: MemoryOutput::new(partitions),
            shards: MemoryShardStore::new(),
            queue: MemoryTaskQueue::new(),
            reduce_calls: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            map_executions: AtomicU32::new(0),
            map_params: Mutex::new(String::new()),
            reduce_params: Mutex::new(String::new()),
            transient_map_failures: AtomicU32::new(0),
            map_fatal: AtomicBool::new(false),
            router,
        })
    }

    pub fn recorded_reduce_calls(&self) -> Vec<(String, Vec<i64>)> {
        self.reduce_calls.lock().unwrap().clone()
    }
}

impl KeyHandler for TestPipeline {
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
        (self.router)(key, shard_count)
    }
}

impl ValueHandler for TestPipeline {
    type Value = i64;

    fn value_dump(&self, value: &i64) -> Result<Vec<u8>> {
        I64ValueHandler.value_dump(value)
    }

    fn value_load(&self, raw: &[u8]) -> Result<i64> {
        I64ValueHandler.value_load(raw)
    }
}

#[async_trait]
impl InputReader for TestPipeline {
    type Item = (String, i64);

    async fn reader_names(&self) -> Result<Vec<String>> {
        Ok(self.input.reader_names())
    }

    async fn reader_from_name(
        &self,
        name: &str,
    ) -> Result<Box<dyn SingleInputReader<(String, i64)>>> {
        self.input.reader(name)
    }
}

#[async_trait]
impl OutputWriter for TestPipeline {
    type Output = String;

    async fn writer_names(&self) -> Result<Vec<String>> {
        Ok(self.output.writer_names())
    }

    async fn writer_from_name(&self, name: &str) -> Result<Box<dyn SingleOutputWriter<String>>> {
        self.output.writer(name)
    }
}

#[async_trait]
impl Mapper for TestPipeline {
    async fn map(
        &self,
        item: (String, i64),
        _status: &StatusUpdater,
    ) -> Result<Vec<MappedDatum<String, i64>>, TaskError> {
        if self.map_fatal.load(Ordering::SeqCst) {
            return Err(TaskError::fatal(anyhow::anyhow!("unmappable input")));
        }

        let remaining = self.transient_map_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_map_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TaskError::try_again(anyhow::anyhow!("flaky backend")));
        }

        let (key, value) = item;
        Ok(vec![MappedDatum::new(key, value)])
    }

    fn set_map_parameters(&self, json_parameters: &str) {
        self.map_executions.fetch_add(1, Ordering::SeqCst);
        *self.map_params.lock().unwrap() = json_parameters.to_string();
    }
}

#[async_trait]
impl Reducer for TestPipeline {
    async fn reduce(
        &self,
        key: String,
        values: Vec<i64>,
        _status: &StatusUpdater,
    ) -> Result<Option<String>, TaskError> {
        self.reduce_calls
            .lock()
            .unwrap()
            .push((key.clone(), values.clone()));
        let sum: i64 = values.iter().sum();
        Ok(Some(format!("{key}:{sum}")))
    }

    fn set_reduce_parameters(&self, json_parameters: &str) {
        *self.reduce_params.lock().unwrap() = json_parameters.to_string();
    }
}

#[async_trait]
impl IntermediateStorage for TestPipeline {
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

#[async_trait]
impl TaskTransport for TestPipeline {
    async fn post_task(&self, url: &str, json_parameters: &str) -> Result<()> {
        self.queue.post_task(url, json_parameters).await
    }

    async fn post_status(&self, url: &str) -> Result<()> {
        self.queue.post_status(url).await
    }
}

impl TaskStatusChange for TestPipeline {
    fn status(&self, _job_id: JobId, task: &JobTask) {
        self.transitions
            .lock()
            .unwrap()
            .push((task.id, task.status));
    }
}

/// Monitor settings that fall through to a re-enqueue instead of blocking
/// the single-threaded pump.
pub fn pump_config() -> PipelineConfig {
    PipelineConfig {
        monitor_poll_timeout_secs: 0,
        monitor_poll_interval_ms: 1,
        ..PipelineConfig::default()
    }
}

/// Drain the queue through the dispatcher until it is empty. Entries
/// outside the pipeline's url prefix (completion callbacks) are collected
/// and returned instead of dispatched.
pub async fn pump(
    service: &Arc<MapReduceService<TestPipeline>>,
    pipeline: &TestPipeline,
) -> Vec<QueuedCall> {
    let mut callbacks = Vec::new();
    let mut dispatched = 0u32;

    while let Some(call) = pipeline.queue.pop() {
        if !call.url.starts_with(BASE_URL) {
            callbacks.push(call);
            continue;
        }

        dispatched += 1;
        assert!(
            dispatched < 500,
            "queue did not drain after {dispatched} dispatches"
        );

        let (code, message) = service.handle_url(&call.url, &call.body).await;
        assert!(
            code.is_success(),
            "dispatch of {} returned {code}: {message}",
            call.url
        );
    }

    callbacks
}
