//! A distributed MapReduce pipeline core.
//!
//! A job turns a set of input shards into a totally ordered, key-grouped
//! reduce over all of them, executed by stateless workers that pull HTTP
//! invocations off a task queue and coordinate through a persistent
//! job/task store. The crate provides the engine: the job and task state
//! machines, the map-side external-memory sort, the reduce-side k-way
//! merge, the stage monitors, and the retry policy. Everything environment
//! specific (input readers, output writers, intermediate blob storage, the
//! queue transport, the metadata store, and the map/reduce functions
//! themselves) is injected through the traits in [`pipeline`] and
//! [`store`].
//!
//! A minimal embedding implements [`MapReducePipeline`] for one type (the
//! component traits compose through supertraits), mounts
//! [`http::router`] under the job url prefix, and calls
//! [`controller::run`]:
//!
//! ```ignore
//! let service = MapReduceService::new("/mr/wordcount", pipeline, store, PipelineConfig::default());
//! let app = gristmill::http::router(service.clone());
//! let job_id = service.run(JobConfig::new("/mr/wordcount")).await?;
//! ```
//!
//! Workers are at-least-once: task retries can duplicate side effects, so
//! output writers and reduce functions should tolerate reruns.

pub mod controller;
pub mod error;
pub mod http;
pub mod job;
pub mod keyhandlers;
pub mod memory;
pub mod merge;
pub mod monitor;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod wire;

mod map_task;
mod reduce_task;
mod spill;

pub use controller::{job_summary, run, JobSummary};
pub use error::{PipelineError, TaskError};
pub use http::{router, MapReduceService};
pub use job::{Job, JobConfig, JobId, JobTask, PipelineConfig, Stage, TaskId, TaskStatus, TaskType};
pub use pipeline::{
    IgnoreTaskStatusChange, InputReader, IntermediateStorage, KeyHandler, MapReducePipeline,
    MappedDatum, Mapper, OutputWriter, Reducer, ShardIterator, SingleInputReader,
    SingleOutputWriter, TaskStatusChange, TaskTransport, ValueHandler,
};
pub use status::StatusUpdater;
pub use store::{Datastore, MemoryDatastore};
