//! Job and task persistence
//!
//! The [`Datastore`] trait is the only shared state between workers, so its
//! contract carries the pipeline's concurrency model: status transitions
//! are compare-and-set (a lost race is an error the caller inspects, not a
//! silent overwrite), task ids come from contiguous windows so a stage's
//! tasks can be recovered by range scan, and task-batch creation commits
//! atomically with the owning job's stage transition.
//!
//! [`MemoryDatastore`] is the in-process reference implementation used by
//! single-node deployments and the test suite.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::job::{Job, JobId, JobTask, Stage, TaskId, TaskStatus};

type Result<T> = std::result::Result<T, PipelineError>;

/// Persistence contract for the `Job` and `JobTask` entity kinds.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Persist a new job, assigning its id.
    async fn create_job(&self, job: Job) -> Result<JobId>;

    async fn job(&self, id: JobId) -> Result<Job>;

    /// CAS `from` → `to` on the job's stage. Fails with
    /// [`PipelineError::StageMismatch`] if another writer got there first.
    async fn transition_stage(&self, id: JobId, from: Stage, to: Stage) -> Result<Job>;

    /// Move the job to `Failed` recording `reason`. Returns the updated job
    /// if this call performed the transition, `None` when the job was
    /// already terminal (so exactly one caller owns the failure callback).
    async fn mark_job_failed(&self, id: JobId, reason: &str) -> Result<Option<Job>>;

    /// Reserve `count` contiguous task ids and return the first. The window
    /// is exclusive to the caller; ids are never reused.
    async fn allocate_task_ids(&self, count: usize) -> Result<TaskId>;

    /// Atomically verify the job is at `expected`, persist `tasks`, set the
    /// job's id window to `first .. first + tasks.len()`, and advance the
    /// stage to `next`. All-or-nothing.
    async fn create_tasks(
        &self,
        job_id: JobId,
        expected: Stage,
        next: Stage,
        first: TaskId,
        tasks: Vec<JobTask>,
    ) -> Result<Job>;

    async fn task(&self, id: TaskId) -> Result<JobTask>;

    /// Every task in the job's current id window, in id order.
    async fn tasks_for_job(&self, job: &Job) -> Result<Vec<JobTask>>;

    /// CAS `Pending` → `Running`. Duplicate queue deliveries lose this race
    /// and back off.
    async fn start_task(&self, id: TaskId) -> Result<JobTask>;

    /// CAS `Running` → `Done`, recording the result payload.
    async fn complete_task(&self, id: TaskId, result: String) -> Result<JobTask>;

    /// Terminal failure for the task, recording the error as its info.
    async fn fail_task(&self, id: TaskId, error: &str) -> Result<JobTask>;

    /// CAS `Running` → `Pending` with the retry counter incremented, making
    /// the task eligible for re-posting. A task already back at `Pending`
    /// means a duplicate completion callback; the CAS failure lets the
    /// caller drop it.
    async fn retry_task(&self, id: TaskId) -> Result<JobTask>;

    /// Overwrite the task's info message without touching its status.
    async fn update_task_info(&self, id: TaskId, msg: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<JobId, Job>,
    tasks: BTreeMap<TaskId, JobTask>,
    next_job_id: JobId,
    next_task_id: TaskId,
}

/// In-memory [`Datastore`] guarded by a single lock. Transition atomicity
/// falls out of holding the write guard across each operation.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: RwLock<MemoryInner>,
}

impl MemoryDatastore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MemoryInner {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(PipelineError::JobNotFound(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut JobTask> {
        self.tasks.get_mut(&id).ok_or(PipelineError::TaskNotFound(id))
    }

    fn cas_task(&mut self, id: TaskId, expected: TaskStatus, to: TaskStatus) -> Result<&mut JobTask> {
        let task = self.task_mut(id)?;
        if task.status != expected {
            return Err(PipelineError::StatusMismatch {
                task_id: id,
                expected,
                found: task.status,
            });
        }
        task.status = to;
        task.updated_at = Utc::now();
        Ok(task)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_job(&self, mut job: Job) -> Result<JobId> {
        let mut inner = self.inner.write().await;
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        job.id = id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn job(&self, id: JobId) -> Result<Job> {
        let inner = self.inner.read().await;
        inner.jobs.get(&id).cloned().ok_or(PipelineError::JobNotFound(id))
    }

    async fn transition_stage(&self, id: JobId, from: Stage, to: Stage) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id)?;
        if job.stage != from {
            return Err(PipelineError::StageMismatch {
                job_id: id,
                expected: from,
                found: job.stage,
            });
        }
        job.stage = to;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn mark_job_failed(&self, id: JobId, reason: &str) -> Result<Option<Job>> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id)?;
        if job.stage.is_terminal() {
            return Ok(None);
        }
        job.stage = Stage::Failed;
        job.failure = Some(reason.to_string());
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn allocate_task_ids(&self, count: usize) -> Result<TaskId> {
        let mut inner = self.inner.write().await;
        let first = inner.next_task_id + 1;
        inner.next_task_id += count as TaskId;
        Ok(first)
    }

    async fn create_tasks(
        &self,
        job_id: JobId,
        expected: Stage,
        next: Stage,
        first: TaskId,
        tasks: Vec<JobTask>,
    ) -> Result<Job> {
        let mut inner = self.inner.write().await;

        let job = inner.jobs.get(&job_id).ok_or(PipelineError::JobNotFound(job_id))?;
        if job.stage != expected {
            return Err(PipelineError::StageMismatch {
                job_id,
                expected,
                found: job.stage,
            });
        }
        let count = tasks.len();
        if tasks
            .iter()
            .any(|t| t.id < first || t.id >= first + count as TaskId)
        {
            return Err(PipelineError::TaskIdOutsideWindow { first, count });
        }

        for task in tasks {
            inner.tasks.insert(task.id, task);
        }
        let job = inner.job_mut(job_id)?;
        job.stage = next;
        job.first_task_id = first;
        job.task_count = count;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn task(&self, id: TaskId) -> Result<JobTask> {
        let inner = self.inner.read().await;
        inner.tasks.get(&id).cloned().ok_or(PipelineError::TaskNotFound(id))
    }

    async fn tasks_for_job(&self, job: &Job) -> Result<Vec<JobTask>> {
        let inner = self.inner.read().await;
        let end = job.first_task_id + job.task_count as TaskId;
        Ok(inner
            .tasks
            .range(job.first_task_id..end)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn start_task(&self, id: TaskId) -> Result<JobTask> {
        let mut inner = self.inner.write().await;
        let task = inner.cas_task(id, TaskStatus::Pending, TaskStatus::Running)?;
        Ok(task.clone())
    }

    async fn complete_task(&self, id: TaskId, result: String) -> Result<JobTask> {
        let mut inner = self.inner.write().await;
        let task = inner.cas_task(id, TaskStatus::Running, TaskStatus::Done)?;
        task.result = Some(result);
        Ok(task.clone())
    }

    async fn fail_task(&self, id: TaskId, error: &str) -> Result<JobTask> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.info = error.to_string();
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn retry_task(&self, id: TaskId) -> Result<JobTask> {
        let mut inner = self.inner.write().await;
        let task = inner.cas_task(id, TaskStatus::Running, TaskStatus::Pending)?;
        task.retries += 1;
        Ok(task.clone())
    }

    async fn update_task_info(&self, id: TaskId, msg: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        task.info = msg.to_string();
        task.updated_at = Utc::now();
        Ok(())
    }
}
