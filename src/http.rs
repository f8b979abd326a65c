//! Request dispatch for the pipeline url surface
//!
//! Every url under a job's prefix funnels through one suffix-matching
//! handler, mirroring how the queue delivers work: task execution (`/map`,
//! `/reduce`), free-form status updates (`/mapstatus`, `/reducestatus`),
//! monitor ticks (`/map-monitor`, `/reduce-monitor`), and completion
//! callbacks (`/mapcomplete`, `/reducecomplete`). Parameters arrive
//! form-encoded in the query or body, with `;` accepted as a separator.
//!
//! A non-2xx response tells the task queue to redeliver; panics inside a
//! task are caught here and routed through the retry path as transient
//! failures.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

use crate::controller::{self, handle_task_completion};
use crate::error::PipelineError;
use crate::job::{Job, JobConfig, JobId, PipelineConfig, TaskId, TaskType};
use crate::map_task::run_map_task;
use crate::monitor::{map_monitor, reduce_monitor};
use crate::pipeline::MapReducePipeline;
use crate::reduce_task::run_reduce_task;
use crate::store::Datastore;
use crate::wire::{escape, Params};

/// One mounted pipeline: the pipeline implementation, its datastore, and
/// the base url its jobs route under.
pub struct MapReduceService<P> {
    pipeline: Arc<P>,
    store: Arc<dyn Datastore>,
    config: PipelineConfig,
    base_url: String,
}

impl<P: MapReducePipeline> MapReduceService<P> {
    pub fn new(
        base_url: impl Into<String>,
        pipeline: Arc<P>,
        store: Arc<dyn Datastore>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            store,
            config,
            base_url: base_url.into(),
        })
    }

    pub fn pipeline(&self) -> &Arc<P> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    /// Start a job through this service. The config's url prefix should
    /// match the service's base url.
    pub async fn run(&self, config: JobConfig) -> Result<JobId, PipelineError> {
        controller::run(self.pipeline.as_ref(), &self.store, config).await
    }

    pub async fn job(&self, id: JobId) -> Result<Job, PipelineError> {
        self.store.job(id).await
    }

    /// Dispatch a queue entry given its full url and form-encoded body.
    pub async fn handle_url(&self, url: &str, body: &str) -> (StatusCode, String) {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, query),
            None => (url, ""),
        };
        self.dispatch(path, query, body).await
    }

    /// Route one request by url suffix.
    pub async fn dispatch(&self, path: &str, query: &str, body: &str) -> (StatusCode, String) {
        let mut params = Params::parse(query);
        params.merge(Params::parse(body));

        debug!(path, "dispatching pipeline request");

        if path.ends_with("/map-monitor") || path.ends_with("/reduce-monitor") {
            let job_id = match require_id(&params, "jobKey") {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let result = if path.ends_with("/map-monitor") {
                map_monitor(self.pipeline.as_ref(), &self.store, &self.config, job_id).await
            } else {
                reduce_monitor(self.pipeline.as_ref(), &self.store, &self.config, job_id).await
            };
            return match result {
                Ok(()) => (StatusCode::OK, String::new()),
                Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            };
        }

        let task_id = match require_id(&params, "taskKey") {
            Ok(id) => id,
            Err(resp) => return resp,
        };

        if path.ends_with("/map") {
            self.execute_task(TaskType::Map, task_id, &params).await
        } else if path.ends_with("/reduce") {
            self.execute_task(TaskType::Reduce, task_id, &params).await
        } else if path.ends_with("/mapstatus") || path.ends_with("/reducestatus") {
            let msg = params.get("msg").unwrap_or("");
            match self.store.update_task_info(task_id, msg).await {
                Ok(()) => (StatusCode::OK, String::new()),
                Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            }
        } else if path.ends_with("/mapcomplete") || path.ends_with("/reducecomplete") {
            let status = params.get("status").unwrap_or("");
            let error_msg = params.get("error");
            match handle_task_completion(
                self.pipeline.as_ref(),
                &self.store,
                task_id,
                status,
                error_msg,
            )
            .await
            {
                Ok(()) => (StatusCode::OK, String::new()),
                Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            }
        } else {
            (StatusCode::NOT_FOUND, "unknown request url".to_string())
        }
    }

    /// Run a task engine with panic isolation. A panicking task is logged
    /// and sent down the retry path like any other transient failure.
    async fn execute_task(
        &self,
        task_type: TaskType,
        task_id: TaskId,
        params: &Params,
    ) -> (StatusCode, String) {
        let run = async {
            match task_type {
                TaskType::Map => {
                    run_map_task(
                        self.pipeline.as_ref(),
                        &self.store,
                        &self.config,
                        &self.base_url,
                        task_id,
                        params,
                    )
                    .await
                }
                TaskType::Reduce => {
                    run_reduce_task(
                        self.pipeline.as_ref(),
                        &self.store,
                        &self.base_url,
                        task_id,
                        params,
                    )
                    .await
                }
            }
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => (StatusCode::OK, String::new()),
            Ok(Err(err)) => {
                error!(task_id, %err, "task dispatch failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            Err(panic) => {
                let msg = panic_message(panic);
                error!(task_id, %msg, "panic inside {task_type} task");

                let endpoint = match task_type {
                    TaskType::Map => "mapcomplete",
                    TaskType::Reduce => "reducecomplete",
                };
                let url = format!(
                    "{}/{endpoint}?taskKey={task_id};status=again;error={}",
                    self.base_url,
                    escape(&msg)
                );
                if let Err(err) = self.pipeline.post_status(&url).await {
                    error!(task_id, %err, "failed to schedule retry after panic");
                    return (StatusCode::INTERNAL_SERVER_ERROR, msg);
                }
                (StatusCode::OK, String::new())
            }
        }
    }
}

fn require_id(params: &Params, name: &'static str) -> Result<u64, (StatusCode, String)> {
    let raw = params
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("{name} parameter required"),
            )
        })?;
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid {name}: {raw}")))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task panicked".to_string()
    }
}

/// An [`axum`] router serving the whole url surface for one service. Mount
/// it at the service's base url.
pub fn router<P: MapReducePipeline>(service: Arc<MapReduceService<P>>) -> Router {
    Router::new().fallback(handle::<P>).with_state(service)
}

async fn handle<P: MapReducePipeline>(
    State(service): State<Arc<MapReduceService<P>>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();

    let bytes = match axum::body::to_bytes(body, 4 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("reading body: {err}")).into_response()
        }
    };
    let body = String::from_utf8_lossy(&bytes);

    let (code, message) = service.dispatch(&path, &query, &body).await;
    (code, message).into_response()
}
