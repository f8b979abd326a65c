//! Advisory status updates from running tasks
//!
//! User code gets a [`StatusUpdater`] so long-running map and reduce calls
//! can surface progress. Updates land in the task's `info` field without
//! touching its status, and failures are logged and swallowed: status is
//! advisory, never load-bearing.

use std::sync::Arc;
use tracing::warn;

use crate::job::TaskId;
use crate::store::Datastore;

/// Handle for posting free-form progress messages from inside a task.
#[derive(Clone)]
pub struct StatusUpdater {
    store: Arc<dyn Datastore>,
    task_id: TaskId,
}

impl StatusUpdater {
    pub fn new(store: Arc<dyn Datastore>, task_id: TaskId) -> Self {
        Self { store, task_id }
    }

    /// Record `msg` as the task's latest info line. Never fails the caller.
    pub async fn update(&self, msg: impl Into<String>) {
        let msg = msg.into();
        if let Err(err) = self.store.update_task_info(self.task_id, &msg).await {
            warn!(task_id = self.task_id, %err, "failed to update task status");
        }
    }
}
