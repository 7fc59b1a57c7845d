//! Concurrent task execution on top of the controller.
//!
//! Each task runs on its own tokio task behind a semaphore bounding how many
//! pipelines are active at once. A task waiting for a permit can be cancelled
//! before it ever starts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::controller::{PipelineController, TaskRequest};
use crate::errors::PipelineError;
use crate::models::Task;

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<Task, PipelineError>>,
}

pub struct PipelineRunner {
    controller: Arc<PipelineController>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<i64, RunningTask>>>,
}

impl PipelineRunner {
    pub fn new(controller: Arc<PipelineController>, max_concurrent: usize) -> Self {
        Self {
            controller,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    /// Submit a request and start driving it. Returns the new task id.
    pub async fn start(&self, request: TaskRequest) -> Result<i64, PipelineError> {
        let task = self.controller.submit(request).await?;
        self.spawn(task.id).await;
        Ok(task.id)
    }

    /// Start driving an existing task. A no-op if it is already running.
    pub async fn spawn(&self, task_id: i64) {
        let mut running = self.running.lock().await;
        if running
            .get(&task_id)
            .is_some_and(|r| !r.handle.is_finished())
        {
            tracing::debug!(task_id, "Task already running");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let controller = Arc::clone(&self.controller);
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit
                    .map_err(|_| PipelineError::Execution("runner is shut down".to_string()))?,
                _ = token.cancelled() => {
                    return controller.cancel_task(task_id).await;
                }
            };
            controller.run_with_cancel(task_id, &token).await
        });
        running.insert(task_id, RunningTask { cancel, handle });
    }

    /// Request cancellation. The pipeline stops at its next safe point,
    /// releases its sandbox and records `Failed` with reason "cancelled".
    pub async fn cancel(&self, task_id: i64) -> bool {
        match self.running.lock().await.get(&task_id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for a spawned task to finish and return its final state.
    pub async fn wait(&self, task_id: i64) -> Result<Task, PipelineError> {
        let entry = self.running.lock().await.remove(&task_id);
        match entry {
            Some(task) => task
                .handle
                .await
                .map_err(|e| PipelineError::Execution(format!("task {} panicked: {}", task_id, e)))?,
            None => self.controller.load_task(task_id).await,
        }
    }

    /// Spawn every task left unfinished by a previous process.
    pub async fn resume_unfinished(&self) -> Result<Vec<i64>, PipelineError> {
        let tasks = self
            .controller
            .store(|db| db.list_unfinished_tasks())
            .await?;
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        for id in &ids {
            self.spawn(*id).await;
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Resuming unfinished tasks");
        }
        Ok(ids)
    }

    pub async fn active_count(&self) -> usize {
        self.running
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Cancel everything still running and wait for it to settle.
    pub async fn shutdown(&self) {
        let tasks: Vec<(i64, RunningTask)> = self.running.lock().await.drain().collect();
        for (_, task) in &tasks {
            task.cancel.cancel();
        }
        for (task_id, task) in tasks {
            match task.handle.await {
                Ok(Ok(t)) => tracing::debug!(task_id, status = %t.status, "Task stopped"),
                Ok(Err(e)) => tracing::warn!(task_id, error = %e, "Task stopped with error"),
                Err(e) => tracing::warn!(task_id, error = %e, "Task panicked"),
            }
        }
    }
}
