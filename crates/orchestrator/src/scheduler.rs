//! Action scheduler.
//!
//! Actions are validated synchronously by [`Scheduler::enqueue`] and then
//! queued; a dispatcher task pulls them off the queue and runs each one on
//! its own tokio task. A task id is held in the running set from the moment
//! validation starts until its action finishes, so at most one action per
//! task is ever in flight. [`Scheduler::stop`] returns only once every
//! started action has finished.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::AppConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ActionKind, Task, TaskId};
use crate::result_ext::ResultExt;
use crate::store::TaskStore;

/// Runs one action against a loaded task.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: ActionKind, task: &mut Task) -> OrchestratorResult<()>;
}

/// Outcome of an action, delivered to `enqueue_and_wait` callers.
#[derive(Debug)]
pub struct Completed {
    /// The task as stored after the action ran.
    pub task: Task,
    pub result: OrchestratorResult<()>,
}

impl Completed {
    pub fn into_result(self) -> OrchestratorResult<Task> {
        self.result.map(|()| self.task)
    }
}

type RunningSet = Arc<Mutex<HashSet<TaskId>>>;

fn lock(running: &RunningSet) -> MutexGuard<'_, HashSet<TaskId>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Membership of one task id in the running set, released on drop.
struct RunningGuard {
    running: RunningSet,
    task_id: TaskId,
}

impl RunningGuard {
    fn acquire(running: &RunningSet, task_id: TaskId) -> OrchestratorResult<Self> {
        if !lock(running).insert(task_id) {
            return Err(OrchestratorError::TaskRunning(task_id));
        }
        Ok(Self {
            running: running.clone(),
            task_id,
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.task_id);
    }
}

struct Action {
    kind: ActionKind,
    task: Task,
    guard: RunningGuard,
    done: Option<oneshot::Sender<Completed>>,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn ActionHandler>,
    running: RunningSet,
    queue: mpsc::Sender<Action>,
    receiver: Mutex<Option<mpsc::Receiver<Action>>>,
    shutdown: watch::Sender<bool>,
    enqueue_timeout: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        handler: Arc<dyn ActionHandler>,
        capacity: usize,
        enqueue_timeout: Duration,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            handler,
            running: Arc::new(Mutex::new(HashSet::new())),
            queue,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            enqueue_timeout,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn from_config(
        store: Arc<dyn TaskStore>,
        handler: Arc<dyn ActionHandler>,
        config: &AppConfig,
    ) -> Self {
        Self::new(store, handler, config.queue_capacity, config.enqueue_timeout())
    }

    /// Start the dispatcher. Fails if it was already started or stopped.
    pub fn start(&self) -> OrchestratorResult<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| OrchestratorError::Internal("scheduler already started".to_string()))?;

        let mut shutdown = self.shutdown.subscribe();
        let store = self.store.clone();
        let handler = self.handler.clone();

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_join(finished);
                    }
                    action = receiver.recv() => match action {
                        Some(action) => {
                            in_flight.spawn(run_action(store.clone(), handler.clone(), action));
                        }
                        None => break,
                    },
                }
            }
            receiver.close();
            drop(receiver);

            if !in_flight.is_empty() {
                tracing::info!(actions = in_flight.len(), "Waiting for running actions");
            }
            while let Some(finished) = in_flight.join_next().await {
                log_join(finished);
            }
            tracing::info!("Scheduler dispatcher stopped");
        });

        *self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        tracing::info!("Scheduler started");
        Ok(())
    }

    /// Stop dispatching and wait for running actions to finish. Queued
    /// actions are dropped.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        drop(
            self.receiver
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Scheduler dispatcher ended abnormally");
            }
        }
    }

    /// Validate and queue an action without waiting for it.
    pub async fn enqueue(&self, task_id: TaskId, action: ActionKind) -> OrchestratorResult<()> {
        self.submit(task_id, action, None).await
    }

    /// Validate and queue an action, then wait until it has run.
    pub async fn enqueue_and_wait(
        &self,
        task_id: TaskId,
        action: ActionKind,
    ) -> OrchestratorResult<Completed> {
        let (done, completed) = oneshot::channel();
        self.submit(task_id, action, Some(done)).await?;
        completed
            .await
            .map_err(|_| OrchestratorError::SchedulerStopped)
    }

    /// Whether `task_id` is being validated, queued or run.
    pub fn has_task(&self, task_id: TaskId) -> bool {
        lock(&self.running).contains(&task_id)
    }

    async fn submit(
        &self,
        task_id: TaskId,
        action: ActionKind,
        done: Option<oneshot::Sender<Completed>>,
    ) -> OrchestratorResult<()> {
        let guard = RunningGuard::acquire(&self.running, task_id)?;

        let task = self
            .store
            .task(task_id)
            .await
            .log_task(task_id, "load task")?
            .ok_or(OrchestratorError::TaskNotExist(task_id))?;
        task.valid_action(action)?;

        let queued = Action {
            kind: action,
            task,
            guard,
            done,
        };
        match self.queue.send_timeout(queued, self.enqueue_timeout).await {
            Ok(()) => {
                tracing::debug!(task_id, action = %action, "Action queued");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::error!(task_id, action = %action, "Action queue is full");
                Err(OrchestratorError::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(OrchestratorError::SchedulerStopped),
        }
    }
}

fn log_join(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        tracing::error!(error = %e, "Action task ended abnormally");
    }
}

async fn run_action(store: Arc<dyn TaskStore>, handler: Arc<dyn ActionHandler>, action: Action) {
    let Action {
        kind,
        mut task,
        guard,
        done,
    } = action;
    let task_id = task.id;

    tracing::info!(task_id, action = %kind, "Action started");
    let result = handler.handle(kind, &mut task).await;
    match &result {
        Ok(()) => tracing::info!(task_id, action = %kind, "Action finished"),
        Err(e) => tracing::error!(task_id, action = %kind, error = %e, "Action failed"),
    }
    drop(guard);

    let Some(done) = done else {
        return;
    };

    let task = match store.task(task_id).await {
        Ok(Some(stored)) => stored,
        Ok(None) => task,
        Err(e) => {
            tracing::warn!(task_id, error = %e, "Failed to reload task after action");
            task
        }
    };
    // The waiter may have gone away.
    let _ = done.send(Completed { task, result });
}
