use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{ThreadChannel, WorkerChannel};
use super::driver::SyncDriver;
use super::process::ProcessChannel;
use super::task::{Task, TaskReply};
use crate::config::BridgeOptions;
use crate::error::SqlBridgeError;
use crate::pool::ResourceFactory;

struct WorkerInner {
    id: u64,
    channel: Mutex<Box<dyn WorkerChannel>>,
    running: AtomicBool,
    shutdown_timeout: Duration,
    /// Fire-and-forget tasks, sent before the next submitted task.
    deferred: StdMutex<VecDeque<Task>>,
}

impl WorkerInner {
    fn next_deferred(&self) -> Option<Task> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Marks a round trip whose reply has not been read yet. Dropped unsettled,
/// it lets the channel recover or stops the worker.
struct InFlight<'a> {
    inner: &'a WorkerInner,
    channel: &'a mut Box<dyn WorkerChannel>,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled || self.channel.abandon() {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        warn!(worker = self.inner.id, "dispatch cancelled before its reply; worker stopped");
    }
}

/// Caller-side handle to one worker. Cloning shares the worker.
///
/// Submissions are serialized: one task is in flight at a time and each
/// reply belongs to the task sent just before it.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    pub fn new(id: u64, channel: impl WorkerChannel, shutdown_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id,
                channel: Mutex::new(Box::new(channel)),
                running: AtomicBool::new(true),
                shutdown_timeout,
                deferred: StdMutex::new(VecDeque::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Send a task and wait for its reply.
    ///
    /// Dropping the returned future mid-flight is safe: a channel that cannot
    /// discard the orphaned reply stops the worker instead of handing that
    /// reply to the next caller.
    ///
    /// # Errors
    ///
    /// The worker-side error carried by the reply, or `WorkerError` if the
    /// worker is shut down or its channel fails. A channel failure stops the worker.
    pub async fn submit(&self, task: Task) -> Result<Value, SqlBridgeError> {
        if !self.is_running() {
            return Err(stopped());
        }
        let mut channel = self.inner.channel.lock().await;
        self.drain_deferred(&mut channel).await;
        if !self.is_running() {
            return Err(stopped());
        }
        match self.dispatch(&mut channel, &task).await? {
            TaskReply::Value(value) => Ok(value),
            TaskReply::Error(err) => Err(err.into()),
        }
    }

    /// Queue a task whose reply nobody waits for, such as a destroy. It is
    /// sent before any task submitted after this call.
    pub fn defer(&self, task: Task) {
        if !self.is_running() {
            return;
        }
        self.inner
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let worker = self.clone();
            runtime.spawn(async move { worker.flush().await });
        }
    }

    /// Send every deferred task now.
    pub async fn flush(&self) {
        if !self.is_running() {
            return;
        }
        let mut channel = self.inner.channel.lock().await;
        self.drain_deferred(&mut channel).await;
    }

    async fn drain_deferred(&self, channel: &mut Box<dyn WorkerChannel>) {
        while let Some(task) = self.inner.next_deferred() {
            match self.dispatch(channel, &task).await {
                Ok(TaskReply::Value(_)) => {}
                Ok(TaskReply::Error(err)) => {
                    debug!(worker = self.inner.id, operation = %task.operation, error = ?err, "deferred task failed");
                }
                Err(_) => {
                    self.inner
                        .deferred
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                    return;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        channel: &mut Box<dyn WorkerChannel>,
        task: &Task,
    ) -> Result<TaskReply, SqlBridgeError> {
        let mut flight = InFlight {
            inner: &self.inner,
            channel,
            settled: false,
        };
        let result = flight.channel.round_trip(task).await;
        flight.settled = true;
        drop(flight);
        result.inspect_err(|err| {
            self.inner.running.store(false, Ordering::Release);
            warn!(worker = self.inner.id, error = %err, "worker channel failed");
        })
    }

    /// Let the in-flight task finish, then ask the worker to exit, killing it
    /// if it has not exited within the shutdown timeout. Deferred tasks are
    /// sent first.
    ///
    /// # Errors
    ///
    /// `WorkerError` if the worker had to be killed.
    pub async fn shutdown(&self) -> Result<(), SqlBridgeError> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut channel = self.inner.channel.lock().await;
        self.drain_deferred(&mut channel).await;
        debug!(worker = self.inner.id, "shutting worker down");
        channel.close(self.inner.shutdown_timeout).await
    }

    /// Stop the worker without waiting. A task in flight is abandoned.
    pub fn kill(&self) {
        self.inner.running.store(false, Ordering::Release);
        match self.inner.channel.try_lock() {
            Ok(mut channel) => channel.kill(),
            Err(_) => debug!(worker = self.inner.id, "worker busy; it stops once the current task fails"),
        }
    }
}

fn stopped() -> SqlBridgeError {
    SqlBridgeError::WorkerError("The worker has been shut down".into())
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Starts thread workers hosting `D`.
pub struct ThreadWorkerFactory<D> {
    driver: D,
    pool_limit: usize,
    shutdown_timeout: Duration,
    next_id: AtomicU64,
}

impl<D: SyncDriver + Clone> ThreadWorkerFactory<D> {
    #[must_use]
    pub fn new(driver: D, options: &BridgeOptions) -> Self {
        Self {
            driver,
            pool_limit: options.pool_limit,
            shutdown_timeout: options.shutdown_timeout(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl<D: SyncDriver + Clone> ResourceFactory for ThreadWorkerFactory<D> {
    type Resource = WorkerHandle;

    async fn create(&self, _cancel: CancellationToken) -> Result<WorkerHandle, SqlBridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = ThreadChannel::spawn(id, self.driver.clone(), self.pool_limit).await?;
        Ok(WorkerHandle::new(id, channel, self.shutdown_timeout))
    }

    fn is_alive(&self, worker: &WorkerHandle) -> bool {
        worker.is_running()
    }
}

/// Starts worker processes, e.g. the `sql-bridge-worker` binary.
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
    shutdown_timeout: Duration,
    next_id: AtomicU64,
}

impl ProcessWorkerFactory {
    /// Run `program --pool-limit <pool_limit>` for each worker.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, options: &BridgeOptions) -> Self {
        Self {
            program: program.into(),
            args: vec!["--pool-limit".into(), options.pool_limit.to_string()],
            shutdown_timeout: options.shutdown_timeout(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl ResourceFactory for ProcessWorkerFactory {
    type Resource = WorkerHandle;

    async fn create(&self, _cancel: CancellationToken) -> Result<WorkerHandle, SqlBridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = ProcessChannel::spawn(id, &self.program, &self.args)?;
        Ok(WorkerHandle::new(id, channel, self.shutdown_timeout))
    }

    fn is_alive(&self, worker: &WorkerHandle) -> bool {
        worker.is_running()
    }
}
