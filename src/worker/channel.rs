use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::driver::SyncDriver;
use super::host::WorkerHost;
use super::task::{Task, TaskReply};
use crate::error::SqlBridgeError;

/// Grace period for a worker whose channel broke mid-task.
pub const ERROR_TIMEOUT: Duration = Duration::from_millis(250);

/// Duplex link to one worker. Requests and replies pair by order: the caller
/// must finish one round trip before starting the next.
#[async_trait]
pub trait WorkerChannel: Send + 'static {
    /// # Errors
    ///
    /// `WorkerError` if the task cannot be sent or the reply cannot be read.
    async fn round_trip(&mut self, task: &Task) -> Result<TaskReply, SqlBridgeError>;

    /// Send the end-of-tasks marker and wait up to `timeout` for the worker to exit.
    ///
    /// # Errors
    ///
    /// `WorkerError` when the worker had to be killed.
    async fn close(&mut self, timeout: Duration) -> Result<(), SqlBridgeError>;

    /// Terminate immediately.
    fn kill(&mut self);

    /// Called when a round trip is dropped before its reply was read.
    /// Returns whether later round trips still get their own replies.
    fn abandon(&mut self) -> bool;
}

enum Command {
    Run {
        task: Task,
        respond_to: oneshot::Sender<TaskReply>,
    },
    Shutdown,
}

/// Worker running a [`WorkerHost`] on a dedicated OS thread.
pub struct ThreadChannel {
    id: u64,
    sender: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadChannel {
    /// # Errors
    ///
    /// `WorkerError` if the host cannot start or the thread cannot be spawned.
    pub async fn spawn<D: SyncDriver>(
        id: u64,
        driver: D,
        pool_limit: usize,
    ) -> Result<Self, SqlBridgeError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SqlBridgeError>>();
        let thread = thread::Builder::new()
            .name(format!("sql-bridge-worker-{id}"))
            .spawn(move || match WorkerHost::new(driver, pool_limit) {
                Ok(host) => {
                    let _ = ready_tx.send(Ok(()));
                    run_thread_worker(host, &receiver);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|err| {
                SqlBridgeError::WorkerError(format!("failed to spawn worker thread: {err}"))
            })?;
        ready_rx.await.map_err(|_| {
            SqlBridgeError::WorkerError("worker thread exited during startup".into())
        })??;
        debug!(worker = id, "thread worker started");
        Ok(Self {
            id,
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let joined = tokio::task::spawn_blocking(move || thread.join());
        matches!(tokio::time::timeout(timeout, joined).await, Ok(Ok(Ok(()))))
    }
}

fn run_thread_worker<D: SyncDriver>(mut host: WorkerHost<D>, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run { task, respond_to } => {
                let _ = respond_to.send(host.handle(&task));
            }
            Command::Shutdown => break,
        }
    }
}

#[async_trait]
impl WorkerChannel for ThreadChannel {
    async fn round_trip(&mut self, task: &Task) -> Result<TaskReply, SqlBridgeError> {
        let (tx, rx) = oneshot::channel();
        {
            let sender = self.sender.as_ref().ok_or_else(|| {
                SqlBridgeError::WorkerError("The worker has been shut down".into())
            })?;
            sender
                .send(Command::Run {
                    task: task.clone(),
                    respond_to: tx,
                })
                .map_err(|_| {
                    SqlBridgeError::WorkerError("Sending the task to the worker failed".into())
                })?;
        }
        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.sender = None;
                let exited = self.join(ERROR_TIMEOUT).await;
                warn!(worker = self.id, exited, "worker thread stopped mid-task");
                Err(SqlBridgeError::WorkerError(
                    "Reading from the worker failed".into(),
                ))
            }
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<(), SqlBridgeError> {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Shutdown);
        }
        if self.join(timeout).await {
            debug!(worker = self.id, "thread worker exited");
            Ok(())
        } else {
            warn!(worker = self.id, "thread worker did not exit in time; detaching");
            Err(SqlBridgeError::WorkerError("The worker was killed".into()))
        }
    }

    fn kill(&mut self) {
        // Threads cannot be killed; closing the channel ends the loop after the current task.
        self.sender = None;
        self.thread = None;
    }

    fn abandon(&mut self) -> bool {
        // Each task carries its own reply channel; the orphaned reply is dropped by the worker.
        true
    }
}

impl Drop for ThreadChannel {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Shutdown);
        }
    }
}
