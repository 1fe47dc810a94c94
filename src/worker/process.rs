use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::channel::{ERROR_TIMEOUT, WorkerChannel};
use super::driver::SyncDriver;
use super::host::WorkerHost;
use super::task::{RemoteError, Task, TaskReply};
use crate::error::SqlBridgeError;

/// Line sent to a worker to end its task loop.
pub const END_OF_TASKS: &str = "null";

/// Worker running in a child process, speaking one JSON document per line
/// over stdin/stdout.
pub struct ProcessChannel {
    id: u64,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessChannel {
    /// # Errors
    ///
    /// `WorkerError` if the process cannot be started.
    pub fn spawn(id: u64, program: &Path, args: &[String]) -> Result<Self, SqlBridgeError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SqlBridgeError::WorkerError(format!(
                    "failed to start worker {}: {err}",
                    program.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SqlBridgeError::WorkerError("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SqlBridgeError::WorkerError("worker stdout unavailable".into()))?;
        info!(worker = id, pid = child.id(), program = %program.display(), "process worker started");
        Ok(Self {
            id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// True if the process exited on its own within `timeout`.
    async fn wait_or_kill(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = self.id, %status, "process worker exited");
                true
            }
            Ok(Err(err)) => {
                warn!(worker = self.id, error = %err, "failed waiting for process worker");
                let _ = self.child.kill().await;
                false
            }
            Err(_) => {
                warn!(worker = self.id, ?timeout, "process worker did not exit in time; killing");
                let _ = self.child.kill().await;
                false
            }
        }
    }

    async fn fail(&mut self, message: &str) -> SqlBridgeError {
        self.stdin = None;
        self.wait_or_kill(ERROR_TIMEOUT).await;
        SqlBridgeError::WorkerError(message.to_string())
    }
}

#[async_trait]
impl WorkerChannel for ProcessChannel {
    async fn round_trip(&mut self, task: &Task) -> Result<TaskReply, SqlBridgeError> {
        let encoded = serde_json::to_string(task)?;
        if self.write_line(&encoded).await.is_err() {
            return Err(self.fail("Sending the task to the worker failed").await);
        }
        match self.stdout.next_line().await {
            Ok(Some(line)) => Ok(serde_json::from_str(&line)?),
            Ok(None) => Err(self.fail("The worker exited unexpectedly").await),
            Err(_) => Err(self.fail("Reading from the worker failed").await),
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<(), SqlBridgeError> {
        let _ = self.write_line(END_OF_TASKS).await;
        self.stdin = None;
        if self.wait_or_kill(timeout).await {
            Ok(())
        } else {
            Err(SqlBridgeError::WorkerError("The worker was killed".into()))
        }
    }

    fn kill(&mut self) {
        self.stdin = None;
        if let Err(err) = self.child.start_kill() {
            debug!(worker = self.id, error = %err, "kill signal not delivered");
        }
    }

    fn abandon(&mut self) -> bool {
        // Replies pair with requests by line order; an unread reply would answer the next task.
        self.kill();
        false
    }
}

/// Worker-side task loop: one task per input line, one reply per output line,
/// until [`END_OF_TASKS`] or end of input.
///
/// # Errors
///
/// `WorkerError` on I/O failure, or the host's startup error.
pub fn serve<D, R, W>(driver: D, pool_limit: usize, input: R, mut output: W) -> Result<(), SqlBridgeError>
where
    D: SyncDriver,
    R: BufRead,
    W: Write,
{
    let mut host = WorkerHost::new(driver, pool_limit)?;
    let io_err = |err: io::Error| SqlBridgeError::WorkerError(format!("worker i/o failed: {err}"));
    for line in input.lines() {
        let line = line.map_err(io_err)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == END_OF_TASKS {
            debug!("end of tasks");
            break;
        }
        let reply = match serde_json::from_str::<Task>(trimmed) {
            Ok(task) => host.handle(&task),
            Err(err) => TaskReply::Error(RemoteError::InvalidTask {
                message: format!("malformed task: {err}"),
            }),
        };
        let encoded = serde_json::to_string(&reply)?;
        writeln!(output, "{encoded}").map_err(io_err)?;
        output.flush().map_err(io_err)?;
    }
    Ok(())
}

/// [`serve`] over this process's stdin and stdout.
///
/// # Errors
///
/// As [`serve`].
pub fn serve_stdio<D: SyncDriver>(driver: D, pool_limit: usize) -> Result<(), SqlBridgeError> {
    serve(driver, pool_limit, io::stdin().lock(), io::stdout().lock())
}
