//! Turns "issue, then get called back when ready" into one awaited call.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use crate::error::{NativeError, SqlBridgeError};

/// Busy flag allowing at most one outstanding request per resource.
#[derive(Debug, Default)]
pub struct PendingMarker {
    busy: AtomicBool,
}

impl PendingMarker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark the resource busy until the guard drops.
    ///
    /// # Errors
    ///
    /// `PendingOperation` if a request is already outstanding.
    pub fn begin(&self) -> Result<PendingGuard<'_>, SqlBridgeError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SqlBridgeError::PendingOperation)?;
        Ok(PendingGuard { busy: &self.busy })
    }
}

#[derive(Debug)]
pub struct PendingGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Callback a client invokes once with the outcome of the issued call.
pub type Completion<T> = Box<dyn FnOnce(Result<T, NativeError>) + Send + 'static>;

/// Native client exposing a non-blocking issue call and a readiness signal.
pub trait PollingClient: Send + 'static {
    type Output: Send + 'static;
    /// Keeps the readiness callback registered; dropping it deregisters.
    type Registration: Send;

    /// Start `sql` without waiting for the result.
    ///
    /// # Errors
    ///
    /// The native error if the call could not be started.
    fn issue(&mut self, sql: &str) -> Result<(), NativeError>;

    /// Register `completion` to run once the issued call has a result.
    fn on_ready(&mut self, completion: Completion<Self::Output>) -> Self::Registration;

    /// Id generated by the last insert on this client, if any.
    fn last_insert_id(&self) -> Option<u64>;
}

/// Issue `sql` and suspend the calling flow until the client reports completion.
///
/// Dropping the returned future drops the registration, so the callback never
/// resumes a flow that has gone away, and clears the busy flag.
///
/// # Errors
///
/// `PendingOperation` when `marker` is already held, `Native` for the client's
/// error, `ConnectionError` if the client dropped the callback unfired.
pub async fn await_completion<C: PollingClient>(
    client: &mut C,
    marker: &PendingMarker,
    sql: &str,
) -> Result<C::Output, SqlBridgeError> {
    let _pending = marker.begin()?;
    client.issue(sql)?;
    let (tx, rx) = oneshot::channel();
    let registration = client.on_ready(Box::new(move |outcome| {
        let _ = tx.send(outcome);
    }));
    let outcome = rx.await;
    drop(registration);
    match outcome {
        Ok(result) => result.map_err(SqlBridgeError::Native),
        Err(_) => Err(SqlBridgeError::ConnectionError(
            "readiness callback dropped before completion".into(),
        )),
    }
}
