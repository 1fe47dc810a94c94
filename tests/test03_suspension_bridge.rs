use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_bridge::bridge::{Completion, PendingMarker, PollingClient, await_completion};
use sql_bridge::{NativeError, SqlBridgeError};

type Slot = Arc<Mutex<Option<Completion<u64>>>>;

/// Holds the completion until the test fires it.
#[derive(Default)]
struct DeferredClient {
    slot: Slot,
    deregistered: Arc<AtomicBool>,
    drop_callbacks: bool,
}

struct Registration(Arc<AtomicBool>);

impl Drop for Registration {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl PollingClient for DeferredClient {
    type Output = u64;
    type Registration = Registration;

    fn issue(&mut self, sql: &str) -> Result<(), NativeError> {
        if sql.is_empty() {
            return Err(NativeError::new(1065, "Query was empty"));
        }
        Ok(())
    }

    fn on_ready(&mut self, completion: Completion<u64>) -> Registration {
        if !self.drop_callbacks {
            *self.slot.lock().unwrap() = Some(completion);
        }
        Registration(Arc::clone(&self.deregistered))
    }

    fn last_insert_id(&self) -> Option<u64> {
        None
    }
}

fn fire(slot: &Slot, outcome: Result<u64, NativeError>) {
    if let Some(completion) = slot.lock().unwrap().take() {
        completion(outcome);
    }
}

#[tokio::test]
async fn test03_completion_resumes_the_flow() -> Result<(), SqlBridgeError> {
    let mut client = DeferredClient::default();
    let slot = Arc::clone(&client.slot);
    let marker = PendingMarker::new();

    let firing = tokio::spawn(async move {
        while slot.lock().unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        fire(&slot, Ok(7));
    });
    let rows = await_completion(&mut client, &marker, "UPDATE t SET x = 1").await?;
    firing.await.expect("firing task");

    assert_eq!(rows, 7);
    assert!(client.deregistered.load(Ordering::SeqCst));
    assert!(!marker.is_busy());
    Ok(())
}

#[tokio::test]
async fn test03_native_errors_pass_through() {
    let mut client = DeferredClient::default();
    let marker = PendingMarker::new();

    let err = await_completion(&mut client, &marker, "").await.unwrap_err();
    assert_eq!(err.native_code(), Some(1065));
    assert!(!marker.is_busy());
}

#[tokio::test]
async fn test03_second_request_is_refused_while_pending() {
    let mut client = DeferredClient::default();
    let marker = PendingMarker::new();
    let _outstanding = marker.begin().expect("first request");

    let err = await_completion(&mut client, &marker, "SELECT 1").await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::PendingOperation));
    assert!(client.slot.lock().unwrap().is_none());
}

#[tokio::test]
async fn test03_cancelled_flow_is_deregistered() {
    let mut client = DeferredClient::default();
    let slot = Arc::clone(&client.slot);
    let deregistered = Arc::clone(&client.deregistered);
    let marker = PendingMarker::new();

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        await_completion(&mut client, &marker, "SELECT SLEEP(10)"),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(deregistered.load(Ordering::SeqCst));
    assert!(!marker.is_busy());

    // A late completion finds nobody waiting.
    fire(&slot, Ok(1));
}

#[tokio::test]
async fn test03_dropped_callback_is_a_connection_error() {
    let mut client = DeferredClient {
        drop_callbacks: true,
        ..DeferredClient::default()
    };
    let marker = PendingMarker::new();

    let err = await_completion(&mut client, &marker, "SELECT 1").await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::ConnectionError(_)));
}
