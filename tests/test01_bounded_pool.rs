use std::sync::atomic::{AtomicUsize, Ordering};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use sql_bridge::SqlBridgeError;
use sql_bridge::pool::{BoundedPool, ResourceFactory, SharedPool, factory_fn};
use tokio::sync::Notify;
use tokio::task::yield_now;
use tokio_util::sync::CancellationToken;

/// Hands out 0, 1, 2, ... and counts creations.
struct Counting {
    created: Arc<AtomicUsize>,
}

#[async_trait]
impl ResourceFactory for Counting {
    type Resource = usize;

    async fn create(&self, _cancel: CancellationToken) -> Result<usize, SqlBridgeError> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }
}

fn counting_factory(created: &Arc<AtomicUsize>) -> Counting {
    Counting {
        created: Arc::clone(created),
    }
}

async fn wait_for_waiters<F>(pool: &BoundedPool<F>, waiting: usize)
where
    F: ResourceFactory,
{
    for _ in 0..100 {
        if pool.status().waiting == waiting {
            return;
        }
        yield_now().await;
    }
    panic!("expected {waiting} waiters, status {:?}", pool.status());
}

async fn wait_for_pending<F>(pool: &BoundedPool<F>, pending: usize)
where
    F: ResourceFactory,
{
    for _ in 0..100 {
        if pool.status().pending == pending {
            return;
        }
        yield_now().await;
    }
    panic!("expected {pending} pending creations, status {:?}", pool.status());
}

#[tokio::test]
async fn test01_limit_is_never_exceeded() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 2)?;

    let first = pool.acquire().await?;
    let second = pool.acquire().await?;
    assert_eq!(created.load(Ordering::SeqCst), 2);

    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_waiters(&pool, 1).await;
    let status = pool.status();
    assert_eq!(status.live, 2);
    assert_eq!(status.pending, 0);

    let released = first.id();
    drop(first);
    let handed = waiting.await.expect("waiter task")?;
    assert_eq!(handed, released);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    drop(second);
    Ok(())
}

#[tokio::test]
async fn test01_waiters_are_served_in_arrival_order() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 1)?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire().await?;
    let mut tasks = Vec::new();
    for label in 1..=3 {
        let task_pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let conn = task_pool.acquire().await?;
            order.lock().unwrap().push(label);
            drop(conn);
            Ok::<_, SqlBridgeError>(())
        }));
        wait_for_waiters(&pool, label).await;
    }

    drop(held);
    for task in tasks {
        task.await.expect("waiter task")?;
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test01_released_resources_are_reused() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 4)?;

    let id = {
        let conn = pool.acquire().await?;
        assert_eq!(*conn, 0);
        conn.id()
    };
    assert_eq!(pool.status().idle, 1);

    let again = pool.acquire().await?;
    assert_eq!(again.id(), id);
    assert_eq!(created.load(Ordering::SeqCst), 1);

    again.discard();
    let status = pool.status();
    assert_eq!(status.live, 0);
    assert_eq!(status.idle, 0);
    Ok(())
}

#[tokio::test]
async fn test01_factory_failure_shuts_the_pool_down() -> Result<(), SqlBridgeError> {
    let pool = BoundedPool::new(
        factory_fn(|_cancel| async {
            Err::<u8, _>(SqlBridgeError::ConnectionError("refused".into()))
        }),
        3,
    )?;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::ConnectionError(ref msg) if msg == "refused"));
    assert!(!pool.is_running());

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::PoolShutdown(_)));
    Ok(())
}

#[tokio::test]
async fn test01_abandoned_wait_leaves_no_trace() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 1)?;
    let held = pool.acquire().await?;

    let timed_out = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(timed_out.is_err());
    assert_eq!(pool.status().waiting, 0);

    drop(held);
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.live, 1);
    Ok(())
}

#[tokio::test]
async fn test01_shutdown_fails_waiters() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 1)?;
    let held = pool.acquire().await?;

    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_waiters(&pool, 1).await;

    pool.shutdown();
    let err = waiting.await.expect("waiter task").unwrap_err();
    assert!(matches!(err, SqlBridgeError::PoolShutdown(_)));

    drop(held);
    let status = pool.status();
    assert!(!status.running);
    assert_eq!(status.live, 0);
    Ok(())
}

#[tokio::test]
async fn test01_zero_limit_is_rejected() {
    let created = Arc::new(AtomicUsize::new(0));
    let err = BoundedPool::new(counting_factory(&created), 0).unwrap_err();
    assert!(matches!(err, SqlBridgeError::ConfigError(_)));
}

#[tokio::test]
async fn test01_shared_pool_lends_least_loaded() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = SharedPool::new(counting_factory(&created), 2, "shared")?;

    let a = pool.acquire().await?;
    let b = pool.acquire().await?;
    assert_ne!(a.id(), b.id());
    assert_eq!(created.load(Ordering::SeqCst), 2);

    // Both carry one borrow: the lower id wins the tie.
    let c = pool.acquire().await?;
    assert_eq!(c.id(), a.id().min(b.id()));

    let d = pool.acquire().await?;
    assert_eq!(d.id(), a.id().max(b.id()));
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(pool.live().len(), 2);

    drop((a, b, c, d));
    assert_eq!(pool.status().idle, 2);
    Ok(())
}

#[tokio::test]
async fn test01_shutdown_during_creation_fails_the_waiter() -> Result<(), SqlBridgeError> {
    let pool = BoundedPool::new(
        factory_fn(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<u8, _>(SqlBridgeError::ConnectionError("creation abandoned".into()))
        }),
        1,
    )?;

    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 1).await;
    wait_for_waiters(&pool, 1).await;

    pool.shutdown();
    let err = waiting.await.expect("waiter task").unwrap_err();
    assert!(matches!(err, SqlBridgeError::PoolShutdown(_)));

    wait_for_pending(&pool, 0).await;
    let status = pool.status();
    assert!(!status.running);
    assert_eq!(status.live, 0);
    assert_eq!(status.waiting, 0);
    Ok(())
}

#[tokio::test]
async fn test01_factory_failure_fails_every_queued_waiter() -> Result<(), SqlBridgeError> {
    let gate = Arc::new(Notify::new());
    let pool = BoundedPool::new(
        factory_fn({
            let gate = Arc::clone(&gate);
            move |_cancel| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Err::<u8, _>(SqlBridgeError::ConnectionError("refused".into()))
                }
            }
        }),
        1,
    )?;

    let mut tasks = Vec::new();
    for queued in 1..=3 {
        tasks.push(tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|conn| conn.id()) }
        }));
        wait_for_waiters(&pool, queued).await;
    }
    assert_eq!(pool.status().pending, 1);

    gate.notify_one();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("waiter task").unwrap_err());
    }
    assert!(matches!(results[0], SqlBridgeError::ConnectionError(ref msg) if msg == "refused"));
    for err in &results[1..] {
        assert!(matches!(err, SqlBridgeError::PoolShutdown(_)));
    }
    let status = pool.status();
    assert!(!status.running);
    assert_eq!(status.waiting, 0);
    assert_eq!(status.pending, 0);
    Ok(())
}

#[test]
fn test01_acquire_outside_a_runtime_fails_fast() -> Result<(), SqlBridgeError> {
    let created = Arc::new(AtomicUsize::new(0));
    let pool = BoundedPool::new(counting_factory(&created), 1)?;

    let mut acquire = pin!(pool.acquire());
    let mut cx = Context::from_waker(Waker::noop());
    match acquire.as_mut().poll(&mut cx) {
        Poll::Ready(Err(SqlBridgeError::ConfigError(_))) => {}
        Poll::Ready(other) => panic!("expected a config error, got {:?}", other.map(|c| c.id())),
        Poll::Pending => panic!("acquire must not stay pending without a runtime"),
    }
    assert_eq!(pool.status().waiting, 0);
    assert_eq!(created.load(Ordering::SeqCst), 0);
    Ok(())
}
