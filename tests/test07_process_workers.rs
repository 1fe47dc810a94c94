#![cfg(feature = "worker-bin")]

use std::time::Duration;

use serde_json::json;
use sql_bridge::dsn::ConnectParams;
use sql_bridge::flow::FlowId;
use sql_bridge::worker::{ConnectionMethod, ProcessWorkerFactory, Task, WorkerConnection, WorkerPool};
use sql_bridge::{BridgeOptions, SqlBridgeError};

const WORKER: &str = env!("CARGO_BIN_EXE_sql-bridge-worker");

fn pool(options: &BridgeOptions) -> Result<WorkerPool<ProcessWorkerFactory>, SqlBridgeError> {
    WorkerPool::new(
        ProcessWorkerFactory::new(WORKER, options).arg("--log").arg("error"),
        options.worker_limit,
    )
}

#[tokio::test]
async fn test07_process_worker_serves_a_flow() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder()
        .worker_limit(1)
        .init_statement("PRAGMA foreign_keys = ON")
        .build()?;
    let workers = pool(&options)?;
    let conn = WorkerConnection::new(
        ConnectParams::with_dsn("sqlite::memory:"),
        workers.clone(),
        &options,
    )?;
    let flow = FlowId::next();

    conn.exec(flow, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").await?;
    conn.exec(flow, "INSERT INTO t (v) VALUES ('x')").await?;
    let stmt = conn.execute(flow, "PRAGMA foreign_keys").await?;
    assert_eq!(stmt.fetch_column(0).await?, Some(json!(1)));
    let rows = conn.execute(flow, "SELECT v FROM t").await?.fetch_all().await?;
    assert_eq!(rows, vec![json!({"v": "x"})]);

    workers.shutdown().await;
    assert!(!workers.is_running());
    Ok(())
}

#[tokio::test]
async fn test07_unknown_ids_come_back_as_errors() -> Result<(), SqlBridgeError> {
    let workers = pool(&BridgeOptions::default())?;
    let worker = workers.lease().await?;

    let err = worker
        .submit(Task::connection(
            ConnectionMethod::Exec,
            vec![json!("SELECT 1")],
            "99:pdo",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlBridgeError::ResourceNotFound(ref msg) if msg == "PDO resource not found '99:pdo'"));
    // A worker-side error leaves the worker usable.
    assert!(worker.is_running());

    let reply = worker.submit(Task::connect(vec![json!("sqlite::memory:")])).await?;
    assert_eq!(reply, json!(["1:pdo", "sqlite"]));
    workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test07_killed_worker_is_replaced() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder()
        .worker_limit(1)
        .shutdown_timeout(Duration::from_millis(200))
        .build()?;
    let workers = pool(&options)?;
    let first = workers.lease().await?;
    let first_id = first.id();

    first.kill();
    assert!(!first.is_running());
    let err = first.submit(Task::connect(vec![json!("sqlite::memory:")])).await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::WorkerError(_)));
    drop(first);

    let second = workers.lease().await?;
    assert_ne!(second.id(), first_id);
    assert!(second.is_running());
    workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test07_cancelled_dispatch_stops_the_worker() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder()
        .worker_limit(1)
        .shutdown_timeout(Duration::from_millis(200))
        .build()?;
    let workers = pool(&options)?;
    let worker = workers.lease().await?;
    let first_id = worker.id();
    let reply = worker.submit(Task::connect(vec![json!("sqlite::memory:")])).await?;
    let id = reply[0].as_str().expect("connection id").to_string();

    let slow = Task::connection(
        ConnectionMethod::Exec,
        vec![json!("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 3000000) SELECT count(*) FROM c")],
        &id,
    );
    let timed_out = tokio::time::timeout(Duration::from_millis(5), worker.submit(slow)).await;
    assert!(timed_out.is_err());

    // The exec reply is never read as the answer to a later task.
    assert!(!worker.is_running());
    let err = worker
        .submit(Task::connection(ConnectionMethod::DriverName, Vec::new(), &id))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlBridgeError::WorkerError(_)));
    drop(worker);

    let fresh = workers.lease().await?;
    assert_ne!(fresh.id(), first_id);
    let reply = fresh.submit(Task::connect(vec![json!("sqlite::memory:")])).await?;
    assert_eq!(reply, json!(["1:pdo", "sqlite"]));
    let name = fresh
        .submit(Task::connection(ConnectionMethod::DriverName, Vec::new(), "1:pdo"))
        .await?;
    assert_eq!(name, json!("sqlite"));
    workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test07_scopes_release_worker_connections() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder().worker_limit(1).pool_limit(2).build()?;
    let workers = pool(&options)?;
    let conn = WorkerConnection::new(
        ConnectParams::with_dsn("sqlite::memory:"),
        workers.clone(),
        &options,
    )?;

    for _ in 0..3 {
        let scope = conn.scope();
        assert_eq!(conn.exec(scope.id(), "CREATE TABLE IF NOT EXISTS t (x)").await?, 0);
    }
    assert_eq!(conn.open_flows(), 0);
    workers.shutdown().await;
    Ok(())
}
