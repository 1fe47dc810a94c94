use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sql_bridge::bridge::{Completion, PollingClient};
use sql_bridge::flow::FlowId;
use sql_bridge::polling::{Connector, PollingDriver};
use sql_bridge::{BridgeOptions, NativeError, SqlBridgeError, TxOp};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Server {
    log: Vec<String>,
    /// Native codes the next statements fail with, in order.
    failures: VecDeque<i64>,
    connects: usize,
    refuse_connects: bool,
}

type Shared = Arc<Mutex<Server>>;

/// Client that completes every statement as soon as it is registered.
struct EchoClient {
    server: Shared,
    outcome: Option<Result<String, NativeError>>,
}

impl PollingClient for EchoClient {
    type Output = String;
    type Registration = ();

    fn issue(&mut self, sql: &str) -> Result<(), NativeError> {
        let mut server = self.server.lock().unwrap();
        server.log.push(sql.to_string());
        self.outcome = Some(match server.failures.pop_front() {
            Some(code) => Err(NativeError::new(code, format!("failed with {code}"))),
            None => Ok(sql.to_string()),
        });
        Ok(())
    }

    fn on_ready(&mut self, completion: Completion<String>) {
        if let Some(outcome) = self.outcome.take() {
            completion(outcome);
        }
    }

    fn last_insert_id(&self) -> Option<u64> {
        Some(42)
    }
}

struct EchoConnector {
    server: Shared,
}

#[async_trait]
impl Connector for EchoConnector {
    type Client = EchoClient;

    async fn connect(&self, _cancel: &CancellationToken) -> Result<EchoClient, SqlBridgeError> {
        let mut server = self.server.lock().unwrap();
        if server.refuse_connects {
            return Err(SqlBridgeError::ConnectionError("connection refused".into()));
        }
        server.connects += 1;
        Ok(EchoClient {
            server: Arc::clone(&self.server),
            outcome: None,
        })
    }
}

fn driver(options: &BridgeOptions) -> Result<(PollingDriver<EchoConnector>, Shared), SqlBridgeError> {
    let server = Shared::default();
    let driver = PollingDriver::new(
        EchoConnector {
            server: Arc::clone(&server),
        },
        options,
    )?;
    Ok((driver, server))
}

fn take_log(server: &Shared) -> Vec<String> {
    std::mem::take(&mut server.lock().unwrap().log)
}

#[tokio::test]
async fn test04_init_statements_run_once_per_link() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder()
        .init_statement("SET NAMES utf8mb4")
        .build()?;
    let (driver, server) = driver(&options)?;

    {
        let conn = driver.connection().await?;
        assert_eq!(conn.execute("SELECT 1").await?, "SELECT 1");
        assert_eq!(conn.last_insert_id().await, Some(42));
    }
    let conn = driver.connection().await?;
    conn.execute("SELECT 2").await?;

    assert_eq!(take_log(&server), ["SET NAMES utf8mb4", "SELECT 1", "SELECT 2"]);
    assert_eq!(server.lock().unwrap().connects, 1);
    Ok(())
}

#[tokio::test]
async fn test04_nested_transactions_issue_one_physical_pair() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;
    let flow = FlowId::next();

    for _ in 0..3 {
        conn.begin_transaction(flow).await?;
    }
    assert_eq!(conn.transaction_state(flow).depth(), 3);
    for _ in 0..3 {
        conn.commit(flow).await?;
    }

    assert_eq!(take_log(&server), ["BEGIN", "COMMIT"]);
    assert_eq!(conn.transaction_state(flow).depth(), 0);
    Ok(())
}

#[tokio::test]
async fn test04_inner_rollback_poisons_the_outer_commit() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;
    let flow = FlowId::next();

    conn.begin_transaction(flow).await?;
    conn.begin_transaction(flow).await?;
    conn.rollback(flow).await?;
    assert!(conn.transaction_state(flow).is_rolled_back());

    let err = conn.commit(flow).await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::RolledBackIncomplete));
    let err = conn.begin_transaction(flow).await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::RolledBackIncomplete));

    conn.rollback(flow).await?;
    assert_eq!(take_log(&server), ["BEGIN", "ROLLBACK"]);
    assert_eq!(conn.transaction_state(flow).depth(), 0);
    assert!(!conn.transaction_state(flow).is_rolled_back());
    Ok(())
}

#[tokio::test]
async fn test04_commit_without_begin_is_asymmetric() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;
    let flow = FlowId::next();

    let err = conn.commit(flow).await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::AsymmetricTransaction(TxOp::Commit)));
    let err = conn.rollback(flow).await.unwrap_err();
    assert!(matches!(err, SqlBridgeError::AsymmetricTransaction(TxOp::Rollback)));
    assert!(take_log(&server).is_empty());
    Ok(())
}

#[tokio::test]
async fn test04_failed_begin_leaves_state_untouched() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;
    let flow = FlowId::next();

    // Transaction statements are not retried, even for transient codes.
    server.lock().unwrap().failures.push_back(2006);
    let err = conn.begin_transaction(flow).await.unwrap_err();
    assert_eq!(err.native_code(), Some(2006));
    assert_eq!(conn.transaction_state(flow).depth(), 0);
    assert_eq!(conn.reconnects().await, 0);
    Ok(())
}

#[tokio::test]
async fn test04_flows_keep_separate_transactions() -> Result<(), SqlBridgeError> {
    let (driver, _server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;
    let (a, b) = (FlowId::next(), FlowId::next());

    conn.begin_transaction(a).await?;
    assert_eq!(conn.transaction_state(a).depth(), 1);
    assert_eq!(conn.transaction_state(b).depth(), 0);
    conn.commit(a).await?;

    let shared = BridgeOptions::builder().flow_isolation(false).build()?;
    let (driver, _server) = self::driver(&shared)?;
    let conn = driver.connection().await?;
    conn.begin_transaction(a).await?;
    assert_eq!(conn.transaction_state(b).depth(), 1);
    conn.commit(b).await?;
    Ok(())
}

#[tokio::test]
async fn test04_lost_connection_is_retried_transparently() -> Result<(), SqlBridgeError> {
    let options = BridgeOptions::builder()
        .init_statement("SET SESSION sql_mode = 'ANSI'")
        .build()?;
    let (driver, server) = driver(&options)?;
    let conn = driver.connection().await?;
    take_log(&server);

    server.lock().unwrap().failures.extend([1213, 2006]);
    assert_eq!(conn.execute("SELECT 1").await?, "SELECT 1");

    assert_eq!(conn.reconnects().await, 1);
    assert_eq!(server.lock().unwrap().connects, 2);
    assert_eq!(
        take_log(&server),
        ["SELECT 1", "SELECT 1", "SET SESSION sql_mode = 'ANSI'", "SELECT 1"]
    );
    Ok(())
}

#[tokio::test]
async fn test04_failed_reconnect_discards_the_link() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    {
        let conn = driver.connection().await?;
        {
            let mut server = server.lock().unwrap();
            server.failures.push_back(2013);
            server.refuse_connects = true;
        }
        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, SqlBridgeError::Reconnect(_)));
    }
    assert_eq!(driver.status().live, 0);

    server.lock().unwrap().refuse_connects = false;
    let conn = driver.connection().await?;
    assert_eq!(conn.execute("SELECT 1").await?, "SELECT 1");
    Ok(())
}

#[tokio::test]
async fn test04_statements_prepare_once() -> Result<(), SqlBridgeError> {
    let (driver, _server) = driver(&BridgeOptions::default())?;
    let conn = driver.connection().await?;

    let mut stmt = conn.prepare("SELECT name FROM users");
    assert!(!stmt.is_prepared());
    assert_eq!(stmt.execute().await?, "SELECT name FROM users");
    let err = stmt.prepare().unwrap_err();
    assert!(matches!(err, SqlBridgeError::ExecutionError(ref msg) if msg == "This statement has already been prepared"));
    assert_eq!(stmt.execute().await?, "SELECT name FROM users");
    Ok(())
}

#[tokio::test]
async fn test04_dropping_mid_transaction_discards_the_link() -> Result<(), SqlBridgeError> {
    let (driver, server) = driver(&BridgeOptions::default())?;
    let flow = FlowId::next();
    {
        let conn = driver.connection().await?;
        conn.begin_transaction(flow).await?;
        conn.begin_transaction(flow).await?;
    }
    assert_eq!(driver.status().live, 0);

    let conn = driver.connection().await?;
    assert_eq!(conn.transaction_state(flow).depth(), 0);
    assert_eq!(conn.execute("SELECT 1").await?, "SELECT 1");
    assert_eq!(server.lock().unwrap().connects, 2);

    // A finished transaction leaves the link pooled.
    conn.begin_transaction(flow).await?;
    conn.commit(flow).await?;
    drop(conn);
    assert_eq!(driver.status().idle, 1);
    assert_eq!(take_log(&server), ["BEGIN", "SELECT 1", "BEGIN", "COMMIT"]);
    Ok(())
}
