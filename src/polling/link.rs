use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Connector;
use crate::bridge::{PendingMarker, PollingClient, await_completion};
use crate::error::SqlBridgeError;
use crate::pool::ResourceFactory;
use crate::retry::Reconnect;

/// One open native client plus what it takes to re-open it.
pub struct PhysicalLink<K: Connector> {
    client: K::Client,
    connector: Arc<K>,
    init_statements: Arc<[String]>,
    pending: PendingMarker,
    reconnects: u64,
}

impl<K: Connector> PhysicalLink<K> {
    /// Connect and run the initialization statements.
    ///
    /// # Errors
    ///
    /// The connector's error, or the first failing init statement's.
    pub async fn open(
        connector: Arc<K>,
        init_statements: Arc<[String]>,
        cancel: &CancellationToken,
    ) -> Result<Self, SqlBridgeError> {
        let client = connector.connect(cancel).await?;
        let mut link = Self {
            client,
            connector,
            init_statements,
            pending: PendingMarker::new(),
            reconnects: 0,
        };
        link.run_init().await?;
        Ok(link)
    }

    async fn run_init(&mut self) -> Result<(), SqlBridgeError> {
        let statements = Arc::clone(&self.init_statements);
        for sql in statements.iter() {
            self.execute(sql).await?;
        }
        Ok(())
    }

    /// Issue one statement through the suspension bridge. No retries.
    ///
    /// # Errors
    ///
    /// `PendingOperation` if a call is already outstanding on this link, or the native error.
    pub async fn execute(
        &mut self,
        sql: &str,
    ) -> Result<<K::Client as PollingClient>::Output, SqlBridgeError> {
        await_completion(&mut self.client, &self.pending, sql).await
    }

    #[must_use]
    pub fn client(&self) -> &K::Client {
        &self.client
    }

    /// Number of successful reconnects on this link.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }
}

#[async_trait]
impl<K: Connector> Reconnect for PhysicalLink<K> {
    async fn reconnect(&mut self) -> Result<(), SqlBridgeError> {
        self.client = self.connector.connect(&CancellationToken::new()).await?;
        self.run_init().await?;
        self.reconnects += 1;
        debug!(reconnects = self.reconnects, "link re-established");
        Ok(())
    }
}

/// A physical link shared by every flow bound to its pool slot.
pub struct SharedLink<K: Connector> {
    id: u64,
    link: Mutex<PhysicalLink<K>>,
    broken: AtomicBool,
}

impl<K: Connector> SharedLink<K> {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn link(&self) -> &Mutex<PhysicalLink<K>> {
        &self.link
    }

    /// Flag the link so the pool drops it on release.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

/// Opens physical links for the link pool.
pub struct LinkFactory<K: Connector> {
    connector: Arc<K>,
    init_statements: Arc<[String]>,
    next_id: AtomicU64,
}

impl<K: Connector> LinkFactory<K> {
    #[must_use]
    pub fn new(connector: K, init_statements: Vec<String>) -> Self {
        Self {
            connector: Arc::new(connector),
            init_statements: init_statements.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl<K: Connector> ResourceFactory for LinkFactory<K> {
    type Resource = Arc<SharedLink<K>>;

    async fn create(&self, cancel: CancellationToken) -> Result<Self::Resource, SqlBridgeError> {
        let link = PhysicalLink::open(
            Arc::clone(&self.connector),
            Arc::clone(&self.init_statements),
            &cancel,
        )
        .await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(link = id, "opened physical link");
        Ok(Arc::new(SharedLink {
            id,
            link: Mutex::new(link),
            broken: AtomicBool::new(false),
        }))
    }

    fn is_alive(&self, resource: &Self::Resource) -> bool {
        !resource.is_broken()
    }
}
