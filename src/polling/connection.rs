use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;
use tracing::warn;

use super::link::{LinkFactory, PhysicalLink};
use super::statement::{PollingStatement, SqlAttempt};
use super::Connector;
use crate::bridge::PollingClient;
use crate::error::SqlBridgeError;
use crate::flow::{FlowId, FlowLocal};
use crate::pool::Pooled;
use crate::retry::{Attempt, RetryPolicy};
use crate::transaction::{TransactionState, TxAction};

/// A borrowed physical link. The link goes back to the pool on drop, unless
/// a flow still has a transaction open on it: then the flow's state is reset
/// and the link is dropped, ending the server-side transaction.
pub struct PollingConnection<K: Connector> {
    link: Pooled<LinkFactory<K>>,
    retry: Arc<RetryPolicy>,
    transactions: Arc<FlowLocal<TransactionState>>,
    /// Flows that began a transaction through this connection.
    open: StdMutex<BTreeSet<FlowId>>,
}

impl<K: Connector> PollingConnection<K> {
    pub(crate) fn new(
        link: Pooled<LinkFactory<K>>,
        retry: Arc<RetryPolicy>,
        transactions: Arc<FlowLocal<TransactionState>>,
    ) -> Self {
        Self {
            link,
            retry,
            transactions,
            open: StdMutex::new(BTreeSet::new()),
        }
    }

    fn physical(&self) -> &Mutex<PhysicalLink<K>> {
        self.link.link()
    }

    /// Pool identity of the underlying link.
    #[must_use]
    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    /// Run `sql` with transient errors retried per the policy.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::run`].
    pub async fn execute(
        &self,
        sql: &str,
    ) -> Result<<K::Client as PollingClient>::Output, SqlBridgeError> {
        self.run_attempt(&mut SqlAttempt::new(sql)).await
    }

    #[must_use]
    pub fn prepare(&self, sql: &str) -> PollingStatement<'_, K> {
        PollingStatement::new(self, sql)
    }

    pub(crate) async fn run_attempt<A>(&self, attempt: &mut A) -> Result<A::Output, SqlBridgeError>
    where
        A: Attempt<PhysicalLink<K>>,
    {
        let result = self.retry.run(self.physical(), attempt).await;
        if let Err(SqlBridgeError::Reconnect(err)) = &result {
            warn!(link = self.link.id(), error = %err, "reconnect failed; link will be discarded");
            self.link.mark_broken();
        }
        result
    }

    /// # Errors
    ///
    /// `RolledBackIncomplete` after an unwound inner rollback, or the native
    /// error from the physical `BEGIN`.
    pub async fn begin_transaction(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::begin).await
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction`, `RolledBackIncomplete`, or the native error from `COMMIT`.
    pub async fn commit(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::commit).await
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction`, or the native error from `ROLLBACK`.
    pub async fn rollback(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::rollback).await
    }

    #[must_use]
    pub fn transaction_state(&self, flow: FlowId) -> TransactionState {
        self.transactions.get(flow)
    }

    // Transaction statements are not retried: a lost connection has already
    // discarded the server-side transaction.
    async fn transition(
        &self,
        flow: FlowId,
        step: fn(&mut TransactionState) -> Result<TxAction, SqlBridgeError>,
    ) -> Result<(), SqlBridgeError> {
        let mut state = self.transactions.get(flow);
        let action = step(&mut state)?;
        if let Some(sql) = action.sql() {
            self.physical().lock().await.execute(sql).await?;
        }
        self.transactions.set(flow, state);
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if state.depth() > 0 {
            open.insert(flow);
        } else {
            open.remove(&flow);
        }
        Ok(())
    }

    pub async fn last_insert_id(&self) -> Option<u64> {
        self.physical().lock().await.client().last_insert_id()
    }

    /// Successful reconnects performed on the underlying link so far.
    pub async fn reconnects(&self) -> u64 {
        self.physical().lock().await.reconnects()
    }

    /// Drop the link instead of returning it to the pool.
    pub fn discard(self) {
        self.link.mark_broken();
    }
}

impl<K: Connector> Drop for PollingConnection<K> {
    fn drop(&mut self) {
        let open = std::mem::take(self.open.get_mut().unwrap_or_else(PoisonError::into_inner));
        let abandoned: Vec<FlowId> = open
            .into_iter()
            .filter(|flow| self.transactions.get(*flow).depth() > 0)
            .collect();
        if abandoned.is_empty() {
            return;
        }
        for flow in &abandoned {
            self.transactions.remove(*flow);
        }
        warn!(
            link = self.link.id(),
            flows = abandoned.len(),
            "connection dropped inside a transaction; discarding its link"
        );
        self.link.mark_broken();
    }
}
