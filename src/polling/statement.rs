use async_trait::async_trait;

use super::link::PhysicalLink;
use super::{Connector, PollingConnection};
use crate::bridge::PollingClient;
use crate::error::SqlBridgeError;
use crate::retry::Attempt;

/// Executes one SQL text on a link; the unit both ad hoc and prepared
/// execution hand to the retry policy.
#[derive(Debug, Clone)]
pub struct SqlAttempt {
    sql: String,
}

impl SqlAttempt {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl<K: Connector> Attempt<PhysicalLink<K>> for SqlAttempt {
    type Output = <K::Client as PollingClient>::Output;

    fn describe(&self) -> String {
        self.sql.clone()
    }

    async fn attempt(&mut self, link: &mut PhysicalLink<K>) -> Result<Self::Output, SqlBridgeError> {
        link.execute(&self.sql).await
    }
}

/// Statement bound to a borrowed connection.
///
/// Parameters are expected to be already bound into the text; execution
/// shares the connection's retry path.
pub struct PollingStatement<'c, K: Connector> {
    connection: &'c PollingConnection<K>,
    attempt: SqlAttempt,
    prepared: bool,
}

impl<'c, K: Connector> PollingStatement<'c, K> {
    pub(crate) fn new(connection: &'c PollingConnection<K>, sql: &str) -> Self {
        Self {
            connection,
            attempt: SqlAttempt::new(sql),
            prepared: false,
        }
    }

    /// # Errors
    ///
    /// `ExecutionError` if already prepared.
    pub fn prepare(&mut self) -> Result<(), SqlBridgeError> {
        if self.prepared {
            return Err(SqlBridgeError::ExecutionError(
                "This statement has already been prepared".into(),
            ));
        }
        self.prepared = true;
        Ok(())
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        self.attempt.sql()
    }

    /// Execute, preparing first if needed.
    ///
    /// # Errors
    ///
    /// As [`PollingConnection::execute`].
    pub async fn execute(&mut self) -> Result<<K::Client as PollingClient>::Output, SqlBridgeError> {
        if !self.prepared {
            self.prepare()?;
        }
        self.connection.run_attempt(&mut self.attempt).await
    }
}
