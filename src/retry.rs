use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_RETRIES;
use crate::error::SqlBridgeError;

/// Server has gone away / lost connection during query.
pub const CONNECTION_TRANSIENT_CODES: [i64; 2] = [2006, 2013];
/// Deadlock found / lock wait timeout exceeded.
pub const LOCK_TRANSIENT_CODES: [i64; 2] = [1213, 1205];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reconnect, then retry.
    ConnectionTransient,
    /// Retry on the same link.
    LockTransient,
    Fatal,
}

/// A physical link that can be re-established in place.
#[async_trait]
pub trait Reconnect: Send {
    /// # Errors
    ///
    /// Any error re-establishing the link; the retry loop gives up on it.
    async fn reconnect(&mut self) -> Result<(), SqlBridgeError>;
}

/// One retryable operation against a link of type `L`.
#[async_trait]
pub trait Attempt<L: Send>: Send {
    type Output: Send;

    /// Context attached to fatal errors.
    fn describe(&self) -> String;

    /// # Errors
    ///
    /// The error the policy classifies.
    async fn attempt(&mut self, link: &mut L) -> Result<Self::Output, SqlBridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    connection_codes: Vec<i64>,
    lock_codes: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            connection_codes: CONNECTION_TRANSIENT_CODES.to_vec(),
            lock_codes: LOCK_TRANSIENT_CODES.to_vec(),
        }
    }

    #[must_use]
    pub fn with_connection_codes(mut self, codes: impl Into<Vec<i64>>) -> Self {
        self.connection_codes = codes.into();
        self
    }

    #[must_use]
    pub fn with_lock_codes(mut self, codes: impl Into<Vec<i64>>) -> Self {
        self.lock_codes = codes.into();
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Only bare native errors are retryable.
    #[must_use]
    pub fn classify(&self, err: &SqlBridgeError) -> ErrorClass {
        match err {
            SqlBridgeError::Native(native) if self.connection_codes.contains(&native.code) => {
                ErrorClass::ConnectionTransient
            }
            SqlBridgeError::Native(native) if self.lock_codes.contains(&native.code) => {
                ErrorClass::LockTransient
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Run `attempt` against the shared link until it succeeds, fails fatally,
    /// or exhausts the retry bound.
    ///
    /// The link stays locked for the whole loop, reconnects included, so no
    /// other flow can reach it half re-established.
    ///
    /// # Errors
    ///
    /// - the last `Native` error, unchanged, once the bound is exceeded;
    /// - `Query` wrapping a fatal native error with the attempt's context;
    /// - `Reconnect` if re-establishing the link fails;
    /// - any other error from the attempt, unchanged.
    pub async fn run<L, A>(&self, link: &Mutex<L>, attempt: &mut A) -> Result<A::Output, SqlBridgeError>
    where
        L: Reconnect,
        A: Attempt<L>,
    {
        let mut link = link.lock().await;
        let mut retries = 0u32;
        loop {
            let err = match attempt.attempt(&mut link).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            let class = self.classify(&err);
            if class == ErrorClass::Fatal {
                return Err(match err {
                    SqlBridgeError::Native(source) => SqlBridgeError::Query {
                        context: attempt.describe(),
                        source,
                    },
                    other => other,
                });
            }
            if retries >= self.max_retries {
                warn!(
                    retries,
                    code = err.native_code(),
                    "retry bound exceeded; surfacing native error"
                );
                return Err(err);
            }
            retries += 1;
            if class == ErrorClass::ConnectionTransient {
                debug!(retries, code = err.native_code(), "connection lost; reconnecting");
                link.reconnect()
                    .await
                    .map_err(|reconnect_err| SqlBridgeError::Reconnect(Box::new(reconnect_err)))?;
            } else {
                debug!(retries, code = err.native_code(), "lock conflict; retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeError;

    #[test]
    fn classification_follows_codes() {
        let policy = RetryPolicy::default();
        let native = |code| SqlBridgeError::Native(NativeError::new(code, "x"));
        assert_eq!(policy.classify(&native(2006)), ErrorClass::ConnectionTransient);
        assert_eq!(policy.classify(&native(2013)), ErrorClass::ConnectionTransient);
        assert_eq!(policy.classify(&native(1213)), ErrorClass::LockTransient);
        assert_eq!(policy.classify(&native(1205)), ErrorClass::LockTransient);
        assert_eq!(policy.classify(&native(1064)), ErrorClass::Fatal);
        assert_eq!(
            policy.classify(&SqlBridgeError::PendingOperation),
            ErrorClass::Fatal
        );
    }
}
