use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlBridgeError;

pub const DEFAULT_POOL_LIMIT: usize = 32;
pub const DEFAULT_WORKER_LIMIT: usize = 32;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1_000;

/// Options shared by the polling driver, the worker pool and the worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeOptions {
    /// Maximum live resources per pool (links, or native connections inside a worker).
    pub pool_limit: usize,
    /// Maximum live workers in a worker pool.
    pub worker_limit: usize,
    /// Retry bound for transient transport and lock errors.
    pub max_retries: u32,
    /// Run once per freshly created physical connection.
    pub init_statements: Vec<String>,
    /// When false every flow shares one transaction state.
    pub flow_isolation: bool,
    /// Grace period for a worker to exit after the end-of-tasks marker.
    pub shutdown_timeout_ms: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            pool_limit: DEFAULT_POOL_LIMIT,
            worker_limit: DEFAULT_WORKER_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            init_statements: Vec::new(),
            flow_isolation: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl BridgeOptions {
    #[must_use]
    pub fn builder() -> BridgeOptionsBuilder {
        BridgeOptionsBuilder::new()
    }

    /// Parse options from JSON, filling omitted fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConfigError` if the JSON is malformed or the options are invalid.
    pub fn from_json(raw: &str) -> Result<Self, SqlBridgeError> {
        let opts: Self = serde_json::from_str(raw)
            .map_err(|err| SqlBridgeError::ConfigError(format!("invalid options: {err}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConfigError` when a limit is zero.
    pub fn validate(&self) -> Result<(), SqlBridgeError> {
        if self.pool_limit == 0 {
            return Err(SqlBridgeError::ConfigError(
                "pool_limit must be greater than zero".into(),
            ));
        }
        if self.worker_limit == 0 {
            return Err(SqlBridgeError::ConfigError(
                "worker_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Fluent builder for `BridgeOptions`.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptionsBuilder {
    opts: BridgeOptions,
}

impl BridgeOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pool_limit(mut self, limit: usize) -> Self {
        self.opts.pool_limit = limit;
        self
    }

    #[must_use]
    pub fn worker_limit(mut self, limit: usize) -> Self {
        self.opts.worker_limit = limit;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.opts.max_retries = retries;
        self
    }

    #[must_use]
    pub fn init_statement(mut self, sql: impl Into<String>) -> Self {
        self.opts.init_statements.push(sql.into());
        self
    }

    #[must_use]
    pub fn flow_isolation(mut self, isolated: bool) -> Self {
        self.opts.flow_isolation = isolated;
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.opts.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn finish(self) -> BridgeOptions {
        self.opts
    }

    /// Finish and validate.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConfigError` when a limit is zero.
    pub fn build(self) -> Result<BridgeOptions, SqlBridgeError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}
