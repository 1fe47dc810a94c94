//! Connection parameters and DSN construction for worker-hosted drivers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SqlBridgeError;

/// Parameters for opening a connection in a worker.
///
/// Credentials are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub dsn: Option<String>,
    /// Dialect prefix such as `mysql`, `pgsql`, `sqlite` or `sqlsrv`.
    pub driver: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub charset: Option<String>,
    pub unix_socket: Option<String>,
    pub version: Option<String>,
    /// Driver options forwarded to the native connect call.
    pub options: BTreeMap<String, Value>,
}

impl ConnectParams {
    /// Build from a loosely keyed map, accepting the usual aliases
    /// (`host`/`hostname`, `user`/`username`, `pass`/`password`,
    /// `dbname`/`database`, `driver = "pdo_<name>"` in any spelling such as
    /// `PDO-MySQL` or `pdomysql`, `pdodriver`).
    /// Unrecognised keys become driver options.
    ///
    /// # Errors
    ///
    /// `ConfigError` for a non-numeric port or a non-object `options` value.
    pub fn from_map(raw: BTreeMap<String, Value>) -> Result<Self, SqlBridgeError> {
        let mut params = ConnectParams::default();
        for (key, value) in raw {
            let text = || value_text(&value);
            match key.to_ascii_lowercase().as_str() {
                "dsn" => params.dsn = text(),
                "driver" => params.driver = text().map(|d| normalize_driver(&d)),
                "pdodriver" => params.driver = text(),
                "user" | "username" => params.username = text(),
                "pass" | "password" => params.password = text(),
                "host" | "hostname" => params.host = text(),
                "port" => params.port = Some(parse_port(&value)?),
                "dbname" | "database" => params.database = text(),
                "charset" => params.charset = text(),
                "unix_socket" => params.unix_socket = text(),
                "version" => params.version = text(),
                "options" | "driver_options" => match value {
                    Value::Object(map) => params.options.extend(map),
                    Value::Null => {}
                    _ => {
                        return Err(SqlBridgeError::ConfigError(
                            "connection options must be an object".into(),
                        ));
                    }
                },
                _ => {
                    params.options.insert(key, value);
                }
            }
        }
        Ok(params)
    }

    #[must_use]
    pub fn with_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// The explicit DSN, or one assembled from the individual fields.
    ///
    /// # Errors
    ///
    /// `ConfigError` when both a host and a unix socket are given, or when
    /// neither a DSN nor a driver is available.
    pub fn dsn(&self) -> Result<String, SqlBridgeError> {
        if self.host.is_some() && self.unix_socket.is_some() {
            return Err(SqlBridgeError::ConfigError(
                "Ambiguous connection parameters: hostname and unix_socket are mutually exclusive"
                    .into(),
            ));
        }
        if let Some(dsn) = &self.dsn {
            return Ok(dsn.clone());
        }
        let Some(driver) = self.driver.as_deref() else {
            return Err(SqlBridgeError::ConfigError(
                "A dsn was not provided or could not be constructed from your parameters".into(),
            ));
        };

        match driver {
            "sqlite" => Ok(format!(
                "sqlite:{}",
                self.database.as_deref().unwrap_or(":memory:")
            )),
            "sqlsrv" => {
                let mut parts = Vec::new();
                if let Some(database) = &self.database {
                    parts.push(format!("database={database}"));
                }
                if let Some(host) = &self.host {
                    parts.push(format!("server={host}"));
                }
                Ok(format!("sqlsrv:{}", parts.join(";")))
            }
            other => {
                let mut parts = Vec::new();
                if let Some(database) = &self.database {
                    parts.push(format!("dbname={database}"));
                }
                if let Some(host) = &self.host {
                    parts.push(format!("host={host}"));
                }
                if let Some(port) = self.port {
                    parts.push(format!("port={port}"));
                }
                if other != "pgsql"
                    && let Some(charset) = &self.charset
                {
                    parts.push(format!("charset={charset}"));
                }
                if let Some(socket) = &self.unix_socket {
                    parts.push(format!("unix_socket={socket}"));
                }
                if let Some(version) = &self.version {
                    parts.push(format!("version={version}"));
                }
                Ok(format!("{other}:{}", parts.join(";")))
            }
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `PDO-MySQL`, `pdo_mysql` and `pdomysql` all name `mysql`.
fn normalize_driver(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    if !lowered.starts_with("pdo") {
        return lowered;
    }
    let squeezed: String = lowered
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect();
    squeezed["pdo".len()..].to_string()
}

fn parse_port(value: &Value) -> Result<u16, SqlBridgeError> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    port.ok_or_else(|| SqlBridgeError::ConfigError(format!("invalid port: {value}")))
}
