//! Worker-side map from opaque ids to live native objects.
//!
//! Connection ids look like `"7:pdo"`. Statement ids look like `"3:7:stmt"`:
//! the statement number is allocated per owning connection, so two
//! connections can both own a statement `3` without their ids colliding.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SqlBridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId {
    statement: u64,
    connection: ConnectionId,
}

impl StatementId {
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Number local to the owning connection.
    #[must_use]
    pub fn local(&self) -> u64 {
        self.statement
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:pdo", self.0)
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:stmt", self.statement, self.connection.0)
    }
}

fn parse_number(part: &str, id: &str) -> Result<u64, SqlBridgeError> {
    part.parse()
        .map_err(|_| SqlBridgeError::InvalidTask(format!("Invalid resource id '{id}'")))
}

impl FromStr for ConnectionId {
    type Err = SqlBridgeError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        match id.split_once(':') {
            Some((number, "pdo")) => Ok(ConnectionId(parse_number(number, id)?)),
            _ => Err(SqlBridgeError::InvalidTask(format!(
                "Invalid connection id '{id}'"
            ))),
        }
    }
}

impl FromStr for StatementId {
    type Err = SqlBridgeError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = id.split(':').collect();
        let [statement, connection, "stmt"] = parts.as_slice() else {
            return Err(SqlBridgeError::InvalidTask(format!(
                "Invalid statement id '{id}'"
            )));
        };
        Ok(StatementId {
            statement: parse_number(statement, id)?,
            connection: ConnectionId(parse_number(connection, id)?),
        })
    }
}

struct ConnectionEntry<C> {
    connection: C,
    driver_name: String,
    next_statement: u64,
}

pub struct Registry<C, S> {
    next_connection: u64,
    connections: HashMap<ConnectionId, ConnectionEntry<C>>,
    statements: HashMap<StatementId, S>,
}

impl<C, S> Default for Registry<C, S> {
    fn default() -> Self {
        Self {
            next_connection: 1,
            connections: HashMap::new(),
            statements: HashMap::new(),
        }
    }
}

impl<C, S> Registry<C, S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_connection(&mut self, connection: C, driver_name: String) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(
            id,
            ConnectionEntry {
                connection,
                driver_name,
                next_statement: 1,
            },
        );
        id
    }

    /// # Errors
    ///
    /// `ResourceNotFound` if the owning connection is gone.
    pub fn insert_statement(
        &mut self,
        connection: ConnectionId,
        statement: S,
    ) -> Result<StatementId, SqlBridgeError> {
        let entry = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| connection_not_found(connection))?;
        let id = StatementId {
            statement: entry.next_statement,
            connection,
        };
        entry.next_statement += 1;
        self.statements.insert(id, statement);
        Ok(id)
    }

    /// # Errors
    ///
    /// `ResourceNotFound` for an unknown id.
    pub fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut C, SqlBridgeError> {
        self.connections
            .get_mut(&id)
            .map(|entry| &mut entry.connection)
            .ok_or_else(|| connection_not_found(id))
    }

    /// # Errors
    ///
    /// `ResourceNotFound` for an unknown id.
    pub fn driver_name(&self, id: ConnectionId) -> Result<&str, SqlBridgeError> {
        self.connections
            .get(&id)
            .map(|entry| entry.driver_name.as_str())
            .ok_or_else(|| connection_not_found(id))
    }

    /// The statement together with its owning connection.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if either half is gone.
    pub fn statement_mut(&mut self, id: StatementId) -> Result<(&mut S, &mut C), SqlBridgeError> {
        let statement = self
            .statements
            .get_mut(&id)
            .ok_or_else(|| SqlBridgeError::ResourceNotFound(format!("Statement resource not found '{id}'")))?;
        let connection = self
            .connections
            .get_mut(&id.connection)
            .map(|entry| &mut entry.connection)
            .ok_or_else(|| connection_not_found(id.connection))?;
        Ok((statement, connection))
    }

    /// Remove a connection along with every statement it owns.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<C> {
        self.statements.retain(|statement, _| statement.connection != id);
        self.connections.remove(&id).map(|entry| entry.connection)
    }

    pub fn remove_statement(&mut self, id: StatementId) -> Option<S> {
        self.statements.remove(&id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

fn connection_not_found(id: ConnectionId) -> SqlBridgeError {
    SqlBridgeError::ResourceNotFound(format!("PDO resource not found '{id}'"))
}
