use crate::error::{SqlBridgeError, TxOp};

/// Physical statement a transition requires, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    IssueBegin,
    IssueCommit,
    IssueRollback,
    /// Nested level; bookkeeping only.
    Nested,
}

impl TxAction {
    /// SQL for the physical statement, `None` for nested transitions.
    #[must_use]
    pub fn sql(self) -> Option<&'static str> {
        match self {
            TxAction::IssueBegin => Some("BEGIN"),
            TxAction::IssueCommit => Some("COMMIT"),
            TxAction::IssueRollback => Some("ROLLBACK"),
            TxAction::Nested => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    Open,
    OpenRolledBack,
}

/// Nesting depth and rolled-back flag of one flow.
///
/// Transitions mutate the state and report the physical statement to issue.
/// When that statement fails the caller restores the copy it took beforehand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    depth: u32,
    rolled_back: bool,
}

impl TransactionState {
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    #[must_use]
    pub fn phase(&self) -> TxPhase {
        match (self.depth, self.rolled_back) {
            (0, _) => TxPhase::Idle,
            (_, false) => TxPhase::Open,
            (_, true) => TxPhase::OpenRolledBack,
        }
    }

    /// # Errors
    ///
    /// `RolledBackIncomplete` while an inner rollback has not been unwound.
    pub fn begin(&mut self) -> Result<TxAction, SqlBridgeError> {
        if self.rolled_back {
            return Err(SqlBridgeError::RolledBackIncomplete);
        }
        let action = if self.depth == 0 {
            TxAction::IssueBegin
        } else {
            TxAction::Nested
        };
        self.depth += 1;
        Ok(action)
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction` at depth 0, `RolledBackIncomplete` after an inner rollback.
    pub fn commit(&mut self) -> Result<TxAction, SqlBridgeError> {
        if self.depth == 0 {
            return Err(SqlBridgeError::AsymmetricTransaction(TxOp::Commit));
        }
        if self.rolled_back {
            return Err(SqlBridgeError::RolledBackIncomplete);
        }
        let action = if self.depth == 1 {
            TxAction::IssueCommit
        } else {
            TxAction::Nested
        };
        self.depth -= 1;
        Ok(action)
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction` at depth 0.
    pub fn rollback(&mut self) -> Result<TxAction, SqlBridgeError> {
        match self.depth {
            0 => Err(SqlBridgeError::AsymmetricTransaction(TxOp::Rollback)),
            1 => {
                self.depth = 0;
                self.rolled_back = false;
                Ok(TxAction::IssueRollback)
            }
            _ => {
                self.depth -= 1;
                self.rolled_back = true;
                Ok(TxAction::Nested)
            }
        }
    }
}
