//! Stored Value operation sequencing
//!
//! An SV modifying command must follow an SV Get of the same operation, and a
//! secure session accepts a single SV modifying command.

use serde::{Deserialize, Serialize};

use crate::error::TransactionError;

/// SV operation announced by SV Get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvOperation {
    Reload,
    Debit,
}

/// Whether the debit operation is done or undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvAction {
    Do,
    Undo,
}

/// Tracks the SV Get / SV modifying command pairing
#[derive(Debug, Clone, Default)]
pub(crate) struct SvSequencer {
    is_sv_get: bool,
    operation: Option<SvOperation>,
    action: Option<SvAction>,
    operation_in_secure_session: bool,
}

impl SvSequencer {
    pub fn sv_get_prepared(&mut self, operation: SvOperation, action: SvAction) {
        self.is_sv_get = true;
        self.operation = Some(operation);
        self.action = Some(action);
    }

    pub fn action(&self) -> SvAction {
        self.action.unwrap_or(SvAction::Do)
    }

    /// Check that an SV modifying command may be prepared now
    ///
    /// The pending SV Get is consumed even when the check fails.
    pub fn check_modifying_command(
        &mut self,
        operation: SvOperation,
        secure_session_open: bool,
    ) -> Result<(), TransactionError> {
        if !self.is_sv_get {
            return Err(TransactionError::IllegalState(
                "SV modifying command must follow an SV Get command".into(),
            ));
        }
        self.is_sv_get = false;
        if self.operation != Some(operation) {
            return Err(TransactionError::IllegalState("Inconsistent SV operation".into()));
        }
        if secure_session_open && self.operation_in_secure_session {
            return Err(TransactionError::IllegalState(
                "Only one SV modifying command is allowed per Secure Session".into(),
            ));
        }
        Ok(())
    }

    /// Record that the session now holds its SV modifying command
    pub fn mark_operation_in_session(&mut self) {
        self.operation_in_secure_session = true;
    }

    /// A new (sub-)session accepts a new SV modifying command
    pub fn reset_session(&mut self) {
        self.operation_in_secure_session = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
