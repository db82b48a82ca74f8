//! Transaction errors

use thiserror::Error;

use crate::command::CommandRef;
use crate::crypto::CryptoError;
use crate::reader::ReaderError;

/// Category of a card status word error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardErrorKind {
    DataAccess,
    SecurityContext,
    SecurityData,
    AccessForbidden,
    IllegalParameter,
    SessionBufferOverflow,
    Pin,
    Terminated,
    Unknown,
}

/// A command answered with an unexpected status word
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{command}: {message} (SW={sw:04X})")]
pub struct CardError {
    pub kind: CardErrorKind,
    pub command: CommandRef,
    pub sw: u16,
    pub message: String,
}

/// Errors raised by the transaction engine
///
/// Whatever the variant, the transaction has been reset when the caller
/// receives it.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("ATOMIC mode error! This command would overflow the card modifications buffer: {command}\nTransaction audit data: {audit}")]
    SessionBufferOverflow { command: CommandRef, audit: String },

    #[error("Card error: {0}")]
    Card(#[from] CardError),

    #[error("Invalid card MAC: {0}")]
    InvalidCardMac(String),

    #[error("Inconsistent card response: {0}")]
    InconsistentResponse(String),

    #[error("Crypto service error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),
}

impl TransactionError {
    /// Kind of the card error, if this is one
    pub fn card_error_kind(&self) -> Option<CardErrorKind> {
        match self {
            TransactionError::Card(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_error_display() {
        let err = TransactionError::from(CardError {
            kind: CardErrorKind::SessionBufferOverflow,
            command: CommandRef::UpdateRecord,
            sw: 0x6400,
            message: "Too many modifications in session".into(),
        });
        assert_eq!(err.card_error_kind(), Some(CardErrorKind::SessionBufferOverflow));
        assert_eq!(
            err.to_string(),
            "Card error: UPDATE_RECORD: Too many modifications in session (SW=6400)"
        );
    }

    #[test]
    fn test_overflow_message_names_command() {
        let err = TransactionError::SessionBufferOverflow {
            command: CommandRef::AppendRecord,
            audit: "[]".into(),
        };
        assert!(err
            .to_string()
            .starts_with("ATOMIC mode error! This command would overflow the card modifications buffer: APPEND_RECORD"));
        assert_eq!(err.card_error_kind(), None);
    }
}
