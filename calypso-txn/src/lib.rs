//! Calypso secure session transaction engine
//!
//! Terminal side of a Calypso card transaction. Card operations are prepared
//! on a [`CardTransactionManager`], then sent in as few reader round trips as
//! the crypto dependencies allow. The engine:
//! - accounts every modification against the card session buffer and splits
//!   an oversized secure session when the setting allows it
//! - drives a symmetric crypto service (SAM) for session MACs, SV signatures
//!   and PIN or key ciphering
//! - keeps an image of the card file system, rolled back when a session is
//!   aborted
//!
//! The [`sim`] module provides a virtual card and reader, and
//! [`crypto::SoftSam`] a software crypto service matching it.

pub mod apdu;
pub mod audit;
pub mod card;
pub mod command;
pub mod crypto;
pub mod error;
pub mod reader;
pub mod sim;
pub mod transaction;

pub use audit::TransactionAuditData;
pub use card::{CalypsoCard, ProductType, WriteAccessLevel};
pub use command::{
    CardCommand, CommandRef, GetDataTag, PinStatus, SearchCommandData, SelectFileControl,
};
pub use error::{CardError, CardErrorKind, TransactionError};
pub use reader::{CardReader, ChannelControl};
pub use transaction::{CardTransactionManager, SecuritySetting, SvAction, SvOperation};
