//! Card image and its persistence
//!
//! This module contains the terminal-side model of the card file system and
//! capabilities, updated from card responses and rolled back on session abort.

pub mod calypso_card;
pub mod file;
pub mod storage;
pub mod sv_log;
mod serde_helpers;

use serde::{Deserialize, Serialize};

pub use calypso_card::CalypsoCard;
pub use file::{DirectoryHeader, ElementaryFile, FileData, FileHeader, FileType};
pub use storage::CardImageStore;
pub use sv_log::{SvDebitLogRecord, SvLoadLogRecord};

/// Calypso product families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    PrimeRevision1,
    PrimeRevision2,
    PrimeRevision3,
    Light,
    Basic,
}

/// Access level of a secure session, each level using its own key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WriteAccessLevel {
    Personalization,
    Load,
    Debit,
}

impl WriteAccessLevel {
    /// Key index sent in the Open Secure Session command (1..=3)
    pub fn key_index(self) -> u8 {
        match self {
            WriteAccessLevel::Personalization => 1,
            WriteAccessLevel::Load => 2,
            WriteAccessLevel::Debit => 3,
        }
    }
}
