//! Card reader abstraction
//!
//! The transaction engine sends batches of APDUs through a [`CardReader`].
//! Opening the physical channel and selecting the application happen before
//! the engine is involved.

use thiserror::Error;

use crate::apdu::{Response, SW};

/// What to do with the physical channel once a batch has been exchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelControl {
    KeepOpen,
    CloseAfter,
}

/// Errors raised by the reader layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Card communication failure: {0}")]
    Communication(String),

    #[error("Reader communication failure: {0}")]
    Reader(String),

    #[error("Card removed")]
    CardRemoved,
}

/// One APDU and the status words that let the batch go on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduRequest {
    pub apdu: Vec<u8>,
    pub successful_status_words: Vec<u16>,
    /// Short description of the command, for logs
    pub info: String,
}

impl ApduRequest {
    pub fn new(apdu: Vec<u8>, info: &str) -> Self {
        Self {
            apdu,
            successful_status_words: vec![SW::SUCCESS],
            info: info.to_string(),
        }
    }

    pub fn add_successful_status_word(&mut self, sw: u16) {
        if !self.successful_status_words.contains(&sw) {
            self.successful_status_words.push(sw);
        }
    }

    pub fn is_successful(&self, sw: u16) -> bool {
        self.successful_status_words.contains(&sw)
    }
}

/// A batch of APDUs sent in one reader round trip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardRequest {
    pub apdus: Vec<ApduRequest>,
}

/// Responses to a [`CardRequest`]
///
/// The reader stops after the first response whose status word is not listed
/// as successful for its request, so `apdus` may be shorter than the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardResponse {
    pub apdus: Vec<Response>,
    pub channel_closed: bool,
}

/// A reader holding a selected Calypso card
pub trait CardReader {
    /// Exchange a batch of APDUs with the card
    fn transmit(
        &mut self,
        request: &CardRequest,
        control: ChannelControl,
    ) -> Result<CardResponse, ReaderError>;

    /// True when the card is accessed through a contactless interface
    fn is_contactless(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_status_words() {
        let mut req = ApduRequest::new(vec![0x00, 0x20, 0x00, 0x00, 0x00], "Verify PIN");
        assert!(req.is_successful(0x9000));
        assert!(!req.is_successful(0x63C2));

        req.add_successful_status_word(0x63C2);
        req.add_successful_status_word(0x63C2);
        assert!(req.is_successful(0x63C2));
        assert_eq!(req.successful_status_words.len(), 2);
    }
}
