//! Reader holding a virtual card

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::apdu::{parse_apdu, Response, SW};
use crate::reader::{CardReader, CardRequest, CardResponse, ChannelControl, ReaderError};

use super::VirtualCalypsoCard;

/// [`CardReader`] over a shared [`VirtualCalypsoCard`]
///
/// Every APDU reaching the card is logged. The card can be made to leave the
/// field after a given number of APDUs.
pub struct VirtualCardReader {
    card: Arc<Mutex<VirtualCalypsoCard>>,
    contactless: bool,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    remove_after: Option<usize>,
}

impl VirtualCardReader {
    pub fn new(card: Arc<Mutex<VirtualCalypsoCard>>) -> Self {
        Self {
            card,
            contactless: false,
            sent: Arc::new(Mutex::new(Vec::new())),
            remove_after: None,
        }
    }

    pub fn contactless(mut self, contactless: bool) -> Self {
        self.contactless = contactless;
        self
    }

    /// Remove the card once `apdus` more APDUs have been processed
    pub fn remove_card_after(mut self, apdus: usize) -> Self {
        self.remove_after = Some(apdus);
        self
    }

    /// Handle on the log of APDUs sent to the card
    pub fn sent_apdus(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }
}

impl CardReader for VirtualCardReader {
    fn transmit(
        &mut self,
        request: &CardRequest,
        control: ChannelControl,
    ) -> Result<CardResponse, ReaderError> {
        let mut card = self.card.lock();
        if !card.is_present() {
            return Err(ReaderError::CardRemoved);
        }
        let mut response = CardResponse::default();
        for apdu_request in &request.apdus {
            if self.remove_after == Some(0) {
                card.remove();
                self.remove_after = None;
                debug!("Virtual card left the field before {}", apdu_request.info);
                if response.apdus.is_empty() {
                    return Err(ReaderError::CardRemoved);
                }
                response.channel_closed = true;
                return Ok(response);
            }
            if let Some(remaining) = self.remove_after.as_mut() {
                *remaining -= 1;
            }

            self.sent.lock().push(apdu_request.apdu.clone());
            let answer = match parse_apdu(&apdu_request.apdu) {
                Ok(apdu) => card.process_apdu(&apdu),
                Err(_) => Response::error(SW::WRONG_LENGTH),
            };
            let sw = answer.sw();
            response.apdus.push(answer);
            if !apdu_request.is_successful(sw) {
                debug!("{} answered {:04X}, batch stopped", apdu_request.info, sw);
                break;
            }
        }
        response.channel_closed = control == ChannelControl::CloseAfter;
        Ok(response)
    }

    fn is_contactless(&self) -> bool {
        self.contactless
    }
}
