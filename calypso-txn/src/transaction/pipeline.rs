//! Batch transmission and crypto look-ahead

use log::debug;

use crate::audit::TransactionAuditData;
use crate::command::CardCommand;
use crate::error::TransactionError;
use crate::reader::{CardReader, CardRequest, ChannelControl};

use super::TransactionContext;

/// Feed the crypto service with every command of `batch` ahead of the card
///
/// Stops at the first command whose response cannot be anticipated and
/// returns false. Commands already synchronized are skipped, so calling this
/// again on a grown batch is cheap.
pub(crate) fn synchronize_before_card_processing(
    batch: &mut [CardCommand],
    ctx: &mut TransactionContext,
) -> Result<bool, TransactionError> {
    for command in batch.iter_mut() {
        if !command.synchronize_crypto_before_card_processing(ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Send `batch` in one reader round trip and apply the responses in order
pub(crate) fn execute_batch(
    reader: &mut dyn CardReader,
    batch: &mut [CardCommand],
    ctx: &mut TransactionContext,
    control: ChannelControl,
    audit: &TransactionAuditData,
) -> Result<(), TransactionError> {
    if batch.is_empty() {
        return Ok(());
    }
    let request = CardRequest {
        apdus: batch.iter().map(CardCommand::apdu_request).collect(),
    };
    debug!("Transmitting {} APDU(s), channel {:?}", request.apdus.len(), control);
    let response = reader.transmit(&request, control)?;

    for (i, command) in batch.iter_mut().enumerate() {
        match response.apdus.get(i) {
            Some(apdu_response) => {
                audit.push(&request.apdus[i].apdu);
                audit.push(&apdu_response.to_bytes());
                command.parse_response(apdu_response, ctx)?;
            }
            // A card leaving the field right after the close is tolerated
            None if command.is_ratification() => {
                debug!("No response to the ratification command");
            }
            None => {
                return Err(TransactionError::InconsistentResponse(format!(
                    "{}: no response from the card ({} of {} APDUs answered)",
                    command.command_ref(), response.apdus.len(), batch.len()
                )));
            }
        }
    }
    Ok(())
}
