//! Challenge, PIN, key and DF state commands

use crate::apdu::{ins, Response, APDU, SW};
use crate::error::TransactionError;
use crate::transaction::TransactionContext;

use super::status::check_status_accepting;
use super::{CardCommand, CommandContext, CommandKind, CommandRef, KeyReference};

/// Number of PIN presentation attempts of a fresh counter
pub const PIN_MAX_ATTEMPTS: u8 = 3;

const CHALLENGE_LENGTH: u8 = 0x08;
const CIPHERED_PIN_LENGTH: usize = 8;
const CIPHERED_NEW_PIN_LENGTH: usize = 16;
const CIPHERED_KEY_LENGTH: usize = 32;
const CHANGE_PIN_P2: u8 = 0xFF;

/// PIN state decoded from a Verify PIN answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    Verified,
    AttemptsRemaining(u8),
    Blocked,
}

impl PinStatus {
    pub fn from_status_word(sw: u16) -> Option<Self> {
        match sw {
            SW::SUCCESS => Some(PinStatus::Verified),
            SW::AUTH_METHOD_BLOCKED => Some(PinStatus::Blocked),
            _ => SW::get_retry_count(sw).map(PinStatus::AttemptsRemaining),
        }
    }

    /// Attempts left on the card counter
    pub fn attempts_remaining(self) -> u8 {
        match self {
            PinStatus::Verified => PIN_MAX_ATTEMPTS,
            PinStatus::AttemptsRemaining(n) => n,
            PinStatus::Blocked => 0,
        }
    }
}

impl CardCommand {
    pub(crate) fn get_challenge(cla: u8, context: CommandContext) -> Self {
        Self::new(
            CommandKind::GetChallenge,
            context,
            APDU::new(cla, ins::GET_CHALLENGE, 0x00, 0x00).le(CHALLENGE_LENGTH),
        )
    }

    /// Verify PIN; without a PIN only the attempt counter is read
    pub(crate) fn verify_pin(
        cla: u8,
        context: CommandContext,
        pin: Option<Vec<u8>>,
        ciphering_key: Option<KeyReference>,
    ) -> Self {
        let apdu = match (&pin, ciphering_key) {
            (None, _) => APDU::new(cla, ins::VERIFY_PIN, 0x00, 0x00),
            (Some(pin), None) => APDU::with_data(cla, ins::VERIFY_PIN, 0x00, 0x00, pin.clone()),
            (Some(_), Some(_)) => APDU::with_data(
                cla,
                ins::VERIFY_PIN,
                0x00,
                0x00,
                vec![0u8; CIPHERED_PIN_LENGTH],
            ),
        };
        let read_only = pin.is_none();
        let mut command = Self::new(CommandKind::VerifyPin { pin, ciphering_key }, context, apdu);
        if read_only {
            command.successful_status_words.extend([
                SW::counter_warning(1),
                SW::counter_warning(2),
                SW::AUTH_METHOD_BLOCKED,
            ]);
        }
        command
    }

    pub(crate) fn change_pin(
        cla: u8,
        context: CommandContext,
        new_pin: Vec<u8>,
        ciphering_key: Option<KeyReference>,
    ) -> Self {
        let data = match ciphering_key {
            Some(_) => vec![0u8; CIPHERED_NEW_PIN_LENGTH],
            None => new_pin.clone(),
        };
        Self::new(
            CommandKind::ChangePin { new_pin, ciphering_key },
            context,
            APDU::with_data(cla, ins::CHANGE_PIN, 0x00, CHANGE_PIN_P2, data),
        )
    }

    pub(crate) fn change_key(
        cla: u8,
        context: CommandContext,
        key_index: u8,
        issuer_key: KeyReference,
        target_key: KeyReference,
    ) -> Self {
        Self::new(
            CommandKind::ChangeKey {
                key_index,
                issuer_key,
                target_key,
            },
            context,
            APDU::with_data(cla, ins::CHANGE_KEY, 0x00, key_index, vec![0u8; CIPHERED_KEY_LENGTH]),
        )
    }

    pub(crate) fn invalidate(cla: u8, context: CommandContext) -> Self {
        Self::new(CommandKind::Invalidate, context, APDU::new(cla, ins::INVALIDATE, 0x00, 0x00))
    }

    pub(crate) fn rehabilitate(cla: u8, context: CommandContext) -> Self {
        Self::new(CommandKind::Rehabilitate, context, APDU::new(cla, ins::REHABILITATE, 0x00, 0x00))
    }

    fn card_challenge(&self, ctx: &TransactionContext) -> Result<Vec<u8>, TransactionError> {
        let challenge = ctx.card.card_challenge();
        if challenge.is_empty() {
            return Err(TransactionError::IllegalState(format!(
                "{}: card challenge not available",
                self.command_ref()
            )));
        }
        Ok(challenge.to_vec())
    }

    pub(super) fn finalize_security(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let cla = self.apdu.cla;
        let apdu = match self.kind.clone() {
            CommandKind::VerifyPin {
                pin: Some(pin),
                ciphering_key: Some((kif, kvc)),
            } => {
                let challenge = self.card_challenge(ctx)?;
                let data = ctx.crypto.cipher_pin_for_presentation(&challenge, &pin, kif, kvc)?;
                APDU::with_data(cla, ins::VERIFY_PIN, 0x00, 0x00, data)
            }
            CommandKind::ChangePin {
                new_pin,
                ciphering_key: Some((kif, kvc)),
            } => {
                let challenge = self.card_challenge(ctx)?;
                let data = ctx.crypto.cipher_pin_for_modification(
                    &challenge,
                    None,
                    &new_pin,
                    kif,
                    kvc,
                )?;
                APDU::with_data(cla, ins::CHANGE_PIN, 0x00, CHANGE_PIN_P2, data)
            }
            CommandKind::ChangeKey {
                key_index,
                issuer_key,
                target_key,
            } => {
                let challenge = self.card_challenge(ctx)?;
                let data = ctx.crypto.generate_ciphered_card_key(
                    &challenge,
                    issuer_key.0,
                    issuer_key.1,
                    target_key.0,
                    target_key.1,
                )?;
                APDU::with_data(cla, ins::CHANGE_KEY, 0x00, key_index, data)
            }
            _ => return Ok(()),
        };
        self.set_apdu(apdu);
        Ok(())
    }

    pub(super) fn parse_verify_pin(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if let Some(status) = PinStatus::from_status_word(response.sw()) {
            ctx.card.set_pin_attempt_remaining(status.attempts_remaining());
        }
        let read_only = matches!(self.kind, CommandKind::VerifyPin { pin: None, .. });
        let accepted: &[u16] = if read_only {
            &[
                SW::PIN_ONE_ATTEMPT_REMAINING,
                SW::PIN_TWO_ATTEMPTS_REMAINING,
                SW::AUTH_METHOD_BLOCKED,
            ]
        } else {
            &[]
        };
        check_status_accepting(CommandRef::VerifyPin, response, accepted)?;
        self.check_anticipated_response(response)
    }

    pub(super) fn parse_security(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        match self.kind {
            CommandKind::GetChallenge => {
                if response.data.len() != CHALLENGE_LENGTH as usize {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: challenge of {} bytes",
                        CommandRef::GetChallenge, response.data.len()
                    )));
                }
                ctx.card.set_card_challenge(response.data.clone());
            }
            CommandKind::Invalidate => ctx.card.set_df_invalidated(true),
            CommandKind::Rehabilitate => ctx.card.set_df_invalidated(false),
            CommandKind::ChangePin { .. } => ctx.card.set_pin_attempt_remaining(PIN_MAX_ATTEMPTS),
            _ => {}
        }
        Ok(())
    }
}
