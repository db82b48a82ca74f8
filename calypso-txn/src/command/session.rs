//! Secure session commands: Open, Close, Manage, Ratification

use log::{debug, warn};

use crate::apdu::{ins, Response, APDU, SW};
use crate::card::WriteAccessLevel;
use crate::error::TransactionError;
use crate::transaction::TransactionContext;

use super::status::check_status;
use super::{CardCommand, CommandContext, CommandKind, CommandRef};

const CLOSE_RATIFICATION_ASKED: u8 = 0x80;
/// P1 keeps five bits for the record read on opening
pub(crate) const READ_ON_OPEN_RECORD_MAX: u8 = 31;

/// Length of the session MACs
pub(crate) fn session_mac_len(extended: bool) -> usize {
    if extended {
        8
    } else {
        4
    }
}

/// Output data of Open Secure Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenSessionData {
    pub card_challenge: Vec<u8>,
    pub extended: bool,
    pub ratified: bool,
    pub kif: u8,
    pub kvc: u8,
    pub record_data: Vec<u8>,
}

/// Parse `[challenge][ratification][kif][kvc][len][record data]`
///
/// The challenge is 8 bytes in extended mode, 4 otherwise. A card asked for
/// the extended mode may still answer in the short format.
pub(crate) fn parse_open_session_data(
    data: &[u8],
    extended_requested: bool,
) -> Option<OpenSessionData> {
    let fits = |challenge_len: usize| {
        data.len() >= challenge_len + 4
            && data.len() == challenge_len + 4 + data[challenge_len + 3] as usize
    };
    let challenge_len = if extended_requested && fits(8) {
        8
    } else if fits(4) {
        4
    } else {
        return None;
    };
    Some(OpenSessionData {
        card_challenge: data[..challenge_len].to_vec(),
        extended: challenge_len == 8,
        ratified: data[challenge_len] == 0x00,
        kif: data[challenge_len + 1],
        kvc: data[challenge_len + 2],
        record_data: data[challenge_len + 4..].to_vec(),
    })
}

/// Parse the postponed data of Close Secure Session: `[len][data]...`
fn parse_postponed_data(mut data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let len = data[0] as usize;
        if data.len() < 1 + len {
            return None;
        }
        entries.push(data[1..1 + len].to_vec());
        data = &data[1 + len..];
    }
    Some(entries)
}

fn open_session_apdu(
    cla: u8,
    level: WriteAccessLevel,
    read: Option<(u8, u8)>,
    extended: bool,
    challenge: Vec<u8>,
) -> APDU {
    let (sfi, record) = read.unwrap_or((0, 0));
    let p1 = (record << 3) | level.key_index();
    let p2 = (sfi << 3) | if extended { 0x02 } else { 0x01 };
    APDU::with_data(cla, ins::OPEN_SECURE_SESSION, p1, p2, challenge).le(0)
}

impl CardCommand {
    /// `pre_open` is the output data of a session pre-opened at selection
    pub(crate) fn open_session(
        cla: u8,
        context: CommandContext,
        level: WriteAccessLevel,
        default_kif: u8,
        extended: bool,
        pre_open: Option<Vec<u8>>,
    ) -> Self {
        let placeholder = vec![0u8; if extended { 8 } else { 4 }];
        Self::new(
            CommandKind::OpenSession {
                level,
                read: None,
                default_kif,
                extended,
                pre_open,
            },
            context,
            open_session_apdu(cla, level, None, extended, placeholder),
        )
    }

    /// Fold a single record read into a not yet sent Open Secure Session
    ///
    /// Returns false when this command cannot carry the read: not an opening,
    /// a read already folded, a pre-opened session or a record above 31.
    pub(crate) fn configure_read_on_open(&mut self, sfi: u8, record: u8) -> bool {
        if record > READ_ON_OPEN_RECORD_MAX {
            return false;
        }
        if let CommandKind::OpenSession {
            level,
            read: read @ None,
            extended,
            pre_open: None,
            ..
        } = &mut self.kind
        {
            *read = Some((sfi, record));
            let apdu = open_session_apdu(
                self.apdu.cla,
                *level,
                *read,
                *extended,
                self.apdu.data.clone(),
            );
            self.set_apdu(apdu);
            return true;
        }
        false
    }

    pub(crate) fn close_session(
        cla: u8,
        context: CommandContext,
        ratification_asked: bool,
        sv_postponed_data_index: Option<usize>,
        extended: bool,
    ) -> Self {
        let p1 = if ratification_asked { CLOSE_RATIFICATION_ASKED } else { 0x00 };
        let mac = vec![0u8; session_mac_len(extended)];
        Self::new(
            CommandKind::CloseSession {
                ratification_asked,
                sv_postponed_data_index,
                extended,
            },
            context,
            APDU::with_data(cla, ins::CLOSE_SECURE_SESSION, p1, 0x00, mac).le(0),
        )
    }

    /// Close Secure Session without MAC, cancelling the session
    pub(crate) fn abort_session(cla: u8, context: CommandContext) -> Self {
        Self::new(
            CommandKind::AbortSession,
            context,
            APDU::new(cla, ins::CLOSE_SECURE_SESSION, 0x00, 0x00),
        )
    }

    pub(crate) fn manage_session(
        cla: u8,
        context: CommandContext,
        encryption_requested: bool,
        mutual_authentication_requested: bool,
    ) -> Self {
        let mut command = Self::new(
            CommandKind::ManageSession {
                encryption_requested,
                mutual_authentication_requested,
            },
            context,
            APDU::new(cla, ins::MANAGE_SECURE_SESSION, 0x00, 0x00),
        );
        command.set_apdu(command.manage_session_apdu(None));
        command
    }

    pub(crate) fn ratification(cla: u8, context: CommandContext) -> Self {
        let mut command = Self::new(
            CommandKind::Ratification,
            context,
            APDU::new(cla, ins::RATIFICATION, 0x00, 0x00),
        );
        // The card only needs to receive a command
        command.successful_status_words.extend([
            SW::WRONG_P1_P2,
            SW::RECORD_NOT_FOUND,
            SW::FILE_NOT_FOUND,
            SW::COMMAND_NOT_ALLOWED_NO_EF,
            SW::SECURITY_STATUS_NOT_SATISFIED,
            SW::CONDITIONS_NOT_SATISFIED,
            SW::WRONG_LENGTH,
        ]);
        command
    }

    pub(crate) fn is_ratification(&self) -> bool {
        matches!(self.kind, CommandKind::Ratification)
    }

    fn manage_session_apdu(&self, mac: Option<Vec<u8>>) -> APDU {
        let (encryption, mutual) = match self.kind {
            CommandKind::ManageSession {
                encryption_requested,
                mutual_authentication_requested,
            } => (encryption_requested, mutual_authentication_requested),
            _ => (false, false),
        };
        let p2 = match (mutual, encryption) {
            (true, true) => 0x03,
            (true, false) => 0x01,
            (false, true) => 0x02,
            (false, false) => 0x00,
        };
        match mac {
            Some(mac) => APDU::with_data(self.apdu.cla, ins::MANAGE_SECURE_SESSION, 0x00, p2, mac)
                .le(0),
            None => APDU::new(self.apdu.cla, ins::MANAGE_SECURE_SESSION, 0x00, p2),
        }
    }

    pub(super) fn finalize_open_session(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if let CommandKind::OpenSession { level, read, extended, .. } = self.kind {
            let challenge = ctx.crypto.init_terminal_secure_session_context()?;
            let apdu = open_session_apdu(self.apdu.cla, level, read, extended, challenge);
            self.set_apdu(apdu);
        }
        Ok(())
    }

    /// Anticipate the opening when the card was pre-opened at selection
    pub(super) fn synchronize_open_session(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<bool, TransactionError> {
        let (data_out, default_kif, extended) = match &self.kind {
            CommandKind::OpenSession {
                read: None,
                pre_open: Some(data_out),
                default_kif,
                extended,
                ..
            } => (data_out.clone(), *default_kif, *extended),
            _ => return Ok(false),
        };
        let Some(data) = parse_open_session_data(&data_out, extended) else {
            return Ok(false);
        };
        let kif = if data.kif == 0xFF { default_kif } else { data.kif };
        debug!("Open Secure Session anticipated from pre-open data");
        ctx.crypto.init_terminal_session_mac(&data_out, kif, data.kvc)?;

        let mut anticipated = data_out;
        anticipated.extend_from_slice(&SW::SUCCESS.to_be_bytes());
        self.anticipated_response = Some(anticipated);
        self.crypto_synchronized = true;
        Ok(true)
    }

    pub(super) fn parse_open_session(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let (read, default_kif, extended) = match self.kind {
            CommandKind::OpenSession {
                read,
                default_kif,
                extended,
                ..
            } => (read, default_kif, extended),
            _ => return Ok(()),
        };
        check_status(CommandRef::OpenSecureSession, response)?;
        self.check_anticipated_response(response)?;

        let data = parse_open_session_data(&response.data, extended).ok_or_else(|| {
            TransactionError::InconsistentResponse(format!(
                "{}: unexpected output data length {}",
                CommandRef::OpenSecureSession, response.data.len()
            ))
        })?;
        if extended && !data.extended {
            warn!("Card answered Open Secure Session in non-extended mode");
            ctx.card.set_extended_mode_supported(false);
        }
        ctx.card.set_card_challenge(data.card_challenge.clone());
        ctx.card.set_df_ratified(data.ratified);

        if !self.crypto_synchronized {
            let kif = if data.kif == 0xFF { default_kif } else { data.kif };
            ctx.crypto.init_terminal_session_mac(&response.data, kif, data.kvc)?;
            self.crypto_synchronized = true;
        }
        if let Some((sfi, record)) = read {
            if !data.record_data.is_empty() {
                ctx.card.set_content(sfi, record, &data.record_data);
            }
        }
        ctx.card.backup_files();
        ctx.secure_session_open = true;
        Ok(())
    }

    pub(super) fn finalize_close_session(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let mac = ctx.crypto.finalize_terminal_session_mac()?;
        let p1 = self.apdu.p1;
        let apdu = APDU::with_data(self.apdu.cla, ins::CLOSE_SECURE_SESSION, p1, 0x00, mac).le(0);
        self.set_apdu(apdu);
        Ok(())
    }

    pub(super) fn parse_close_session(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let (ratification_asked, sv_index, extended) = match self.kind {
            CommandKind::CloseSession {
                ratification_asked,
                sv_postponed_data_index,
                extended,
            } => (ratification_asked, sv_postponed_data_index, extended),
            _ => return Ok(()),
        };
        check_status(CommandRef::CloseSecureSession, response)?;

        let mac_len = session_mac_len(extended);
        if response.data.len() < mac_len {
            return Err(TransactionError::InconsistentResponse(format!(
                "{}: output data too short ({} bytes)",
                CommandRef::CloseSecureSession, response.data.len()
            )));
        }
        let (postponed, card_mac) = response.data.split_at(response.data.len() - mac_len);
        let postponed = parse_postponed_data(postponed).ok_or_else(|| {
            TransactionError::InconsistentResponse(format!(
                "{}: malformed postponed data",
                CommandRef::CloseSecureSession
            ))
        })?;

        if !ctx.crypto.is_card_session_mac_valid(card_mac)? {
            return Err(TransactionError::InvalidCardMac("card session MAC".into()));
        }
        if let Some(index) = sv_index {
            let sv_mac = postponed.get(index).ok_or_else(|| {
                TransactionError::InconsistentResponse(format!(
                    "no postponed data at index {}",
                    index
                ))
            })?;
            if !ctx.crypto.is_card_sv_mac_valid(sv_mac)? {
                return Err(TransactionError::InvalidCardMac("card SV MAC".into()));
            }
        }
        ctx.card.set_df_ratified(ratification_asked);
        ctx.secure_session_open = false;
        Ok(())
    }

    pub(super) fn finalize_manage_session(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if let CommandKind::ManageSession {
            mutual_authentication_requested: true,
            ..
        } = self.kind
        {
            let mac = ctx.crypto.generate_terminal_session_mac()?;
            let apdu = self.manage_session_apdu(Some(mac));
            self.set_apdu(apdu);
        }
        Ok(())
    }

    pub(super) fn synchronize_manage_session(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<bool, TransactionError> {
        if let CommandKind::ManageSession {
            mutual_authentication_requested: true,
            ..
        } = self.kind
        {
            return Ok(false);
        }
        self.update_encryption_state(ctx)?;
        self.crypto_synchronized = true;
        Ok(true)
    }

    fn update_encryption_state(
        &self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if let CommandKind::ManageSession {
            encryption_requested, ..
        } = self.kind
        {
            if !self.context.encryption_active && encryption_requested {
                ctx.crypto.activate_encryption()?;
            } else if self.context.encryption_active && !encryption_requested {
                ctx.crypto.deactivate_encryption()?;
            }
        }
        Ok(())
    }

    pub(super) fn parse_manage_session(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if response.sw() == SW::CONDITIONS_NOT_SATISFIED && !ctx.card.is_extended_mode_supported() {
            return Err(TransactionError::UnsupportedOperation(
                "Manage Secure Session not supported by the card".into(),
            ));
        }
        check_status(CommandRef::ManageSecureSession, response)?;
        if let CommandKind::ManageSession {
            mutual_authentication_requested: true,
            ..
        } = self.kind
        {
            if !ctx.crypto.is_card_session_mac_valid(&response.data)? {
                return Err(TransactionError::InvalidCardMac(
                    "card session MAC (mutual authentication)".into(),
                ));
            }
        }
        if !self.crypto_synchronized {
            self.update_encryption_state(ctx)?;
            self.crypto_synchronized = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_session_data_short_format() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x00, 0x30, 0x79, 0x02, 0xAA, 0xBB];
        let parsed = parse_open_session_data(&data, false).unwrap();
        assert_eq!(parsed.card_challenge, vec![0x01, 0x02, 0x03, 0x04]);
        assert!(!parsed.extended);
        assert!(parsed.ratified);
        assert_eq!((parsed.kif, parsed.kvc), (0x30, 0x79));
        assert_eq!(parsed.record_data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_open_session_data_falls_back_to_short_format() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x01, 0x30, 0x79, 0x00];
        let parsed = parse_open_session_data(&data, true).unwrap();
        assert!(!parsed.extended);
        assert!(!parsed.ratified);

        let mut extended = vec![0x11; 8];
        extended.extend_from_slice(&[0x00, 0x21, 0x7E, 0x00]);
        assert!(parse_open_session_data(&extended, true).unwrap().extended);
        assert!(parse_open_session_data(&[0x01, 0x02], false).is_none());
    }

    #[test]
    fn test_parse_postponed_data() {
        let entries = parse_postponed_data(&[0x03, 0x00, 0x00, 0x0A, 0x02, 0xCA, 0xFE]).unwrap();
        assert_eq!(entries, vec![vec![0x00, 0x00, 0x0A], vec![0xCA, 0xFE]]);
        assert!(parse_postponed_data(&[0x05, 0x00]).is_none());
        assert!(parse_postponed_data(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_open_session_apdu_encoding() {
        let outside = CommandContext::default();
        let command = CardCommand::open_session(
            0x00,
            outside,
            WriteAccessLevel::Debit,
            0x30,
            false,
            None,
        );
        assert_eq!(command.request()[..4], [0x00, 0x8A, 0x03, 0x01]);

        let mut command =
            CardCommand::open_session(0x00, outside, WriteAccessLevel::Load, 0x27, true, None);
        assert!(command.configure_read_on_open(0x07, 1));
        assert_eq!(command.request()[..4], [0x00, 0x8A, 0x0A, 0x3A]);
        assert!(!command.configure_read_on_open(0x08, 1));
    }

    #[test]
    fn test_read_on_open_limited_to_five_bit_records() {
        let outside = CommandContext::default();
        let mut command =
            CardCommand::open_session(0x00, outside, WriteAccessLevel::Debit, 0x30, false, None);
        assert!(!command.configure_read_on_open(0x07, 32));
        assert_eq!(command.request()[2], 0x03);
        assert!(command.configure_read_on_open(0x07, 31));
        assert_eq!(command.request()[2], (31 << 3) | 0x03);
    }

    #[test]
    fn test_pre_opened_session_keeps_its_data_out() {
        let data_out = vec![0x01, 0x02, 0x03, 0x04, 0x00, 0x30, 0x79, 0x00];
        let outside = CommandContext::default();
        let mut command = CardCommand::open_session(
            0x00,
            outside,
            WriteAccessLevel::Debit,
            0x30,
            false,
            Some(data_out.clone()),
        );
        assert!(!command.configure_read_on_open(0x07, 1));

        // The live image already forgot the pre-open, the command did not
        let mut ctx = crate::command::tests::transaction_context(false);
        assert!(ctx.card.pre_open_write_access_level().is_none());
        assert!(command.synchronize_crypto_before_card_processing(&mut ctx).unwrap());

        let mut expected = data_out;
        expected.extend_from_slice(&[0x90, 0x00]);
        assert_eq!(command.anticipated_response, Some(expected));
    }

    #[test]
    fn test_manage_session_p2() {
        let ctx = CommandContext {
            secure_session_open: true,
            encryption_active: false,
        };
        assert_eq!(CardCommand::manage_session(0x00, ctx, true, false).apdu().p2, 0x02);
        assert_eq!(CardCommand::manage_session(0x00, ctx, false, true).apdu().p2, 0x01);
        assert_eq!(
            CardCommand::manage_session(0x00, ctx, false, false).request(),
            &[0x00, 0x82, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_abort_and_ratification_encoding() {
        let ctx = CommandContext::default();
        assert_eq!(
            CardCommand::abort_session(0x00, ctx).request(),
            &[0x00, 0x8E, 0x00, 0x00, 0x00]
        );
        let ratification = CardCommand::ratification(0x94, ctx);
        assert_eq!(ratification.request(), &[0x94, 0xB2, 0x00, 0x00, 0x00]);
        assert!(ratification.apdu_request().is_successful(0x6B00));
    }
}
