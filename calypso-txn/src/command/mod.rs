//! Card commands
//!
//! Every operation prepared by the transaction manager becomes a
//! [`CardCommand`]: a closed set of command kinds sharing one capability
//! interface.
//!
//! - `is_crypto_required_to_finalize`: the final APDU needs the crypto service
//! - `finalize_request`: build the final APDU
//! - `synchronize_crypto_before_card_processing`: feed the session digest
//!   ahead of the card exchange, when the response can be anticipated
//! - `parse_response`: status check, card image update, crypto checks
//!
//! Commands capture a [`CommandContext`] when they are prepared and never look
//! at the live transaction flags afterwards.

mod binary;
mod records;
mod security;
mod select;
mod session;
mod status;
mod sv;

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::apdu::{Response, APDU, SW};
use crate::card::WriteAccessLevel;
use crate::error::TransactionError;
use crate::reader::ApduRequest;
use crate::transaction::sv::SvOperation;
use crate::transaction::TransactionContext;

pub(crate) use binary::SFI_ADDRESSING_OFFSET_MAX;
pub use records::SearchCommandData;
pub use security::PinStatus;
pub use select::{GetDataTag, SelectFileControl};
pub(crate) use select::{fcp_for_directory, fcp_for_file, fci, ef_list};

const APDU_RESPONSE_9000: [u8; 2] = [0x90, 0x00];

/// Command identifiers, used in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandRef {
    OpenSecureSession,
    CloseSecureSession,
    ManageSecureSession,
    Ratification,
    GetChallenge,
    ReadRecords,
    ReadRecordMultiple,
    SearchRecordMultiple,
    UpdateRecord,
    WriteRecord,
    AppendRecord,
    ReadBinary,
    UpdateBinary,
    WriteBinary,
    Increase,
    Decrease,
    IncreaseMultiple,
    DecreaseMultiple,
    SelectFile,
    GetData,
    VerifyPin,
    ChangePin,
    ChangeKey,
    Invalidate,
    Rehabilitate,
    SvGet,
    SvReload,
    SvDebit,
    SvUndebit,
}

impl fmt::Display for CommandRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandRef::OpenSecureSession => "OPEN_SECURE_SESSION",
            CommandRef::CloseSecureSession => "CLOSE_SECURE_SESSION",
            CommandRef::ManageSecureSession => "MANAGE_SECURE_SESSION",
            CommandRef::Ratification => "RATIFICATION",
            CommandRef::GetChallenge => "GET_CHALLENGE",
            CommandRef::ReadRecords => "READ_RECORDS",
            CommandRef::ReadRecordMultiple => "READ_RECORD_MULTIPLE",
            CommandRef::SearchRecordMultiple => "SEARCH_RECORD_MULTIPLE",
            CommandRef::UpdateRecord => "UPDATE_RECORD",
            CommandRef::WriteRecord => "WRITE_RECORD",
            CommandRef::AppendRecord => "APPEND_RECORD",
            CommandRef::ReadBinary => "READ_BINARY",
            CommandRef::UpdateBinary => "UPDATE_BINARY",
            CommandRef::WriteBinary => "WRITE_BINARY",
            CommandRef::Increase => "INCREASE",
            CommandRef::Decrease => "DECREASE",
            CommandRef::IncreaseMultiple => "INCREASE_MULTIPLE",
            CommandRef::DecreaseMultiple => "DECREASE_MULTIPLE",
            CommandRef::SelectFile => "SELECT_FILE",
            CommandRef::GetData => "GET_DATA",
            CommandRef::VerifyPin => "VERIFY_PIN",
            CommandRef::ChangePin => "CHANGE_PIN",
            CommandRef::ChangeKey => "CHANGE_KEY",
            CommandRef::Invalidate => "INVALIDATE",
            CommandRef::Rehabilitate => "REHABILITATE",
            CommandRef::SvGet => "SV_GET",
            CommandRef::SvReload => "SV_RELOAD",
            CommandRef::SvDebit => "SV_DEBIT",
            CommandRef::SvUndebit => "SV_UNDEBIT",
        };
        f.write_str(name)
    }
}

/// Snapshot of the transaction flags taken when a command is prepared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandContext {
    pub secure_session_open: bool,
    pub encryption_active: bool,
}

/// Key reference (KIF, KVC) used to cipher PIN data
pub type KeyReference = (u8, u8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommandKind {
    OpenSession {
        level: WriteAccessLevel,
        /// (SFI, record) read along with the opening
        read: Option<(u8, u8)>,
        /// KIF used when the card does not tell which key it used
        default_kif: u8,
        extended: bool,
        /// Output data of a session pre-opened at selection, copied at preparation
        pre_open: Option<Vec<u8>>,
    },
    CloseSession {
        ratification_asked: bool,
        sv_postponed_data_index: Option<usize>,
        extended: bool,
    },
    AbortSession,
    ManageSession {
        encryption_requested: bool,
        mutual_authentication_requested: bool,
    },
    Ratification,
    GetChallenge,
    ReadRecords {
        sfi: u8,
        first_record: u8,
        multiple: bool,
    },
    UpdateRecord {
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    },
    WriteRecord {
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    },
    AppendRecord {
        sfi: u8,
        data: Vec<u8>,
    },
    ReadRecordsPartially {
        sfi: u8,
        first_record: u8,
        offset: u8,
        length: u8,
    },
    SearchRecords {
        sfi: u8,
        fetch_first: bool,
    },
    ReadBinary {
        sfi: u8,
        offset: u16,
    },
    UpdateBinary {
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    },
    WriteBinary {
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    },
    IncreaseOrDecrease {
        decrease: bool,
        sfi: u8,
        counter: u8,
        value: u32,
    },
    IncreaseOrDecreaseMultiple {
        decrease: bool,
        sfi: u8,
        counters: BTreeMap<u8, u32>,
    },
    SelectFile,
    GetData {
        tag: GetDataTag,
    },
    VerifyPin {
        /// None when only the attempt counter is read
        pin: Option<Vec<u8>>,
        ciphering_key: Option<KeyReference>,
    },
    ChangePin {
        new_pin: Vec<u8>,
        ciphering_key: Option<KeyReference>,
    },
    ChangeKey {
        key_index: u8,
        issuer_key: KeyReference,
        target_key: KeyReference,
    },
    Invalidate,
    Rehabilitate,
    SvGet {
        operation: SvOperation,
        extended: bool,
    },
    SvReload {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
        extended: bool,
    },
    SvDebit {
        undebit: bool,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        negative_balance_allowed: bool,
        extended: bool,
    },
}

/// One APDU exchange with the card
#[derive(Debug, Clone)]
pub struct CardCommand {
    pub(crate) kind: CommandKind,
    context: CommandContext,
    apdu: APDU,
    /// Bytes actually sent, ciphered when encryption is active
    request: Vec<u8>,
    request_digested: bool,
    crypto_synchronized: bool,
    anticipated_response: Option<Vec<u8>>,
    successful_status_words: Vec<u16>,
}

impl CardCommand {
    fn new(kind: CommandKind, context: CommandContext, apdu: APDU) -> Self {
        Self {
            kind,
            context,
            request: apdu.to_bytes(),
            apdu,
            request_digested: false,
            crypto_synchronized: false,
            anticipated_response: None,
            successful_status_words: vec![SW::SUCCESS],
        }
    }

    pub fn command_ref(&self) -> CommandRef {
        match &self.kind {
            CommandKind::OpenSession { .. } => CommandRef::OpenSecureSession,
            CommandKind::CloseSession { .. } | CommandKind::AbortSession => {
                CommandRef::CloseSecureSession
            }
            CommandKind::ManageSession { .. } => CommandRef::ManageSecureSession,
            CommandKind::Ratification => CommandRef::Ratification,
            CommandKind::GetChallenge => CommandRef::GetChallenge,
            CommandKind::ReadRecords { .. } => CommandRef::ReadRecords,
            CommandKind::UpdateRecord { .. } => CommandRef::UpdateRecord,
            CommandKind::WriteRecord { .. } => CommandRef::WriteRecord,
            CommandKind::AppendRecord { .. } => CommandRef::AppendRecord,
            CommandKind::ReadRecordsPartially { .. } => CommandRef::ReadRecordMultiple,
            CommandKind::SearchRecords { .. } => CommandRef::SearchRecordMultiple,
            CommandKind::ReadBinary { .. } => CommandRef::ReadBinary,
            CommandKind::UpdateBinary { .. } => CommandRef::UpdateBinary,
            CommandKind::WriteBinary { .. } => CommandRef::WriteBinary,
            CommandKind::IncreaseOrDecrease { decrease: false, .. } => CommandRef::Increase,
            CommandKind::IncreaseOrDecrease { decrease: true, .. } => CommandRef::Decrease,
            CommandKind::IncreaseOrDecreaseMultiple { decrease: false, .. } => {
                CommandRef::IncreaseMultiple
            }
            CommandKind::IncreaseOrDecreaseMultiple { decrease: true, .. } => {
                CommandRef::DecreaseMultiple
            }
            CommandKind::SelectFile => CommandRef::SelectFile,
            CommandKind::GetData { .. } => CommandRef::GetData,
            CommandKind::VerifyPin { .. } => CommandRef::VerifyPin,
            CommandKind::ChangePin { .. } => CommandRef::ChangePin,
            CommandKind::ChangeKey { .. } => CommandRef::ChangeKey,
            CommandKind::Invalidate => CommandRef::Invalidate,
            CommandKind::Rehabilitate => CommandRef::Rehabilitate,
            CommandKind::SvGet { .. } => CommandRef::SvGet,
            CommandKind::SvReload { .. } => CommandRef::SvReload,
            CommandKind::SvDebit { undebit: false, .. } => CommandRef::SvDebit,
            CommandKind::SvDebit { undebit: true, .. } => CommandRef::SvUndebit,
        }
    }

    pub fn context(&self) -> CommandContext {
        self.context
    }

    pub fn apdu(&self) -> &APDU {
        &self.apdu
    }

    /// Bytes sent to the card
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// True for the commands consuming the session modifications buffer
    pub fn is_modifying(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::UpdateRecord { .. }
                | CommandKind::WriteRecord { .. }
                | CommandKind::AppendRecord { .. }
                | CommandKind::UpdateBinary { .. }
                | CommandKind::WriteBinary { .. }
                | CommandKind::IncreaseOrDecrease { .. }
                | CommandKind::IncreaseOrDecreaseMultiple { .. }
                | CommandKind::Invalidate
                | CommandKind::Rehabilitate
                | CommandKind::SvReload { .. }
                | CommandKind::SvDebit { .. }
        )
    }

    /// Cost of this command in the session modifications buffer
    ///
    /// In bytes: the APDU length plus 6 minus the 5 header bytes. In
    /// commands: 1.
    pub fn buffer_cost(&self, counted_in_bytes: bool) -> i32 {
        if counted_in_bytes {
            self.apdu.len() as i32 + 6 - 5
        } else {
            1
        }
    }

    pub(crate) fn apdu_request(&self) -> ApduRequest {
        let mut request = ApduRequest::new(self.request.clone(), &self.command_ref().to_string());
        for sw in &self.successful_status_words {
            request.add_successful_status_word(*sw);
        }
        request
    }

    fn set_apdu(&mut self, apdu: APDU) {
        self.request = apdu.to_bytes();
        self.apdu = apdu;
    }

    /// True when this command takes part in the session digest
    fn is_digested(&self) -> bool {
        !matches!(
            self.kind,
            CommandKind::OpenSession { .. }
                | CommandKind::CloseSession { .. }
                | CommandKind::AbortSession
                | CommandKind::ManageSession { .. }
                | CommandKind::Ratification
        )
    }

    pub(crate) fn is_crypto_required_to_finalize(&self) -> bool {
        match &self.kind {
            CommandKind::OpenSession { .. }
            | CommandKind::CloseSession { .. }
            | CommandKind::ChangeKey { .. }
            | CommandKind::SvReload { .. }
            | CommandKind::SvDebit { .. } => true,
            CommandKind::AbortSession | CommandKind::Ratification => false,
            CommandKind::ManageSession {
                mutual_authentication_requested,
                ..
            } => *mutual_authentication_requested,
            CommandKind::VerifyPin {
                pin: Some(_),
                ciphering_key: Some(_),
            }
            | CommandKind::ChangePin {
                ciphering_key: Some(_),
                ..
            } => true,
            _ => self.context.encryption_active,
        }
    }

    pub(crate) fn finalize_request(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        match self.kind.clone() {
            CommandKind::OpenSession { .. } => self.finalize_open_session(ctx)?,
            CommandKind::CloseSession { .. } => self.finalize_close_session(ctx)?,
            CommandKind::ManageSession { .. } => self.finalize_manage_session(ctx)?,
            CommandKind::AbortSession | CommandKind::Ratification => {}
            CommandKind::VerifyPin { .. }
            | CommandKind::ChangePin { .. }
            | CommandKind::ChangeKey { .. } => {
                self.finalize_security(ctx)?;
                self.encrypt_request_and_update_mac_if_needed(ctx)?;
            }
            CommandKind::SvReload { .. } | CommandKind::SvDebit { .. } => {
                self.finalize_sv(ctx)?;
                self.encrypt_request_and_update_mac_if_needed(ctx)?;
            }
            _ => self.encrypt_request_and_update_mac_if_needed(ctx)?,
        }
        Ok(())
    }

    pub(crate) fn synchronize_crypto_before_card_processing(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<bool, TransactionError> {
        if self.crypto_synchronized {
            return Ok(true);
        }
        match self.kind {
            CommandKind::OpenSession { .. } => self.synchronize_open_session(ctx),
            CommandKind::CloseSession { .. } => Ok(false),
            CommandKind::ManageSession { .. } => self.synchronize_manage_session(ctx),
            CommandKind::AbortSession | CommandKind::Ratification => {
                self.crypto_synchronized = true;
                Ok(true)
            }
            // Later crypto operations need their response
            CommandKind::GetChallenge | CommandKind::SvGet { .. } => Ok(false),
            _ if !self.context.secure_session_open => {
                self.crypto_synchronized = true;
                Ok(true)
            }
            CommandKind::UpdateRecord { .. }
            | CommandKind::WriteRecord { .. }
            | CommandKind::AppendRecord { .. }
            | CommandKind::UpdateBinary { .. }
            | CommandKind::WriteBinary { .. }
            | CommandKind::Invalidate
            | CommandKind::Rehabilitate
            | CommandKind::SvReload { .. }
            | CommandKind::SvDebit { .. } => {
                if self.context.encryption_active {
                    return Ok(false);
                }
                self.update_mac_with_anticipated_response(ctx, APDU_RESPONSE_9000.to_vec())?;
                Ok(true)
            }
            // The card answer is needed first
            _ => Ok(false),
        }
    }

    pub(crate) fn parse_response(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        debug!(
            "{} response: SW={:04X}, {} bytes",
            self.command_ref(), response.sw(), response.data.len()
        );
        let response = self.decrypt_response_and_update_mac_if_needed(response, ctx)?;

        match self.kind.clone() {
            CommandKind::OpenSession { .. } => self.parse_open_session(&response, ctx),
            CommandKind::CloseSession { .. } => self.parse_close_session(&response, ctx),
            CommandKind::AbortSession => {
                ctx.card.restore_files();
                ctx.secure_session_open = false;
                Ok(())
            }
            CommandKind::Ratification => {
                ctx.card.set_df_ratified(true);
                Ok(())
            }
            CommandKind::ManageSession { .. } => self.parse_manage_session(&response, ctx),
            CommandKind::VerifyPin { .. } => self.parse_verify_pin(&response, ctx),
            _ => {
                status::check_status(self.command_ref(), &response)?;
                self.check_anticipated_response(&response)?;
                match self.kind.clone() {
                    CommandKind::GetChallenge
                    | CommandKind::ChangePin { .. }
                    | CommandKind::ChangeKey { .. }
                    | CommandKind::Invalidate
                    | CommandKind::Rehabilitate => self.parse_security(&response, ctx),
                    CommandKind::SvGet { .. }
                    | CommandKind::SvReload { .. }
                    | CommandKind::SvDebit { .. } => self.parse_sv(&response, ctx),
                    CommandKind::ReadBinary { .. }
                    | CommandKind::UpdateBinary { .. }
                    | CommandKind::WriteBinary { .. } => self.parse_binary(&response, ctx),
                    CommandKind::SelectFile | CommandKind::GetData { .. } => {
                        self.parse_file_control(&response, ctx)
                    }
                    _ => self.parse_records(&response, ctx),
                }
            }
        }
    }

    /// Cipher the request and add it to the digest (encryption active only)
    fn encrypt_request_and_update_mac_if_needed(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        if self.context.secure_session_open
            && self.context.encryption_active
            && self.is_digested()
        {
            self.request = ctx.crypto.update_terminal_session_mac(&self.request)?;
            self.request_digested = true;
        }
        Ok(())
    }

    /// Add the request and the expected response to the digest ahead of time
    fn update_mac_with_anticipated_response(
        &mut self,
        ctx: &mut TransactionContext,
        anticipated: Vec<u8>,
    ) -> Result<(), TransactionError> {
        if self.context.secure_session_open {
            if !self.request_digested {
                ctx.crypto.update_terminal_session_mac(&self.request)?;
                self.request_digested = true;
            }
            ctx.crypto.update_terminal_session_mac(&anticipated)?;
            self.anticipated_response = Some(anticipated);
        }
        self.crypto_synchronized = true;
        Ok(())
    }

    fn decrypt_response_and_update_mac_if_needed(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<Response, TransactionError> {
        if self.crypto_synchronized || !self.context.secure_session_open || !self.is_digested() {
            return Ok(response.clone());
        }
        if !self.request_digested {
            ctx.crypto.update_terminal_session_mac(&self.request)?;
            self.request_digested = true;
        }
        let clear = ctx.crypto.update_terminal_session_mac(&response.to_bytes())?;
        self.crypto_synchronized = true;
        Response::from_bytes(&clear).ok_or_else(|| {
            TransactionError::InconsistentResponse(format!(
                "{}: deciphered response too short",
                self.command_ref()
            ))
        })
    }

    fn check_anticipated_response(&self, response: &Response) -> Result<(), TransactionError> {
        match &self.anticipated_response {
            Some(anticipated) if *anticipated != response.to_bytes() => {
                Err(TransactionError::InconsistentResponse(format!(
                    "{}: card response {:02X?} differs from the anticipated {:02X?}",
                    self.command_ref(), response.to_bytes(), anticipated
                )))
            }
            _ => Ok(()),
        }
    }
}
