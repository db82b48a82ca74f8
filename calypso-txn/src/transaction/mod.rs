//! Card transaction manager
//!
//! Operations are prepared first, then sent to the card by
//! [`CardTransactionManager::process_commands`]. While a secure session is
//! prepared, every modifying command is accounted against the card
//! modifications buffer; when the buffer would overflow the session is either
//! split (multiple session enabled) or the operation is rejected.
//!
//! Any error resets the transaction: pending commands are dropped and an
//! open card session is aborted, rolling the card image back to its state at
//! the session opening.

mod buffer;
mod context;
mod pipeline;
pub mod setting;
pub mod sv;

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info, warn};

use crate::audit::TransactionAuditData;
use crate::card::calypso_card::{
    SV_APPLICATION_SUBTYPE, SV_DEBIT_LOG_FILE_RECORDS, SV_DEBIT_LOG_FILE_SFI,
    SV_LOG_FILE_RECORD_SIZE, SV_RELOAD_LOG_FILE_SFI,
};
use crate::card::file::COUNTER_SIZE;
use crate::card::{CalypsoCard, ProductType, WriteAccessLevel};
use crate::command::{
    CardCommand, CommandContext, GetDataTag, SearchCommandData, SelectFileControl,
    SFI_ADDRESSING_OFFSET_MAX,
};
use crate::crypto::SymmetricCryptoFactory;
use crate::error::TransactionError;
use crate::reader::{CardReader, ChannelControl};

use buffer::SessionBuffer;
use sv::SvSequencer;

pub(crate) use context::TransactionContext;
pub use setting::{SecuritySetting, SettingError};
pub use sv::{SvAction, SvOperation};

const APDU_HEADER_LENGTH: usize = 5;
/// Lc and Le are single bytes
const SHORT_APDU_MAX_DATA: usize = 255;
const SFI_MAX: u8 = 30;
const RECORD_NUMBER_MIN: u8 = 1;
const RECORD_NUMBER_MAX: u8 = 250;
const COUNTER_NUMBER_MAX: u8 = 83;
const COUNTER_VALUE_MAX: u32 = 0x00FF_FFFF;
const PIN_LENGTH: usize = 4;
const CHANGE_KEY_INDEX_MIN: u8 = 1;
const CHANGE_KEY_INDEX_MAX: u8 = 3;
const SV_LOAD_MIN_VALUE: i32 = -8_388_608;
const SV_LOAD_MAX_VALUE: i32 = 8_388_607;
const SV_DEBIT_MIN_VALUE: i32 = 0;
const SV_DEBIT_MAX_VALUE: i32 = 32_767;
/// Record header added by the card in a multiple records answer
const RECORD_HEADER_LENGTH: usize = 2;
const RECORD_OFFSET_MAX: u8 = 249;
/// Largest record content reachable by the multiple record commands
const RECORD_SIZE_MAX: usize = 250;
const BINARY_OFFSET_MAX: u16 = 0x7FFF;
/// Counter number and 3-byte value in a multiple counters command
const COUNTER_ENTRY_LENGTH: usize = 4;

/// Secure transaction engine for one selected card
pub struct CardTransactionManager {
    reader: Box<dyn CardReader>,
    setting: SecuritySetting,
    ctx: TransactionContext,
    audit: TransactionAuditData,
    commands: Vec<CardCommand>,
    // Prepared state, ahead of what the card did
    is_secure_session_open: bool,
    is_encryption_active: bool,
    is_extended_mode: bool,
    write_access_level: Option<WriteAccessLevel>,
    buffer: SessionBuffer,
    nb_postponed_data: usize,
    sv_postponed_data_index: Option<usize>,
    sv: SvSequencer,
    payload_capacity: usize,
}

impl fmt::Debug for CardTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardTransactionManager")
            .field("is_secure_session_open", &self.is_secure_session_open)
            .field("is_encryption_active", &self.is_encryption_active)
            .field("is_extended_mode", &self.is_extended_mode)
            .field("write_access_level", &self.write_access_level)
            .field("pending_commands", &self.commands.len())
            .field("payload_capacity", &self.payload_capacity)
            .finish_non_exhaustive()
    }
}

impl CardTransactionManager {
    pub fn new(
        reader: Box<dyn CardReader>,
        card: CalypsoCard,
        crypto_factory: &dyn SymmetricCryptoFactory,
        setting: SecuritySetting,
    ) -> Self {
        let audit = TransactionAuditData::new();
        let is_extended_mode =
            crypto_factory.is_extended_mode_supported() && card.is_extended_mode_supported();
        let crypto = crypto_factory.create_transaction_manager(
            card.calypso_serial_number_full(),
            is_extended_mode,
            audit.clone(),
        );
        let payload_capacity = card
            .payload_capacity()
            .min(
                crypto_factory
                    .max_card_apdu_length_supported()
                    .saturating_sub(APDU_HEADER_LENGTH),
            )
            .min(SHORT_APDU_MAX_DATA);
        let buffer = SessionBuffer::new(
            card.modifications_counter(),
            card.is_modifications_counter_in_bytes(),
        );
        Self {
            reader,
            setting,
            ctx: TransactionContext::new(card, crypto),
            audit,
            commands: Vec::new(),
            is_secure_session_open: false,
            is_encryption_active: false,
            is_extended_mode,
            write_access_level: None,
            buffer,
            nb_postponed_data: 0,
            sv_postponed_data_index: None,
            sv: SvSequencer::default(),
            payload_capacity,
        }
    }

    pub fn card(&self) -> &CalypsoCard {
        &self.ctx.card
    }

    /// Give back the card image at the end of the transaction
    pub fn into_card(self) -> CalypsoCard {
        self.ctx.card
    }

    pub fn setting(&self) -> &SecuritySetting {
        &self.setting
    }

    pub fn audit(&self) -> &TransactionAuditData {
        &self.audit
    }

    /// True once a secure session has been prepared and not yet closed
    pub fn is_secure_session_open(&self) -> bool {
        self.is_secure_session_open
    }

    /// True while the card holds an open secure session
    pub fn is_card_session_open(&self) -> bool {
        self.ctx.secure_session_open
    }

    pub fn is_extended_mode(&self) -> bool {
        self.is_extended_mode
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Room left in the session modifications buffer
    pub fn modifications_counter(&self) -> i32 {
        self.buffer.remaining()
    }

    pub fn pending_commands(&self) -> &[CardCommand] {
        &self.commands
    }

    fn command_context(&self) -> CommandContext {
        CommandContext {
            secure_session_open: self.is_secure_session_open,
            encryption_active: self.is_encryption_active,
        }
    }

    fn reset_command_context(&mut self) {
        self.is_secure_session_open = false;
        self.is_encryption_active = false;
    }

    fn cla(&self) -> u8 {
        self.ctx.card.card_class()
    }

    fn disable_pre_open_mode(&mut self) {
        self.ctx.card.disable_pre_open_mode();
    }

    /// Run a preparation step, resetting the transaction if it fails
    fn run<F>(&mut self, operation: F) -> Result<&mut Self, TransactionError>
    where
        F: FnOnce(&mut Self) -> Result<(), TransactionError>,
    {
        if let Err(e) = operation(self) {
            self.reset_transaction();
            return Err(e);
        }
        Ok(self)
    }

    fn check_secure_session(&self) -> Result<(), TransactionError> {
        if !self.is_secure_session_open {
            return Err(TransactionError::IllegalState("No secure session opened".into()));
        }
        Ok(())
    }

    fn check_no_secure_session(&self) -> Result<(), TransactionError> {
        if self.is_secure_session_open {
            return Err(TransactionError::IllegalState("Secure session already opened".into()));
        }
        Ok(())
    }

    fn check_extended_mode(&self, operation: &str) -> Result<(), TransactionError> {
        if !self.is_extended_mode {
            return Err(TransactionError::UnsupportedOperation(format!(
                "{} requires the extended mode",
                operation
            )));
        }
        Ok(())
    }

    fn check_pin_feature(&self) -> Result<(), TransactionError> {
        if !self.ctx.card.is_pin_feature_available() {
            return Err(TransactionError::UnsupportedOperation(
                "PIN is not available for this card".into(),
            ));
        }
        Ok(())
    }

    fn check_data(&self, data: &[u8]) -> Result<(), TransactionError> {
        if data.is_empty() || data.len() > self.payload_capacity {
            return Err(TransactionError::IllegalArgument(format!(
                "data length {} out of range 1..={}",
                data.len(), self.payload_capacity
            )));
        }
        Ok(())
    }

    /// Account `command` in the session buffer, splitting the session if needed
    fn prepare_new_secure_session_if_needed(
        &mut self,
        command: &CardCommand,
    ) -> Result<(), TransactionError> {
        if !self.is_secure_session_open {
            return Ok(());
        }
        let cost = command.buffer_cost(self.buffer.is_counted_in_bytes());
        if self.buffer.consume(cost) {
            return Ok(());
        }
        if !self.setting.multiple_session_enabled {
            return Err(TransactionError::SessionBufferOverflow {
                command: command.command_ref(),
                audit: self.audit.to_string(),
            });
        }
        let level = self
            .write_access_level
            .ok_or_else(|| {
                TransactionError::IllegalState("no write access level for the new session".into())
            })?;
        info!(
            "Modifications buffer full, secure session split before {}",
            command.command_ref()
        );

        let cla = self.cla();
        let context = self.command_context();
        self.commands.push(CardCommand::close_session(
            cla,
            context,
            true,
            self.sv_postponed_data_index,
            self.is_extended_mode,
        ));
        self.disable_pre_open_mode();
        self.commands.push(CardCommand::open_session(
            cla,
            context,
            level,
            self.setting.default_kif(level),
            self.is_extended_mode,
            None,
        ));
        if self.is_encryption_active {
            // The new session starts without encryption
            let rearm = CommandContext {
                secure_session_open: true,
                encryption_active: false,
            };
            self.commands.push(CardCommand::manage_session(cla, rearm, true, false));
        }
        self.buffer.reset();
        self.buffer.consume(cost);
        self.nb_postponed_data = 0;
        self.sv_postponed_data_index = None;
        self.sv.reset_session();
        Ok(())
    }

    fn enqueue_modifying(&mut self, command: CardCommand) -> Result<(), TransactionError> {
        self.prepare_new_secure_session_if_needed(&command)?;
        self.commands.push(command);
        Ok(())
    }

    pub fn prepare_open_secure_session(
        &mut self,
        level: WriteAccessLevel,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            tm.check_no_secure_session()?;
            if let Some(pre_open_level) = tm.ctx.card.pre_open_write_access_level() {
                if pre_open_level != level || !tm.is_extended_mode {
                    warn!(
                        "Pre-open mode cancelled, write access level {:?} used instead of {:?}",
                        level, pre_open_level
                    );
                    tm.disable_pre_open_mode();
                }
            }
            let pre_open = tm
                .ctx
                .card
                .pre_open_write_access_level()
                .map(|_| tm.ctx.card.pre_open_data_out().to_vec());
            let command = CardCommand::open_session(
                tm.cla(),
                tm.command_context(),
                level,
                tm.setting.default_kif(level),
                tm.is_extended_mode,
                pre_open,
            );
            tm.commands.push(command);
            tm.write_access_level = Some(level);
            tm.is_secure_session_open = true;
            tm.is_encryption_active = false;
            tm.buffer.reset();
            tm.nb_postponed_data = 0;
            tm.sv_postponed_data_index = None;
            tm.sv.reset_session();
            info!("Secure session prepared with write access level {:?}", level);
            Ok(())
        })
    }

    pub fn prepare_close_secure_session(&mut self) -> Result<&mut Self, TransactionError> {
        let result = self.enqueue_close_secure_session();
        self.reset_command_context();
        self.disable_pre_open_mode();
        match result {
            Ok(()) => Ok(self),
            Err(e) => {
                self.reset_transaction();
                Err(e)
            }
        }
    }

    fn enqueue_close_secure_session(&mut self) -> Result<(), TransactionError> {
        self.check_secure_session()?;
        let cla = self.cla();
        let context = self.command_context();
        if self.setting.ratification_mechanism_enabled && self.reader.is_contactless() {
            self.commands.push(CardCommand::close_session(
                cla,
                context,
                false,
                self.sv_postponed_data_index,
                self.is_extended_mode,
            ));
            self.commands.push(CardCommand::ratification(cla, context));
        } else {
            self.commands.push(CardCommand::close_session(
                cla,
                context,
                true,
                self.sv_postponed_data_index,
                self.is_extended_mode,
            ));
        }
        info!("Secure session closing prepared");
        Ok(())
    }

    /// Abort the secure session, discarding its modifications
    pub fn prepare_cancel_secure_session(&mut self) -> Result<&mut Self, TransactionError> {
        let result = self.check_secure_session();
        if result.is_ok() {
            let command = CardCommand::abort_session(self.cla(), self.command_context());
            self.commands.push(command);
        }
        self.reset_command_context();
        self.disable_pre_open_mode();
        match result {
            Ok(()) => Ok(self),
            Err(e) => {
                self.reset_transaction();
                Err(e)
            }
        }
    }

    pub fn prepare_activate_encryption(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            tm.check_secure_session()?;
            tm.check_extended_mode("Encryption")?;
            if tm.is_encryption_active {
                return Err(TransactionError::IllegalState("Encryption already active".into()));
            }
            let command = CardCommand::manage_session(tm.cla(), tm.command_context(), true, false);
            tm.commands.push(command);
            tm.is_encryption_active = true;
            Ok(())
        })
    }

    pub fn prepare_deactivate_encryption(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            tm.check_secure_session()?;
            tm.check_extended_mode("Encryption")?;
            if !tm.is_encryption_active {
                return Err(TransactionError::IllegalState("Encryption not active".into()));
            }
            let command = CardCommand::manage_session(tm.cla(), tm.command_context(), false, false);
            tm.commands.push(command);
            tm.is_encryption_active = false;
            Ok(())
        })
    }

    pub fn prepare_early_mutual_authentication(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            tm.check_secure_session()?;
            tm.check_extended_mode("Early mutual authentication")?;
            let command = CardCommand::manage_session(
                tm.cla(),
                tm.command_context(),
                tm.is_encryption_active,
                true,
            );
            tm.commands.push(command);
            Ok(())
        })
    }

    /// Select an EF by its LID; its header lands in the card image
    pub fn prepare_select_file(&mut self, lid: u16) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            let command = CardCommand::select_file(
                tm.cla(),
                tm.command_context(),
                tm.ctx.card.product_type(),
                lid,
            );
            tm.commands.push(command);
            Ok(())
        })
    }

    /// Select the first or next EF, or the current DF
    pub fn prepare_select_file_control(
        &mut self,
        control: SelectFileControl,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            let command = CardCommand::select_file_control(tm.cla(), tm.command_context(), control);
            tm.commands.push(command);
            Ok(())
        })
    }

    pub fn prepare_get_data(&mut self, tag: GetDataTag) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            let command = CardCommand::get_data(tm.cla(), tm.command_context(), tag);
            tm.commands.push(command);
            Ok(())
        })
    }

    pub fn prepare_read_record(
        &mut self,
        sfi: u8,
        record_number: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_record_number(record_number)?;
            if tm.can_configure_read_on_open() {
                if let Some(open) = tm.commands.last_mut() {
                    if open.configure_read_on_open(sfi, record_number) {
                        debug!(
                            "Read of record {} of SFI {:02X} folded into the session opening",
                            record_number, sfi
                        );
                        return Ok(());
                    }
                }
            }
            let command = CardCommand::read_records(
                tm.cla(),
                tm.command_context(),
                sfi,
                record_number,
                false,
                0,
            );
            tm.commands.push(command);
            Ok(())
        })
    }

    fn can_configure_read_on_open(&self) -> bool {
        self.is_secure_session_open && !self.setting.read_on_session_opening_disabled
    }

    /// Read records `from..=to` of a linear or cyclic file
    ///
    /// Several records are read per command when the payload capacity allows it.
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        from_record: u8,
        to_record: u8,
        record_size: usize,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_record_number(from_record)?;
            check_record_number(to_record)?;
            if to_record < from_record {
                return Err(TransactionError::IllegalArgument(format!(
                    "to record {} before from record {}",
                    to_record, from_record
                )));
            }
            if record_size == 0 || record_size > tm.payload_capacity {
                return Err(TransactionError::IllegalArgument(format!(
                    "record size {} out of range",
                    record_size
                )));
            }
            let per_command = (tm.payload_capacity / (record_size + RECORD_HEADER_LENGTH)).max(1);
            let (mut record, last) = (from_record as usize, to_record as usize);
            while record <= last {
                let count = per_command.min(last - record + 1);
                let command = if count == 1 {
                    CardCommand::read_records(
                        tm.cla(),
                        tm.command_context(),
                        sfi,
                        record as u8,
                        false,
                        0,
                    )
                } else {
                    let expected = (count * (record_size + RECORD_HEADER_LENGTH)) as u8;
                    CardCommand::read_records(
                        tm.cla(),
                        tm.command_context(),
                        sfi,
                        record as u8,
                        true,
                        expected,
                    )
                };
                tm.commands.push(command);
                record += count;
            }
            Ok(())
        })
    }

    /// Read `nb_bytes` at `offset` of records `from..=to` (Read Record Multiple)
    pub fn prepare_read_records_partially(
        &mut self,
        sfi: u8,
        from_record: u8,
        to_record: u8,
        offset: u8,
        nb_bytes: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !matches!(
                tm.ctx.card.product_type(),
                ProductType::PrimeRevision3 | ProductType::Light
            ) {
                return Err(TransactionError::UnsupportedOperation(
                    "'Read Record Multiple' command not available for this card".into(),
                ));
            }
            check_sfi(sfi)?;
            check_record_number(from_record)?;
            check_record_number(to_record)?;
            if to_record < from_record {
                return Err(TransactionError::IllegalArgument(format!(
                    "to record {} before from record {}",
                    to_record, from_record
                )));
            }
            check_record_offset(offset)?;
            if nb_bytes == 0 || usize::from(offset) + usize::from(nb_bytes) > RECORD_SIZE_MAX {
                return Err(TransactionError::IllegalArgument(format!(
                    "{} bytes at offset {} out of the record",
                    nb_bytes, offset
                )));
            }
            let per_command = (tm.payload_capacity / usize::from(nb_bytes)).max(1);
            let mut record = usize::from(from_record);
            while record <= usize::from(to_record) {
                let command = CardCommand::read_records_partially(
                    tm.cla(),
                    tm.command_context(),
                    sfi,
                    record as u8,
                    offset,
                    nb_bytes,
                );
                tm.commands.push(command);
                record += per_command;
            }
            Ok(())
        })
    }

    /// Search Record Multiple; matching record numbers land in the card image
    pub fn prepare_search_records(
        &mut self,
        search: &SearchCommandData,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if tm.ctx.card.product_type() != ProductType::PrimeRevision3 {
                return Err(TransactionError::UnsupportedOperation(
                    "'Search Record Multiple' command not available for this card".into(),
                ));
            }
            check_sfi(search.sfi)?;
            check_record_number(search.first_record)?;
            check_record_offset(search.offset)?;
            let max_length = RECORD_SIZE_MAX - usize::from(search.offset);
            if search.search_data.is_empty() || search.search_data.len() > max_length {
                return Err(TransactionError::IllegalArgument(format!(
                    "search data length {} out of range 1..={}",
                    search.search_data.len(), max_length
                )));
            }
            if search.mask.len() > search.search_data.len() {
                return Err(TransactionError::IllegalArgument(format!(
                    "mask length {} longer than the search data",
                    search.mask.len()
                )));
            }
            let command = CardCommand::search_records(tm.cla(), tm.command_context(), search);
            tm.commands.push(command);
            Ok(())
        })
    }

    /// Read `nb_bytes` of a binary file from `offset`, in as many commands as needed
    pub fn prepare_read_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        nb_bytes: usize,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_binary_range(offset, nb_bytes)?;
            tm.select_binary_file_if_needed(sfi, offset);
            let mut current = offset;
            let mut remaining = nb_bytes;
            while remaining > 0 {
                let length = remaining.min(tm.payload_capacity);
                let command = CardCommand::read_binary(
                    tm.cla(),
                    tm.command_context(),
                    sfi,
                    current,
                    length as u8,
                );
                tm.commands.push(command);
                current += length as u16;
                remaining -= length;
            }
            Ok(())
        })
    }

    pub fn prepare_update_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_update_or_write_binary(false, sfi, offset, data)
    }

    /// Write Binary: the data is ORed with the current file content
    pub fn prepare_write_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_update_or_write_binary(true, sfi, offset, data)
    }

    fn prepare_update_or_write_binary(
        &mut self,
        write: bool,
        sfi: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !matches!(
                tm.ctx.card.product_type(),
                ProductType::PrimeRevision2 | ProductType::PrimeRevision3
            ) {
                return Err(TransactionError::UnsupportedOperation(
                    "Binary commands not available for this card".into(),
                ));
            }
            check_sfi(sfi)?;
            check_binary_range(offset, data.len())?;
            tm.select_binary_file_if_needed(sfi, offset);
            let mut current = offset;
            for chunk in data.chunks(tm.payload_capacity) {
                let command = CardCommand::update_or_write_binary(
                    tm.cla(),
                    tm.command_context(),
                    write,
                    sfi,
                    current,
                    chunk.to_vec(),
                );
                tm.enqueue_modifying(command)?;
                current += chunk.len() as u16;
            }
            Ok(())
        })
    }

    /// Offsets beyond the SFI addressing range need the file to be current
    ///
    /// Reading its first byte makes it so.
    fn select_binary_file_if_needed(&mut self, sfi: u8, offset: u16) {
        if sfi != 0 && offset > SFI_ADDRESSING_OFFSET_MAX {
            let command = CardCommand::read_binary(self.cla(), self.command_context(), sfi, 0, 1);
            self.commands.push(command);
        }
    }

    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_record_number(record_number)?;
            tm.check_data(data)?;
            let command = CardCommand::update_record(
                tm.cla(),
                tm.command_context(),
                sfi,
                record_number,
                data.to_vec(),
            );
            tm.enqueue_modifying(command)
        })
    }

    /// Write Record: the data is ORed with the current record content
    pub fn prepare_write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_record_number(record_number)?;
            tm.check_data(data)?;
            let command = CardCommand::write_record(
                tm.cla(),
                tm.command_context(),
                sfi,
                record_number,
                data.to_vec(),
            );
            tm.enqueue_modifying(command)
        })
    }

    pub fn prepare_append_record(
        &mut self,
        sfi: u8,
        data: &[u8],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            tm.check_data(data)?;
            let command = CardCommand::append_record(
                tm.cla(),
                tm.command_context(),
                sfi,
                data.to_vec(),
            );
            tm.enqueue_modifying(command)
        })
    }

    pub fn prepare_increase_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        value: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_increase_or_decrease_counter(false, sfi, counter_number, value)
    }

    pub fn prepare_decrease_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        value: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_increase_or_decrease_counter(true, sfi, counter_number, value)
    }

    fn prepare_increase_or_decrease_counter(
        &mut self,
        decrease: bool,
        sfi: u8,
        counter_number: u8,
        value: u32,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_sfi(sfi)?;
            check_counter(counter_number, value)?;
            let command =
                CardCommand::increase_or_decrease(
                    tm.cla(),
                    tm.command_context(),
                    decrease,
                    sfi,
                    counter_number,
                    value,
                );
            tm.enqueue_modifying(command)?;
            if tm.is_secure_session_open && tm.ctx.card.is_counter_value_postponed() {
                tm.nb_postponed_data += 1;
            }
            Ok(())
        })
    }

    /// Read the first `nb_counters` counters of a counters file
    pub fn prepare_read_counter(
        &mut self,
        sfi: u8,
        nb_counters: u8,
    ) -> Result<&mut Self, TransactionError> {
        if nb_counters == 0 || usize::from(nb_counters) * COUNTER_SIZE > self.payload_capacity {
            let err = TransactionError::IllegalArgument(format!(
                "{} counters do not fit in one read",
                nb_counters
            ));
            self.reset_transaction();
            return Err(err);
        }
        self.prepare_read_record(sfi, 1)
    }

    /// Increase several counters of one file, `counters` mapping counter numbers to values
    pub fn prepare_increase_counters(
        &mut self,
        sfi: u8,
        counters: &BTreeMap<u8, u32>,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_increase_or_decrease_counters(false, sfi, counters)
    }

    pub fn prepare_decrease_counters(
        &mut self,
        sfi: u8,
        counters: &BTreeMap<u8, u32>,
    ) -> Result<&mut Self, TransactionError> {
        self.prepare_increase_or_decrease_counters(true, sfi, counters)
    }

    fn prepare_increase_or_decrease_counters(
        &mut self,
        decrease: bool,
        sfi: u8,
        counters: &BTreeMap<u8, u32>,
    ) -> Result<&mut Self, TransactionError> {
        if counters.is_empty() {
            return self.run(|_| {
                Err(TransactionError::IllegalArgument("no counter to modify".into()))
            });
        }
        let multiple = matches!(
            self.ctx.card.product_type(),
            ProductType::PrimeRevision3 | ProductType::Light
        );
        if !multiple {
            for (counter_number, value) in counters {
                self.prepare_increase_or_decrease_counter(decrease, sfi, *counter_number, *value)?;
            }
            return Ok(self);
        }
        self.run(|tm| {
            check_sfi(sfi)?;
            for (counter_number, value) in counters {
                check_counter(*counter_number, *value)?;
            }
            let per_command = (tm.payload_capacity / COUNTER_ENTRY_LENGTH).max(1);
            let entries: Vec<(u8, u32)> = counters.iter().map(|(n, v)| (*n, *v)).collect();
            for chunk in entries.chunks(per_command) {
                let command = CardCommand::increase_or_decrease_multiple(
                    tm.cla(),
                    tm.command_context(),
                    decrease,
                    sfi,
                    chunk.iter().copied().collect(),
                );
                tm.enqueue_modifying(command)?;
            }
            Ok(())
        })
    }

    /// Bring a counter to `new_value`, from the value known by the card image
    pub fn prepare_set_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        new_value: u32,
    ) -> Result<&mut Self, TransactionError> {
        let current = self
            .ctx
            .card
            .file_by_sfi(sfi)
            .and_then(|file| file.data.counter_value(counter_number));
        let Some(current) = current else {
            self.reset_transaction();
            return Err(TransactionError::IllegalState(format!(
                "The value for counter {} in file {:02X} is not available",
                counter_number, sfi
            )));
        };
        match new_value.cmp(&current) {
            std::cmp::Ordering::Greater => self.prepare_increase_counter(
                sfi,
                counter_number,
                new_value - current,
            ),
            std::cmp::Ordering::Less => self.prepare_decrease_counter(
                sfi,
                counter_number,
                current - new_value,
            ),
            std::cmp::Ordering::Equal => {
                info!(
                    "Counter {} of file {:02X} already set to {}",
                    counter_number, sfi, new_value
                );
                Ok(self)
            }
        }
    }

    /// Read the PIN attempt counter; the result lands in the card image
    pub fn prepare_check_pin_status(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            tm.check_pin_feature()?;
            tm.check_no_secure_session()?;
            let command = CardCommand::verify_pin(tm.cla(), tm.command_context(), None, None);
            tm.commands.push(command);
            Ok(())
        })
    }

    pub fn prepare_verify_pin(&mut self, pin: &[u8]) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_pin(pin)?;
            tm.check_pin_feature()?;
            tm.check_no_secure_session()?;
            let (cla, context) = (tm.cla(), tm.command_context());
            if tm.setting.pin_plain_transmission_enabled {
                tm.commands.push(CardCommand::verify_pin(cla, context, Some(pin.to_vec()), None));
            } else {
                let key = tm.setting.pin_verification_ciphering_key;
                tm.commands.push(CardCommand::get_challenge(cla, context));
                tm.commands.push(CardCommand::verify_pin(
                    cla,
                    context,
                    Some(pin.to_vec()),
                    Some(key),
                ));
            }
            Ok(())
        })
    }

    pub fn prepare_change_pin(&mut self, new_pin: &[u8]) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            check_pin(new_pin)?;
            tm.check_pin_feature()?;
            tm.check_no_secure_session()?;
            let (cla, context) = (tm.cla(), tm.command_context());
            if tm.setting.pin_plain_transmission_enabled {
                tm.commands.push(CardCommand::change_pin(cla, context, new_pin.to_vec(), None));
            } else {
                let key = tm.setting.pin_modification_ciphering_key;
                tm.commands.push(CardCommand::get_challenge(cla, context));
                tm.commands.push(CardCommand::change_pin(
                    cla,
                    context,
                    new_pin.to_vec(),
                    Some(key),
                ));
            }
            Ok(())
        })
    }

    pub fn prepare_change_key(
        &mut self,
        key_index: u8,
        new_kif: u8,
        new_kvc: u8,
        issuer_kif: u8,
        issuer_kvc: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if tm.ctx.card.product_type() == ProductType::Basic {
                return Err(TransactionError::UnsupportedOperation(
                    "'Change Key' command not available for this card".into(),
                ));
            }
            tm.check_no_secure_session()?;
            if !(CHANGE_KEY_INDEX_MIN..=CHANGE_KEY_INDEX_MAX).contains(&key_index) {
                return Err(TransactionError::IllegalArgument(format!(
                    "key index {} out of range 1..=3",
                    key_index
                )));
            }
            let (cla, context) = (tm.cla(), tm.command_context());
            tm.commands.push(CardCommand::get_challenge(cla, context));
            tm.commands.push(CardCommand::change_key(
                cla,
                context,
                key_index,
                (issuer_kif, issuer_kvc),
                (new_kif, new_kvc),
            ));
            Ok(())
        })
    }

    pub fn prepare_invalidate(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if tm.ctx.card.is_df_invalidated() {
                return Err(TransactionError::IllegalState("Card already invalidated".into()));
            }
            let command = CardCommand::invalidate(tm.cla(), tm.command_context());
            tm.enqueue_modifying(command)
        })
    }

    pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !tm.ctx.card.is_df_invalidated() {
                return Err(TransactionError::IllegalState("Card not invalidated".into()));
            }
            let command = CardCommand::rehabilitate(tm.cla(), tm.command_context());
            tm.enqueue_modifying(command)
        })
    }

    pub fn prepare_sv_get(
        &mut self,
        operation: SvOperation,
        action: SvAction,
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !tm.ctx.card.is_sv_feature_available() {
                return Err(TransactionError::UnsupportedOperation(
                    "Stored Value is not available for this card.".into(),
                ));
            }
            let (cla, context) = (tm.cla(), tm.command_context());
            if tm.setting.sv_load_and_debit_log_enabled && !tm.is_extended_mode {
                // Non-extended cards return one log per SV Get
                let other = match operation {
                    SvOperation::Reload => SvOperation::Debit,
                    SvOperation::Debit => SvOperation::Reload,
                };
                tm.commands.push(CardCommand::sv_get(cla, context, other, false));
            }
            tm.commands.push(CardCommand::sv_get(cla, context, operation, tm.is_extended_mode));
            tm.sv.sv_get_prepared(operation, action);
            Ok(())
        })
    }

    pub fn prepare_sv_reload(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !(SV_LOAD_MIN_VALUE..=SV_LOAD_MAX_VALUE).contains(&amount) {
                return Err(TransactionError::IllegalArgument(format!(
                    "reload amount {} out of range",
                    amount
                )));
            }
            tm.sv
                .check_modifying_command(SvOperation::Reload, tm.is_secure_session_open)?;
            let command = CardCommand::sv_reload(
                tm.cla(),
                tm.command_context(),
                amount,
                date,
                time,
                free,
                tm.is_extended_mode,
            );
            tm.enqueue_sv_modifying(command)
        })
    }

    /// SV Debit, or SV Undebit when the SV Get announced [`SvAction::Undo`]
    pub fn prepare_sv_debit(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    ) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !(SV_DEBIT_MIN_VALUE..=SV_DEBIT_MAX_VALUE).contains(&amount) {
                return Err(TransactionError::IllegalArgument(format!(
                    "debit amount {} out of range",
                    amount
                )));
            }
            tm.sv
                .check_modifying_command(SvOperation::Debit, tm.is_secure_session_open)?;
            let command = CardCommand::sv_debit(
                tm.cla(),
                tm.command_context(),
                tm.sv.action() == SvAction::Undo,
                amount,
                date,
                time,
                tm.setting.sv_negative_balance_authorized,
                tm.is_extended_mode,
            );
            tm.enqueue_sv_modifying(command)
        })
    }

    /// SV Reload with zero date, time and free bytes
    pub fn prepare_sv_reload_amount(&mut self, amount: i32) -> Result<&mut Self, TransactionError> {
        self.prepare_sv_reload(amount, [0; 2], [0; 2], [0; 2])
    }

    /// SV Debit (or Undebit) with zero date and time
    pub fn prepare_sv_debit_amount(&mut self, amount: i32) -> Result<&mut Self, TransactionError> {
        self.prepare_sv_debit(amount, [0; 2], [0; 2])
    }

    /// Read the SV reload log file and every record of the SV debit log file
    ///
    /// The SV data already known by the card image is forgotten.
    pub fn prepare_sv_read_all_logs(&mut self) -> Result<&mut Self, TransactionError> {
        self.run(|tm| {
            if !tm.ctx.card.is_sv_feature_available() {
                return Err(TransactionError::UnsupportedOperation(
                    "Stored Value is not available for this card.".into(),
                ));
            }
            if tm.ctx.card.application_subtype() != SV_APPLICATION_SUBTYPE {
                return Err(TransactionError::UnsupportedOperation(
                    "The currently selected application is not an SV application.".into(),
                ));
            }
            tm.ctx.card.clear_sv_data();
            Ok(())
        })?;
        self.prepare_read_records(SV_RELOAD_LOG_FILE_SFI, 1, 1, SV_LOG_FILE_RECORD_SIZE)?
            .prepare_read_records(
                SV_DEBIT_LOG_FILE_SFI,
                1,
                SV_DEBIT_LOG_FILE_RECORDS,
                SV_LOG_FILE_RECORD_SIZE,
            )
    }

    fn enqueue_sv_modifying(&mut self, command: CardCommand) -> Result<(), TransactionError> {
        self.prepare_new_secure_session_if_needed(&command)?;
        if self.is_secure_session_open {
            self.sv.mark_operation_in_session();
            self.sv_postponed_data_index = Some(self.nb_postponed_data);
            self.nb_postponed_data += 1;
        }
        self.commands.push(command);
        Ok(())
    }

    /// Send every prepared command to the card
    ///
    /// With no pending command only the crypto service is synchronized.
    pub fn process_commands(
        &mut self,
        control: ChannelControl,
    ) -> Result<&mut Self, TransactionError> {
        let result = if self.commands.is_empty() {
            self.ctx.crypto.synchronize().map_err(TransactionError::from)
        } else {
            self.execute_commands(control)
        };
        self.commands.clear();
        if self.is_extended_mode && !self.ctx.card.is_extended_mode_supported() {
            self.is_extended_mode = false;
        }
        match result {
            Ok(()) => Ok(self),
            Err(e) => {
                self.reset_transaction();
                Err(e)
            }
        }
    }

    fn execute_commands(&mut self, control: ChannelControl) -> Result<(), TransactionError> {
        let commands = std::mem::take(&mut self.commands);
        let mut batch: Vec<CardCommand> = Vec::with_capacity(commands.len());
        for mut command in commands {
            if command.is_crypto_required_to_finalize()
                && !pipeline::synchronize_before_card_processing(&mut batch, &mut self.ctx)?
            {
                pipeline::execute_batch(
                    self.reader.as_mut(),
                    &mut batch,
                    &mut self.ctx,
                    ChannelControl::KeepOpen,
                    &self.audit,
                )?;
                batch.clear();
            }
            command.finalize_request(&mut self.ctx)?;
            batch.push(command);
        }
        pipeline::execute_batch(
            self.reader.as_mut(),
            &mut batch,
            &mut self.ctx,
            control,
            &self.audit,
        )?;
        self.ctx.crypto.synchronize()?;
        Ok(())
    }

    /// Drop everything pending and abort the card session if one is open
    ///
    /// Never fails; calling it twice is the same as calling it once.
    pub fn reset_transaction(&mut self) {
        self.reset_command_context();
        self.buffer.reset();
        self.nb_postponed_data = 0;
        self.sv_postponed_data_index = None;
        self.sv.reset();
        self.disable_pre_open_mode();
        self.commands.clear();
        if self.ctx.secure_session_open {
            let mut abort = vec![CardCommand::abort_session(self.cla(), self.command_context())];
            if let Err(e) = pipeline::execute_batch(
                self.reader.as_mut(),
                &mut abort,
                &mut self.ctx,
                ChannelControl::KeepOpen,
                &self.audit,
            ) {
                debug!("Secure session abortion error: {}", e);
            }
            self.ctx.card.restore_files();
            self.ctx.secure_session_open = false;
        }
    }

    /// Let the crypto service prepare the next secure session ahead of time
    pub fn init_crypto_context_for_next_transaction(&mut self) -> Result<(), TransactionError> {
        if !self.commands.is_empty() {
            return Err(TransactionError::IllegalState(
                "Unprocessed card commands are pending".into(),
            ));
        }
        self.ctx.crypto.pre_init_terminal_secure_session_context()?;
        Ok(())
    }
}

fn check_sfi(sfi: u8) -> Result<(), TransactionError> {
    if sfi > SFI_MAX {
        return Err(TransactionError::IllegalArgument(format!(
            "SFI {} out of range 0..={}",
            sfi, SFI_MAX
        )));
    }
    Ok(())
}

fn check_record_number(record_number: u8) -> Result<(), TransactionError> {
    if !(RECORD_NUMBER_MIN..=RECORD_NUMBER_MAX).contains(&record_number) {
        return Err(TransactionError::IllegalArgument(format!(
            "record number {} out of range {}..={}",
            record_number, RECORD_NUMBER_MIN, RECORD_NUMBER_MAX
        )));
    }
    Ok(())
}

fn check_record_offset(offset: u8) -> Result<(), TransactionError> {
    if offset > RECORD_OFFSET_MAX {
        return Err(TransactionError::IllegalArgument(format!(
            "offset {} out of range 0..={}",
            offset, RECORD_OFFSET_MAX
        )));
    }
    Ok(())
}

fn check_binary_range(offset: u16, length: usize) -> Result<(), TransactionError> {
    if offset > BINARY_OFFSET_MAX {
        return Err(TransactionError::IllegalArgument(format!(
            "offset {} out of range 0..={}",
            offset, BINARY_OFFSET_MAX
        )));
    }
    if length == 0 || usize::from(offset) + length > usize::from(BINARY_OFFSET_MAX) + 1 {
        return Err(TransactionError::IllegalArgument(format!(
            "{} bytes at offset {} out of the file",
            length, offset
        )));
    }
    Ok(())
}

fn check_counter(counter_number: u8, value: u32) -> Result<(), TransactionError> {
    if !(1..=COUNTER_NUMBER_MAX).contains(&counter_number) {
        return Err(TransactionError::IllegalArgument(format!(
            "counter number {} out of range 1..={}",
            counter_number, COUNTER_NUMBER_MAX
        )));
    }
    if value > COUNTER_VALUE_MAX {
        return Err(TransactionError::IllegalArgument(format!(
            "counter value {} out of range",
            value
        )));
    }
    Ok(())
}

fn check_pin(pin: &[u8]) -> Result<(), TransactionError> {
    if pin.len() != PIN_LENGTH {
        return Err(TransactionError::IllegalArgument(format!(
            "PIN length {} instead of {}",
            pin.len(), PIN_LENGTH
        )));
    }
    Ok(())
}
