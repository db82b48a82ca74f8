//! Virtual Calypso card
//!
//! A card application answering the commands sent by the transaction engine.
//! Secure sessions are emulated with their rollback, the modifications buffer,
//! postponed data and the same MAC scheme as the software SAM, so a complete
//! transaction can run against it.

use std::collections::BTreeMap;

use log::debug;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::apdu::{ins, Response, APDU, SW};
use crate::card::file::COUNTER_SIZE;
use crate::card::sv_log::{SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE};
use crate::card::calypso_card::SV_APPLICATION_SUBTYPE;
use crate::card::{
    CalypsoCard, DirectoryHeader, FileData, FileHeader, FileType, ProductType, WriteAccessLevel,
};
use crate::command::{ef_list, fci, fcp_for_directory, fcp_for_file};
use crate::crypto::soft_sam::{card_session_mac, card_sv_mac, terminal_session_mac, terminal_sv_mac};
use crate::crypto::TDesOperations;

/// Serial number reported by every virtual card
pub const SERIAL_NUMBER: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78];

const CHALLENGE_LENGTH: usize = 8;
const PIN_LENGTH: usize = 4;
const PIN_MAX_ATTEMPTS: u8 = 3;
const CIPHERED_PIN_LENGTH: usize = 8;
const CIPHERED_NEW_PIN_LENGTH: usize = 16;
const CIPHERED_KEY_LENGTH: usize = 32;
const CHANGE_PIN_P2: u8 = 0xFF;
const DEFAULT_KVC: u8 = 0x79;
const DEFAULT_KIFS: [u8; 3] = [0x21, 0x27, 0x30];
const DEFAULT_BUFFER_SIZE: usize = 430;
const DEFAULT_PIN: &[u8] = b"1234";
const DEFAULT_PAYLOAD_CAPACITY: usize = 250;
/// Name of the DF answered in the FCI
pub const DF_NAME: [u8; 8] = [0x31, 0x54, 0x49, 0x43, 0x2E, 0x49, 0x43, 0x41];
const DF_LID: u16 = 0x2000;
const TRACEABILITY_INFORMATION: [u8; 10] =
    [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
const READ_PARTIALLY_TAG: u8 = 0x54;
const SEARCH_REPEATED_OFFSET: u8 = 0x80;
const SEARCH_FETCH_FIRST: u8 = 0x01;
const BINARY_SFI_ADDRESSING: u8 = 0x80;
const COUNTER_MAX: u32 = 0x00FF_FFFF;
const SV_BALANCE_MIN: i32 = -8_388_608;
const SV_BALANCE_MAX: i32 = 8_388_607;
const SV_GET_RELOAD_P2: u8 = 0x07;
const SV_GET_DEBIT_P2: u8 = 0x09;
const SV_RELOAD_PARTIAL_SIZE: usize = 10;
const SV_DEBIT_PARTIAL_SIZE: usize = 7;
const SAM_ID_SIZE: usize = 4;
const SAM_TNUM_SIZE: usize = 3;

fn signed_24(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    (raw << 8) >> 8
}

fn hash_pin(pin: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(pin);
    hasher.finalize().to_vec()
}

/// Stored Value purse
#[derive(Debug, Clone, PartialEq, Eq)]
struct Purse {
    kvc: u8,
    balance: i32,
    tnum: u16,
    load_log: Vec<u8>,
    debit_log: Vec<u8>,
}

impl Default for Purse {
    fn default() -> Self {
        Self {
            kvc: DEFAULT_KVC,
            balance: 0,
            tnum: 0,
            load_log: vec![0u8; SV_LOAD_LOG_SIZE],
            debit_log: vec![0u8; SV_DEBIT_LOG_SIZE],
        }
    }
}

/// Everything a session abort brings back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Persistent {
    files: BTreeMap<u8, FileData>,
    purse: Purse,
    df_invalidated: bool,
}

#[derive(Debug)]
struct Session {
    extended: bool,
    digest: Vec<u8>,
    buffer_remaining: i32,
    postponed: Vec<Vec<u8>>,
    sv_done: bool,
    encryption: bool,
    backup: Persistent,
}

/// Card side of the Calypso secure session protocol
pub struct VirtualCalypsoCard {
    key: Vec<u8>,
    extended_mode_supported: bool,
    buffer_size: usize,
    buffer_in_bytes: bool,
    counter_value_postponed: bool,
    state: Persistent,
    session: Option<Session>,
    key_references: [(u8, u8); 3],
    df_ratified: bool,
    ratification_pending: bool,
    pin_hash: Vec<u8>,
    pin_attempts: u8,
    pin_verified: bool,
    challenge: Option<Vec<u8>>,
    /// P2 of the SV Get the next SV operation must follow
    sv_get: Option<u8>,
    pre_open: Option<(u8, Vec<u8>)>,
    present: bool,
    payload_capacity: usize,
    headers: BTreeMap<u8, FileHeader>,
    /// SFI of the current EF
    current_sfi: Option<u8>,
}

impl VirtualCalypsoCard {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            extended_mode_supported: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_in_bytes: true,
            counter_value_postponed: false,
            state: Persistent::default(),
            session: None,
            key_references: [
                (DEFAULT_KIFS[0], DEFAULT_KVC),
                (DEFAULT_KIFS[1], DEFAULT_KVC),
                (DEFAULT_KIFS[2], DEFAULT_KVC),
            ],
            df_ratified: true,
            ratification_pending: false,
            pin_hash: hash_pin(DEFAULT_PIN),
            pin_attempts: PIN_MAX_ATTEMPTS,
            pin_verified: false,
            challenge: None,
            sv_get: None,
            pre_open: None,
            present: true,
            payload_capacity: DEFAULT_PAYLOAD_CAPACITY,
            headers: BTreeMap::new(),
            current_sfi: None,
        }
    }

    pub fn with_payload_capacity(mut self, capacity: usize) -> Self {
        self.payload_capacity = capacity;
        self
    }

    /// Header answered by Select File and Get Data for the file `sfi`
    pub fn with_file_header(mut self, sfi: u8, header: FileHeader) -> Self {
        self.headers.insert(sfi, header);
        self
    }

    /// Add a binary file of `content.len()` bytes
    pub fn with_binary_file(mut self, sfi: u8, lid: u16, content: &[u8]) -> Self {
        let mut data = FileData::new();
        data.set_content(1, content);
        self.state.files.insert(sfi, data);
        self.with_file_header(
            sfi,
            FileHeader {
                lid,
                records_number: 1,
                record_size: content.len() as u16,
                ef_type: FileType::Binary,
                access_conditions: vec![0x1F, 0x00, 0x00, 0x00],
                key_indexes: vec![0x01, 0x01, 0x01, 0x01],
                df_status: 0,
                shared_reference: None,
            },
        )
    }

    pub fn with_extended_mode(mut self, supported: bool) -> Self {
        self.extended_mode_supported = supported;
        self
    }

    pub fn with_modifications_buffer(mut self, size: usize, in_bytes: bool) -> Self {
        self.buffer_size = size;
        self.buffer_in_bytes = in_bytes;
        self
    }

    pub fn with_counter_value_postponed(mut self, postponed: bool) -> Self {
        self.counter_value_postponed = postponed;
        self
    }

    pub fn with_pin(mut self, pin: &[u8]) -> Self {
        self.pin_hash = hash_pin(pin);
        self
    }

    /// Add a record file; records are numbered from 1
    pub fn with_file(mut self, sfi: u8, records: &[&[u8]]) -> Self {
        let mut data = FileData::new();
        for (i, record) in records.iter().enumerate() {
            data.set_content(i as u8 + 1, record);
        }
        self.state.files.insert(sfi, data);
        self
    }

    /// Add a counters file; counters are numbered from 1
    pub fn with_counters(mut self, sfi: u8, values: &[u32]) -> Self {
        let mut data = FileData::new();
        for (i, value) in values.iter().enumerate() {
            data.set_counter(i as u8 + 1, &value.to_be_bytes()[1..]);
        }
        self.state.files.insert(sfi, data);
        self
    }

    pub fn with_sv_balance(mut self, balance: i32) -> Self {
        self.state.purse.balance = balance;
        self
    }

    pub fn with_df_invalidated(mut self, invalidated: bool) -> Self {
        self.state.df_invalidated = invalidated;
        self
    }

    /// Terminal-side image of this card, as built at selection
    pub fn card_image(&self) -> CalypsoCard {
        CalypsoCard::new(SERIAL_NUMBER.to_vec(), ProductType::PrimeRevision3)
            .with_modifications_counter(self.buffer_size, self.buffer_in_bytes)
            .with_extended_mode(self.extended_mode_supported)
            .with_pin_feature(true)
            .with_sv_feature(true)
            .with_counter_value_postponed(self.counter_value_postponed)
            .with_df_invalidated(self.state.df_invalidated)
            .with_payload_capacity(self.payload_capacity)
            .with_application_subtype(SV_APPLICATION_SUBTYPE)
    }

    /// Content of a binary file
    pub fn binary(&self, sfi: u8) -> Option<Vec<u8>> {
        self.record(sfi, 1)
    }

    pub fn record(&self, sfi: u8, record_number: u8) -> Option<Vec<u8>> {
        self.state
            .files
            .get(&sfi)
            .and_then(|f| f.content(record_number))
            .map(<[u8]>::to_vec)
    }

    pub fn counter(&self, sfi: u8, counter_number: u8) -> Option<u32> {
        self.state.files.get(&sfi).and_then(|f| f.counter_value(counter_number))
    }

    pub fn sv_balance(&self) -> i32 {
        self.state.purse.balance
    }

    pub fn sv_tnum(&self) -> u16 {
        self.state.purse.tnum
    }

    pub fn is_df_invalidated(&self) -> bool {
        self.state.df_invalidated
    }

    pub fn is_df_ratified(&self) -> bool {
        self.df_ratified
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn pin_attempts(&self) -> u8 {
        self.pin_attempts
    }

    /// (KIF, KVC) of the key at `key_index` (1..=3)
    pub fn key_reference(&self, key_index: u8) -> Option<(u8, u8)> {
        self.key_references.get(key_index.checked_sub(1)? as usize).copied()
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Take the card out of the field; an open session is lost
    pub fn remove(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Virtual card removed, secure session rolled back");
            self.state = session.backup;
        }
        self.present = false;
        self.challenge = None;
        self.pin_verified = false;
    }

    pub fn insert(&mut self) {
        self.present = true;
    }

    /// Open Secure Session output prepared at selection time
    ///
    /// The next opening at the same level without a record read answers this
    /// exact data.
    pub fn pre_open(&mut self, level: WriteAccessLevel) -> Vec<u8> {
        let key_index = level.key_index();
        let data_out = self.open_session_data_out(key_index, self.extended_mode_supported, &[]);
        self.pre_open = Some((key_index, data_out.clone()));
        data_out
    }

    /// Process one command APDU
    pub fn process_apdu(&mut self, cmd: &APDU) -> Response {
        debug!(
            "Virtual card APDU: CLA={:02X} INS={:02X} P1={:02X} P2={:02X} Lc={}",
            cmd.cla, cmd.ins, cmd.p1, cmd.p2, cmd.data.len()
        );
        if std::mem::take(&mut self.ratification_pending) && cmd.ins != ins::OPEN_SECURE_SESSION {
            self.df_ratified = true;
        }

        let response = match cmd.ins {
            ins::OPEN_SECURE_SESSION => self.handle_open_session(cmd),
            ins::CLOSE_SECURE_SESSION => self.handle_close_session(cmd),
            ins::MANAGE_SECURE_SESSION => self.handle_manage_session(cmd),
            ins::GET_CHALLENGE => self.handle_get_challenge(cmd),
            ins::READ_RECORDS => self.handle_read_records(cmd),
            ins::VERIFY_PIN => self.handle_verify_pin(cmd),
            ins::CHANGE_PIN if cmd.p2 == CHANGE_PIN_P2 => self.handle_change_pin(cmd),
            ins::CHANGE_KEY => self.handle_change_key(cmd),
            ins::SV_GET => self.handle_sv_get(cmd),
            ins::READ_BINARY => self.handle_read_binary(cmd),
            ins::READ_RECORD_MULTIPLE => self.handle_read_record_multiple(cmd),
            ins::SEARCH_RECORD_MULTIPLE => self.handle_search_record_multiple(cmd),
            ins::SELECT_FILE => self.handle_select_file(cmd),
            ins::GET_DATA => self.handle_get_data(cmd),
            ins::UPDATE_RECORD
            | ins::WRITE_RECORD
            | ins::APPEND_RECORD
            | ins::INCREASE
            | ins::DECREASE
            | ins::INCREASE_MULTIPLE
            | ins::DECREASE_MULTIPLE
            | ins::UPDATE_BINARY
            | ins::WRITE_BINARY
            | ins::INVALIDATE
            | ins::REHABILITATE
            | ins::SV_RELOAD
            | ins::SV_DEBIT
            | ins::SV_UNDEBIT => self.handle_modifying(cmd),
            _ => Response::error(SW::INS_NOT_SUPPORTED),
        };

        let session_command = matches!(
            cmd.ins,
            ins::OPEN_SECURE_SESSION | ins::CLOSE_SECURE_SESSION | ins::MANAGE_SECURE_SESSION
        );
        if !session_command {
            if let Some(session) = self.session.as_mut() {
                session.digest.extend_from_slice(&cmd.to_bytes());
                session.digest.extend_from_slice(&response.to_bytes());
            }
        }
        response
    }

    fn random(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    fn open_session_data_out(&self, key_index: u8, extended: bool, record_data: &[u8]) -> Vec<u8> {
        let (kif, kvc) = self.key_references[key_index as usize - 1];
        let mut data_out = Self::random(if extended { 8 } else { 4 });
        data_out.push(if self.df_ratified { 0x00 } else { 0x01 });
        data_out.push(kif);
        data_out.push(kvc);
        data_out.push(record_data.len() as u8);
        data_out.extend_from_slice(record_data);
        data_out
    }

    fn rollback(&mut self) {
        if let Some(session) = self.session.take() {
            self.state = session.backup;
        }
    }

    fn handle_open_session(&mut self, cmd: &APDU) -> Response {
        let key_index = cmd.p1 & 0x07;
        let record = cmd.p1 >> 3;
        let sfi = cmd.p2 >> 3;
        if !(1..=3).contains(&key_index) {
            return Response::error(SW::WRONG_P1_P2);
        }
        let extended = cmd.p2 & 0x03 == 0x02 && self.extended_mode_supported;
        // A new opening cancels a pending session
        self.rollback();

        let record_data = if record != 0 {
            match self.state.files.get(&sfi) {
                Some(file) => file.content(record).map(<[u8]>::to_vec).unwrap_or_default(),
                None => return Response::error(SW::FILE_NOT_FOUND),
            }
        } else {
            Vec::new()
        };
        let data_out = match self.pre_open.take() {
            Some((pre_open_index, data_out)) if pre_open_index == key_index && record == 0 => {
                data_out
            }
            _ => self.open_session_data_out(key_index, extended, &record_data),
        };
        self.session = Some(Session {
            extended,
            digest: data_out.clone(),
            buffer_remaining: i32::try_from(self.buffer_size).unwrap_or(i32::MAX),
            postponed: Vec::new(),
            sv_done: false,
            encryption: false,
            backup: self.state.clone(),
        });
        self.df_ratified = false;
        Response::success(data_out)
    }

    fn handle_close_session(&mut self, cmd: &APDU) -> Response {
        let Some(session) = self.session.take() else {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        };
        if cmd.data.is_empty() {
            debug!("Virtual card session aborted");
            self.state = session.backup;
            return Response::ok();
        }
        let terminal_mac = terminal_session_mac(&self.key, &session.digest, session.extended);
        if terminal_mac.ok().as_deref() != Some(cmd.data.as_slice()) {
            debug!("Virtual card rejected the terminal session MAC");
            self.state = session.backup;
            return Response::error(SW::INCORRECT_SM_DATA_OBJECTS);
        }
        let card_mac = match card_session_mac(&self.key, &session.digest, session.extended) {
            Ok(mac) => mac,
            Err(_) => {
                self.state = session.backup;
                return Response::error(SW::UNKNOWN_ERROR);
            }
        };

        let mut data = Vec::new();
        for entry in &session.postponed {
            data.push(entry.len() as u8);
            data.extend_from_slice(entry);
        }
        data.extend(card_mac);
        if cmd.p1 & 0x80 != 0 {
            self.df_ratified = true;
        } else {
            self.ratification_pending = true;
        }
        Response::success(data)
    }

    fn handle_manage_session(&mut self, cmd: &APDU) -> Response {
        let key = self.key.clone();
        let Some(session) = self.session.as_mut() else {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        };
        if !session.extended {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        session.encryption = cmd.p2 & 0x02 != 0;
        if cmd.p2 & 0x01 == 0 {
            return Response::ok();
        }
        match terminal_session_mac(&key, &session.digest, true) {
            Ok(mac) if mac == cmd.data => {}
            _ => return Response::error(SW::INCORRECT_SM_DATA_OBJECTS),
        }
        match card_session_mac(&key, &session.digest, true) {
            Ok(mac) => Response::success(mac),
            Err(_) => Response::error(SW::UNKNOWN_ERROR),
        }
    }

    fn handle_get_challenge(&mut self, _cmd: &APDU) -> Response {
        let challenge = Self::random(CHALLENGE_LENGTH);
        self.challenge = Some(challenge.clone());
        Response::success(challenge)
    }

    fn handle_read_records(&mut self, cmd: &APDU) -> Response {
        if cmd.p1 == 0 {
            return Response::error(SW::WRONG_P1_P2);
        }
        let sfi = cmd.p2 >> 3;
        let Some(file) = self.state.files.get(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        match cmd.p2 & 0x07 {
            0x04 => match file.content(cmd.p1) {
                Some(content) => Response::success(content.to_vec()),
                None => Response::error(SW::RECORD_NOT_FOUND),
            },
            0x05 => {
                let limit = match cmd.le {
                    Some(le) if le > 0 => le as usize,
                    _ => self.payload_capacity,
                };
                let mut data = Vec::new();
                for (number, content) in file.all_records().range(cmd.p1..) {
                    if data.len() + 2 + content.len() > limit {
                        break;
                    }
                    data.push(*number);
                    data.push(content.len() as u8);
                    data.extend_from_slice(content);
                }
                if data.is_empty() {
                    return Response::error(SW::RECORD_NOT_FOUND);
                }
                Response::success(data)
            }
            _ => Response::error(SW::WRONG_P1_P2),
        }
    }

    fn handle_modifying(&mut self, cmd: &APDU) -> Response {
        if let Some(session) = self.session.as_mut() {
            let cost = if self.buffer_in_bytes {
                cmd.to_bytes().len() as i32 + 1
            } else {
                1
            };
            if session.buffer_remaining < cost {
                return Response::error(SW::SESSION_BUFFER_OVERFLOW);
            }
            session.buffer_remaining -= cost;
        }
        match cmd.ins {
            ins::INVALIDATE => {
                if self.state.df_invalidated {
                    return Response::error(SW::CONDITIONS_NOT_SATISFIED);
                }
                self.state.df_invalidated = true;
                Response::ok()
            }
            ins::REHABILITATE => {
                self.state.df_invalidated = false;
                Response::ok()
            }
            ins::SV_RELOAD | ins::SV_DEBIT | ins::SV_UNDEBIT => self.handle_sv_operation(cmd),
            ins::INCREASE | ins::DECREASE => self.handle_counter(cmd),
            ins::INCREASE_MULTIPLE | ins::DECREASE_MULTIPLE => self.handle_counters(cmd),
            ins::UPDATE_BINARY | ins::WRITE_BINARY => self.handle_binary_write(cmd),
            _ => self.handle_record_write(cmd),
        }
    }

    fn handle_record_write(&mut self, cmd: &APDU) -> Response {
        let sfi = cmd.p2 >> 3;
        if sfi == 0 {
            return Response::error(SW::COMMAND_NOT_ALLOWED_NO_EF);
        }
        if cmd.data.is_empty() {
            return Response::error(SW::WRONG_LENGTH);
        }
        let Some(file) = self.state.files.get_mut(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        self.current_sfi = Some(sfi);
        match cmd.ins {
            ins::UPDATE_RECORD if cmd.p1 != 0 => file.set_content(cmd.p1, &cmd.data),
            ins::WRITE_RECORD if cmd.p1 != 0 => file.fill_content(cmd.p1, &cmd.data),
            ins::APPEND_RECORD => file.add_cyclic_content(&cmd.data),
            _ => return Response::error(SW::RECORD_NOT_FOUND),
        }
        Response::ok()
    }

    fn handle_counter(&mut self, cmd: &APDU) -> Response {
        if cmd.data.len() != COUNTER_SIZE {
            return Response::error(SW::WRONG_LENGTH);
        }
        let sfi = cmd.p2 >> 3;
        let Some(file) = self.state.files.get_mut(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        let value = ((cmd.data[0] as u32) << 16) | ((cmd.data[1] as u32) << 8) | cmd.data[2] as u32;
        let current = file.counter_value(cmd.p1).unwrap_or(0);
        let new_value = if cmd.ins == ins::DECREASE {
            current.checked_sub(value)
        } else {
            current.checked_add(value).filter(|v| *v <= COUNTER_MAX)
        };
        let Some(new_value) = new_value else {
            return Response::error(SW::WRONG_DATA);
        };
        let encoded = new_value.to_be_bytes()[1..].to_vec();
        file.set_counter(cmd.p1, &encoded);

        match self.session.as_mut() {
            Some(session) if self.counter_value_postponed => {
                session.postponed.push(encoded);
                Response::ok()
            }
            _ => Response::success(encoded),
        }
    }

    /// File and offset of a binary command, selecting the file when addressed by SFI
    fn binary_target(&mut self, cmd: &APDU) -> Option<(u8, usize)> {
        if cmd.p1 & BINARY_SFI_ADDRESSING != 0 {
            let sfi = cmd.p1 & 0x1F;
            self.current_sfi = Some(sfi);
            Some((sfi, usize::from(cmd.p2)))
        } else {
            let offset = (usize::from(cmd.p1 & 0x7F) << 8) | usize::from(cmd.p2);
            self.current_sfi.map(|sfi| (sfi, offset))
        }
    }

    fn binary_size(&self, sfi: u8) -> usize {
        match self.headers.get(&sfi) {
            Some(header) => usize::from(header.record_size),
            None => self.state.files.get(&sfi).and_then(|f| f.content(1)).map_or(0, <[u8]>::len),
        }
    }

    fn handle_read_binary(&mut self, cmd: &APDU) -> Response {
        let Some((sfi, offset)) = self.binary_target(cmd) else {
            return Response::error(SW::COMMAND_NOT_ALLOWED_NO_EF);
        };
        let Some(file) = self.state.files.get(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        let size = self.binary_size(sfi);
        let length = match cmd.le {
            Some(le) if le > 0 => le as usize,
            _ => size.saturating_sub(offset),
        };
        if length == 0 || offset + length > size {
            return Response::error(SW::WRONG_P1_P2);
        }
        let mut content = file.content(1).map(<[u8]>::to_vec).unwrap_or_default();
        content.resize(size, 0);
        Response::success(content[offset..offset + length].to_vec())
    }

    fn handle_binary_write(&mut self, cmd: &APDU) -> Response {
        if cmd.data.is_empty() {
            return Response::error(SW::WRONG_LENGTH);
        }
        let Some((sfi, offset)) = self.binary_target(cmd) else {
            return Response::error(SW::COMMAND_NOT_ALLOWED_NO_EF);
        };
        if offset + cmd.data.len() > self.binary_size(sfi) {
            return Response::error(SW::WRONG_P1_P2);
        }
        let Some(file) = self.state.files.get_mut(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        if cmd.ins == ins::WRITE_BINARY {
            file.fill_content_at(1, &cmd.data, offset);
        } else {
            file.set_content_at(1, &cmd.data, offset);
        }
        Response::ok()
    }

    fn handle_read_record_multiple(&mut self, cmd: &APDU) -> Response {
        let sfi = cmd.p2 >> 3;
        if cmd.p1 == 0 || cmd.p2 & 0x07 != 0x05 {
            return Response::error(SW::WRONG_P1_P2);
        }
        let [READ_PARTIALLY_TAG, 0x02, offset, length] = cmd.data[..] else {
            return Response::error(SW::WRONG_DATA);
        };
        let (offset, length) = (usize::from(offset), usize::from(length));
        let Some(file) = self.state.files.get(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        self.current_sfi = Some(sfi);
        let mut data = Vec::new();
        for (_, content) in file.all_records().range(cmd.p1..) {
            if data.len() + length > self.payload_capacity {
                break;
            }
            let mut part = content.get(offset..).unwrap_or_default().to_vec();
            part.resize(length, 0);
            data.extend(part);
        }
        if data.is_empty() {
            return Response::error(SW::RECORD_NOT_FOUND);
        }
        Response::success(data)
    }

    fn handle_search_record_multiple(&mut self, cmd: &APDU) -> Response {
        let sfi = cmd.p2 >> 3;
        if cmd.p1 == 0 || cmd.p2 & 0x07 != 0x07 {
            return Response::error(SW::WRONG_P1_P2);
        }
        if cmd.data.len() < 3 {
            return Response::error(SW::WRONG_LENGTH);
        }
        let (flags, offset, length) = (
            cmd.data[0],
            usize::from(cmd.data[1]),
            usize::from(cmd.data[2]),
        );
        if cmd.data.len() != 3 + 2 * length {
            return Response::error(SW::WRONG_LENGTH);
        }
        let (search, mask) = cmd.data[3..].split_at(length);
        let Some(file) = self.state.files.get(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        self.current_sfi = Some(sfi);
        let matches_at = |content: &[u8], at: usize| {
            content.get(at..at + length).is_some_and(|window| {
                window
                    .iter()
                    .zip(search)
                    .zip(mask)
                    .all(|((c, s), m)| c & m == s & m)
            })
        };
        let mut matching = Vec::new();
        for (number, content) in file.all_records().range(cmd.p1..) {
            let found = if flags & SEARCH_REPEATED_OFFSET != 0 {
                (offset..content.len()).any(|at| matches_at(content, at))
            } else {
                matches_at(content, offset)
            };
            if found {
                matching.push(*number);
            }
        }
        let mut data = vec![matching.len() as u8];
        data.extend_from_slice(&matching);
        if flags & SEARCH_FETCH_FIRST != 0 {
            if let Some(content) = matching.first().and_then(|n| file.content(*n)) {
                data.extend_from_slice(content);
            }
        }
        Response::success(data)
    }

    fn handle_counters(&mut self, cmd: &APDU) -> Response {
        if cmd.data.is_empty() || cmd.data.len() % (COUNTER_SIZE + 1) != 0 {
            return Response::error(SW::WRONG_LENGTH);
        }
        let sfi = cmd.p2 >> 3;
        let Some(file) = self.state.files.get_mut(&sfi) else {
            return Response::error(SW::FILE_NOT_FOUND);
        };
        // Check every counter before touching any of them
        let mut updates = Vec::new();
        for entry in cmd.data.chunks_exact(COUNTER_SIZE + 1) {
            let value = ((entry[1] as u32) << 16) | ((entry[2] as u32) << 8) | entry[3] as u32;
            let current = file.counter_value(entry[0]).unwrap_or(0);
            let new_value = if cmd.ins == ins::DECREASE_MULTIPLE {
                current.checked_sub(value)
            } else {
                current.checked_add(value).filter(|v| *v <= COUNTER_MAX)
            };
            let Some(new_value) = new_value else {
                return Response::error(SW::WRONG_DATA);
            };
            updates.push((entry[0], new_value));
        }
        let mut data = Vec::with_capacity(cmd.data.len());
        for (counter_number, value) in updates {
            let encoded = &value.to_be_bytes()[1..];
            file.set_counter(counter_number, encoded);
            data.push(counter_number);
            data.extend_from_slice(encoded);
        }
        self.current_sfi = Some(sfi);
        Response::success(data)
    }

    fn directory_header(&self) -> DirectoryHeader {
        DirectoryHeader {
            lid: DF_LID,
            access_conditions: vec![0x10, 0x10, 0x10, 0x10],
            key_indexes: vec![0x01, 0x02, 0x03, 0x01],
            df_status: u8::from(self.state.df_invalidated),
            kifs: DEFAULT_KIFS,
            kvcs: [self.key_references[0].1, self.key_references[1].1, self.key_references[2].1],
        }
    }

    fn fcp_for_current_file(&self) -> Response {
        match self.current_sfi.and_then(|sfi| self.headers.get(&sfi).map(|h| (sfi, h))) {
            Some((sfi, header)) => Response::success(fcp_for_file(sfi, header)),
            None => Response::error(SW::DATA_NOT_FOUND),
        }
    }

    fn handle_select_file(&mut self, cmd: &APDU) -> Response {
        match (cmd.p1, cmd.p2) {
            (0x02, 0x00) => {
                self.current_sfi = self.headers.keys().next().copied();
                self.fcp_for_current_file()
            }
            (0x02, 0x02) => {
                let next = match self.current_sfi {
                    Some(current) => self.headers.range(current + 1..).next().map(|(sfi, _)| *sfi),
                    None => self.headers.keys().next().copied(),
                };
                match next {
                    Some(sfi) => {
                        self.current_sfi = Some(sfi);
                        self.fcp_for_current_file()
                    }
                    None => Response::error(SW::FILE_NOT_FOUND),
                }
            }
            (0x08 | 0x09, 0x00) => {
                let [high, low] = cmd.data[..] else {
                    return Response::error(SW::WRONG_LENGTH);
                };
                let lid = u16::from_be_bytes([high, low]);
                if cmd.p1 == 0x09 && lid == 0 {
                    return Response::success(fcp_for_directory(&self.directory_header()));
                }
                let found = self
                    .headers
                    .iter()
                    .find(|(_, header)| header.lid == lid)
                    .map(|(sfi, _)| *sfi);
                match found {
                    Some(sfi) => {
                        self.current_sfi = Some(sfi);
                        self.fcp_for_current_file()
                    }
                    None => Response::error(SW::FILE_NOT_FOUND),
                }
            }
            _ => Response::error(SW::WRONG_P1_P2),
        }
    }

    fn handle_get_data(&mut self, cmd: &APDU) -> Response {
        match (cmd.p1, cmd.p2) {
            (0x00, 0x62) => self.fcp_for_current_file(),
            (0x00, 0x6F) => {
                let startup_info = [0x0A, 0x3C, 0x2F, SV_APPLICATION_SUBTYPE, 0x14, 0x03, 0x01];
                Response::success(fci(&DF_NAME, &SERIAL_NUMBER, &startup_info))
            }
            (0x00, 0xC0) => Response::success(ef_list(
                self.headers.iter().map(|(sfi, h)| (*sfi, h)),
            )),
            (0x01, 0x85) => Response::success(TRACEABILITY_INFORMATION.to_vec()),
            _ => Response::error(SW::DATA_NOT_FOUND),
        }
    }

    fn check_pin(&mut self, pin: &[u8]) -> Response {
        if self.pin_attempts == 0 {
            return Response::error(SW::AUTH_METHOD_BLOCKED);
        }
        if hash_pin(pin) == self.pin_hash {
            self.pin_attempts = PIN_MAX_ATTEMPTS;
            self.pin_verified = true;
            return Response::ok();
        }
        self.pin_attempts -= 1;
        self.pin_verified = false;
        if self.pin_attempts == 0 {
            Response::error(SW::AUTH_METHOD_BLOCKED)
        } else {
            Response::counter_warning(self.pin_attempts)
        }
    }

    /// The deciphered block when it embeds the pending challenge
    fn deciphered_with_challenge(&mut self, data: &[u8], challenge_len: usize) -> Option<Vec<u8>> {
        let challenge = self.challenge.take()?;
        let plain = TDesOperations::decrypt_ecb(&self.key, data).ok()?;
        (plain[..challenge_len] == challenge[..challenge_len]).then_some(plain)
    }

    fn handle_verify_pin(&mut self, cmd: &APDU) -> Response {
        if self.session.is_some() {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        match cmd.data.len() {
            0 => {
                if self.pin_attempts == 0 {
                    Response::error(SW::AUTH_METHOD_BLOCKED)
                } else if self.pin_verified || self.pin_attempts == PIN_MAX_ATTEMPTS {
                    Response::ok()
                } else {
                    Response::counter_warning(self.pin_attempts)
                }
            }
            PIN_LENGTH => self.check_pin(&cmd.data),
            CIPHERED_PIN_LENGTH => {
                if self.challenge.is_none() {
                    return Response::error(SW::SECURITY_STATUS_NOT_SATISFIED);
                }
                // Block layout: PIN then the first half of the challenge
                let block = self
                    .challenge
                    .take()
                    .and_then(|challenge| {
                        let plain = TDesOperations::decrypt_block(&self.key, &cmd.data).ok()?;
                        (plain[PIN_LENGTH..] == challenge[..PIN_LENGTH]).then_some(plain)
                    });
                match block {
                    Some(plain) => self.check_pin(&plain[..PIN_LENGTH]),
                    None => self.check_pin(&[]),
                }
            }
            _ => Response::error(SW::WRONG_LENGTH),
        }
    }

    fn handle_change_pin(&mut self, cmd: &APDU) -> Response {
        if self.session.is_some() {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        let new_pin = match cmd.data.len() {
            PIN_LENGTH => cmd.data.clone(),
            CIPHERED_NEW_PIN_LENGTH => {
                if self.challenge.is_none() {
                    return Response::error(SW::SECURITY_STATUS_NOT_SATISFIED);
                }
                match self.deciphered_with_challenge(&cmd.data, CHALLENGE_LENGTH) {
                    Some(plain) => plain[CHALLENGE_LENGTH..CHALLENGE_LENGTH + PIN_LENGTH].to_vec(),
                    None => return Response::error(SW::INCORRECT_SM_DATA_OBJECTS),
                }
            }
            _ => return Response::error(SW::WRONG_LENGTH),
        };
        self.pin_hash = hash_pin(&new_pin);
        self.pin_attempts = PIN_MAX_ATTEMPTS;
        self.pin_verified = false;
        Response::ok()
    }

    fn handle_change_key(&mut self, cmd: &APDU) -> Response {
        if self.session.is_some() {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        if !(1..=3).contains(&cmd.p2) {
            return Response::error(SW::WRONG_P1_P2);
        }
        if cmd.data.len() != CIPHERED_KEY_LENGTH {
            return Response::error(SW::WRONG_LENGTH);
        }
        if self.challenge.is_none() {
            return Response::error(SW::SECURITY_STATUS_NOT_SATISFIED);
        }
        match self.deciphered_with_challenge(&cmd.data, CHALLENGE_LENGTH) {
            Some(plain) => {
                self.key_references[cmd.p2 as usize - 1] = (
                    plain[CHALLENGE_LENGTH],
                    plain[CHALLENGE_LENGTH + 1],
                );
                Response::ok()
            }
            None => Response::error(SW::INCORRECT_SM_DATA_OBJECTS),
        }
    }

    fn handle_sv_get(&mut self, cmd: &APDU) -> Response {
        let extended = cmd.p1 == 0x01;
        if extended && !self.extended_mode_supported {
            return Response::error(SW::WRONG_P1_P2);
        }
        if cmd.p2 != SV_GET_RELOAD_P2 && cmd.p2 != SV_GET_DEBIT_P2 {
            return Response::error(SW::WRONG_P1_P2);
        }
        let purse = &self.state.purse;
        let mut data = vec![purse.kvc];
        data.extend_from_slice(&purse.tnum.to_be_bytes());
        if extended {
            // previous signature and card challenge
            data.extend_from_slice(&[0u8; 10]);
            data.extend(Self::random(4));
        } else {
            data.extend_from_slice(&[0u8; 5]);
        }
        data.extend_from_slice(&purse.balance.to_be_bytes()[1..]);
        if extended || cmd.p2 == SV_GET_RELOAD_P2 {
            data.extend_from_slice(&purse.load_log);
        }
        if extended || cmd.p2 == SV_GET_DEBIT_P2 {
            data.extend_from_slice(&purse.debit_log);
        }
        self.sv_get = Some(cmd.p2);
        Response::success(data)
    }

    fn handle_sv_operation(&mut self, cmd: &APDU) -> Response {
        let reload = cmd.ins == ins::SV_RELOAD;
        let expected_get = if reload { SV_GET_RELOAD_P2 } else { SV_GET_DEBIT_P2 };
        if self.sv_get.take() != Some(expected_get) {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        if self.session.as_ref().is_some_and(|s| s.sv_done) {
            return Response::error(SW::CONDITIONS_NOT_SATISFIED);
        }
        let extended = cmd.p2 == 0x01;
        let partial_len = if reload { SV_RELOAD_PARTIAL_SIZE } else { SV_DEBIT_PARTIAL_SIZE };
        let mac_len = if extended { 10 } else { 5 };
        let signed_len = partial_len + SAM_ID_SIZE + SAM_TNUM_SIZE;
        if cmd.data.len() != signed_len + mac_len {
            return Response::error(SW::WRONG_LENGTH);
        }
        let (signed, terminal_mac) = cmd.data.split_at(signed_len);
        match terminal_sv_mac(&self.key, signed, extended) {
            Ok(mac) if mac == terminal_mac => {}
            _ => return Response::error(SW::INCORRECT_SM_DATA_OBJECTS),
        }

        let amount = if reload {
            signed_24(&cmd.data[5..8])
        } else {
            i16::from_be_bytes([cmd.data[0], cmd.data[1]]) as i32
        };
        let purse = &mut self.state.purse;
        let balance = purse.balance + amount;
        if !(SV_BALANCE_MIN..=SV_BALANCE_MAX).contains(&balance) {
            return Response::error(SW::WRONG_DATA);
        }
        purse.balance = balance;
        purse.tnum = purse.tnum.wrapping_add(1);

        let sam = &signed[partial_len..];
        let balance_bytes = &balance.to_be_bytes()[1..];
        if reload {
            // date free1 kvc free2 balance amount time sam_id sam_tnum sv_tnum
            let mut log = cmd.data[0..5].to_vec();
            log.extend_from_slice(balance_bytes);
            log.extend_from_slice(&cmd.data[5..10]);
            log.extend_from_slice(sam);
            log.extend_from_slice(&purse.tnum.to_be_bytes());
            purse.load_log = log;
        } else {
            // amount date time kvc sam_id sam_tnum balance sv_tnum
            let mut log = cmd.data[0..7].to_vec();
            log.extend_from_slice(sam);
            log.extend_from_slice(balance_bytes);
            log.extend_from_slice(&purse.tnum.to_be_bytes());
            purse.debit_log = log;
        }

        let card_mac = match card_sv_mac(&self.key, &cmd.data, extended) {
            Ok(mac) => mac,
            Err(_) => return Response::error(SW::UNKNOWN_ERROR),
        };
        match self.session.as_mut() {
            Some(session) => {
                session.postponed.push(card_mac);
                session.sv_done = true;
                Response::ok()
            }
            None => Response::success(card_mac),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::soft_sam::session_mac_len;

    fn key() -> Vec<u8> {
        (0x10u8..0x28).collect()
    }

    fn card() -> VirtualCalypsoCard {
        VirtualCalypsoCard::new(key())
            .with_file(0x07, &[&[0x01, 0x02, 0x03], &[0x04, 0x05]])
            .with_counters(0x19, &[100, 5])
    }

    fn open(card: &mut VirtualCalypsoCard, read: Option<(u8, u8)>) -> Vec<u8> {
        let (sfi, record) = read.unwrap_or((0, 0));
        let p1 = (record << 3) | 3;
        let p2 = (sfi << 3) | 1;
        let apdu = APDU::with_data(0x00, ins::OPEN_SECURE_SESSION, p1, p2, vec![0; 4]).le(0);
        let response = card.process_apdu(&apdu);
        assert_eq!(response.sw(), SW::SUCCESS);
        response.data
    }

    #[test]
    fn test_read_single_and_multiple_records() {
        let mut card = card();
        let single = card.process_apdu(&APDU::new(0x00, ins::READ_RECORDS, 2, 0x3C).le(0));
        assert_eq!(single.data, vec![0x04, 0x05]);

        let multiple = card.process_apdu(&APDU::new(0x00, ins::READ_RECORDS, 1, 0x3D).le(0));
        assert_eq!(multiple.data, vec![0x01, 0x03, 0x01, 0x02, 0x03, 0x02, 0x02, 0x04, 0x05]);

        assert_eq!(
            card.process_apdu(&APDU::new(0x00, ins::READ_RECORDS, 9, 0x3C).le(0)).sw(),
            SW::RECORD_NOT_FOUND
        );
        assert_eq!(
            card.process_apdu(&APDU::new(0x00, ins::READ_RECORDS, 1, 0x44).le(0)).sw(),
            SW::FILE_NOT_FOUND
        );
    }

    #[test]
    fn test_open_session_reads_record_and_reports_key() {
        let mut card = card();
        let data_out = open(&mut card, Some((0x07, 1)));
        assert_eq!(data_out[4], 0x00);
        assert_eq!(&data_out[5..7], &[0x30, 0x79]);
        assert_eq!(&data_out[7..], &[0x03, 0x01, 0x02, 0x03]);
        assert!(card.is_session_open());
        assert!(!card.is_df_ratified());
    }

    #[test]
    fn test_abort_rolls_back() {
        let mut card = card();
        open(&mut card, None);
        let update = APDU::with_data(0x00, ins::UPDATE_RECORD, 1, 0x3C, vec![0xEE]);
        assert_eq!(card.process_apdu(&update).sw(), SW::SUCCESS);
        assert_eq!(card.record(0x07, 1), Some(vec![0xEE]));

        assert_eq!(
            card.process_apdu(&APDU::new(0x00, ins::CLOSE_SECURE_SESSION, 0, 0)).sw(),
            SW::SUCCESS
        );
        assert_eq!(card.record(0x07, 1), Some(vec![0x01, 0x02, 0x03]));
        assert!(!card.is_session_open());
    }

    #[test]
    fn test_close_checks_terminal_mac() {
        let mut card = card();
        let data_out = open(&mut card, None);
        let update = APDU::with_data(0x00, ins::UPDATE_RECORD, 1, 0x3C, vec![0xEE]);
        let response = card.process_apdu(&update);

        let mut digest = data_out;
        digest.extend(update.to_bytes());
        digest.extend(response.to_bytes());
        let mac = terminal_session_mac(&key(), &digest, false).unwrap();
        let close = APDU::with_data(0x00, ins::CLOSE_SECURE_SESSION, 0x80, 0x00, mac).le(0);
        let response = card.process_apdu(&close);
        assert_eq!(response.sw(), SW::SUCCESS);
        assert_eq!(response.data, card_session_mac(&key(), &digest, false).unwrap());
        assert_eq!(response.data.len(), session_mac_len(false));
        assert_eq!(card.record(0x07, 1), Some(vec![0xEE]));
        assert!(card.is_df_ratified());
    }

    #[test]
    fn test_wrong_terminal_mac_rolls_back() {
        let mut card = card();
        open(&mut card, None);
        card.process_apdu(&APDU::with_data(0x00, ins::UPDATE_RECORD, 1, 0x3C, vec![0xEE]));
        let close = APDU::with_data(0x00, ins::CLOSE_SECURE_SESSION, 0x80, 0x00, vec![0; 4]).le(0);
        assert_eq!(card.process_apdu(&close).sw(), SW::INCORRECT_SM_DATA_OBJECTS);
        assert_eq!(card.record(0x07, 1), Some(vec![0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_session_buffer_overflow() {
        let mut card = card().with_modifications_buffer(2, false);
        open(&mut card, None);
        let append = APDU::with_data(0x00, ins::APPEND_RECORD, 0, 0x38, vec![0xAA]);
        assert_eq!(card.process_apdu(&append).sw(), SW::SUCCESS);
        assert_eq!(card.process_apdu(&append).sw(), SW::SUCCESS);
        assert_eq!(card.process_apdu(&append).sw(), SW::SESSION_BUFFER_OVERFLOW);
    }

    #[test]
    fn test_counters() {
        let mut counters = card();
        let increase = APDU::with_data(0x00, ins::INCREASE, 1, 0x19 << 3, vec![0, 0, 10]).le(0);
        assert_eq!(counters.process_apdu(&increase).data, vec![0, 0, 110]);
        let decrease = APDU::with_data(0x00, ins::DECREASE, 2, 0x19 << 3, vec![0, 0, 6]).le(0);
        assert_eq!(counters.process_apdu(&decrease).sw(), SW::WRONG_DATA);
        assert_eq!(counters.counter(0x19, 2), Some(5));

        let mut postponed = card().with_counter_value_postponed(true);
        open(&mut postponed, None);
        let response = postponed.process_apdu(&increase);
        assert!(response.data.is_empty());
        assert_eq!(postponed.counter(0x19, 1), Some(110));
    }

    #[test]
    fn test_plain_pin_attempts() {
        let mut card = card().with_pin(b"0000");
        assert_eq!(card.process_apdu(&APDU::new(0x00, ins::VERIFY_PIN, 0, 0)).sw(), SW::SUCCESS);
        let wrong = APDU::with_data(0x00, ins::VERIFY_PIN, 0, 0, b"1111".to_vec());
        assert_eq!(card.process_apdu(&wrong).sw(), 0x63C2);
        assert_eq!(card.process_apdu(&APDU::new(0x00, ins::VERIFY_PIN, 0, 0)).sw(), 0x63C2);
        assert_eq!(card.process_apdu(&wrong).sw(), 0x63C1);
        assert_eq!(card.process_apdu(&wrong).sw(), SW::AUTH_METHOD_BLOCKED);
        let right = APDU::with_data(0x00, ins::VERIFY_PIN, 0, 0, b"0000".to_vec());
        assert_eq!(card.process_apdu(&right).sw(), SW::AUTH_METHOD_BLOCKED);
        assert_eq!(card.pin_attempts(), 0);
    }

    #[test]
    fn test_sv_operation_requires_sv_get() {
        let mut card = card();
        let reload = APDU::with_data(0x00, ins::SV_RELOAD, 0, 0, vec![0; 22]).le(0);
        assert_eq!(card.process_apdu(&reload).sw(), SW::CONDITIONS_NOT_SATISFIED);

        let get = card.process_apdu(&APDU::new(0x00, ins::SV_GET, 0, SV_GET_RELOAD_P2).le(0x21));
        assert_eq!(get.data.len(), 0x21);
        // Wrong terminal MAC
        assert_eq!(card.process_apdu(&reload).sw(), SW::INCORRECT_SM_DATA_OBJECTS);
        assert_eq!(card.sv_balance(), 0);
    }

    #[test]
    fn test_removal_rolls_back_session() {
        let mut card = card();
        open(&mut card, None);
        card.process_apdu(&APDU::with_data(0x00, ins::UPDATE_RECORD, 2, 0x3C, vec![0xEE]));
        card.remove();
        assert!(!card.is_present());
        assert_eq!(card.record(0x07, 2), Some(vec![0x04, 0x05]));
    }

    #[test]
    fn test_binary_addressing_keeps_the_current_file() {
        let mut card = card().with_binary_file(0x01, 0x2F10, &[0x00; 300]);
        let far = APDU::new(0x00, ins::READ_BINARY, 0x01, 0x18).le(4);
        assert_eq!(card.process_apdu(&far).sw(), SW::COMMAND_NOT_ALLOWED_NO_EF);

        let update = APDU::with_data(0x00, ins::UPDATE_BINARY, 0x81, 0x00, vec![0xAA]);
        assert_eq!(card.process_apdu(&update).sw(), SW::SUCCESS);
        let write = APDU::with_data(0x00, ins::WRITE_BINARY, 0x01, 0x18, vec![0x0F, 0xF0]);
        assert_eq!(card.process_apdu(&write).sw(), SW::SUCCESS);
        assert_eq!(card.process_apdu(&far).data, vec![0x0F, 0xF0, 0x00, 0x00]);

        let beyond = APDU::new(0x00, ins::READ_BINARY, 0x01, 0x2A).le(4);
        assert_eq!(card.process_apdu(&beyond).sw(), SW::WRONG_P1_P2);
    }

    #[test]
    fn test_multiple_counters_are_all_or_nothing() {
        let mut card = card();
        let decrease = APDU::with_data(
            0x00,
            ins::DECREASE_MULTIPLE,
            0x00,
            0x19 << 3,
            vec![0x01, 0x00, 0x00, 0x0A, 0x02, 0x00, 0x00, 0x06],
        )
        .le(0);
        assert_eq!(card.process_apdu(&decrease).sw(), SW::WRONG_DATA);
        assert_eq!(card.counter(0x19, 1), Some(100));

        let data = vec![0x02, 0x00, 0x00, 0x01];
        let increase = APDU::with_data(0x00, ins::INCREASE_MULTIPLE, 0x00, 0x19 << 3, data).le(0);
        assert_eq!(card.process_apdu(&increase).data, vec![0x02, 0x00, 0x00, 0x06]);
    }

    #[test]
    fn test_read_record_multiple_pads_short_records() {
        let mut card = card();
        let data = vec![0x54, 0x02, 0x01, 0x02];
        let read = APDU::with_data(0x00, ins::READ_RECORD_MULTIPLE, 1, 0x3D, data).le(0);
        assert_eq!(card.process_apdu(&read).data, vec![0x02, 0x03, 0x05, 0x00]);
    }

    #[test]
    fn test_select_unknown_file() {
        let mut card = card().with_binary_file(0x01, 0x2F10, &[0x00; 4]);
        let select = APDU::with_data(0x00, ins::SELECT_FILE, 0x09, 0x00, vec![0x2F, 0x11]).le(0);
        assert_eq!(card.process_apdu(&select).sw(), SW::FILE_NOT_FOUND);
        let fcp = APDU::new(0x00, ins::GET_DATA, 0x00, 0x62).le(0);
        assert_eq!(card.process_apdu(&fcp).sw(), SW::DATA_NOT_FOUND);
    }
}
