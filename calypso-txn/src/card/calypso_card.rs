//! Terminal-side image of a Calypso card
//!
//! Holds the capabilities learnt at selection time and everything read or
//! written during transactions: files, counters, PIN and SV data. The image
//! outlives transactions and is only ever rolled back through
//! [`CalypsoCard::restore_files`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::file::{DirectoryHeader, ElementaryFile, FileHeader};
use super::serde_helpers::{base64_bytes, base64_option};
use super::sv_log::{SvDebitLogRecord, SvLoadLogRecord, SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE};
use super::{ProductType, WriteAccessLevel};
use crate::apdu::cla;

/// Modification buffer sizes indexed by the startup info buffer size indicator
const BUFFER_SIZE_INDICATOR_TO_BUFFER_SIZE: [usize; 56] = [
    0, 0, 0, 0, 0, 0, 215, 256, 304, 362, 430, 512, 608, 724, 861, 1024, 1217, 1448, 1722, 2048,
    2435, 2896, 3444, 4096, 4870, 5792, 6888, 8192, 9741, 11585, 13777, 16384, 19483, 23170,
    27554, 32768, 38967, 46340, 55108, 65536, 77935, 92681, 110217, 131072, 155871, 185363,
    220435, 262144, 311743, 370727, 440871, 524288, 623487, 741455, 881743, 1048576,
];

const REV1_DEFAULT_COMMANDS_PER_SESSION: usize = 3;
const REV2_DEFAULT_COMMANDS_PER_SESSION: usize = 6;
const DEFAULT_BUFFER_SIZE: usize = 430;
const DEFAULT_PAYLOAD_CAPACITY: usize = 250;
const LEGACY_PAYLOAD_CAPACITY: usize = 128;

// Application type bits of the startup info
const APP_TYPE_WITH_CALYPSO_PIN: u8 = 0x01;
const APP_TYPE_WITH_CALYPSO_SV: u8 = 0x02;
const APP_TYPE_CALYPSO_REV_32_MODE: u8 = 0x08;

/// Startup information returned in the FCI of a Calypso application
pub const STARTUP_INFO_SIZE: usize = 7;

/// SV reload log file, one record
pub const SV_RELOAD_LOG_FILE_SFI: u8 = 0x14;
/// SV debit log file, cyclic
pub const SV_DEBIT_LOG_FILE_SFI: u8 = 0x15;
pub const SV_DEBIT_LOG_FILE_RECORDS: u8 = 3;
pub const SV_LOG_FILE_RECORD_SIZE: usize = 29;
/// Application subtype of the applications holding the SV log files
pub const SV_APPLICATION_SUBTYPE: u8 = 0x20;

/// State of the image a session abort brings back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Backup {
    files: BTreeMap<u8, ElementaryFile>,
    sfi_by_lid: BTreeMap<u16, u8>,
    df_invalidated: bool,
    sv_balance: Option<i32>,
}

/// The card image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalypsoCard {
    /// Full Calypso serial number (8 bytes)
    #[serde(with = "base64_bytes")]
    serial_number: Vec<u8>,
    product_type: ProductType,
    #[serde(default)]
    application_subtype: u8,
    /// Session modifications buffer capacity
    modifications_counter_max: usize,
    /// True when the buffer is counted in bytes, false when in commands
    modifications_counter_in_bytes: bool,
    payload_capacity: usize,
    extended_mode_supported: bool,
    pin_feature_available: bool,
    sv_feature_available: bool,
    /// Counter commands in session answer without data, the new value is postponed
    counter_value_postponed: bool,
    df_invalidated: bool,
    df_ratified: Option<bool>,
    pin_attempt_counter: Option<u8>,
    sv_kvc: Option<u8>,
    sv_balance: Option<i32>,
    sv_last_tnum: u16,
    sv_load_log: Option<SvLoadLogRecord>,
    sv_debit_log: Option<SvDebitLogRecord>,
    directory_header: Option<DirectoryHeader>,
    #[serde(with = "base64_option", default)]
    df_name: Option<Vec<u8>>,
    #[serde(with = "base64_option", default)]
    startup_info: Option<Vec<u8>>,
    #[serde(with = "base64_option", default)]
    traceability_information: Option<Vec<u8>>,
    files: BTreeMap<u8, ElementaryFile>,
    sfi_by_lid: BTreeMap<u16, u8>,

    #[serde(skip)]
    backup: Backup,
    #[serde(skip)]
    card_challenge: Vec<u8>,
    /// Last SV Get exchange, needed by the SAM to secure the next SV command
    #[serde(skip)]
    sv_get_request: Vec<u8>,
    #[serde(skip)]
    sv_get_response: Vec<u8>,
    #[serde(skip)]
    pre_open_write_access_level: Option<WriteAccessLevel>,
    #[serde(skip)]
    pre_open_data_out: Vec<u8>,
    /// Record numbers matched by the last search, per SFI
    #[serde(skip)]
    matching_records: BTreeMap<u8, Vec<u8>>,
}

impl CalypsoCard {
    /// Create an image with the default capabilities of a product type
    pub fn new(serial_number: Vec<u8>, product_type: ProductType) -> Self {
        let (max, in_bytes, payload) = match product_type {
            ProductType::PrimeRevision1 => {
                (REV1_DEFAULT_COMMANDS_PER_SESSION, false, LEGACY_PAYLOAD_CAPACITY)
            }
            ProductType::PrimeRevision2 => {
                (REV2_DEFAULT_COMMANDS_PER_SESSION, false, LEGACY_PAYLOAD_CAPACITY)
            }
            _ => (DEFAULT_BUFFER_SIZE, true, DEFAULT_PAYLOAD_CAPACITY),
        };
        Self {
            serial_number,
            product_type,
            application_subtype: 0,
            modifications_counter_max: max,
            modifications_counter_in_bytes: in_bytes,
            payload_capacity: payload,
            extended_mode_supported: false,
            pin_feature_available: false,
            sv_feature_available: false,
            counter_value_postponed: false,
            df_invalidated: false,
            df_ratified: None,
            pin_attempt_counter: None,
            sv_kvc: None,
            sv_balance: None,
            sv_last_tnum: 0,
            sv_load_log: None,
            sv_debit_log: None,
            directory_header: None,
            df_name: None,
            startup_info: None,
            traceability_information: None,
            files: BTreeMap::new(),
            sfi_by_lid: BTreeMap::new(),
            backup: Backup::default(),
            card_challenge: Vec::new(),
            sv_get_request: Vec::new(),
            sv_get_response: Vec::new(),
            pre_open_write_access_level: None,
            pre_open_data_out: Vec::new(),
            matching_records: BTreeMap::new(),
        }
    }

    /// Build an image from the startup information of the selected application
    ///
    /// Startup info layout: buffer size indicator, platform, application type,
    /// application subtype, software issuer, software version, software revision.
    pub fn from_startup_info(serial_number: Vec<u8>, startup_info: &[u8]) -> Option<Self> {
        if startup_info.len() < STARTUP_INFO_SIZE {
            return None;
        }
        let application_type = startup_info[2];
        let product_type = if application_type & 0x80 != 0 {
            ProductType::PrimeRevision3
        } else {
            match application_type >> 3 {
                0x04 | 0x05 => ProductType::PrimeRevision3,
                _ => ProductType::PrimeRevision2,
            }
        };

        let mut card = Self::new(serial_number, product_type);
        if product_type == ProductType::PrimeRevision3 {
            let indicator = startup_info[0] as usize;
            card.modifications_counter_max = BUFFER_SIZE_INDICATOR_TO_BUFFER_SIZE
                .get(indicator)
                .copied()
                .unwrap_or(DEFAULT_BUFFER_SIZE);
        }
        card.extended_mode_supported = application_type & APP_TYPE_CALYPSO_REV_32_MODE != 0;
        card.pin_feature_available = application_type & APP_TYPE_WITH_CALYPSO_PIN != 0;
        card.sv_feature_available = application_type & APP_TYPE_WITH_CALYPSO_SV != 0;
        card.application_subtype = startup_info[3];
        Some(card)
    }

    pub fn with_modifications_counter(mut self, max: usize, in_bytes: bool) -> Self {
        self.modifications_counter_max = max;
        self.modifications_counter_in_bytes = in_bytes;
        self
    }

    pub fn with_payload_capacity(mut self, capacity: usize) -> Self {
        self.payload_capacity = capacity;
        self
    }

    pub fn with_extended_mode(mut self, supported: bool) -> Self {
        self.extended_mode_supported = supported;
        self
    }

    pub fn with_pin_feature(mut self, available: bool) -> Self {
        self.pin_feature_available = available;
        self
    }

    pub fn with_sv_feature(mut self, available: bool) -> Self {
        self.sv_feature_available = available;
        self
    }

    pub fn with_counter_value_postponed(mut self, postponed: bool) -> Self {
        self.counter_value_postponed = postponed;
        self
    }

    pub fn with_df_invalidated(mut self, invalidated: bool) -> Self {
        self.df_invalidated = invalidated;
        self
    }

    pub fn with_application_subtype(mut self, subtype: u8) -> Self {
        self.application_subtype = subtype;
        self
    }

    pub fn calypso_serial_number_full(&self) -> &[u8] {
        &self.serial_number
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn application_subtype(&self) -> u8 {
        self.application_subtype
    }

    /// CLA byte to use with this card
    pub fn card_class(&self) -> u8 {
        match self.product_type {
            ProductType::PrimeRevision1 | ProductType::PrimeRevision2 => cla::LEGACY,
            _ => cla::ISO,
        }
    }

    /// Capacity of the session modifications buffer
    pub fn modifications_counter(&self) -> usize {
        self.modifications_counter_max
    }

    pub fn is_modifications_counter_in_bytes(&self) -> bool {
        self.modifications_counter_in_bytes
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    pub fn is_extended_mode_supported(&self) -> bool {
        self.extended_mode_supported
    }

    pub fn is_pin_feature_available(&self) -> bool {
        self.pin_feature_available
    }

    pub fn is_sv_feature_available(&self) -> bool {
        self.sv_feature_available
    }

    pub fn is_counter_value_postponed(&self) -> bool {
        self.counter_value_postponed
    }

    pub fn is_df_invalidated(&self) -> bool {
        self.df_invalidated
    }

    /// Ratification status of the last session, None if no session was opened
    pub fn is_df_ratified(&self) -> Option<bool> {
        self.df_ratified
    }

    pub fn pin_attempt_remaining(&self) -> Option<u8> {
        self.pin_attempt_counter
    }

    pub fn is_pin_blocked(&self) -> bool {
        self.pin_attempt_counter == Some(0)
    }

    pub fn card_challenge(&self) -> &[u8] {
        &self.card_challenge
    }

    pub fn sv_kvc(&self) -> Option<u8> {
        self.sv_kvc
    }

    pub fn sv_balance(&self) -> Option<i32> {
        self.sv_balance
    }

    pub fn sv_last_tnum(&self) -> u16 {
        self.sv_last_tnum
    }

    pub fn sv_load_log_record(&self) -> Option<&SvLoadLogRecord> {
        self.sv_load_log.as_ref()
    }

    pub fn sv_debit_log_record(&self) -> Option<&SvDebitLogRecord> {
        self.sv_debit_log.as_ref()
    }

    pub fn sv_get_request(&self) -> &[u8] {
        &self.sv_get_request
    }

    pub fn sv_get_response(&self) -> &[u8] {
        &self.sv_get_response
    }

    pub fn sv_load_log_all_records(&self) -> Vec<SvLoadLogRecord> {
        self.log_records(SV_RELOAD_LOG_FILE_SFI, SV_LOAD_LOG_SIZE, SvLoadLogRecord::parse)
    }

    /// Debit logs read from the debit log file, most recent first
    pub fn sv_debit_log_all_records(&self) -> Vec<SvDebitLogRecord> {
        self.log_records(SV_DEBIT_LOG_FILE_SFI, SV_DEBIT_LOG_SIZE, SvDebitLogRecord::parse)
    }

    /// Logs stored at the start of each record of a log file
    fn log_records<T>(&self, sfi: u8, size: usize, parse: fn(&[u8]) -> Option<T>) -> Vec<T> {
        self.files
            .get(&sfi)
            .map(|file| {
                file.data
                    .all_records()
                    .values()
                    .filter_map(|rec| rec.get(..size).and_then(parse))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn directory_header(&self) -> Option<&DirectoryHeader> {
        self.directory_header.as_ref()
    }

    /// DF name from the last FCI read
    pub fn df_name(&self) -> Option<&[u8]> {
        self.df_name.as_deref()
    }

    pub fn startup_info(&self) -> Option<&[u8]> {
        self.startup_info.as_deref()
    }

    pub fn traceability_information(&self) -> Option<&[u8]> {
        self.traceability_information.as_deref()
    }

    /// Record numbers matched by the last Search Record Multiple on `sfi`
    pub fn matching_record_numbers(&self, sfi: u8) -> &[u8] {
        self.matching_records.get(&sfi).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.files.get(&sfi)
    }

    pub fn file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.sfi_by_lid.get(&lid).and_then(|sfi| self.files.get(sfi))
    }

    pub fn files(&self) -> &BTreeMap<u8, ElementaryFile> {
        &self.files
    }

    pub fn pre_open_write_access_level(&self) -> Option<WriteAccessLevel> {
        self.pre_open_write_access_level
    }

    pub fn pre_open_data_out(&self) -> &[u8] {
        &self.pre_open_data_out
    }

    /// Record the outcome of a pre-opened session done at selection time
    pub fn set_pre_open(&mut self, level: WriteAccessLevel, data_out: Vec<u8>) {
        self.pre_open_write_access_level = Some(level);
        self.pre_open_data_out = data_out;
    }

    /// Forget any pre-open secure session
    pub fn disable_pre_open_mode(&mut self) {
        self.pre_open_write_access_level = None;
        self.pre_open_data_out.clear();
    }

    /// Copy the files, the DF status and the SV balance into the backup
    pub fn backup_files(&mut self) {
        self.backup = Backup {
            files: self.files.clone(),
            sfi_by_lid: self.sfi_by_lid.clone(),
            df_invalidated: self.df_invalidated,
            sv_balance: self.sv_balance,
        };
    }

    /// Bring the image back to the last backup
    pub fn restore_files(&mut self) {
        let backup = self.backup.clone();
        self.files = backup.files;
        self.sfi_by_lid = backup.sfi_by_lid;
        self.df_invalidated = backup.df_invalidated;
        self.sv_balance = backup.sv_balance;
    }

    fn file_mut(&mut self, sfi: u8) -> &mut ElementaryFile {
        self.files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(sfi))
    }

    pub(crate) fn set_extended_mode_supported(&mut self, supported: bool) {
        self.extended_mode_supported = supported;
    }

    pub(crate) fn set_df_invalidated(&mut self, invalidated: bool) {
        self.df_invalidated = invalidated;
    }

    pub(crate) fn set_df_ratified(&mut self, ratified: bool) {
        self.df_ratified = Some(ratified);
    }

    pub(crate) fn set_pin_attempt_remaining(&mut self, remaining: u8) {
        self.pin_attempt_counter = Some(remaining);
    }

    pub(crate) fn set_card_challenge(&mut self, challenge: Vec<u8>) {
        self.card_challenge = challenge;
    }

    pub(crate) fn set_sv_get(&mut self, request: Vec<u8>, response: Vec<u8>) {
        self.sv_get_request = request;
        self.sv_get_response = response;
    }

    /// Update SV data, keeping the first log records seen
    ///
    /// Two SV Gets may be needed to read both logs; the second must not
    /// overwrite what the first one returned.
    pub(crate) fn set_sv_data(
        &mut self,
        kvc: u8,
        balance: i32,
        last_tnum: u16,
        load_log: Option<SvLoadLogRecord>,
        debit_log: Option<SvDebitLogRecord>,
    ) {
        self.sv_kvc = Some(kvc);
        self.sv_balance = Some(balance);
        // SV Get reports the committed balance
        self.backup.sv_balance = Some(balance);
        self.sv_last_tnum = last_tnum;
        if self.sv_load_log.is_none() {
            self.sv_load_log = load_log;
        }
        if self.sv_debit_log.is_none() {
            self.sv_debit_log = debit_log;
        }
    }

    /// Forget the SV data and logs, before the log files are read again
    pub(crate) fn clear_sv_data(&mut self) {
        self.sv_kvc = None;
        self.sv_balance = None;
        self.sv_last_tnum = 0;
        self.sv_load_log = None;
        self.sv_debit_log = None;
    }

    pub(crate) fn set_sv_balance(&mut self, balance: i32) {
        self.sv_balance = Some(balance);
    }

    pub(crate) fn set_directory_header(&mut self, header: DirectoryHeader) {
        self.directory_header = Some(header);
    }

    pub(crate) fn set_fci(&mut self, df_name: Option<Vec<u8>>, startup_info: Option<Vec<u8>>) {
        self.df_name = df_name;
        self.startup_info = startup_info;
    }

    pub(crate) fn set_traceability_information(&mut self, information: Vec<u8>) {
        self.traceability_information = Some(information);
    }

    pub(crate) fn set_matching_record_numbers(&mut self, sfi: u8, records: Vec<u8>) {
        self.matching_records.insert(sfi, records);
    }

    pub(crate) fn set_file_header(&mut self, sfi: u8, header: FileHeader) {
        self.sfi_by_lid.insert(header.lid, sfi);
        self.file_mut(sfi).header = Some(header);
    }

    pub(crate) fn set_content(&mut self, sfi: u8, record_number: u8, content: &[u8]) {
        self.file_mut(sfi).data.set_content(record_number, content);
    }

    pub(crate) fn set_content_at(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
        offset: usize,
    ) {
        self.file_mut(sfi).data.set_content_at(record_number, content, offset);
    }

    pub(crate) fn fill_content(&mut self, sfi: u8, record_number: u8, content: &[u8]) {
        self.file_mut(sfi).data.fill_content(record_number, content);
    }

    pub(crate) fn fill_content_at(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
        offset: usize,
    ) {
        self.file_mut(sfi).data.fill_content_at(record_number, content, offset);
    }

    pub(crate) fn add_cyclic_content(&mut self, sfi: u8, content: &[u8]) {
        self.file_mut(sfi).data.add_cyclic_content(content);
    }

    pub(crate) fn set_counter(&mut self, sfi: u8, counter_number: u8, value: &[u8]) {
        self.file_mut(sfi).data.set_counter(counter_number, value);
    }
}
