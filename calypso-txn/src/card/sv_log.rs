//! Stored Value log records
//!
//! Raw log records as returned by SV Get, with accessors for the fields the
//! terminal needs.

use serde::{Deserialize, Serialize};

use super::serde_helpers::base64_bytes;

/// Length of a load log record
pub const SV_LOAD_LOG_SIZE: usize = 22;
/// Length of a debit log record
pub const SV_DEBIT_LOG_SIZE: usize = 19;

fn signed_24(b: &[u8]) -> i32 {
    let raw = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | (b[2] as i32);
    (raw << 8) >> 8
}

fn unsigned_16(b: &[u8]) -> u16 {
    ((b[0] as u16) << 8) | (b[1] as u16)
}

/// Last SV reload, as logged by the card
///
/// Layout: date(2) free1(1) kvc(1) free2(1) balance(3) amount(3) time(2)
/// sam_id(4) sam_tnum(3) sv_tnum(2)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvLoadLogRecord {
    #[serde(with = "base64_bytes")]
    raw: Vec<u8>,
}

impl SvLoadLogRecord {
    /// Wrap a raw record, None if it has the wrong size
    pub fn parse(raw: &[u8]) -> Option<Self> {
        (raw.len() == SV_LOAD_LOG_SIZE).then(|| Self { raw: raw.to_vec() })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn date(&self) -> u16 {
        unsigned_16(&self.raw[0..2])
    }

    pub fn kvc(&self) -> u8 {
        self.raw[3]
    }

    pub fn balance(&self) -> i32 {
        signed_24(&self.raw[5..8])
    }

    pub fn amount(&self) -> i32 {
        signed_24(&self.raw[8..11])
    }

    pub fn time(&self) -> u16 {
        unsigned_16(&self.raw[11..13])
    }

    pub fn sam_id(&self) -> &[u8] {
        &self.raw[13..17]
    }

    pub fn sv_tnum(&self) -> u16 {
        unsigned_16(&self.raw[20..22])
    }
}

/// Last SV debit, as logged by the card
///
/// Layout: amount(2) date(2) time(2) kvc(1) sam_id(4) sam_tnum(3) balance(3)
/// sv_tnum(2)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvDebitLogRecord {
    #[serde(with = "base64_bytes")]
    raw: Vec<u8>,
}

impl SvDebitLogRecord {
    /// Wrap a raw record, None if it has the wrong size
    pub fn parse(raw: &[u8]) -> Option<Self> {
        (raw.len() == SV_DEBIT_LOG_SIZE).then(|| Self { raw: raw.to_vec() })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Signed amount, negative for a debit
    pub fn amount(&self) -> i16 {
        unsigned_16(&self.raw[0..2]) as i16
    }

    pub fn date(&self) -> u16 {
        unsigned_16(&self.raw[2..4])
    }

    pub fn time(&self) -> u16 {
        unsigned_16(&self.raw[4..6])
    }

    pub fn kvc(&self) -> u8 {
        self.raw[6]
    }

    pub fn sam_id(&self) -> &[u8] {
        &self.raw[7..11]
    }

    pub fn balance(&self) -> i32 {
        signed_24(&self.raw[14..17])
    }

    pub fn sv_tnum(&self) -> u16 {
        unsigned_16(&self.raw[17..19])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_log_fields() {
        let mut raw = vec![0u8; SV_LOAD_LOG_SIZE];
        raw[3] = 0xAA;
        raw[5..8].copy_from_slice(&[0x00, 0x01, 0x00]);
        raw[8..11].copy_from_slice(&[0xFF, 0xFF, 0xF6]);
        raw[20..22].copy_from_slice(&[0x00, 0x07]);

        let log = SvLoadLogRecord::parse(&raw).unwrap();
        assert_eq!(log.kvc(), 0xAA);
        assert_eq!(log.balance(), 256);
        assert_eq!(log.amount(), -10);
        assert_eq!(log.sv_tnum(), 7);
    }

    #[test]
    fn test_debit_log_fields() {
        let mut raw = vec![0u8; SV_DEBIT_LOG_SIZE];
        raw[0..2].copy_from_slice(&[0xFF, 0xFB]);
        raw[14..17].copy_from_slice(&[0x00, 0x00, 0x64]);

        let log = SvDebitLogRecord::parse(&raw).unwrap();
        assert_eq!(log.amount(), -5);
        assert_eq!(log.balance(), 100);
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(SvLoadLogRecord::parse(&[0u8; 21]).is_none());
        assert!(SvDebitLogRecord::parse(&[0u8; 22]).is_none());
    }
}
