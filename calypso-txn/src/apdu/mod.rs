//! Command and response APDUs
//!
//! Short ISO 7816-4 APDUs as exchanged with Calypso cards. The terminal side
//! builds them with [`APDU::to_bytes`]; the virtual card parses them back with
//! [`parse_apdu`].
//!
//! # Example
//! ```ignore
//! use calypso_txn::apdu::{APDU, parse_apdu, ins};
//!
//! let raw = APDU::with_data(0x00, ins::UPDATE_RECORD, 0x01, 0x0C, vec![0x11; 29]).to_bytes();
//! assert_eq!(raw.len(), 34);
//! let apdu = parse_apdu(&raw).unwrap();
//! assert_eq!(apdu.p2 >> 3, 1);
//! ```

mod response;
mod status;
pub mod tlv;

pub use response::Response;
pub use status::SW;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum APDUError {
    #[error("command shorter than its header ({0} bytes)")]
    TooShort(usize),

    #[error("Lc does not match the body length")]
    InvalidLength,
}

/// A short command APDU; `cla` is 0x94 for legacy products and 0x00 for ISO ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDU {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Trailing P3 or Le byte
    pub le: Option<u8>,
}

impl APDU {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self::with_data(cla, ins, p1, p2, Vec::new())
    }

    pub fn with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self { cla, ins, p1, p2, data, le: None }
    }

    pub fn le(self, le: u8) -> Self {
        Self { le: Some(le), ..self }
    }

    pub fn p1p2(&self) -> u16 {
        u16::from_be_bytes([self.p1, self.p2])
    }

    /// SFI encoded in the upper five bits of P2 (record and counter commands)
    pub fn sfi(&self) -> u8 {
        self.p2 >> 3
    }

    /// CLA INS P1 P2, then either P3 alone or Lc Data [Le]
    ///
    /// Calypso cards expect a five byte header, so a command without data
    /// always carries a P3 byte (zero when no Le was set).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if self.data.is_empty() {
            out.push(self.le.unwrap_or(0));
        } else {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
            out.extend(self.le);
        }
        out
    }

    /// Encoded size, matching `to_bytes().len()`
    pub fn len(&self) -> usize {
        match self.data.len() {
            0 => 5,
            n => 5 + n + usize::from(self.le.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decode a short APDU as the virtual card receives it
///
/// A lone fifth byte is reported as `le`, so `94 B2 01 0C 00` parses with
/// `le == Some(0)`. A body is `Lc Data` optionally followed by one Le byte.
pub fn parse_apdu(raw: &[u8]) -> Result<APDU, APDUError> {
    let [cla, ins, p1, p2, body @ ..] = raw else {
        return Err(APDUError::TooShort(raw.len()));
    };
    let mut apdu = APDU::new(*cla, *ins, *p1, *p2);

    match body {
        [] => {}
        [p3] => apdu.le = Some(*p3),
        [lc, rest @ ..] => {
            let lc = usize::from(*lc);
            match rest.len().checked_sub(lc) {
                Some(0) => apdu.data = rest.to_vec(),
                Some(1) => {
                    apdu.data = rest[..lc].to_vec();
                    apdu.le = rest.last().copied();
                }
                _ => return Err(APDUError::InvalidLength),
            }
        }
    }
    Ok(apdu)
}

/// Calypso instruction bytes
pub mod ins {
    pub const GET_CHALLENGE: u8 = 0x84;
    pub const OPEN_SECURE_SESSION: u8 = 0x8A;
    pub const CLOSE_SECURE_SESSION: u8 = 0x8E;
    pub const MANAGE_SECURE_SESSION: u8 = 0x82;
    pub const RATIFICATION: u8 = 0xB2;
    pub const READ_RECORDS: u8 = 0xB2;
    pub const READ_RECORD_MULTIPLE: u8 = 0xB3;
    pub const SEARCH_RECORD_MULTIPLE: u8 = 0xA2;
    pub const READ_BINARY: u8 = 0xB0;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const WRITE_BINARY: u8 = 0xD0;
    pub const UPDATE_RECORD: u8 = 0xDC;
    pub const WRITE_RECORD: u8 = 0xD2;
    pub const APPEND_RECORD: u8 = 0xE2;
    pub const INCREASE: u8 = 0x32;
    pub const DECREASE: u8 = 0x30;
    pub const INCREASE_MULTIPLE: u8 = 0x3A;
    pub const DECREASE_MULTIPLE: u8 = 0x38;
    pub const SELECT_FILE: u8 = 0xA4;
    pub const GET_DATA: u8 = 0xCA;
    pub const VERIFY_PIN: u8 = 0x20;
    pub const CHANGE_PIN: u8 = 0xD8;
    pub const CHANGE_KEY: u8 = 0xD8;
    pub const INVALIDATE: u8 = 0x04;
    pub const REHABILITATE: u8 = 0x44;
    pub const SV_GET: u8 = 0x7C;
    pub const SV_RELOAD: u8 = 0xB8;
    pub const SV_DEBIT: u8 = 0xBA;
    pub const SV_UNDEBIT: u8 = 0xBC;
}

/// Class bytes
pub mod cla {
    /// Legacy Calypso class (Rev1 and Rev2 products)
    pub const LEGACY: u8 = 0x94;
    /// ISO class (Rev3 products)
    pub const ISO: u8 = 0x00;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case1_header_only() {
        let apdu = APDU::new(0x00, ins::INVALIDATE, 0x00, 0x00);
        assert_eq!(apdu.to_bytes(), vec![0x00, 0x04, 0x00, 0x00, 0x00]);
        assert_eq!(apdu.len(), 5);
    }

    #[test]
    fn test_challenge_request_parses_p3_as_le() {
        let apdu = parse_apdu(&[0x00, 0x84, 0x00, 0x00, 0x08]).unwrap();
        assert_eq!(apdu.ins, ins::GET_CHALLENGE);
        assert!(apdu.is_empty());
        assert_eq!(apdu.le, Some(8));
    }

    #[test]
    fn test_case3_lc_data() {
        let apdu = APDU::with_data(0x00, ins::UPDATE_RECORD, 0x01, 0x0C, vec![0x11; 29]);
        let raw = apdu.to_bytes();
        assert_eq!(raw.len(), 34);
        assert_eq!(raw[4], 29);
        assert_eq!(apdu.len(), raw.len());

        let parsed = parse_apdu(&raw).unwrap();
        assert_eq!(parsed, apdu);
        assert_eq!(parsed.sfi(), 1);
    }

    #[test]
    fn test_increase_with_trailing_le() {
        let raw = [0x00, 0x32, 0x01, 0x40, 0x03, 0x00, 0x00, 0x0A, 0x00];
        let apdu = parse_apdu(&raw).unwrap();
        assert_eq!(apdu.ins, ins::INCREASE);
        assert_eq!(apdu.data, vec![0x00, 0x00, 0x0A]);
        assert_eq!(apdu.le, Some(0));
        assert_eq!(apdu.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_p1p2_helper() {
        let apdu = parse_apdu(&[0x94, 0x8A, 0x0B, 0x39]).unwrap();
        assert_eq!(apdu.p1p2(), 0x0B39);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(parse_apdu(&[0x00, 0xB2, 0x01]), Err(APDUError::TooShort(3)));
    }

    #[test]
    fn test_inconsistent_lc() {
        assert_eq!(
            parse_apdu(&[0x00, 0xDC, 0x01, 0x0C, 0x05, 0x01, 0x02]),
            Err(APDUError::InvalidLength)
        );
    }
}
