//! Symmetric crypto authority
//!
//! The terminal relies on a SAM (or any equivalent service) for every
//! cryptographic computation of a secure session: terminal challenge, session
//! MAC, SV signatures, PIN and key ciphering. This module defines the service
//! interface the transaction engine drives, plus a software implementation
//! based on 3DES.

pub mod soft_sam;
pub mod tdes;

use thiserror::Error;

use crate::audit::TransactionAuditData;

pub use soft_sam::{SoftSam, SoftSamFactory};
pub use tdes::{TDesError, TDesOperations};

/// Errors raised by the crypto authority
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The crypto computation itself failed
    #[error("Crypto service failure: {0}")]
    Crypto(String),

    /// The crypto service could not be reached
    #[error("Crypto service I/O failure: {0}")]
    Io(String),

    #[error("Crypto service used out of sequence: {0}")]
    IllegalState(String),
}

impl From<TDesError> for CryptoError {
    fn from(e: TDesError) -> Self {
        CryptoError::Crypto(e.to_string())
    }
}

/// Input and output of the SV command securing computation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SvCommandSecurityData {
    /// The SV Get APDU that preceded the SV command
    pub sv_get_request: Vec<u8>,
    /// Its response
    pub sv_get_response: Vec<u8>,
    /// SV command data without the security part
    pub sv_command_partial_request: Vec<u8>,
    /// SAM serial number (output, 4 bytes)
    pub serial_number: Vec<u8>,
    /// SAM transaction number (output, 3 bytes)
    pub transaction_number: Vec<u8>,
    /// Terminal SV MAC (output, 5 or 10 bytes)
    pub terminal_sv_mac: Vec<u8>,
}

impl SvCommandSecurityData {
    /// Length of the security part appended to an SV command
    pub fn security_part_len(extended_mode: bool) -> usize {
        4 + 3 + if extended_mode { 10 } else { 5 }
    }

    /// The security part: serial number, transaction number, MAC
    pub fn security_part(&self) -> Vec<u8> {
        let mut out = self.serial_number.clone();
        out.extend_from_slice(&self.transaction_number);
        out.extend_from_slice(&self.terminal_sv_mac);
        out
    }
}

/// Crypto service bound to one card transaction
pub trait SymmetricCryptoService {
    /// Start a secure session context and return the terminal challenge
    fn init_terminal_secure_session_context(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Feed the Open Secure Session output data and the key used by the card
    fn init_terminal_session_mac(
        &mut self,
        open_session_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError>;

    /// Add an APDU (request or response) to the session digest
    ///
    /// When encryption is active the result is the ciphered request or the
    /// deciphered response; otherwise it is the input unchanged.
    fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Terminal MAC to send in Close Secure Session
    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Intermediate terminal MAC (early mutual authentication)
    fn generate_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError>;

    fn activate_encryption(&mut self) -> Result<(), CryptoError>;

    fn deactivate_encryption(&mut self) -> Result<(), CryptoError>;

    fn is_card_session_mac_valid(&mut self, card_session_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Fill the output fields of `data`
    fn compute_sv_command_security_data(
        &mut self,
        data: &mut SvCommandSecurityData,
    ) -> Result<(), CryptoError>;

    fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, CryptoError>;

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: Option<&[u8]>,
        new_pin: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer_kif: u8,
        issuer_kvc: u8,
        target_kif: u8,
        target_kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Run every operation the service deferred so far
    fn synchronize(&mut self) -> Result<(), CryptoError>;

    /// Prepare the next secure session ahead of time
    fn pre_init_terminal_secure_session_context(&mut self) -> Result<(), CryptoError>;
}

/// Creates crypto services for card transactions
pub trait SymmetricCryptoFactory {
    fn is_extended_mode_supported(&self) -> bool;

    /// Largest card APDU the service can secure
    fn max_card_apdu_length_supported(&self) -> usize;

    fn create_transaction_manager(
        &self,
        card_serial_number: &[u8],
        extended_mode: bool,
        audit: TransactionAuditData,
    ) -> Box<dyn SymmetricCryptoService>;
}
