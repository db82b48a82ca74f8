//! Software crypto authority
//!
//! A 3DES implementation of [`SymmetricCryptoService`] sharing one key with
//! the card. Digest updates are queued and only computed when a MAC is needed
//! or on [`SymmetricCryptoService::synchronize`], the way a SAM batches its
//! commands. Payload ciphering is not emulated: with encryption active the
//! APDUs pass through unchanged.
//!
//! The free functions of this module define the MAC scheme and are shared with
//! the virtual card.

use log::debug;
use rand::RngCore;

use super::tdes::{TDesError, TDesOperations};
use super::{CryptoError, SvCommandSecurityData, SymmetricCryptoFactory, SymmetricCryptoService};
use crate::audit::TransactionAuditData;

const TERMINAL_MAC_TAG: u8 = 0x00;
const CARD_MAC_TAG: u8 = 0x01;
const SV_TERMINAL_MAC_TAG: u8 = 0x02;
const SV_CARD_MAC_TAG: u8 = 0x03;
const SV_TERMINAL_MAC_TAG_EXT: u8 = 0x12;

/// Session MAC length
pub fn session_mac_len(extended_mode: bool) -> usize {
    if extended_mode { 8 } else { 4 }
}

/// Card SV MAC length
pub fn sv_card_mac_len(extended_mode: bool) -> usize {
    if extended_mode { 6 } else { 3 }
}

fn tagged_mac(key: &[u8], data: &[u8], tag: u8) -> Result<Vec<u8>, TDesError> {
    let mut input = data.to_vec();
    input.push(tag);
    TDesOperations::cbc_mac(key, &input)
}

/// MAC computed by the terminal over the session digest
pub fn terminal_session_mac(
    key: &[u8],
    digest: &[u8],
    extended_mode: bool,
) -> Result<Vec<u8>, TDesError> {
    let mut mac = tagged_mac(key, digest, TERMINAL_MAC_TAG)?;
    mac.truncate(session_mac_len(extended_mode));
    Ok(mac)
}

/// MAC computed by the card over the session digest
pub fn card_session_mac(
    key: &[u8],
    digest: &[u8],
    extended_mode: bool,
) -> Result<Vec<u8>, TDesError> {
    let mut mac = tagged_mac(key, digest, CARD_MAC_TAG)?;
    mac.truncate(session_mac_len(extended_mode));
    Ok(mac)
}

/// Terminal SV MAC over the SV command data and the SAM identification
pub fn terminal_sv_mac(
    key: &[u8],
    signed_data: &[u8],
    extended_mode: bool,
) -> Result<Vec<u8>, TDesError> {
    let mut mac = tagged_mac(key, signed_data, SV_TERMINAL_MAC_TAG)?;
    if extended_mode {
        mac.extend(tagged_mac(key, signed_data, SV_TERMINAL_MAC_TAG_EXT)?);
        mac.truncate(10);
    } else {
        mac.truncate(5);
    }
    Ok(mac)
}

/// Card SV MAC over the complete SV command data
pub fn card_sv_mac(
    key: &[u8],
    command_data: &[u8],
    extended_mode: bool,
) -> Result<Vec<u8>, TDesError> {
    let mut mac = tagged_mac(key, command_data, SV_CARD_MAC_TAG)?;
    mac.truncate(sv_card_mac_len(extended_mode));
    Ok(mac)
}

/// Ciphered PIN block: 3DES(pin || challenge[0..4])
pub fn cipher_pin_block(
    key: &[u8],
    card_challenge: &[u8],
    pin: &[u8],
) -> Result<Vec<u8>, TDesError> {
    if pin.len() != 4 || card_challenge.len() < 4 {
        return Err(TDesError::InvalidData(
            "PIN ciphering needs a 4-byte PIN and a card challenge".into(),
        ));
    }
    let mut block = pin.to_vec();
    block.extend_from_slice(&card_challenge[..4]);
    TDesOperations::encrypt_block(key, &block)
}

/// Ciphered new PIN: 3DES-ECB(challenge(8) || new_pin || 0000)
pub fn cipher_new_pin_blocks(
    key: &[u8],
    card_challenge: &[u8],
    new_pin: &[u8],
) -> Result<Vec<u8>, TDesError> {
    if new_pin.len() != 4 || card_challenge.len() < 8 {
        return Err(TDesError::InvalidData(
            "PIN modification needs a 4-byte PIN and an 8-byte challenge".into(),
        ));
    }
    let mut blocks = card_challenge[..8].to_vec();
    blocks.extend_from_slice(new_pin);
    blocks.extend_from_slice(&[0u8; 4]);
    TDesOperations::encrypt_ecb(key, &blocks)
}

/// Ciphered key for Change Key: 3DES-ECB(challenge(8) || kif || kvc || padding)
pub fn cipher_key_blocks(
    key: &[u8],
    card_challenge: &[u8],
    target_kif: u8,
    target_kvc: u8,
) -> Result<Vec<u8>, TDesError> {
    if card_challenge.len() < 8 {
        return Err(TDesError::InvalidData("Key ciphering needs an 8-byte challenge".into()));
    }
    let mut blocks = card_challenge[..8].to_vec();
    blocks.push(target_kif);
    blocks.push(target_kvc);
    blocks.resize(32, 0x00);
    TDesOperations::encrypt_ecb(key, &blocks)
}

/// Factory of [`SoftSam`] sessions
#[derive(Debug, Clone)]
pub struct SoftSamFactory {
    key: Vec<u8>,
    sam_serial_number: [u8; 4],
    extended_mode_supported: bool,
    max_card_apdu_length: usize,
}

impl SoftSamFactory {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            sam_serial_number: [0x5A, 0x4D, 0x00, 0x01],
            extended_mode_supported: true,
            max_card_apdu_length: 255,
        }
    }

    pub fn with_extended_mode(mut self, supported: bool) -> Self {
        self.extended_mode_supported = supported;
        self
    }

    pub fn with_max_card_apdu_length(mut self, length: usize) -> Self {
        self.max_card_apdu_length = length;
        self
    }

    /// Create a session directly, without boxing
    pub fn create(
        &self,
        card_serial_number: &[u8],
        extended_mode: bool,
        audit: TransactionAuditData,
    ) -> SoftSam {
        SoftSam {
            key: self.key.clone(),
            sam_serial_number: self.sam_serial_number,
            card_serial_number: card_serial_number.to_vec(),
            extended_mode,
            audit,
            terminal_challenge: None,
            digest: Vec::new(),
            pending: Vec::new(),
            session_open: false,
            encryption_active: false,
            sam_tnum: 0,
            last_sv_command_data: Vec::new(),
            synchronize_count: 0,
        }
    }
}

impl SymmetricCryptoFactory for SoftSamFactory {
    fn is_extended_mode_supported(&self) -> bool {
        self.extended_mode_supported
    }

    fn max_card_apdu_length_supported(&self) -> usize {
        self.max_card_apdu_length
    }

    fn create_transaction_manager(
        &self,
        card_serial_number: &[u8],
        extended_mode: bool,
        audit: TransactionAuditData,
    ) -> Box<dyn SymmetricCryptoService> {
        Box::new(self.create(card_serial_number, extended_mode, audit))
    }
}

/// Software SAM session
pub struct SoftSam {
    key: Vec<u8>,
    sam_serial_number: [u8; 4],
    card_serial_number: Vec<u8>,
    extended_mode: bool,
    audit: TransactionAuditData,
    /// Challenge prepared by pre-init, consumed by the next session
    terminal_challenge: Option<Vec<u8>>,
    digest: Vec<u8>,
    /// Digest updates not yet computed
    pending: Vec<Vec<u8>>,
    session_open: bool,
    encryption_active: bool,
    sam_tnum: u32,
    last_sv_command_data: Vec<u8>,
    synchronize_count: usize,
}

impl SoftSam {
    pub fn card_serial_number(&self) -> &[u8] {
        &self.card_serial_number
    }

    pub fn is_encryption_active(&self) -> bool {
        self.encryption_active
    }

    /// Number of synchronizations performed
    pub fn synchronize_count(&self) -> usize {
        self.synchronize_count
    }

    fn new_challenge(&self) -> Vec<u8> {
        let mut challenge = vec![0u8; if self.extended_mode { 8 } else { 4 }];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    fn check_session_open(&self) -> Result<(), CryptoError> {
        if !self.session_open {
            return Err(CryptoError::IllegalState("no secure session context".into()));
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        for update in self.pending.drain(..) {
            self.digest.extend_from_slice(&update);
        }
    }
}

impl SymmetricCryptoService for SoftSam {
    fn init_terminal_secure_session_context(&mut self) -> Result<Vec<u8>, CryptoError> {
        let challenge = match self.terminal_challenge.take() {
            Some(challenge) => challenge,
            None => self.new_challenge(),
        };
        self.audit.push(&challenge);
        Ok(challenge)
    }

    fn init_terminal_session_mac(
        &mut self,
        open_session_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError> {
        debug!("Soft SAM session initialized with KIF={:02X} KVC={:02X}", kif, kvc);
        self.digest = open_session_data_out.to_vec();
        self.pending.clear();
        self.session_open = true;
        self.encryption_active = false;
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.check_session_open()?;
        self.pending.push(apdu.to_vec());
        Ok(apdu.to_vec())
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.check_session_open()?;
        self.flush_pending();
        let mac = terminal_session_mac(&self.key, &self.digest, self.extended_mode)?;
        self.audit.push(&mac);
        Ok(mac)
    }

    fn generate_terminal_session_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.finalize_terminal_session_mac()
    }

    fn activate_encryption(&mut self) -> Result<(), CryptoError> {
        self.check_session_open()?;
        self.encryption_active = true;
        Ok(())
    }

    fn deactivate_encryption(&mut self) -> Result<(), CryptoError> {
        self.check_session_open()?;
        self.encryption_active = false;
        Ok(())
    }

    fn is_card_session_mac_valid(&mut self, mac: &[u8]) -> Result<bool, CryptoError> {
        self.check_session_open()?;
        self.flush_pending();
        let expected = card_session_mac(&self.key, &self.digest, self.extended_mode)?;
        Ok(expected == mac)
    }

    fn compute_sv_command_security_data(
        &mut self,
        data: &mut SvCommandSecurityData,
    ) -> Result<(), CryptoError> {
        if data.sv_get_response.is_empty() {
            return Err(CryptoError::IllegalState("SV Get response missing".into()));
        }
        self.sam_tnum += 1;
        data.serial_number = self.sam_serial_number.to_vec();
        data.transaction_number = self.sam_tnum.to_be_bytes()[1..].to_vec();

        let mut signed = data.sv_command_partial_request.clone();
        signed.extend_from_slice(&data.serial_number);
        signed.extend_from_slice(&data.transaction_number);
        data.terminal_sv_mac = terminal_sv_mac(&self.key, &signed, self.extended_mode)?;

        signed.extend_from_slice(&data.terminal_sv_mac);
        self.last_sv_command_data = signed;
        Ok(())
    }

    fn is_card_sv_mac_valid(&mut self, mac: &[u8]) -> Result<bool, CryptoError> {
        if self.last_sv_command_data.is_empty() {
            return Err(CryptoError::IllegalState("no SV command secured".into()));
        }
        let expected = card_sv_mac(&self.key, &self.last_sv_command_data, self.extended_mode)?;
        Ok(expected == mac)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8],
        _kif: u8,
        _kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(cipher_pin_block(&self.key, card_challenge, pin)?)
    }

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        _current_pin: Option<&[u8]>,
        new_pin: &[u8],
        _kif: u8,
        _kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(cipher_new_pin_blocks(&self.key, card_challenge, new_pin)?)
    }

    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        _issuer_kif: u8,
        _issuer_kvc: u8,
        target_kif: u8,
        target_kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(cipher_key_blocks(&self.key, card_challenge, target_kif, target_kvc)?)
    }

    fn synchronize(&mut self) -> Result<(), CryptoError> {
        self.flush_pending();
        self.synchronize_count += 1;
        Ok(())
    }

    fn pre_init_terminal_secure_session_context(&mut self) -> Result<(), CryptoError> {
        self.terminal_challenge = Some(self.new_challenge());
        Ok(())
    }
}
