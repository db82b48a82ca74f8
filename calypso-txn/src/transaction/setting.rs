//! Security setting of card transactions

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::card::WriteAccessLevel;
use crate::command::KeyReference;

/// Default KIF of the personalization key
pub const DEFAULT_KIF_PERSONALIZATION: u8 = 0x21;
/// Default KIF of the load key
pub const DEFAULT_KIF_LOAD: u8 = 0x27;
/// Default KIF of the debit key
pub const DEFAULT_KIF_DEBIT: u8 = 0x30;

const DEFAULT_PIN_CIPHERING_KIF: u8 = 0x30;
const DEFAULT_PIN_CIPHERING_KVC: u8 = 0x79;

#[derive(Debug, Error)]
pub enum SettingError {
    #[error("Cannot read security setting {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid security setting: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_kif_personalization() -> u8 {
    DEFAULT_KIF_PERSONALIZATION
}

fn default_kif_load() -> u8 {
    DEFAULT_KIF_LOAD
}

fn default_kif_debit() -> u8 {
    DEFAULT_KIF_DEBIT
}

fn default_pin_ciphering_key() -> KeyReference {
    (DEFAULT_PIN_CIPHERING_KIF, DEFAULT_PIN_CIPHERING_KVC)
}

/// Policy knobs of the transaction engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySetting {
    /// Split a session that would overflow the card buffer
    #[serde(default)]
    pub multiple_session_enabled: bool,
    /// Close without ratification then send a Ratification command (contactless)
    #[serde(default)]
    pub ratification_mechanism_enabled: bool,
    #[serde(default)]
    pub pin_plain_transmission_enabled: bool,
    /// Read both SV logs (two SV Gets on non-extended cards)
    #[serde(default)]
    pub sv_load_and_debit_log_enabled: bool,
    #[serde(default)]
    pub sv_negative_balance_authorized: bool,
    #[serde(default)]
    pub read_on_session_opening_disabled: bool,
    #[serde(default = "default_pin_ciphering_key")]
    pub pin_verification_ciphering_key: KeyReference,
    #[serde(default = "default_pin_ciphering_key")]
    pub pin_modification_ciphering_key: KeyReference,
    #[serde(default = "default_kif_personalization")]
    pub default_kif_personalization: u8,
    #[serde(default = "default_kif_load")]
    pub default_kif_load: u8,
    #[serde(default = "default_kif_debit")]
    pub default_kif_debit: u8,
}

impl Default for SecuritySetting {
    fn default() -> Self {
        Self {
            multiple_session_enabled: false,
            ratification_mechanism_enabled: false,
            pin_plain_transmission_enabled: false,
            sv_load_and_debit_log_enabled: false,
            sv_negative_balance_authorized: false,
            read_on_session_opening_disabled: false,
            pin_verification_ciphering_key: default_pin_ciphering_key(),
            pin_modification_ciphering_key: default_pin_ciphering_key(),
            default_kif_personalization: DEFAULT_KIF_PERSONALIZATION,
            default_kif_load: DEFAULT_KIF_LOAD,
            default_kif_debit: DEFAULT_KIF_DEBIT,
        }
    }
}

impl SecuritySetting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_multiple_session(mut self) -> Self {
        self.multiple_session_enabled = true;
        self
    }

    pub fn enable_ratification_mechanism(mut self) -> Self {
        self.ratification_mechanism_enabled = true;
        self
    }

    pub fn enable_pin_plain_transmission(mut self) -> Self {
        self.pin_plain_transmission_enabled = true;
        self
    }

    pub fn enable_sv_load_and_debit_log(mut self) -> Self {
        self.sv_load_and_debit_log_enabled = true;
        self
    }

    pub fn authorize_sv_negative_balance(mut self) -> Self {
        self.sv_negative_balance_authorized = true;
        self
    }

    pub fn disable_read_on_session_opening(mut self) -> Self {
        self.read_on_session_opening_disabled = true;
        self
    }

    pub fn with_pin_verification_ciphering_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_verification_ciphering_key = (kif, kvc);
        self
    }

    pub fn with_pin_modification_ciphering_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_modification_ciphering_key = (kif, kvc);
        self
    }

    pub fn with_default_kif(mut self, level: WriteAccessLevel, kif: u8) -> Self {
        match level {
            WriteAccessLevel::Personalization => self.default_kif_personalization = kif,
            WriteAccessLevel::Load => self.default_kif_load = kif,
            WriteAccessLevel::Debit => self.default_kif_debit = kif,
        }
        self
    }

    /// KIF assumed when the card does not tell which key it used
    pub fn default_kif(&self, level: WriteAccessLevel) -> u8 {
        match level {
            WriteAccessLevel::Personalization => self.default_kif_personalization,
            WriteAccessLevel::Load => self.default_kif_load,
            WriteAccessLevel::Debit => self.default_kif_debit,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SettingError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingError> {
        let content = fs::read_to_string(path).map_err(|source| SettingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let setting = SecuritySetting::new();
        assert!(!setting.multiple_session_enabled);
        assert_eq!(setting.default_kif(WriteAccessLevel::Debit), 0x30);
        assert_eq!(setting.pin_verification_ciphering_key, (0x30, 0x79));
    }

    #[test]
    fn test_builder() {
        let setting = SecuritySetting::new()
            .enable_multiple_session()
            .enable_ratification_mechanism()
            .with_default_kif(WriteAccessLevel::Load, 0x2A);
        assert!(setting.multiple_session_enabled);
        assert!(setting.ratification_mechanism_enabled);
        assert_eq!(setting.default_kif(WriteAccessLevel::Load), 0x2A);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"multiple_session_enabled": true, "default_kif_debit": 49}"#;
        let setting = SecuritySetting::from_json(json).unwrap();
        assert!(setting.multiple_session_enabled);
        assert_eq!(setting.default_kif(WriteAccessLevel::Debit), 49);
        assert_eq!(setting.default_kif(WriteAccessLevel::Load), DEFAULT_KIF_LOAD);
        assert!(matches!(SecuritySetting::from_json("{"), Err(SettingError::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let setting = SecuritySetting::new().enable_pin_plain_transmission();
        let json = serde_json::to_string(&setting).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let setting = SecuritySetting::load(file.path()).unwrap();
        assert!(setting.pin_plain_transmission_enabled);
        assert!(matches!(
            SecuritySetting::load(Path::new("/nonexistent/setting.json")),
            Err(SettingError::Io { .. })
        ));
    }
}
