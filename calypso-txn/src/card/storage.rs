//! Card image storage
//!
//! Persists card images as JSON, one file per card serial number, so that a
//! terminal can resume with what it already knows about a card.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use super::CalypsoCard;

/// Errors raised while loading or saving a card image
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed card image {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Handles persistent storage of card images
pub struct CardImageStore {
    storage_dir: PathBuf,
}

impl CardImageStore {
    /// Get the default storage directory
    fn default_storage_dir() -> PathBuf {
        if let Ok(path) = std::env::var("CALYPSO_CARD_IMAGE_DIR") {
            return PathBuf::from(path);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".calypso-txn");
        }
        PathBuf::from("/var/lib/calypso-txn")
    }

    /// Create a store, in the default directory when none is given
    pub fn new(storage_path: Option<PathBuf>) -> Self {
        Self {
            storage_dir: storage_path.unwrap_or_else(Self::default_storage_dir),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Path of the image of the card with this serial number
    pub fn image_path(&self, serial_number: &[u8]) -> PathBuf {
        self.storage_dir
            .join(format!("{}.json", hex::encode_upper(serial_number)))
    }

    /// Load the image of a card, None if it was never saved
    pub fn load(&self, serial_number: &[u8]) -> Result<Option<CalypsoCard>, StoreError> {
        let path = self.image_path(serial_number);
        if !path.exists() {
            info!("No stored image for card {:02X?}", serial_number);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let card = serde_json::from_str(&content).map_err(|source| {
            warn!("Failed to parse card image {:?}: {}", path, source);
            StoreError::Json { path: path.clone(), source }
        })?;
        info!("Loaded card image from {:?}", path);
        Ok(Some(card))
    }

    /// Save the image of a card, replacing any previous one
    pub fn save(&self, card: &CalypsoCard) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.storage_dir).map_err(|source| StoreError::Io {
            path: self.storage_dir.clone(),
            source,
        })?;

        let path = self.image_path(card.calypso_serial_number_full());
        let json = serde_json::to_string_pretty(card).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Saved card image to {:?}", path);
        Ok(path)
    }

    /// Delete the image of a card
    ///
    /// Returns true if an image existed.
    pub fn remove(&self, serial_number: &[u8]) -> Result<bool, StoreError> {
        let path = self.image_path(serial_number);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::ProductType;
    use crate::card::sv_log::{SvLoadLogRecord, SV_LOAD_LOG_SIZE};
    use tempfile::TempDir;

    fn sample_card() -> CalypsoCard {
        let serial = vec![0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44];
        let mut card = CalypsoCard::new(serial, ProductType::PrimeRevision3).with_sv_feature(true);
        card.set_content(0x07, 1, &[0xCA, 0xFE]);
        card.set_counter(0x19, 2, &[0x00, 0x00, 0x2A]);
        card.set_sv_data(0x55, 1200, 3, SvLoadLogRecord::parse(&[0x09; SV_LOAD_LOG_SIZE]), None);
        card
    }

    #[test]
    fn test_missing_image() {
        let temp_dir = TempDir::new().unwrap();
        let store = CardImageStore::new(Some(temp_dir.path().to_path_buf()));
        assert!(store.load(&[0x01; 8]).unwrap().is_none());
        assert!(!store.remove(&[0x01; 8]).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = CardImageStore::new(Some(temp_dir.path().join("images")));
        let card = sample_card();

        let path = store.save(&card).unwrap();
        assert!(path.ends_with("0000000011223344.json"));

        let loaded = store.load(card.calypso_serial_number_full()).unwrap().unwrap();
        assert_eq!(loaded.file_by_sfi(0x07).unwrap().data.content(1).unwrap(), &[0xCA, 0xFE]);
        assert_eq!(loaded.file_by_sfi(0x19).unwrap().data.counter_value(2), Some(42));
        assert_eq!(loaded.sv_balance(), Some(1200));
        assert_eq!(loaded.sv_load_log_record(), card.sv_load_log_record());
    }

    #[test]
    fn test_malformed_image() {
        let temp_dir = TempDir::new().unwrap();
        let store = CardImageStore::new(Some(temp_dir.path().to_path_buf()));
        fs::write(store.image_path(&[0x02; 8]), "{not json").unwrap();
        assert!(matches!(store.load(&[0x02; 8]), Err(StoreError::Json { .. })));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = CardImageStore::new(Some(temp_dir.path().to_path_buf()));
        let card = sample_card();
        store.save(&card).unwrap();
        assert!(store.remove(card.calypso_serial_number_full()).unwrap());
        assert!(store.load(card.calypso_serial_number_full()).unwrap().is_none());
    }
}
