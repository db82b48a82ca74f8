//! Elementary files and their record content
//!
//! The terminal keeps an image of every file it read or modified. Records are
//! numbered from 1; counters live in record #1, three bytes each.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::serde_helpers::{base64_bytes, base64_records};

/// Size of a counter in a counters file
pub const COUNTER_SIZE: usize = 3;

/// Elementary file structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Linear,
    Binary,
    Cyclic,
    Counters,
    SimulatedCounters,
}

/// Header of an elementary file, as returned by a Select File
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Long identifier
    pub lid: u16,
    pub records_number: u8,
    /// Record size, or the file size for a binary file
    pub record_size: u16,
    pub ef_type: FileType,
    #[serde(with = "base64_bytes")]
    pub access_conditions: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key_indexes: Vec<u8>,
    pub df_status: u8,
    /// LID of the file this one shares its data with, if any
    pub shared_reference: Option<u16>,
}

/// Header of the current DF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryHeader {
    pub lid: u16,
    #[serde(with = "base64_bytes")]
    pub access_conditions: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key_indexes: Vec<u8>,
    pub df_status: u8,
    /// KIF of the personalization, load and debit keys
    pub kifs: [u8; 3],
    /// KVC of the personalization, load and debit keys
    pub kvcs: [u8; 3],
}

/// Record content of a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    #[serde(with = "base64_records")]
    records: BTreeMap<u8, Vec<u8>>,
}

impl FileData {
    pub fn new() -> Self {
        Self::default()
    }

    /// All known records, by record number
    pub fn all_records(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    /// Content of a record, None if never read nor written
    pub fn content(&self, record_number: u8) -> Option<&[u8]> {
        self.records.get(&record_number).map(Vec::as_slice)
    }

    /// A slice of a record
    ///
    /// Returns None if the record is unknown or too short.
    pub fn content_range(&self, record_number: u8, offset: usize, length: usize) -> Option<&[u8]> {
        self.records
            .get(&record_number)
            .and_then(|rec| rec.get(offset..offset + length))
    }

    /// Value of counter #`counter_number` (1-based) stored in record #1
    pub fn counter_value(&self, counter_number: u8) -> Option<u32> {
        if counter_number == 0 {
            return None;
        }
        let offset = (counter_number as usize - 1) * COUNTER_SIZE;
        self.content_range(1, offset, COUNTER_SIZE)
            .map(|b| ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    /// Every counter fully present in record #1
    pub fn all_counters(&self) -> BTreeMap<u8, u32> {
        let mut counters = BTreeMap::new();
        if let Some(rec) = self.records.get(&1) {
            for (i, chunk) in rec.chunks_exact(COUNTER_SIZE).enumerate() {
                let value =
                    ((chunk[0] as u32) << 16) | ((chunk[1] as u32) << 8) | (chunk[2] as u32);
                counters.insert(i as u8 + 1, value);
            }
        }
        counters
    }

    /// Replace the whole content of a record
    pub fn set_content(&mut self, record_number: u8, content: &[u8]) {
        self.records.insert(record_number, content.to_vec());
    }

    /// Write `content` at `offset` in a record, zero padding any gap
    pub fn set_content_at(&mut self, record_number: u8, content: &[u8], offset: usize) {
        let rec = self.records.entry(record_number).or_default();
        let end = offset + content.len();
        if rec.len() < end {
            rec.resize(end, 0);
        }
        rec[offset..end].copy_from_slice(content);
    }

    /// Store a 3-byte counter value in record #1
    pub fn set_counter(&mut self, counter_number: u8, value: &[u8]) {
        let offset = (counter_number.max(1) as usize - 1) * COUNTER_SIZE;
        self.set_content_at(1, value, offset);
    }

    /// Binary OR of `content` into a record (Write Record semantics)
    ///
    /// Bytes beyond the current record length are taken from `content`.
    pub fn fill_content(&mut self, record_number: u8, content: &[u8]) {
        self.fill_content_at(record_number, content, 0);
    }

    /// Binary OR of `content` at `offset`, zero padding any gap
    pub fn fill_content_at(&mut self, record_number: u8, content: &[u8], offset: usize) {
        let rec = self.records.entry(record_number).or_default();
        let end = offset + content.len();
        if rec.len() < end {
            rec.resize(end, 0);
        }
        rec[offset..end]
            .iter_mut()
            .zip(content)
            .for_each(|(existing, byte)| *existing |= byte);
    }

    /// Shift every record by one position and put `content` in record #1
    ///
    /// Records are shifted without bound, the image does not know the
    /// physical size of the cyclic file.
    pub fn add_cyclic_content(&mut self, content: &[u8]) {
        let shifted: BTreeMap<u8, Vec<u8>> = std::mem::take(&mut self.records)
            .into_iter()
            .filter_map(|(n, rec)| n.checked_add(1).map(|n| (n, rec)))
            .collect();
        self.records = shifted;
        self.records.insert(1, content.to_vec());
    }
}

/// An elementary file of the card image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementaryFile {
    pub sfi: u8,
    pub header: Option<FileHeader>,
    pub data: FileData,
}

impl ElementaryFile {
    pub fn new(sfi: u8) -> Self {
        Self {
            sfi,
            header: None,
            data: FileData::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_content_at_pads_with_zeros() {
        let mut data = FileData::new();
        data.set_content_at(1, &[0xAA, 0xBB], 3);
        assert_eq!(data.content(1).unwrap(), &[0x00, 0x00, 0x00, 0xAA, 0xBB]);

        data.set_content_at(1, &[0x11], 0);
        assert_eq!(data.content(1).unwrap(), &[0x11, 0x00, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn test_fill_content_ors_and_extends() {
        let mut data = FileData::new();
        data.set_content(2, &[0x01, 0x10]);
        data.fill_content(2, &[0x02, 0x01, 0xFF]);
        assert_eq!(data.content(2).unwrap(), &[0x03, 0x11, 0xFF]);
    }

    #[test]
    fn test_fill_content_at_offset() {
        let mut data = FileData::new();
        data.set_content(1, &[0x10, 0x20]);
        data.fill_content_at(1, &[0x01, 0x02, 0x03], 1);
        assert_eq!(data.content(1).unwrap(), &[0x10, 0x21, 0x02, 0x03]);

        data.fill_content_at(2, &[0x55], 4);
        assert_eq!(data.content(2).unwrap(), &[0x00, 0x00, 0x00, 0x00, 0x55]);
    }

    #[test]
    fn test_add_cyclic_content_shifts_records() {
        let mut data = FileData::new();
        data.set_content(1, &[0x01]);
        data.set_content(2, &[0x02]);

        data.add_cyclic_content(&[0x00]);

        assert_eq!(data.content(1).unwrap(), &[0x00]);
        assert_eq!(data.content(2).unwrap(), &[0x01]);
        assert_eq!(data.content(3).unwrap(), &[0x02]);
        assert_eq!(data.all_records().len(), 3);
    }

    #[test]
    fn test_counters_in_record_one() {
        let mut data = FileData::new();
        data.set_counter(2, &[0x00, 0x01, 0x00]);

        assert_eq!(data.counter_value(1), Some(0));
        assert_eq!(data.counter_value(2), Some(256));
        assert_eq!(data.counter_value(3), None);
        assert_eq!(data.all_counters().len(), 2);
    }

    #[test]
    fn test_content_range() {
        let mut data = FileData::new();
        data.set_content(1, &[1, 2, 3, 4]);
        assert_eq!(data.content_range(1, 1, 2), Some(&[2u8, 3][..]));
        assert_eq!(data.content_range(1, 3, 2), None);
        assert_eq!(data.content_range(5, 0, 1), None);
    }
}
