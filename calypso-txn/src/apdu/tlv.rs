//! BER-TLV objects found in Select File and Get Data answers
//!
//! Only what Calypso answers use: tags of one or two bytes and lengths up
//! to 65535. Constructed objects are parsed into their children.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TLVError {
    #[error("data ends inside a tag")]
    TruncatedTag,

    #[error("data ends inside a length")]
    TruncatedLength,

    #[error("value of tag {tag:X} needs {needed} bytes, {available} left")]
    TruncatedValue { tag: u32, needed: usize, available: usize },

    #[error("unsupported length encoding {0:02X}")]
    UnsupportedLength(u8),
}

/// A data object and, when constructed, its children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TLV {
    pub tag: u32,
    pub value: Vec<u8>,
    pub subs: Vec<TLV>,
}

impl TLV {
    /// First tag byte carries the constructed bit
    pub fn is_constructed(&self) -> bool {
        let first = if self.tag > 0xFF { (self.tag >> 8) as u8 } else { self.tag as u8 };
        first & 0x20 != 0
    }

    /// Depth-first search of `tag`, this object included
    pub fn find(&self, tag: u32) -> Option<&TLV> {
        if self.tag == tag {
            return Some(self);
        }
        self.subs.iter().find_map(|sub| sub.find(tag))
    }
}

/// Search `tag` in a list of objects and their descendants
pub fn find<'a>(tlvs: &'a [TLV], tag: u32) -> Option<&'a TLV> {
    tlvs.iter().find_map(|tlv| tlv.find(tag))
}

/// Parse consecutive objects, skipping 00 and FF padding between them
pub fn read_list(mut data: &[u8]) -> Result<Vec<TLV>, TLVError> {
    let mut list = Vec::new();
    while let Some((&first, rest)) = data.split_first() {
        if first == 0x00 || first == 0xFF {
            data = rest;
            continue;
        }
        let (tlv, consumed) = read_single(data)?;
        list.push(tlv);
        data = &data[consumed..];
    }
    Ok(list)
}

/// Parse one object, returning it with the number of bytes it spans
pub fn read_single(data: &[u8]) -> Result<(TLV, usize), TLVError> {
    let (tag, tag_len) = parse_tag(data)?;
    let (length, length_len) = parse_length(&data[tag_len..])?;
    let start = tag_len + length_len;
    let value = data.get(start..start + length).ok_or(TLVError::TruncatedValue {
        tag,
        needed: length,
        available: data.len() - start,
    })?;

    let mut tlv = TLV {
        tag,
        value: value.to_vec(),
        subs: Vec::new(),
    };
    if tlv.is_constructed() {
        tlv.subs = read_list(value)?;
    }
    Ok((tlv, start + length))
}

fn parse_tag(data: &[u8]) -> Result<(u32, usize), TLVError> {
    match data {
        [first, ..] if first & 0x1F != 0x1F => Ok((u32::from(*first), 1)),
        [first, second, ..] => Ok(((u32::from(*first) << 8) | u32::from(*second), 2)),
        _ => Err(TLVError::TruncatedTag),
    }
}

fn parse_length(data: &[u8]) -> Result<(usize, usize), TLVError> {
    match data {
        [first, ..] if first & 0x80 == 0 => Ok((usize::from(*first), 1)),
        [0x81, len, ..] => Ok((usize::from(*len), 2)),
        [0x82, hi, lo, ..] => Ok(((usize::from(*hi) << 8) | usize::from(*lo), 3)),
        [0x81 | 0x82, ..] | [] => Err(TLVError::TruncatedLength),
        [first, ..] => Err(TLVError::UnsupportedLength(*first)),
    }
}

/// Encode a primitive or constructed object from its value bytes
pub fn encode(tag: u32, value: &[u8]) -> Vec<u8> {
    let mut out = if tag > 0xFF {
        vec![(tag >> 8) as u8, tag as u8]
    } else {
        vec![tag as u8]
    };
    match value.len() {
        n if n < 0x80 => out.push(n as u8),
        n if n <= 0xFF => out.extend([0x81, n as u8]),
        n => out.extend([0x82, (n >> 8) as u8, n as u8]),
    }
    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_object() {
        let (tlv, consumed) = read_single(&[0x85, 0x02, 0xAA, 0xBB, 0x01]).unwrap();
        assert_eq!(tlv.tag, 0x85);
        assert_eq!(tlv.value, vec![0xAA, 0xBB]);
        assert!(tlv.subs.is_empty());
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_nested_fci() {
        let data = hex::decode("6F0F8403315449A508BF0C055303010203").unwrap();
        let tlvs = read_list(&data).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert!(tlvs[0].is_constructed());
        assert_eq!(find(&tlvs, 0x84).unwrap().value, b"1TI".to_vec());
        assert_eq!(find(&tlvs, 0x53).unwrap().value, vec![0x01, 0x02, 0x03]);
        assert_eq!(find(&tlvs, 0xBF0C).unwrap().subs.len(), 1);
        assert!(find(&tlvs, 0xC7).is_none());
    }

    #[test]
    fn test_padding_skipped() {
        let tlvs = read_list(&[0x00, 0xFF, 0x84, 0x01, 0x11, 0x00]).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].value, vec![0x11]);
    }

    #[test]
    fn test_long_length() {
        let value = vec![0x5A; 200];
        let encoded = encode(0xC0, &value);
        assert_eq!(&encoded[..3], &[0xC0, 0x81, 200]);
        let (tlv, consumed) = read_single(&encoded).unwrap();
        assert_eq!(tlv.value, value);
        assert_eq!(consumed, 203);
    }

    #[test]
    fn test_truncated_data() {
        assert_eq!(read_single(&[0xBF]), Err(TLVError::TruncatedTag));
        assert_eq!(read_single(&[0x84]), Err(TLVError::TruncatedLength));
        assert!(matches!(
            read_single(&[0x84, 0x05, 0x01]),
            Err(TLVError::TruncatedValue { tag: 0x84, needed: 5, available: 1 })
        ));
        assert_eq!(read_single(&[0x84, 0x84, 0, 0, 0, 1]), Err(TLVError::UnsupportedLength(0x84)));
    }
}
