//! 3DES primitives for the soft SAM and the virtual card
//!
//! ECB over whole blocks, and the CBC-MAC behind session and SV MACs.

use des::TdesEde3;
use des::cipher::{Block, BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use log::trace;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TDesError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

enum Direction {
    Encrypt,
    Decrypt,
}

/// Stateless 3DES helpers keyed with a 24-byte EDE3 key
pub struct TDesOperations;

impl TDesOperations {
    pub const BLOCK_SIZE: usize = 8;
    pub const KEY_SIZE: usize = 24;

    fn keyed(key: &[u8]) -> Result<TdesEde3, TDesError> {
        TdesEde3::new_from_slice(key).map_err(|_| {
            TDesError::InvalidKey(format!(
                "{} bytes, a 3DES key takes {}",
                key.len(), Self::KEY_SIZE
            ))
        })
    }

    fn ecb(key: &[u8], input: &[u8], direction: Direction) -> Result<Vec<u8>, TDesError> {
        let cipher = Self::keyed(key)?;
        if input.is_empty() || input.len() % Self::BLOCK_SIZE != 0 {
            return Err(TDesError::InvalidData(format!(
                "{} bytes do not make whole {}-byte blocks",
                input.len(), Self::BLOCK_SIZE
            )));
        }

        let mut out = input.to_vec();
        for chunk in out.chunks_exact_mut(Self::BLOCK_SIZE) {
            let block: &mut Block<TdesEde3> = GenericArray::from_mut_slice(chunk);
            match direction {
                Direction::Encrypt => cipher.encrypt_block(block),
                Direction::Decrypt => cipher.decrypt_block(block),
            }
        }
        Ok(out)
    }

    fn single(input: &[u8]) -> Result<(), TDesError> {
        match input.len() {
            Self::BLOCK_SIZE => Ok(()),
            n => Err(TDesError::InvalidData(format!("expected one block, got {} bytes", n))),
        }
    }

    pub fn encrypt_block(key: &[u8], block: &[u8]) -> Result<Vec<u8>, TDesError> {
        Self::single(block)?;
        Self::ecb(key, block, Direction::Encrypt)
    }

    pub fn decrypt_block(key: &[u8], block: &[u8]) -> Result<Vec<u8>, TDesError> {
        Self::single(block)?;
        Self::ecb(key, block, Direction::Decrypt)
    }

    pub fn encrypt_ecb(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TDesError> {
        Self::ecb(key, data, Direction::Encrypt)
    }

    pub fn decrypt_ecb(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TDesError> {
        Self::ecb(key, data, Direction::Decrypt)
    }

    /// CBC-MAC with a zero IV and ISO 9797-1 padding method 2
    ///
    /// Returns the full 8-byte last block; callers truncate.
    pub fn cbc_mac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TDesError> {
        let cipher = Self::keyed(key)?;

        let mut padded = data.to_vec();
        padded.push(0x80);
        padded.resize(padded.len().next_multiple_of(Self::BLOCK_SIZE), 0x00);
        trace!("3DES CBC-MAC over {} bytes", padded.len());

        let mut chain: Block<TdesEde3> = GenericArray::default();
        for chunk in padded.chunks_exact(Self::BLOCK_SIZE) {
            chain.iter_mut().zip(chunk).for_each(|(c, d)| *c ^= d);
            cipher.encrypt_block(&mut chain);
        }
        Ok(chain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 24] = [0x01; 24];

    #[test]
    fn test_single_block_inverts() {
        let clear = [0x12, 0x34, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        let ciphered = TDesOperations::encrypt_block(&KEY, &clear).unwrap();
        assert_ne!(ciphered, clear);
        assert_eq!(TDesOperations::decrypt_block(&KEY, &ciphered).unwrap(), clear);
    }

    #[test]
    fn test_ecb_blocks_are_independent() {
        let ciphered = TDesOperations::encrypt_ecb(&KEY, &[0x5A; 16]).unwrap();
        assert_eq!(ciphered.len(), 16);
        assert_eq!(ciphered[..8], ciphered[8..]);
        assert_eq!(TDesOperations::decrypt_ecb(&KEY, &ciphered).unwrap(), vec![0x5A; 16]);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(matches!(
            TDesOperations::encrypt_block(&[0x01; 16], &[0x00; 8]),
            Err(TDesError::InvalidKey(_))
        ));
        assert!(matches!(
            TDesOperations::encrypt_block(&KEY, &[0x00; 7]),
            Err(TDesError::InvalidData(_))
        ));
        assert!(matches!(
            TDesOperations::decrypt_ecb(&KEY, &[0x00; 12]),
            Err(TDesError::InvalidData(_))
        ));
    }

    #[test]
    fn test_cbc_mac() {
        let key: Vec<u8> = (0u8..24).collect();

        let mac = TDesOperations::cbc_mac(&key, b"session digest").unwrap();
        assert_eq!(mac.len(), 8);
        assert_eq!(mac, TDesOperations::cbc_mac(&key, b"session digest").unwrap());
        assert_ne!(mac, TDesOperations::cbc_mac(&key, b"session digesT").unwrap());

        // Empty input still yields one padded block
        assert_eq!(TDesOperations::cbc_mac(&key, &[]).unwrap().len(), 8);
    }
}
