//! AES helpers
//!
//! Block and CTR wrappers whose variant is picked from the key length, so
//! callers can hold 16, 24 or 32 byte keys behind one type.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};

use crate::error::{CryptoErrorKind, P2pError};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

fn key_size_error(len: usize) -> P2pError {
    P2pError::crypto_error(
        CryptoErrorKind::InvalidKeySize,
        format!("aes key must be 16, 24 or 32 bytes, got {}", len),
    )
}

/// Single-block AES encryptor (ECB on one block)
#[derive(Clone)]
pub enum AesBlock {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesBlock {
    pub fn new(key: &[u8]) -> Result<Self, P2pError> {
        let block = match key.len() {
            16 => Aes128::new_from_slice(key).map(AesBlock::Aes128),
            24 => Aes192::new_from_slice(key).map(AesBlock::Aes192),
            32 => Aes256::new_from_slice(key).map(AesBlock::Aes256),
            other => return Err(key_size_error(other)),
        };
        block.map_err(|_| key_size_error(key.len()))
    }

    /// Encrypt one block in place
    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let b = aes::Block::from_mut_slice(&mut block[..]);
        match self {
            AesBlock::Aes128(c) => c.encrypt_block(b),
            AesBlock::Aes192(c) => c.encrypt_block(b),
            AesBlock::Aes256(c) => c.encrypt_block(b),
        }
    }
}

/// AES-CTR keystream with a 128-bit big-endian counter
pub enum AesCtr {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl AesCtr {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, P2pError> {
        if iv.len() != BLOCK_SIZE {
            return Err(P2pError::crypto_error(
                CryptoErrorKind::InvalidIvSize,
                format!("ctr iv must be {} bytes, got {}", BLOCK_SIZE, iv.len()),
            ));
        }
        let stream = match key.len() {
            16 => Aes128Ctr::new_from_slices(key, iv).map(AesCtr::Aes128),
            24 => Aes192Ctr::new_from_slices(key, iv).map(AesCtr::Aes192),
            32 => Aes256Ctr::new_from_slices(key, iv).map(AesCtr::Aes256),
            other => return Err(key_size_error(other)),
        };
        stream.map_err(|_| key_size_error(key.len()))
    }

    /// Zero IV stream, as used by the frame codec
    pub fn with_zero_iv(key: &[u8]) -> Result<Self, P2pError> {
        Self::new(key, &[0u8; BLOCK_SIZE])
    }

    /// XOR the next keystream bytes into `buf`
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            AesCtr::Aes128(c) => c.apply_keystream(buf),
            AesCtr::Aes192(c) => c.apply_keystream(buf),
            AesCtr::Aes256(c) => c.apply_keystream(buf),
        }
    }
}
