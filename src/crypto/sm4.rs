//! SM4 block cipher module
//!
//! GB/T 32907-2016 128-bit block cipher with a 128-bit key, plus a CTR
//! keystream built on top of it.

use crate::error::{CryptoErrorKind, P2pError};

/// Block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Key size in bytes
pub const KEY_SIZE: usize = 16;

const FK: [u32; 4] = [0xa3b1bac6, 0x56aa3350, 0x677d9197, 0xb27022dc];

const CK: [u32; 32] = gen_ck();

const SBOX: [u8; 256] = [
    0xd6, 0x90, 0xe9, 0xfe, 0xcc, 0xe1, 0x3d, 0xb7, 0x16, 0xb6, 0x14, 0xc2, 0x28, 0xfb, 0x2c, 0x05,
    0x2b, 0x67, 0x9a, 0x76, 0x2a, 0xbe, 0x04, 0xc3, 0xaa, 0x44, 0x13, 0x26, 0x49, 0x86, 0x06, 0x99,
    0x9c, 0x42, 0x50, 0xf4, 0x91, 0xef, 0x98, 0x7a, 0x33, 0x54, 0x0b, 0x43, 0xed, 0xcf, 0xac, 0x62,
    0xe4, 0xb3, 0x1c, 0xa9, 0xc9, 0x08, 0xe8, 0x95, 0x80, 0xdf, 0x94, 0xfa, 0x75, 0x8f, 0x3f, 0xa6,
    0x47, 0x07, 0xa7, 0xfc, 0xf3, 0x73, 0x17, 0xba, 0x83, 0x59, 0x3c, 0x19, 0xe6, 0x85, 0x4f, 0xa8,
    0x68, 0x6b, 0x81, 0xb2, 0x71, 0x64, 0xda, 0x8b, 0xf8, 0xeb, 0x0f, 0x4b, 0x70, 0x56, 0x9d, 0x35,
    0x1e, 0x24, 0x0e, 0x5e, 0x63, 0x58, 0xd1, 0xa2, 0x25, 0x22, 0x7c, 0x3b, 0x01, 0x21, 0x78, 0x87,
    0xd4, 0x00, 0x46, 0x57, 0x9f, 0xd3, 0x27, 0x52, 0x4c, 0x36, 0x02, 0xe7, 0xa0, 0xc4, 0xc8, 0x9e,
    0xea, 0xbf, 0x8a, 0xd2, 0x40, 0xc7, 0x38, 0xb5, 0xa3, 0xf7, 0xf2, 0xce, 0xf9, 0x61, 0x15, 0xa1,
    0xe0, 0xae, 0x5d, 0xa4, 0x9b, 0x34, 0x1a, 0x55, 0xad, 0x93, 0x32, 0x30, 0xf5, 0x8c, 0xb1, 0xe3,
    0x1d, 0xf6, 0xe2, 0x2e, 0x82, 0x66, 0xca, 0x60, 0xc0, 0x29, 0x23, 0xab, 0x0d, 0x53, 0x4e, 0x6f,
    0xd5, 0xdb, 0x37, 0x45, 0xde, 0xfd, 0x8e, 0x2f, 0x03, 0xff, 0x6a, 0x72, 0x6d, 0x6c, 0x5b, 0x51,
    0x8d, 0x1b, 0xaf, 0x92, 0xbb, 0xdd, 0xbc, 0x7f, 0x11, 0xd9, 0x5c, 0x41, 0x1f, 0x10, 0x5a, 0xd8,
    0x0a, 0xc1, 0x31, 0x88, 0xa5, 0xcd, 0x7b, 0xbd, 0x2d, 0x74, 0xd0, 0x12, 0xb8, 0xe5, 0xb4, 0xb0,
    0x89, 0x69, 0x97, 0x4a, 0x0c, 0x96, 0x77, 0x7e, 0x65, 0xb9, 0xf1, 0x09, 0xc5, 0x6e, 0xc6, 0x84,
    0x18, 0xf0, 0x7d, 0xec, 0x3a, 0xdc, 0x4d, 0x20, 0x79, 0xee, 0x5f, 0x3e, 0xd7, 0xcb, 0x39, 0x48,
];

/// ck[i] byte j = (4i + j) * 7 mod 256
const fn gen_ck() -> [u32; 32] {
    let mut ck = [0u32; 32];
    let mut i = 0;
    while i < 32 {
        let mut word = 0u32;
        let mut j = 0;
        while j < 4 {
            let byte = (((4 * i + j) * 7) % 256) as u32;
            word = (word << 8) | byte;
            j += 1;
        }
        ck[i] = word;
        i += 1;
    }
    ck
}

#[inline]
fn tau(a: u32) -> u32 {
    let b = a.to_be_bytes();
    u32::from_be_bytes([
        SBOX[b[0] as usize],
        SBOX[b[1] as usize],
        SBOX[b[2] as usize],
        SBOX[b[3] as usize],
    ])
}

/// Round transform T = L(tau(x))
#[inline]
fn t(x: u32) -> u32 {
    let b = tau(x);
    b ^ b.rotate_left(2) ^ b.rotate_left(10) ^ b.rotate_left(18) ^ b.rotate_left(24)
}

/// Key expansion transform T' = L'(tau(x))
#[inline]
fn t_prime(x: u32) -> u32 {
    let b = tau(x);
    b ^ b.rotate_left(13) ^ b.rotate_left(23)
}

fn crypt_block(rk: &[u32; 32], block: &mut [u8; BLOCK_SIZE]) {
    let mut x = [0u32; 4];
    for (word, chunk) in x.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let [mut s0, mut s1, mut s2, mut s3] = x;
    for key in rk.iter() {
        let next = s0 ^ t(s1 ^ s2 ^ s3 ^ key);
        s0 = s1;
        s1 = s2;
        s2 = s3;
        s3 = next;
    }
    for (chunk, word) in block.chunks_exact_mut(4).zip([s3, s2, s1, s0]) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
}

/// SM4 cipher with expanded round keys
#[derive(Clone)]
pub struct Sm4Cipher {
    enc: [u32; 32],
    dec: [u32; 32],
}

impl std::fmt::Debug for Sm4Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sm4Cipher")
    }
}

impl Sm4Cipher {
    /// Expand `key` into encryption and decryption round keys
    pub fn new(key: &[u8]) -> Result<Self, P2pError> {
        if key.len() != KEY_SIZE {
            return Err(P2pError::crypto_error(
                CryptoErrorKind::InvalidKeySize,
                format!("sm4 key must be {} bytes, got {}", KEY_SIZE, key.len()),
            ));
        }

        let mut k = [0u32; 4];
        for (i, chunk) in key.chunks_exact(4).enumerate() {
            k[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ FK[i];
        }

        let mut enc = [0u32; 32];
        for i in 0..32 {
            let next = k[0] ^ t_prime(k[1] ^ k[2] ^ k[3] ^ CK[i]);
            k = [k[1], k[2], k[3], next];
            enc[i] = next;
        }
        let mut dec = enc;
        dec.reverse();

        Ok(Self { enc, dec })
    }

    /// Encrypt one block in place
    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        crypt_block(&self.enc, block);
    }

    /// Decrypt one block in place
    pub fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        crypt_block(&self.dec, block);
    }

    /// Encrypt one block into a new array
    pub fn encrypt(&self, src: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut out = *src;
        self.encrypt_block(&mut out);
        out
    }

    /// Decrypt one block into a new array
    pub fn decrypt(&self, src: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut out = *src;
        self.decrypt_block(&mut out);
        out
    }
}

/// SM4 in counter mode; the 16-byte counter is big-endian
#[derive(Debug, Clone)]
pub struct Sm4Ctr {
    cipher: Sm4Cipher,
    counter: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    used: usize,
}

impl Sm4Ctr {
    /// Create a keystream from `key` and a 16-byte `iv`
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, P2pError> {
        let cipher = Sm4Cipher::new(key)?;
        let counter: [u8; BLOCK_SIZE] = iv.try_into().map_err(|_| {
            P2pError::crypto_error(
                CryptoErrorKind::InvalidIvSize,
                format!("sm4 ctr iv must be {} bytes, got {}", BLOCK_SIZE, iv.len()),
            )
        })?;
        Ok(Self {
            cipher,
            counter,
            keystream: [0u8; BLOCK_SIZE],
            used: BLOCK_SIZE,
        })
    }

    /// XOR the keystream into `buf`
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            if self.used == BLOCK_SIZE {
                self.keystream = self.cipher.encrypt(&self.counter);
                for c in self.counter.iter_mut().rev() {
                    *c = c.wrapping_add(1);
                    if *c != 0 {
                        break;
                    }
                }
                self.used = 0;
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_vector() {
        let key = hex::decode("0123456789abcdeffedcba9876543210").unwrap();
        let plain: [u8; 16] = key.clone().try_into().unwrap();
        let cipher = Sm4Cipher::new(&key).unwrap();

        let ct = cipher.encrypt(&plain);
        assert_eq!(hex::encode(ct), "681edf34d206965e86b3e94f536e4246");
        assert_eq!(cipher.decrypt(&ct), plain);
    }

    #[test]
    fn test_ck_constants() {
        assert_eq!(CK[0], 0x00070e15);
        assert_eq!(CK[1], 0x1c232a31);
        assert_eq!(CK[31], 0x646b7279);
    }

    #[test]
    fn test_invalid_key_size() {
        let err = Sm4Cipher::new(&[0u8; 15]).unwrap_err();
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidKeySize));
        assert!(Sm4Cipher::new(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_invalid_ctr_iv_size() {
        let err = Sm4Ctr::new(&[0u8; 16], &[0u8; 12]).err().unwrap();
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidIvSize));
    }

    #[test]
    fn test_ctr_roundtrip_across_calls() {
        let key = [7u8; 16];
        let iv = [0xffu8; 16];
        let plain: Vec<u8> = (0..100u8).collect();

        let mut enc = Sm4Ctr::new(&key, &iv).unwrap();
        let mut buf = plain.clone();
        let (a, b) = buf.split_at_mut(37);
        enc.apply_keystream(a);
        enc.apply_keystream(b);
        assert_ne!(buf, plain);

        let mut dec = Sm4Ctr::new(&key, &iv).unwrap();
        dec.apply_keystream(&mut buf);
        assert_eq!(buf, plain);
    }
}
