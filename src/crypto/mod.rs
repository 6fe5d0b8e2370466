//! Crypto module
//!
//! SM3 hashing, SM4 and AES block ciphers with CTR streams, and ECIES over
//! the NIST P-curves.

pub mod aes;
pub mod ecies;
pub mod sm3;
pub mod sm4;

pub use self::aes::{AesBlock, AesCtr};
pub use ecies::{decrypt, encrypt, CurveKind, HashKind, PrivateKey, PublicKey};
pub use sm3::{sm3, Sm3};
pub use sm4::{Sm4Cipher, Sm4Ctr};
