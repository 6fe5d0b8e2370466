//! ECIES module
//!
//! Hybrid public-key encryption over the NIST P-curves. A one-shot key pair
//! is drawn on the recipient's curve, the ECDH x-coordinate is expanded with
//! HKDF, the payload is AES-CTR encrypted and `IV || ciphertext` is tagged
//! with an HMAC. Wire layout:
//!
//! ```text
//! marshal(random_pub) || IV(16) || ciphertext || HMAC tag
//! ```

use elliptic_curve::ecdh::diffie_hellman;
use elliptic_curve::sec1::ToEncodedPoint;
use elliptic_curve::CurveArithmetic;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::pkcs8::{DecodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Sha256, Sha384, Sha512};
use tracing::{debug, trace};

use crate::crypto::aes::{AesCtr, BLOCK_SIZE};
use crate::error::{CryptoErrorKind, P2pError};

/// HKDF info tag shared by both parties
pub const KDF_INFO: [u8; 9] = [0x6b, 0x65, 0x6c, 0x6c, 0x79, 0x63, 0x68, 0x65, 0x6e];

/// Supported curves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    P256,
    P384,
    P521,
}

/// Digest used for the KDF and the tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    /// Output size in bytes
    pub fn size(&self) -> usize {
        match self {
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }
}

/// Per-curve parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EciesParams {
    /// Digest for HKDF and HMAC
    pub hash: HashKind,
    /// Symmetric key length (AES-128 or AES-256)
    pub key_len: usize,
    /// Cipher block size, also the IV length
    pub block_size: usize,
}

impl CurveKind {
    /// Bytes in one field element
    pub fn field_bytes(&self) -> usize {
        match self {
            CurveKind::P256 => 32,
            CurveKind::P384 => 48,
            CurveKind::P521 => 66,
        }
    }

    /// Length of an uncompressed SEC1 point
    pub fn public_key_len(&self) -> usize {
        1 + 2 * self.field_bytes()
    }

    /// ECIES parameters bound to this curve
    pub fn params(&self) -> EciesParams {
        match self {
            CurveKind::P256 => EciesParams { hash: HashKind::Sha256, key_len: 16, block_size: BLOCK_SIZE },
            CurveKind::P384 => EciesParams { hash: HashKind::Sha384, key_len: 32, block_size: BLOCK_SIZE },
            CurveKind::P521 => EciesParams { hash: HashKind::Sha512, key_len: 32, block_size: BLOCK_SIZE },
        }
    }
}

fn invalid_public_key(detail: impl Into<String>) -> P2pError {
    P2pError::crypto_error(CryptoErrorKind::InvalidPublicKey, detail)
}

/// Public key tagged with its curve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    P256(p256::PublicKey),
    P384(p384::PublicKey),
    P521(p521::PublicKey),
}

impl PublicKey {
    /// Parse a SEC1 encoded point on `curve`
    pub fn from_bytes(curve: CurveKind, bytes: &[u8]) -> Result<Self, P2pError> {
        if bytes == [0u8] {
            return Err(P2pError::crypto_error(
                CryptoErrorKind::SharedKeyIsPointAtInfinity,
                "public key is the identity point",
            ));
        }
        let key = match curve {
            CurveKind::P256 => p256::PublicKey::from_sec1_bytes(bytes).map(PublicKey::P256),
            CurveKind::P384 => p384::PublicKey::from_sec1_bytes(bytes).map(PublicKey::P384),
            CurveKind::P521 => p521::PublicKey::from_sec1_bytes(bytes).map(PublicKey::P521),
        };
        key.map_err(|_| invalid_public_key(format!("{} bytes are not a point on {:?}", bytes.len(), curve)))
    }

    /// Uncompressed SEC1 encoding (`0x04 || X || Y`)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PublicKey::P256(k) => k.to_encoded_point(false).as_bytes().to_vec(),
            PublicKey::P384(k) => k.to_encoded_point(false).as_bytes().to_vec(),
            PublicKey::P521(k) => k.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    pub fn curve(&self) -> CurveKind {
        match self {
            PublicKey::P256(_) => CurveKind::P256,
            PublicKey::P384(_) => CurveKind::P384,
            PublicKey::P521(_) => CurveKind::P521,
        }
    }
}

/// Private key tagged with its curve
#[derive(Clone)]
pub enum PrivateKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({:?})", self.curve())
    }
}

impl PrivateKey {
    /// Draw a fresh key on `curve`
    pub fn generate(curve: CurveKind) -> Self {
        match curve {
            CurveKind::P256 => PrivateKey::P256(p256::SecretKey::random(&mut OsRng)),
            CurveKind::P384 => PrivateKey::P384(p384::SecretKey::random(&mut OsRng)),
            CurveKind::P521 => PrivateKey::P521(p521::SecretKey::random(&mut OsRng)),
        }
    }

    /// Parse a big-endian scalar on `curve`
    pub fn from_bytes(curve: CurveKind, bytes: &[u8]) -> Result<Self, P2pError> {
        let key = match curve {
            CurveKind::P256 => p256::SecretKey::from_slice(bytes).map(PrivateKey::P256),
            CurveKind::P384 => p384::SecretKey::from_slice(bytes).map(PrivateKey::P384),
            CurveKind::P521 => p521::SecretKey::from_slice(bytes).map(PrivateKey::P521),
        };
        key.map_err(|_| P2pError::crypto_error(CryptoErrorKind::InvalidKeySize, "invalid private scalar"))
    }

    /// Parse a P-256 key from SEC1 ("EC PRIVATE KEY") or PKCS#8 PEM
    pub fn from_pem(pem: &str) -> Result<Self, P2pError> {
        if let Ok(key) = p256::SecretKey::from_sec1_pem(pem) {
            return Ok(PrivateKey::P256(key));
        }
        p256::SecretKey::from_pkcs8_pem(pem)
            .map(PrivateKey::P256)
            .map_err(|e| {
                debug!("Failed to parse PEM private key: {}", e);
                P2pError::crypto_error(CryptoErrorKind::UnsupportedAlgorithm, "pem is not a P-256 private key")
            })
    }

    /// SEC1 PEM encoding; only P-256 keys are exportable
    pub fn to_pem(&self) -> Result<String, P2pError> {
        match self {
            PrivateKey::P256(k) => k
                .to_sec1_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|e| P2pError::crypto_error(CryptoErrorKind::UnsupportedAlgorithm, e.to_string())),
            other => Err(P2pError::crypto_error(
                CryptoErrorKind::UnsupportedAlgorithm,
                format!("pem export is not supported for {:?}", other.curve()),
            )),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PrivateKey::P256(k) => k.to_bytes().to_vec(),
            PrivateKey::P384(k) => k.to_bytes().to_vec(),
            PrivateKey::P521(k) => k.to_bytes().to_vec(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::P256(k) => PublicKey::P256(k.public_key()),
            PrivateKey::P384(k) => PublicKey::P384(k.public_key()),
            PrivateKey::P521(k) => PublicKey::P521(k.public_key()),
        }
    }

    pub fn curve(&self) -> CurveKind {
        match self {
            PrivateKey::P256(_) => CurveKind::P256,
            PrivateKey::P384(_) => CurveKind::P384,
            PrivateKey::P521(_) => CurveKind::P521,
        }
    }

    /// ECDH x-coordinate, left-padded with zeros to
    /// `max(sk_len + mac_len, field bytes)`
    pub fn shared_key(&self, public: &PublicKey, sk_len: usize, mac_len: usize) -> Result<Vec<u8>, P2pError> {
        let x = match (self, public) {
            (PrivateKey::P256(s), PublicKey::P256(p)) => ecdh_x(s, p),
            (PrivateKey::P384(s), PublicKey::P384(p)) => ecdh_x(s, p),
            (PrivateKey::P521(s), PublicKey::P521(p)) => ecdh_x(s, p),
            _ => {
                return Err(P2pError::crypto_error(
                    CryptoErrorKind::InvalidCurve,
                    format!("{:?} private key with {:?} public key", self.curve(), public.curve()),
                ))
            }
        };
        if x.iter().all(|b| *b == 0) {
            return Err(P2pError::crypto_error(CryptoErrorKind::SharedKeyIsPointAtInfinity, ""));
        }

        let length = (sk_len + mac_len).max(self.curve().field_bytes());
        let mut sk = vec![0u8; length];
        sk[length - x.len()..].copy_from_slice(&x);
        Ok(sk)
    }
}

fn ecdh_x<C: CurveArithmetic>(secret: &elliptic_curve::SecretKey<C>, public: &elliptic_curve::PublicKey<C>) -> Vec<u8> {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    shared.raw_secret_bytes().to_vec()
}

fn kdf(hash: HashKind, secret: &[u8], salt: Option<&[u8]>, key_len: usize) -> Result<Vec<u8>, P2pError> {
    let mut key = vec![0u8; key_len];
    let expanded = match hash {
        HashKind::Sha256 => Hkdf::<Sha256>::new(salt, secret).expand(&KDF_INFO, &mut key),
        HashKind::Sha384 => Hkdf::<Sha384>::new(salt, secret).expand(&KDF_INFO, &mut key),
        HashKind::Sha512 => Hkdf::<Sha512>::new(salt, secret).expand(&KDF_INFO, &mut key),
    };
    expanded.map_err(|e| P2pError::crypto_error(CryptoErrorKind::UnsupportedAlgorithm, e.to_string()))?;
    Ok(key)
}

fn mac_tag(hash: HashKind, key: &[u8], data: &[u8]) -> Result<Vec<u8>, P2pError> {
    let key_error = |_| P2pError::crypto_error(CryptoErrorKind::InvalidKeySize, "hmac key");
    let tag = match hash {
        HashKind::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(key_error)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashKind::Sha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key).map_err(key_error)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashKind::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(key_error)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(tag)
}

/// Constant-time tag comparison
pub fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Encrypt `msg` to `recipient`
pub fn encrypt(recipient: &PublicKey, msg: &[u8], salt: Option<&[u8]>) -> Result<Vec<u8>, P2pError> {
    let curve = recipient.curve();
    let params = curve.params();

    let ephemeral = PrivateKey::generate(curve);
    let sk = ephemeral.shared_key(recipient, params.key_len, params.key_len)?;
    let key = kdf(params.hash, &sk, salt, params.key_len)?;

    let mut em = vec![0u8; params.block_size + msg.len()];
    OsRng.fill_bytes(&mut em[..params.block_size]);
    em[params.block_size..].copy_from_slice(msg);
    let iv = em[..params.block_size].to_vec();
    AesCtr::new(&key, &iv)?.apply_keystream(&mut em[params.block_size..]);

    let tag = mac_tag(params.hash, &key, &em)?;
    let random_pub = ephemeral.public_key().to_bytes();

    let mut out = Vec::with_capacity(random_pub.len() + em.len() + tag.len());
    out.extend_from_slice(&random_pub);
    out.extend_from_slice(&em);
    out.extend_from_slice(&tag);
    trace!("ECIES encrypted {} bytes into {} bytes on {:?}", msg.len(), out.len(), curve);
    Ok(out)
}

/// Decrypt a message produced by [`encrypt`]
pub fn decrypt(recipient: &PrivateKey, data: &[u8], salt: Option<&[u8]>) -> Result<Vec<u8>, P2pError> {
    let curve = recipient.curve();
    let params = curve.params();
    let pub_len = curve.public_key_len();
    let hash_len = params.hash.size();

    if data.len() < pub_len + params.block_size + hash_len {
        return Err(P2pError::crypto_error(
            CryptoErrorKind::InvalidMessage,
            format!("ciphertext of {} bytes is too short", data.len()),
        ));
    }

    let random_pub = PublicKey::from_bytes(curve, &data[..pub_len])?;
    let sk = recipient.shared_key(&random_pub, params.key_len, params.key_len)?;
    let key = kdf(params.hash, &sk, salt, params.key_len)?;

    let em = &data[pub_len..data.len() - hash_len];
    let expected = mac_tag(params.hash, &key, em)?;
    if !tags_equal(&expected, &data[data.len() - hash_len..]) {
        return Err(P2pError::crypto_error(CryptoErrorKind::InvalidMessage, "tag mismatch"));
    }

    let (iv, ct) = em.split_at(params.block_size);
    let mut plain = ct.to_vec();
    AesCtr::new(&key, iv)?.apply_keystream(&mut plain);
    Ok(plain)
}
