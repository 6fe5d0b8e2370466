//! Frame codec
//!
//! Every frame on an authenticated session is laid out as
//!
//! ```text
//! header(32) = enc(len u32 BE | flags 4 | frame id 8) | header mac 16
//! body       = enc(payload | zero padding to 16)
//! body mac   = 16
//! ```
//!
//! Both directions run one continuous AES-CTR stream keyed with AK and a zero
//! IV. The macs come from running hashes that absorb every body ciphertext in
//! order, so any lost, reordered or tampered frame desynchronizes the session
//! for good.

use std::fmt;

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::crypto::aes::{AesBlock, AesCtr, BLOCK_SIZE};
use crate::crypto::ecies::tags_equal;
use crate::crypto::sm3::Sm3;
use crate::error::{FrameErrorKind, P2pError};

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;
/// Body padding boundary
pub const PAD_SIZE: usize = 16;
/// Size of both macs
pub const MAC_SIZE: usize = 16;
/// Default payload limit
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 16;

/// Heartbeat request, set by the client in the low nibble
pub const PING_FLAGS: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
/// Heartbeat answer, set by the server in the high nibble
pub const PONG_FLAGS: [u8; 4] = [0x10, 0x00, 0x00, 0x00];
pub const NO_FLAGS: [u8; 4] = [0x00; 4];

/// Hash state absorbing the ciphertext of one direction
#[derive(Clone)]
pub enum RunningHash {
    Sha256(Sha256),
    Sm3(Sm3),
}

impl RunningHash {
    pub fn sha256() -> Self {
        RunningHash::Sha256(Sha256::new())
    }

    pub fn sm3() -> Self {
        RunningHash::Sm3(Sm3::new())
    }

    pub fn write(&mut self, data: &[u8]) {
        match self {
            RunningHash::Sha256(h) => h.update(data),
            RunningHash::Sm3(h) => h.write(data),
        }
    }

    /// Digest of everything absorbed so far; the state keeps running
    pub fn sum(&self) -> Vec<u8> {
        match self {
            RunningHash::Sha256(h) => h.clone().finalize().to_vec(),
            RunningHash::Sm3(h) => h.sum().to_vec(),
        }
    }
}

impl fmt::Debug for RunningHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningHash::Sha256(_) => write!(f, "RunningHash::Sha256"),
            RunningHash::Sm3(_) => write!(f, "RunningHash::Sm3"),
        }
    }
}

/// Session keys produced by the handshake
pub struct Secrets {
    /// Stream key for the CTR cipher
    pub ak: Vec<u8>,
    /// Mac key for the header and body signatures
    pub mk: Vec<u8>,
    pub egress: RunningHash,
    pub ingress: RunningHash,
}

impl Secrets {
    /// Pre-shared secrets with fresh running hashes of the chosen kind
    pub fn new(ak: Vec<u8>, mk: Vec<u8>, sm3: bool) -> Self {
        let fresh = || if sm3 { RunningHash::sm3() } else { RunningHash::sha256() };
        Self {
            ak,
            mk,
            egress: fresh(),
            ingress: fresh(),
        }
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("ak", &format_args!("<{} bytes>", self.ak.len()))
            .field("mk", &format_args!("<{} bytes>", self.mk.len()))
            .field("egress", &self.egress)
            .field("ingress", &self.ingress)
            .finish()
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: [u8; 4],
    pub id: u64,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(flags: [u8; 4], id: u64, data: Vec<u8>) -> Self {
        Self { flags, id, data }
    }

    pub fn is_ping(&self) -> bool {
        self.flags[0] & 0x0f == PING_FLAGS[0]
    }

    pub fn is_pong(&self) -> bool {
        self.flags[0] & 0xf0 == PONG_FLAGS[0]
    }
}

/// Decrypted header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: usize,
    pub flags: [u8; 4],
    pub id: u64,
}

impl FrameHeader {
    /// Body bytes on the wire, padding included, mac excluded
    pub fn padded_len(&self) -> usize {
        padded(self.len)
    }
}

fn padded(len: usize) -> usize {
    match len % PAD_SIZE {
        0 => len,
        rem => len + PAD_SIZE - rem,
    }
}

/// `hash.write(AES_mk(hash.sum()[..16]) ^ seed[..16]); hash.sum()[..16]`
fn hash_mac(hash: &mut RunningHash, block: &AesBlock, seed: &[u8]) -> [u8; MAC_SIZE] {
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(&hash.sum()[..BLOCK_SIZE]);
    block.encrypt_block(&mut buf);
    for (b, s) in buf.iter_mut().zip(seed.iter()) {
        *b ^= s;
    }
    hash.write(&buf);

    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&hash.sum()[..MAC_SIZE]);
    mac
}

fn too_large(len: usize, max: usize) -> P2pError {
    P2pError::frame_error_with_source(FrameErrorKind::TooLarge, format!("{} > {}", len, max))
}

/// Sending half: encrypts and signs outgoing frames
pub struct FrameWriter {
    stream: AesCtr,
    mac_block: AesBlock,
    egress: RunningHash,
    max_frame_size: usize,
}

impl FrameWriter {
    /// Encode one frame, advancing the stream and egress hash
    pub fn seal(&mut self, flags: [u8; 4], id: u64, data: &[u8]) -> Result<Vec<u8>, P2pError> {
        if data.len() > self.max_frame_size {
            return Err(too_large(data.len(), self.max_frame_size));
        }

        let body_len = padded(data.len());
        let mut out = BytesMut::with_capacity(HEADER_SIZE + body_len + MAC_SIZE);
        out.put_u32(data.len() as u32);
        out.put_slice(&flags);
        out.put_u64(id);
        self.stream.apply_keystream(&mut out[..16]);
        let header_mac = hash_mac(&mut self.egress, &self.mac_block, &out[..16]);
        out.put_slice(&header_mac);

        let body_start = out.len();
        out.put_slice(data);
        out.put_bytes(0, body_len - data.len());
        self.stream.apply_keystream(&mut out[body_start..]);
        self.egress.write(&out[body_start..]);

        let seed = self.egress.sum();
        let body_mac = hash_mac(&mut self.egress, &self.mac_block, &seed);
        out.put_slice(&body_mac);

        trace!("Sealed frame {:016x} ({} bytes payload)", id, data.len());
        Ok(out.to_vec())
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Receiving half: verifies and decrypts incoming frames
pub struct FrameReader {
    stream: AesCtr,
    mac_block: AesBlock,
    ingress: RunningHash,
    max_frame_size: usize,
}

impl FrameReader {
    /// Verify and decrypt a 32-byte header
    pub fn open_header(&mut self, header: &[u8]) -> Result<FrameHeader, P2pError> {
        if header.len() < HEADER_SIZE {
            return Err(P2pError::frame_error_with_source(
                FrameErrorKind::ShortRead,
                format!("header {} < {}", header.len(), HEADER_SIZE),
            ));
        }

        let expected = hash_mac(&mut self.ingress, &self.mac_block, &header[..16]);
        if !tags_equal(&expected, &header[16..HEADER_SIZE]) {
            warn!("Frame header signature mismatch");
            return Err(P2pError::frame_error(FrameErrorKind::BadHeaderSign));
        }

        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&header[..16]);
        self.stream.apply_keystream(&mut prefix);

        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&prefix[4..8]);
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&prefix[8..16]);
        let id = u64::from_be_bytes(id_bytes);

        if len > self.max_frame_size {
            return Err(too_large(len, self.max_frame_size));
        }
        Ok(FrameHeader { len, flags, id })
    }

    /// Verify and decrypt the padded body plus its trailing mac
    pub fn open_body(&mut self, header: &FrameHeader, body: &[u8]) -> Result<Frame, P2pError> {
        let body_len = header.padded_len();
        if body.len() < body_len + MAC_SIZE {
            return Err(P2pError::frame_error_with_source(
                FrameErrorKind::ShortRead,
                format!("frame {:016x} body {} < {}", header.id, body.len(), body_len + MAC_SIZE),
            ));
        }

        let (cipher, sign) = body.split_at(body_len);
        self.ingress.write(cipher);
        let seed = self.ingress.sum();
        let expected = hash_mac(&mut self.ingress, &self.mac_block, &seed);
        if !tags_equal(&expected, &sign[..MAC_SIZE]) {
            warn!("Frame {:016x} body signature mismatch", header.id);
            return Err(P2pError::frame_error(FrameErrorKind::BadBodySign));
        }

        let mut plain = cipher.to_vec();
        self.stream.apply_keystream(&mut plain);
        plain.truncate(header.len);
        Ok(Frame::new(header.flags, header.id, plain))
    }

    /// Decode one complete frame from `bytes`
    pub fn open(&mut self, bytes: &[u8]) -> Result<Frame, P2pError> {
        let header = self.open_header(bytes)?;
        self.open_body(&header, &bytes[HEADER_SIZE..])
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Both halves of a session's frame state
pub struct FrameCodec {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Result<Self, P2pError> {
        Self::with_max_frame_size(secrets, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Consumes the secrets; they belong to exactly one session
    pub fn with_max_frame_size(secrets: Secrets, max_frame_size: usize) -> Result<Self, P2pError> {
        let Secrets { ak, mk, egress, ingress } = secrets;
        Ok(Self {
            reader: FrameReader {
                stream: AesCtr::with_zero_iv(&ak)?,
                mac_block: AesBlock::new(&mk)?,
                ingress,
                max_frame_size,
            },
            writer: FrameWriter {
                stream: AesCtr::with_zero_iv(&ak)?,
                mac_block: AesBlock::new(&mk)?,
                egress,
                max_frame_size,
            },
        })
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    pub fn seal(&mut self, flags: [u8; 4], id: u64, data: &[u8]) -> Result<Vec<u8>, P2pError> {
        self.writer.seal(flags, id, data)
    }

    pub fn open(&mut self, bytes: &[u8]) -> Result<Frame, P2pError> {
        self.reader.open(bytes)
    }
}
