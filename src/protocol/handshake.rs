//! ECDHE handshake
//!
//! Each side sends one ECIES packet to the other's long-term key:
//!
//! ```text
//! static_pub(65) | nonce(32) | signature(32) | ephemeral_pub(65)
//! token     = ECDH(static_pri, remote_static_pub) ^ nonce
//! signature = HMAC-SHA256(key = 16 zero bytes, token | ephemeral_pub)
//! ```
//!
//! The ephemeral keys and both nonces then yield the session [`Secrets`].

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::crypto::ecies::{self, tags_equal, CurveKind, PrivateKey, PublicKey};
use crate::error::{CryptoErrorKind, P2pError};
use crate::identity::Enode;
use crate::protocol::frame::{RunningHash, Secrets};

/// Uncompressed P-256 point
pub const PUBLIC_KEY_SIZE: usize = 65;
pub const NONCE_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 32;
/// Cleartext hello
pub const HELLO_SIZE: usize = 0xc2;
/// ECIES wrapped hello on P-256
pub const PACKET_SIZE: usize = 0x133;

/// Zero key used for the token signature
const SIGNATURE_KEY: [u8; 16] = [0u8; 16];

/// Decoded hello from the remote side
#[derive(Debug, Clone)]
pub struct Hello {
    pub static_pub: PublicKey,
    pub ephemeral_pub: PublicKey,
    pub nonce: [u8; NONCE_SIZE],
}

/// What a side keeps between writing its hello and deriving secrets
#[derive(Debug)]
pub struct Pending {
    pub ephemeral: PrivateKey,
    pub nonce: [u8; NONCE_SIZE],
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

fn sign(token: &[u8], ephemeral_pub: &[u8]) -> Result<Vec<u8>, P2pError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(&SIGNATURE_KEY)
        .map_err(|_| P2pError::crypto_error(CryptoErrorKind::InvalidKeySize, "signature key"))?;
    mac.update(token);
    mac.update(ephemeral_pub);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Handshake driver bound to the local identity
#[derive(Debug, Clone)]
pub struct Ecdhe {
    local: Enode,
}

impl Ecdhe {
    /// `local` must carry its private key
    pub fn new(local: Enode) -> Result<Self, P2pError> {
        if local.private_key().is_none() {
            return Err(P2pError::crypto_error(
                CryptoErrorKind::InvalidKeySize,
                "handshake requires the local private key",
            ));
        }
        Ok(Self { local })
    }

    pub fn local(&self) -> &Enode {
        &self.local
    }

    fn private_key(&self) -> Result<&PrivateKey, P2pError> {
        self.local
            .private_key()
            .ok_or_else(|| P2pError::crypto_error(CryptoErrorKind::InvalidKeySize, "missing private key"))
    }

    /// Build an encrypted hello for `remote`
    pub fn seal_hello(&self, remote: &PublicKey) -> Result<(Vec<u8>, Pending), P2pError> {
        let private = self.private_key()?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ephemeral = PrivateKey::generate(CurveKind::P256);
        let ephemeral_pub = ephemeral.public_key().to_bytes();

        let token = xor(&private.shared_key(remote, 16, 16)?, &nonce);
        let signature = sign(&token, &ephemeral_pub)?;

        let mut hello = Vec::with_capacity(HELLO_SIZE);
        hello.extend_from_slice(&self.local.public_key().to_bytes());
        hello.extend_from_slice(&nonce);
        hello.extend_from_slice(&signature);
        hello.extend_from_slice(&ephemeral_pub);

        let packet = ecies::encrypt(remote, &hello, None)?;
        Ok((packet, Pending { ephemeral, nonce }))
    }

    /// Decrypt and authenticate a hello addressed to us
    pub fn open_hello(&self, packet: &[u8]) -> Result<Hello, P2pError> {
        let private = self.private_key()?;
        let hello = ecies::decrypt(private, packet, None).map_err(|e| {
            debug!("Handshake packet did not decrypt: {}", e);
            P2pError::crypto_error(CryptoErrorKind::DecryptFailed, e.to_string())
        })?;
        if hello.len() != HELLO_SIZE {
            return Err(P2pError::crypto_error(
                CryptoErrorKind::InvalidMessage,
                format!("hello is {} bytes", hello.len()),
            ));
        }

        let (static_bytes, rest) = hello.split_at(PUBLIC_KEY_SIZE);
        let (nonce_bytes, rest) = rest.split_at(NONCE_SIZE);
        let (signature, ephemeral_bytes) = rest.split_at(SIGNATURE_SIZE);

        let static_pub = PublicKey::from_bytes(CurveKind::P256, static_bytes)?;
        let ephemeral_pub = PublicKey::from_bytes(CurveKind::P256, ephemeral_bytes)?;

        let token = xor(&private.shared_key(&static_pub, 16, 16)?, nonce_bytes);
        let expected = sign(&token, ephemeral_bytes)?;
        if !tags_equal(&expected, signature) {
            return Err(P2pError::crypto_error(CryptoErrorKind::InvalidSignature, "hello token signature"));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Hello {
            static_pub,
            ephemeral_pub,
            nonce,
        })
    }

    /// Write our hello to `writer`
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, writer: &mut W, remote: &PublicKey) -> Result<Pending, P2pError> {
        let (packet, pending) = self.seal_hello(remote)?;
        writer.write_all(&packet).await?;
        writer.flush().await?;
        trace!("Wrote handshake packet ({} bytes)", packet.len());
        Ok(pending)
    }

    /// Read the remote hello from `reader`
    pub async fn read<R: AsyncReadExt + Unpin>(&self, reader: &mut R) -> Result<Hello, P2pError> {
        let mut packet = [0u8; PACKET_SIZE];
        reader.read_exact(&mut packet).await?;
        self.open_hello(&packet)
    }

    /// Derive the session secrets; symmetric in the two nonces
    pub fn ephemeral(&self, pending: Pending, remote: &Hello) -> Result<Secrets, P2pError> {
        let shared = pending.ephemeral.shared_key(&remote.ephemeral_pub, 16, 16)?;

        let mut hasher = Sha256::new();
        hasher.update(&shared);
        hasher.update(xor(&pending.nonce, &remote.nonce));
        let ak = hasher.clone().finalize().to_vec();
        hasher.update(&ak);
        let mk = hasher.finalize().to_vec();

        Ok(Secrets {
            ak,
            mk,
            egress: RunningHash::sha256(),
            ingress: RunningHash::sha256(),
        })
    }

    /// Client side: write, read, check the responder is who we dialed
    pub async fn initiate<S>(&self, stream: &mut S, remote: &Enode) -> Result<Secrets, P2pError>
    where
        S: AsyncReadExt + AsyncWriteExt + Unpin,
    {
        let pending = self.write(stream, remote.public_key()).await?;
        let hello = self.read(stream).await?;
        if &hello.static_pub != remote.public_key() {
            error!("Handshake responder key does not match {}", remote.id());
            return Err(P2pError::crypto_error(
                CryptoErrorKind::InvalidPublicKey,
                "responder static key does not match the dialed enode",
            ));
        }
        self.ephemeral(pending, &hello)
    }

    /// Server side: read, answer to the initiator's key, derive
    pub async fn respond<S>(&self, stream: &mut S) -> Result<(Secrets, PublicKey), P2pError>
    where
        S: AsyncReadExt + AsyncWriteExt + Unpin,
    {
        let hello = self.read(stream).await?;
        let pending = self.write(stream, &hello.static_pub).await?;
        let secrets = self.ephemeral(pending, &hello)?;
        Ok((secrets, hello.static_pub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameCodec;
    use crate::protocol::wire::{read_frame, write_frame};
    use crate::protocol::frame::NO_FLAGS;

    fn node(port: u16) -> Enode {
        Enode::from_private_key(PrivateKey::generate(CurveKind::P256), "127.0.0.1", port, port).unwrap()
    }

    #[test]
    fn test_packet_size() {
        let a = Ecdhe::new(node(1)).unwrap();
        let b = node(2);
        let (packet, _) = a.seal_hello(b.public_key()).unwrap();
        assert_eq!(packet.len(), PACKET_SIZE);
    }

    #[test]
    fn test_hello_roundtrip_and_symmetric_secrets() {
        let alice = Ecdhe::new(node(1)).unwrap();
        let bob = Ecdhe::new(node(2)).unwrap();

        let (to_bob, alice_pending) = alice.seal_hello(bob.local().public_key()).unwrap();
        let from_alice = bob.open_hello(&to_bob).unwrap();
        assert_eq!(&from_alice.static_pub, alice.local().public_key());
        assert_eq!(from_alice.nonce, alice_pending.nonce);

        let (to_alice, bob_pending) = bob.seal_hello(&from_alice.static_pub).unwrap();
        let from_bob = alice.open_hello(&to_alice).unwrap();
        assert_eq!(from_bob.nonce, bob_pending.nonce);

        let alice_secrets = alice.ephemeral(alice_pending, &from_bob).unwrap();
        let bob_secrets = bob.ephemeral(bob_pending, &from_alice).unwrap();
        assert_eq!(alice_secrets.ak, bob_secrets.ak);
        assert_eq!(alice_secrets.mk, bob_secrets.mk);
        assert_eq!(alice_secrets.ak.len(), 32);
        assert_ne!(alice_secrets.ak, alice_secrets.mk);
    }

    #[test]
    fn test_wrong_recipient_fails_to_decrypt() {
        let alice = Ecdhe::new(node(1)).unwrap();
        let bob = Ecdhe::new(node(2)).unwrap();
        let carol = Ecdhe::new(node(3)).unwrap();
        let (packet, _) = alice.seal_hello(bob.local().public_key()).unwrap();
        let err = carol.open_hello(&packet).unwrap_err();
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::DecryptFailed));
    }

    #[test]
    fn test_forged_static_key_fails_signature() {
        let alice = Ecdhe::new(node(1)).unwrap();
        let bob = Ecdhe::new(node(2)).unwrap();
        let mallory = node(3);

        // hello claims mallory's static key but is signed with alice's token
        let (packet, _) = alice.seal_hello(bob.local().public_key()).unwrap();
        let private = bob.local().private_key().unwrap();
        let mut hello = ecies::decrypt(private, &packet, None).unwrap();
        hello[..PUBLIC_KEY_SIZE].copy_from_slice(&mallory.public_key().to_bytes());
        let forged = ecies::encrypt(bob.local().public_key(), &hello, None).unwrap();

        let err = bob.open_hello(&forged).unwrap_err();
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidSignature));
    }

    #[test]
    fn test_requires_private_key() {
        let public_only = Enode::parse(node(1).url()).unwrap();
        assert!(Ecdhe::new(public_only).is_err());
    }

    #[tokio::test]
    async fn test_handshake_then_ping_pong() {
        let client = Ecdhe::new(node(1)).unwrap();
        let server = Ecdhe::new(node(2)).unwrap();
        let server_enode = server.local().clone();

        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let (secrets, client_pub) = server.respond(&mut server_io).await.unwrap();
            let (mut reader, mut writer) = FrameCodec::new(secrets).unwrap().split();
            let frame = read_frame(&mut reader, &mut server_io).await.unwrap();
            assert_eq!(frame.data, b"ping");
            write_frame(&mut writer, &mut server_io, NO_FLAGS, frame.id, b"pong").await.unwrap();
            client_pub
        });

        let secrets = client.initiate(&mut client_io, &server_enode).await.unwrap();
        let (mut reader, mut writer) = FrameCodec::new(secrets).unwrap().split();
        write_frame(&mut writer, &mut client_io, NO_FLAGS, 7, b"ping").await.unwrap();
        let reply = read_frame(&mut reader, &mut client_io).await.unwrap();
        assert_eq!(reply.data, b"pong");
        assert_eq!(reply.id, 7);

        let client_pub = server_task.await.unwrap();
        assert_eq!(&client_pub, client.local().public_key());
    }

    #[tokio::test]
    async fn test_initiate_rejects_impostor() {
        let client = Ecdhe::new(node(1)).unwrap();
        let server = Ecdhe::new(node(2)).unwrap();
        let expected = node(3);

        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = server.respond(&mut server_io).await;
        });
        // dialing `expected` but the packet is for server's key; server cannot decrypt it
        let err = client.initiate(&mut client_io, &expected).await.unwrap_err();
        assert!(err.frame_kind() == Some(crate::error::FrameErrorKind::ShortRead) || err.crypto_kind().is_some());
    }
}
