//! Suite-specific ephemeral key agreement.
//!
//! Both suites yield a 32-byte shared secret: X25519's raw output, or the
//! X coordinate for P-256. Private keys live only for the duration of the
//! handshake; the dalek and RustCrypto types wipe themselves on drop, and
//! `agree` consumes the keypair so nothing outlives the derivation.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::suite::CipherSuite;

/// 32-byte ECDH output. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

pub enum EphemeralKeyPair {
    X25519 {
        secret: x25519_dalek::EphemeralSecret,
        public: x25519_dalek::PublicKey,
    },
    P256 {
        secret: p256::ecdh::EphemeralSecret,
        public: p256::PublicKey,
    },
}

fn fatal(msg: &str) -> FsError {
    FsError::new(Stage::Handshake, ErrorCode::HandshakeError).with_message(msg)
}

impl EphemeralKeyPair {
    pub fn generate(suite: CipherSuite) -> Self {
        match suite {
            CipherSuite::X25519HkdfSha256Aes256Gcm => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                EphemeralKeyPair::X25519 { secret, public }
            }
            CipherSuite::P256HkdfSha256Aes256Gcm => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key();
                EphemeralKeyPair::P256 { secret, public }
            }
        }
    }

    /// Wire encoding of the public half: 32 raw bytes for X25519, a 33-byte
    /// SEC1 compressed point for P-256.
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            EphemeralKeyPair::X25519 { public, .. } => public.as_bytes().to_vec(),
            EphemeralKeyPair::P256 { public, .. } => {
                public.to_encoded_point(true).as_bytes().to_vec()
            }
        }
    }

    /// Run the key agreement against the peer's wire-encoded public key.
    /// Consumes the keypair; the private half is wiped when this returns.
    pub fn agree(self, peer_pub: &[u8]) -> FsResult<SharedSecret> {
        match self {
            EphemeralKeyPair::X25519 { secret, .. } => {
                let bytes: [u8; 32] = peer_pub
                    .try_into()
                    .map_err(|_| fatal("peer X25519 public key must be 32 bytes"))?;
                let peer = x25519_dalek::PublicKey::from(bytes);
                let shared = secret.diffie_hellman(&peer);
                // Contributory check: an all-zero output means the peer sent
                // a low-order point.
                if !shared.was_contributory() {
                    return Err(fatal("non-contributory X25519 exchange"));
                }
                Ok(SharedSecret(*shared.as_bytes()))
            }
            EphemeralKeyPair::P256 { secret, .. } => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_pub)
                    .map_err(|_| fatal("peer P-256 public key is not a valid point"))?;
                let shared = secret.diffie_hellman(&peer);
                let raw = shared.raw_secret_bytes();
                let mut out = [0u8; 32];
                out.copy_from_slice(raw.as_slice());
                Ok(SharedSecret(out))
            }
        }
    }
}
