//! Channel identity, endpoint roles, and pre-shared key material.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::b64;
use crate::error::{ErrorCode, FsError, FsResult, Stage};

/// Which end of a channel an endpoint is. On the wire (grants, tokens,
/// attach) the client is `1` and the server is `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const fn wire_id(&self) -> u8 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Role::Client),
            2 => Ok(Role::Server),
            other => Err(format!("unknown role {other}")),
        }
    }
}

impl From<Role> for u8 {
    fn from(r: Role) -> u8 {
        r.wire_id()
    }
}

/// Longest accepted channel id, in bytes, after whitespace trim.
pub const MAX_CHANNEL_ID: usize = 256;

/// Validated channel identifier. Opaque to the stack; compared in constant
/// time wherever an attacker controls one side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelId(String);

impl ChannelId {
    /// Trim ASCII whitespace and validate length bounds.
    pub fn parse(raw: &str) -> FsResult<Self> {
        let trimmed = raw.trim_matches(|c: char| c.is_ascii_whitespace());
        if trimmed.is_empty() {
            return Err(FsError::new(Stage::Validate, ErrorCode::MissingChannelId)
                .with_message("channel_id is empty"));
        }
        if trimmed.len() > MAX_CHANNEL_ID {
            return Err(FsError::new(Stage::Validate, ErrorCode::ChannelIdTooLong)
                .with_message(format!(
                    "channel_id is {} bytes, max {MAX_CHANNEL_ID}",
                    trimmed.len()
                )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Constant-time equality against an attacker-supplied id. Length is not
    /// secret; contents are compared without short-circuiting.
    pub fn ct_eq_bytes(&self, other: &[u8]) -> bool {
        self.0.len() == other.len() && bool::from(self.0.as_bytes().ct_eq(other))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte pre-shared key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk([u8; 32]);

impl Psk {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode the `e2ee_psk_b64u` form carried in grants and connect info.
    pub fn from_b64u(s: &str) -> FsResult<Self> {
        let bytes = b64::decode_exact::<32>(s).map_err(|e| {
            FsError::new(Stage::Validate, ErrorCode::InvalidPsk)
                .with_message("psk must be base64url of 32 bytes")
                .with_source(e)
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Never print key material.
impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Psk(..)")
    }
}
