//! End-to-end encrypted channel.
//!
//! A 3-message, PSK-authenticated, forward-secret handshake
//! ([`handshake`]) followed by an AEAD record stream ([`record`]). The
//! outer transport is untrusted; confidentiality and integrity live
//! entirely in this layer.

pub mod handshake;
pub mod kex;
pub mod keys;
pub mod record;
pub mod wire;

use std::time::Duration;

use crate::channel::{ChannelId, Psk};
use crate::suite::CipherSuite;

/// Wire magic prefix for handshake messages: `0x46 0x53 0x01 0x02`.
pub const MAGIC: [u8; 4] = [0x46, 0x53, 0x01, 0x02];

/// Handshake protocol version.
pub const VERSION: u8 = 1;

pub const DEFAULT_MAX_HANDSHAKE_PAYLOAD: usize = 8 * 1024;
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Baseline feature bit. No other bits are assigned; receivers ignore
/// bits they do not know.
pub const FEATURE_BASELINE: u16 = 0x0001;

/// How far in the future a ClientHello's `init_exp` may sit before the
/// server refuses to start the handshake.
pub const DEFAULT_MAX_INIT_LOOKAHEAD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Tuning knobs shared by both handshake roles.
#[derive(Debug, Clone)]
pub struct E2eeConfig {
    /// Cap on a single handshake message payload.
    pub max_handshake_payload: usize,
    /// Cap on a single record's ciphertext length.
    pub max_record_bytes: usize,
    /// Clock-skew budget applied to `init_exp` checks.
    pub clock_skew: Duration,
    /// Upper bound on how far ahead `init_exp` may lie.
    pub max_init_lookahead: Duration,
    /// Feature bitmask advertised in the hello.
    pub features: u16,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            max_handshake_payload: DEFAULT_MAX_HANDSHAKE_PAYLOAD,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            clock_skew: Duration::from_secs(5),
            max_init_lookahead: DEFAULT_MAX_INIT_LOOKAHEAD,
            features: FEATURE_BASELINE,
        }
    }
}

/// Everything that binds one endpoint to a channel: the out-of-band
/// negotiated id, the PSK, the suite, and the init deadline.
pub struct ChannelParams {
    pub channel_id: ChannelId,
    pub psk: Psk,
    pub suite: CipherSuite,
    /// Unix seconds after which the handshake may no longer begin.
    pub init_expire_at: i64,
}

impl std::fmt::Debug for ChannelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelParams")
            .field("channel_id", &self.channel_id)
            .field("psk", &"<redacted>")
            .field("suite", &self.suite)
            .field("init_expire_at", &self.init_expire_at)
            .finish()
    }
}
