// SPDX-License-Identifier: MIT
//! Handshake transcript tags and the record key schedule.
//!
//! Key schedule: `PRK = HKDF-Extract(salt = client_nonce ∥ server_nonce,
//! ikm = Z ∥ PSK)`, then one `HKDF-Expand(PRK, label)` of 32 bytes per
//! direction for the AEAD key and per direction for the IV base. The first
//! 12 bytes of each IV output seed the per-record nonces.
//!
//! Transcript tags are HMAC-SHA256 under the PSK, truncated to 16 bytes,
//! verified in constant time.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::Psk;
use crate::error::{ErrorCode, FsError, FsResult, Stage};

use super::kex::SharedSecret;
use super::wire::TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

pub const LABEL_C2S_KEY: &[u8] = b"fs/1/c2s-key";
pub const LABEL_S2C_KEY: &[u8] = b"fs/1/s2c-key";
pub const LABEL_C2S_IV: &[u8] = b"fs/1/c2s-iv";
pub const LABEL_S2C_IV: &[u8] = b"fs/1/s2c-iv";

/// AEAD key and nonce base for one direction. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub key: [u8; 32],
    pub iv: [u8; 12],
}

/// Both directions of a channel, labeled by who sends.
pub struct RecordKeys {
    pub c2s: DirectionKeys,
    pub s2c: DirectionKeys,
}

/// Derive the full record key schedule from the handshake outputs.
pub fn derive_record_keys(
    z: &SharedSecret,
    psk: &Psk,
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
) -> FsResult<RecordKeys> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_nonce);
    salt[32..].copy_from_slice(server_nonce);

    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(z.as_bytes());
    ikm[32..].copy_from_slice(psk.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    ikm.zeroize();

    let expand = |label: &[u8]| -> FsResult<[u8; 32]> {
        let mut okm = [0u8; 32];
        hk.expand(label, &mut okm).map_err(|_| {
            FsError::new(Stage::Handshake, ErrorCode::HandshakeError)
                .with_message("hkdf expand failed")
        })?;
        Ok(okm)
    };

    let c2s_key = expand(LABEL_C2S_KEY)?;
    let s2c_key = expand(LABEL_S2C_KEY)?;
    let mut c2s_iv_full = expand(LABEL_C2S_IV)?;
    let mut s2c_iv_full = expand(LABEL_S2C_IV)?;

    let mut c2s_iv = [0u8; 12];
    c2s_iv.copy_from_slice(&c2s_iv_full[..12]);
    let mut s2c_iv = [0u8; 12];
    s2c_iv.copy_from_slice(&s2c_iv_full[..12]);
    c2s_iv_full.zeroize();
    s2c_iv_full.zeroize();

    Ok(RecordKeys {
        c2s: DirectionKeys {
            key: c2s_key,
            iv: c2s_iv,
        },
        s2c: DirectionKeys {
            key: s2c_key,
            iv: s2c_iv,
        },
    })
}

fn transcript_mac(psk: &Psk, transcript: &[&[u8]]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(psk.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    for part in transcript {
        mac.update(part);
    }
    mac
}

/// HMAC-SHA256 over the transcript parts, truncated to 16 bytes.
pub fn transcript_tag(psk: &Psk, transcript: &[&[u8]]) -> [u8; TAG_LEN] {
    let full = transcript_mac(psk, transcript).finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

/// Constant-time verification of a truncated transcript tag.
pub fn verify_transcript_tag(psk: &Psk, transcript: &[&[u8]], tag: &[u8; TAG_LEN]) -> bool {
    transcript_mac(psk, transcript)
        .verify_truncated_left(tag)
        .is_ok()
}
