//! Control-plane data objects consumed at the boundary: channel-init
//! grants, direct connect info, the tunnel attach message, and tunnel URL
//! selection.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::b64;
use crate::channel::Role;
use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::suite::CipherSuite;

/// Cap on any control-plane JSON input (grants, connect info).
pub const MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Caps on the tunnel attach message.
pub const MAX_ATTACH_BYTES: usize = 8192;
pub const MAX_ATTACH_CHANNEL_ID: usize = 256;
pub const MAX_ATTACH_TOKEN: usize = 2048;

/// What the control plane hands an endpoint so it can join a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelGrant {
    pub v: u32,
    pub role: Role,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    pub e2ee_psk_b64u: String,
    pub default_suite: CipherSuite,
    pub token: String,
}

// Grants arrive either raw or wrapped; both decode to the same struct.
#[derive(Deserialize)]
#[serde(untagged)]
enum GrantDocument {
    WrappedClient { grant_client: ChannelGrant },
    WrappedServer { grant_server: ChannelGrant },
    Raw(ChannelGrant),
}

fn check_input_len(input: &[u8]) -> FsResult<()> {
    if input.len() > MAX_INPUT_BYTES {
        return Err(FsError::new(Stage::Validate, ErrorCode::InputTooLarge)
            .with_message(format!(
                "input of {} bytes exceeds cap of {MAX_INPUT_BYTES}",
                input.len()
            )));
    }
    Ok(())
}

/// Decode a grant from raw bytes, accepting both the raw and the
/// `{"grant_client": …}` / `{"grant_server": …}` wrapper forms.
pub fn decode_grant(input: &[u8]) -> FsResult<ChannelGrant> {
    check_input_len(input)?;
    let doc: GrantDocument = serde_json::from_slice(input).map_err(|e| {
        FsError::new(Stage::Validate, ErrorCode::InvalidJson)
            .with_message("grant is not valid JSON")
            .with_source(e)
    })?;
    Ok(match doc {
        GrantDocument::WrappedClient { grant_client } => grant_client,
        GrantDocument::WrappedServer { grant_server } => grant_server,
        GrantDocument::Raw(grant) => grant,
    })
}

/// What the direct demo prints: enough to dial the endpoint's own
/// WebSocket. Unknown (demo-specific) fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConnectInfo {
    pub ws_url: String,
    pub channel_id: String,
    pub e2ee_psk_b64u: String,
    pub default_suite: CipherSuite,
    pub channel_init_expire_at_unix_s: i64,
}

pub fn decode_direct_info(input: &[u8]) -> FsResult<DirectConnectInfo> {
    check_input_len(input)?;
    serde_json::from_slice(input).map_err(|e| {
        FsError::new(Stage::Validate, ErrorCode::InvalidJson)
            .with_message("direct connect info is not valid JSON")
            .with_source(e)
    })
}

/// The one JSON text frame a peer sends the tunnel to join a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub v: u32,
    pub channel_id: String,
    pub role: Role,
    pub token: String,
    pub endpoint_instance_id: String,
}

impl AttachRequest {
    /// Build an attach with a fresh random instance id.
    pub fn new(channel_id: impl Into<String>, role: Role, token: impl Into<String>) -> Self {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        Self {
            v: 1,
            channel_id: channel_id.into(),
            role,
            token: token.into(),
            endpoint_instance_id: b64::encode(id),
        }
    }

    pub fn validate(&self) -> FsResult<()> {
        let err = |code, msg: &str| {
            Err(FsError::new(Stage::Attach, code).with_message(msg.to_string()))
        };
        if self.channel_id.is_empty() {
            return err(ErrorCode::MissingChannelId, "attach channel_id is empty");
        }
        if self.channel_id.len() > MAX_ATTACH_CHANNEL_ID {
            return err(ErrorCode::ChannelIdTooLong, "attach channel_id over cap");
        }
        if self.token.is_empty() {
            return err(ErrorCode::MissingAttach, "attach token is empty");
        }
        if self.token.len() > MAX_ATTACH_TOKEN {
            return err(ErrorCode::InputTooLarge, "attach token over cap");
        }
        if b64::decode_exact::<16>(&self.endpoint_instance_id).is_err() {
            return err(
                ErrorCode::InvalidEndpointInstanceId,
                "endpoint_instance_id must be base64url of 16 bytes",
            );
        }
        Ok(())
    }

    /// Serialize for the wire, enforcing the overall attach cap.
    pub fn to_json(&self) -> FsResult<String> {
        self.validate()?;
        let json = serde_json::to_string(self).map_err(|e| {
            FsError::new(Stage::Attach, ErrorCode::InvalidJson)
                .with_message("attach not serializable")
                .with_source(e)
        })?;
        if json.len() > MAX_ATTACH_BYTES {
            return Err(FsError::new(Stage::Attach, ErrorCode::InputTooLarge)
                .with_message("attach message over cap"));
        }
        Ok(json)
    }
}

/// Deterministic tunnel selection by rendezvous hashing: score every URL
/// as the big-endian u64 of the first 8 bytes of
/// `SHA-256(channel_id + "|" + url)` and take the highest. Stable across
/// permutations of the candidate list; `None` only for an empty list.
pub fn pick_tunnel_url<'a>(channel_id: &str, urls: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(u64, &str)> = None;
    for url in urls {
        let mut hasher = Sha256::new();
        hasher.update(channel_id.as_bytes());
        hasher.update(b"|");
        hasher.update(url.as_bytes());
        let digest = hasher.finalize();
        let score = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
        // Strictly greater only: on a score tie the earliest candidate keeps
        // the slot.
        match best {
            Some((top, _)) if score <= top => {}
            _ => best = Some((score, url.as_str())),
        }
    }
    best.map(|(_, url)| url)
}
