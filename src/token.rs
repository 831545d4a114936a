// SPDX-License-Identifier: MIT
//! The FST2 control-plane token.
//!
//! Wire form: `FST2.<b64url(payload_json)>.<b64url(ed25519_sig)>`, where the
//! 64-byte signature covers the ASCII bytes of `"FST2." + payload_b64url`.
//! Payload JSON is marshaled with the struct's declaration order (stable
//! under serde_json); verification never re-serializes — the signature is
//! checked over the exact bytes received.

use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::b64;
use crate::channel::Role;
use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::keyset::IssuerKeyset;
use crate::timeops::{skew_seconds, unix_now};

pub const TOKEN_PREFIX: &str = "FST2";

/// Claims carried by a token. Field order here is the canonical marshal
/// order for signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub kid: String,
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub channel_id: String,
    pub role: Role,
    pub token_id: String,
    pub init_exp: i64,
    pub idle_timeout_seconds: i64,
    pub iat: i64,
    pub exp: i64,
}

/// A structurally valid token: parsed claims plus the exact signed bytes.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub payload: TokenPayload,
    /// The base64url payload exactly as received; the signature covers
    /// `"FST2." + payload_b64u`.
    pub payload_b64u: String,
    pub signature: [u8; 64],
}

impl ParsedToken {
    fn signed_part(&self) -> String {
        format!("{TOKEN_PREFIX}.{}", self.payload_b64u)
    }
}

fn invalid(code: ErrorCode, msg: impl Into<String>) -> FsError {
    FsError::new(Stage::Validate, code).with_message(msg)
}

/// Sign a payload into its compact wire form.
pub fn sign(key: &SigningKey, payload: &TokenPayload) -> FsResult<String> {
    if payload.kid.is_empty() {
        return Err(invalid(ErrorCode::InvalidFormat, "token kid is empty"));
    }
    if payload.aud.is_empty() {
        return Err(invalid(ErrorCode::InvalidFormat, "token aud is empty"));
    }
    let json = serde_json::to_vec(payload).map_err(|e| {
        invalid(ErrorCode::InvalidJson, "token payload not serializable").with_source(e)
    })?;
    let signed_part = format!("{TOKEN_PREFIX}.{}", b64::encode(json));
    let sig = key.sign(signed_part.as_bytes());
    Ok(format!("{signed_part}.{}", b64::encode(sig.to_bytes())))
}

/// Split, decode, and JSON-parse a token. No signature or claim checks.
pub fn parse(token: &str) -> FsResult<ParsedToken> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(invalid(
            ErrorCode::InvalidFormat,
            "token must have exactly three dot-separated parts",
        ));
    }
    if parts[0] != TOKEN_PREFIX {
        return Err(invalid(ErrorCode::InvalidFormat, "token tag is not FST2"));
    }

    let payload_raw = b64::decode(parts[1])
        .map_err(|e| invalid(ErrorCode::InvalidB64, "payload is not base64url").with_source(e))?;
    let signature = b64::decode_exact::<64>(parts[2]).map_err(|e| {
        invalid(ErrorCode::InvalidB64, "signature must be 64 base64url bytes").with_source(e)
    })?;
    let payload: TokenPayload = serde_json::from_slice(&payload_raw)
        .map_err(|e| invalid(ErrorCode::InvalidJson, "payload is not valid JSON").with_source(e))?;

    Ok(ParsedToken {
        payload,
        payload_b64u: parts[1].to_string(),
        signature,
    })
}

/// What a verifier demands beyond a valid signature.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Required audience; `None` skips the check.
    pub audience: Option<String>,
    /// Required issuer; `None` skips the check.
    pub issuer: Option<String>,
    /// Budget applied to every time comparison.
    pub clock_skew: Duration,
}

/// Verify a token against the keyset at the current wall clock.
pub fn verify(token: &str, keys: &IssuerKeyset, opts: &VerifyOptions) -> FsResult<TokenPayload> {
    verify_at(token, keys, unix_now(), opts)
}

/// Verify at an explicit `now` (Unix seconds).
pub fn verify_at(
    token: &str,
    keys: &IssuerKeyset,
    now: i64,
    opts: &VerifyOptions,
) -> FsResult<TokenPayload> {
    let parsed = parse(token)?;
    let payload = &parsed.payload;

    let key = keys.get(&payload.kid).ok_or_else(|| {
        invalid(
            ErrorCode::UnknownKid,
            format!("no issuer key for kid {:?}", payload.kid),
        )
    })?;

    let sig = Signature::from_bytes(&parsed.signature);
    key.verify(parsed.signed_part().as_bytes(), &sig)
        .map_err(|_| invalid(ErrorCode::InvalidSignature, "token signature is invalid"))?;

    if let Some(required) = &opts.audience {
        if &payload.aud != required {
            return Err(invalid(ErrorCode::InvalidAudience, "audience mismatch"));
        }
    }
    if let Some(required) = &opts.issuer {
        if payload.iss.as_deref() != Some(required.as_str()) {
            return Err(invalid(ErrorCode::InvalidIssuer, "issuer mismatch"));
        }
    }

    let skew = skew_seconds(opts.clock_skew);
    if payload.iat > now.saturating_add(skew) {
        return Err(invalid(ErrorCode::IatInFuture, "token issued in the future"));
    }
    if now >= payload.exp.saturating_add(skew) {
        return Err(invalid(ErrorCode::Expired, "token has expired"));
    }
    if now >= payload.init_exp.saturating_add(skew) {
        return Err(invalid(
            ErrorCode::InitExpired,
            "channel init window has expired",
        ));
    }
    if payload.exp > payload.init_exp {
        return Err(invalid(
            ErrorCode::ExpAfterInit,
            "exp must not exceed init_exp",
        ));
    }

    Ok(parsed.payload)
}

/// True iff both tokens parse and carry byte-identical signed parts
/// (`FST2.<payload>`), compared in constant time.
pub fn equal_signed_part(a: &str, b: &str) -> bool {
    let (Ok(a), Ok(b)) = (parse(a), parse(b)) else {
        return false;
    };
    let a = a.signed_part();
    let b = b.signed_part();
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
