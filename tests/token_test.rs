//! FST2 token scenarios with literal values, plus keyset file round trips
//! and parse/sign properties.

use std::time::Duration;

use ed25519_dalek::SigningKey;
use flowersec::channel::Role;
use flowersec::error::ErrorCode;
use flowersec::keyset::{IssuerKeyset, SigningIdentity};
use flowersec::token::{
    self, equal_signed_part, parse, sign, verify_at, TokenPayload, VerifyOptions,
};
use proptest::prelude::*;

const IAT: i64 = 1_700_000_000;

fn seeded_key() -> SigningKey {
    let seed: [u8; 32] = core::array::from_fn(|i| i as u8);
    SigningKey::from_bytes(&seed)
}

fn payload() -> TokenPayload {
    TokenPayload {
        kid: "kid_1".into(),
        aud: "aud_1".into(),
        iss: Some("iss_1".into()),
        channel_id: "ch_1".into(),
        role: Role::Client,
        token_id: "tok_1".into(),
        init_exp: IAT + 120,
        idle_timeout_seconds: 30,
        iat: IAT,
        exp: IAT + 60,
    }
}

fn keyset() -> IssuerKeyset {
    let mut keys = IssuerKeyset::new();
    keys.insert("kid_1", seeded_key().verifying_key());
    keys
}

fn opts() -> VerifyOptions {
    VerifyOptions {
        audience: Some("aud_1".into()),
        issuer: Some("iss_1".into()),
        clock_skew: Duration::ZERO,
    }
}

/// Seeded Ed25519 key, literal claims, verified ten seconds in: ok.
#[test]
fn verify_happy_path_scenario() {
    let token = sign(&seeded_key(), &payload()).unwrap();
    let out = verify_at(&token, &keyset(), IAT + 10, &opts()).unwrap();
    assert_eq!(out.channel_id, "ch_1");
    assert_eq!(out.role, Role::Client);
}

/// Same token one second past exp: expired.
#[test]
fn verify_expired_scenario() {
    let token = sign(&seeded_key(), &payload()).unwrap();
    let err = verify_at(&token, &keyset(), IAT + 61, &opts()).unwrap_err();
    assert_eq!(err.code, ErrorCode::Expired);
}

/// Valid across the whole [iat, exp) window.
#[test]
fn verify_window_sweep() {
    let token = sign(&seeded_key(), &payload()).unwrap();
    for offset in [0, 1, 30, 59] {
        assert!(
            verify_at(&token, &keyset(), IAT + offset, &opts()).is_ok(),
            "offset {offset} must verify"
        );
    }
    assert!(verify_at(&token, &keyset(), IAT + 60, &opts()).is_err());
}

#[test]
fn exp_after_init_always_fails() {
    let mut p = payload();
    p.exp = p.init_exp + 1;
    let token = sign(&seeded_key(), &p).unwrap();
    let err = verify_at(&token, &keyset(), IAT + 10, &opts()).unwrap_err();
    assert_eq!(err.code, ErrorCode::ExpAfterInit);
}

/// parse(sign(p)) is byte-identical on the signed slice.
#[test]
fn parse_sign_round_trip_is_exact() {
    let token = sign(&seeded_key(), &payload()).unwrap();
    let parsed = parse(&token).unwrap();
    assert_eq!(parsed.payload, payload());
    let rebuilt = format!(
        "FST2.{}.{}",
        parsed.payload_b64u,
        flowersec::b64::encode(parsed.signature)
    );
    assert_eq!(rebuilt, token);
}

#[test]
fn signed_identity_file_flow() {
    let dir = tempfile::tempdir().unwrap();
    let private = dir.path().join("issuer_private_key.json");
    let keys_file = dir.path().join("issuer_keys.json");

    let identity = SigningIdentity::generate("kid_files");
    identity.save(&private, false).unwrap();
    let mut keys = IssuerKeyset::new();
    keys.insert(identity.kid.clone(), identity.verifying_key());
    keys.save(&keys_file, false).unwrap();

    // A verifier that only ever saw the files accepts the signer's tokens.
    let loaded_identity = SigningIdentity::load(&private).unwrap();
    let loaded_keys = IssuerKeyset::load(&keys_file).unwrap();
    let mut p = payload();
    p.kid = "kid_files".into();
    let token = sign(loaded_identity.signing_key(), &p).unwrap();
    assert!(verify_at(&token, &loaded_keys, IAT + 5, &VerifyOptions::default()).is_ok());
}

#[test]
fn equal_signed_part_semantics() {
    let token = sign(&seeded_key(), &payload()).unwrap();
    let same_claims = sign(&seeded_key(), &payload()).unwrap();
    // Deterministic signatures over identical payloads: full tokens equal.
    assert!(equal_signed_part(&token, &same_claims));

    let mut p = payload();
    p.exp += 1;
    let different = sign(&seeded_key(), &p).unwrap();
    assert!(!equal_signed_part(&token, &different));
    assert!(!equal_signed_part("not-a-token", &token));
}

#[test]
fn verify_checks_run_in_documented_order() {
    // Unknown kid reported before any claim validation.
    let mut p = payload();
    p.kid = "kid_missing".into();
    p.exp = p.iat - 100; // also expired, but kid wins
    let token = sign(&seeded_key(), &p).unwrap();
    let err = verify_at(&token, &keyset(), IAT, &opts()).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownKid);

    // Bad signature reported before audience mismatch.
    let token = sign(&seeded_key(), &payload()).unwrap();
    let mut tampered_opts = opts();
    tampered_opts.audience = Some("aud_other".into());
    let bad_sig = {
        let head = token.rsplit_once('.').unwrap().0;
        format!("{head}.{}", flowersec::b64::encode([0u8; 64]))
    };
    let err = verify_at(&bad_sig, &keyset(), IAT, &tampered_opts).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidSignature);
}

proptest! {
    #[test]
    fn any_claims_survive_sign_parse(
        channel in "[a-zA-Z0-9_]{1,64}",
        tok in "[a-zA-Z0-9_]{1,32}",
        idle in 0i64..86_400,
        life in 1i64..3600,
    ) {
        let mut p = payload();
        p.channel_id = channel;
        p.token_id = tok;
        p.idle_timeout_seconds = idle;
        p.exp = p.iat + life;
        p.init_exp = p.exp + 60;
        let token = sign(&seeded_key(), &p).unwrap();
        let parsed = token::parse(&token).unwrap();
        prop_assert_eq!(parsed.payload, p);
    }
}
