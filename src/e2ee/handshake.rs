//! Handshake drivers for both roles.
//!
//! Three messages: ClientHello, ServerHello (tagged), ClientFinished
//! (tagged). Tags are HMAC-SHA256 over the wire transcript under the PSK,
//! so a peer holding the wrong PSK fails before any record flows. Key
//! derivation happens on both sides before the finished message, and the
//! ephemeral private keys are consumed (and wiped) by the agreement.

use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use tracing::debug;

use crate::channel::Role;
use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::observer::ObserverCell;
use crate::timeops::{skew_seconds, unix_now};
use crate::transport::MessageTransport;

use super::keys::{derive_record_keys, transcript_tag, verify_transcript_tag};
use super::kex::EphemeralKeyPair;
use super::record::SecureChannel;
use super::wire::{
    self, ClientFinished, ClientHello, HandshakeMsg, ServerHello, TAG_LEN,
};
use super::{ChannelParams, E2eeConfig};

fn fatal(msg: impl Into<String>) -> FsError {
    FsError::new(Stage::Handshake, ErrorCode::HandshakeError).with_message(msg)
}

async fn recv_handshake(
    transport: &dyn MessageTransport,
    cfg: &E2eeConfig,
) -> FsResult<(bytes::Bytes, HandshakeMsg)> {
    let raw = transport
        .recv_binary()
        .await
        .map_err(|e| e.at_stage(Stage::Handshake))?
        .ok_or_else(|| {
            // A tunnel that refuses the attach just closes the socket; that
            // surfaces here as an EOF before the exchange completes.
            FsError::new(Stage::Handshake, ErrorCode::WebsocketClosed)
                .with_message("transport closed mid-handshake")
        })?;
    let msg = wire::decode(&raw, cfg.max_handshake_payload)?;
    Ok((raw, msg))
}

async fn fail(transport: &dyn MessageTransport, err: FsError) -> FsError {
    transport.close().await;
    err
}

/// Run the client side of the handshake. On success the transport carries
/// an established [`SecureChannel`]; on any failure the transport is closed
/// and all intermediate key material is dropped.
pub async fn client_handshake(
    transport: Arc<dyn MessageTransport>,
    params: &ChannelParams,
    cfg: &E2eeConfig,
    observer: &ObserverCell,
) -> FsResult<SecureChannel> {
    let keypair = EphemeralKeyPair::generate(params.suite);
    let mut client_nonce = [0u8; 32];
    OsRng.fill_bytes(&mut client_nonce);

    let hello_wire = wire::encode_client_hello(&ClientHello {
        suite: params.suite,
        features: cfg.features,
        channel_id: params.channel_id.as_bytes().to_vec(),
        ephemeral_pub: keypair.public_bytes(),
        nonce: client_nonce,
        init_exp: params.init_expire_at,
    });
    if let Err(e) = transport.send_binary(hello_wire.clone()).await {
        return Err(fail(&*transport, e.at_stage(Stage::Handshake)).await);
    }

    let (server_wire, msg) = match recv_handshake(&*transport, cfg).await {
        Ok(v) => v,
        Err(e) => return Err(fail(&*transport, e).await),
    };
    let server_hello = match msg {
        HandshakeMsg::ServerHello(sh) => sh,
        _ => return Err(fail(&*transport, fatal("expected server hello")).await),
    };

    if server_hello.suite != params.suite {
        return Err(fail(&*transport, fatal("server answered with a different suite")).await);
    }

    // ServerHello's tag covers both messages with the tag itself excluded.
    let tagless = &server_wire[..server_wire.len() - TAG_LEN];
    if !verify_transcript_tag(&params.psk, &[&hello_wire, tagless], &server_hello.tag) {
        return Err(fail(
            &*transport,
            fatal("server transcript tag mismatch (wrong PSK or tampering)"),
        )
        .await);
    }

    let shared = match keypair.agree(&server_hello.ephemeral_pub) {
        Ok(z) => z,
        Err(e) => return Err(fail(&*transport, e).await),
    };
    let keys = match derive_record_keys(&shared, &params.psk, &client_nonce, &server_hello.nonce)
    {
        Ok(k) => k,
        Err(e) => return Err(fail(&*transport, e).await),
    };

    let finished_tag = transcript_tag(&params.psk, &[&hello_wire, &server_wire]);
    let finished_wire = wire::encode_client_finished(&ClientFinished { tag: finished_tag });
    if let Err(e) = transport.send_binary(finished_wire).await {
        return Err(fail(&*transport, e.at_stage(Stage::Handshake)).await);
    }

    debug!(channel_id = %params.channel_id, suite = params.suite.wire_id(), "client handshake complete");
    observer.handshake_done(params.suite);
    Ok(SecureChannel::new(
        transport,
        keys,
        Role::Client,
        cfg,
        params.suite,
    ))
}

/// Run the server side of the handshake.
pub async fn server_handshake(
    transport: Arc<dyn MessageTransport>,
    params: &ChannelParams,
    cfg: &E2eeConfig,
    observer: &ObserverCell,
) -> FsResult<SecureChannel> {
    let (client_wire, msg) = match recv_handshake(&*transport, cfg).await {
        Ok(v) => v,
        Err(e) => return Err(fail(&*transport, e).await),
    };
    let client_hello = match msg {
        HandshakeMsg::ClientHello(ch) => ch,
        _ => return Err(fail(&*transport, fatal("expected client hello")).await),
    };

    if let Err(e) = check_client_hello(&client_hello, params, cfg) {
        return Err(fail(&*transport, e).await);
    }

    let keypair = EphemeralKeyPair::generate(params.suite);
    let mut server_nonce = [0u8; 32];
    OsRng.fill_bytes(&mut server_nonce);

    // Encode with a placeholder tag, compute the tag over the tagless wire
    // bytes, then patch it in.
    let mut server_wire = wire::encode_server_hello(&ServerHello {
        suite: params.suite,
        features: cfg.features,
        ephemeral_pub: keypair.public_bytes(),
        nonce: server_nonce,
        tag: [0u8; TAG_LEN],
    });
    let tag_at = server_wire.len() - TAG_LEN;
    let tag = transcript_tag(&params.psk, &[&client_wire, &server_wire[..tag_at]]);
    server_wire[tag_at..].copy_from_slice(&tag);
    let server_wire = server_wire.freeze();

    if let Err(e) = transport.send_binary(server_wire.clone()).await {
        return Err(fail(&*transport, e.at_stage(Stage::Handshake)).await);
    }

    let shared = match keypair.agree(&client_hello.ephemeral_pub) {
        Ok(z) => z,
        Err(e) => return Err(fail(&*transport, e).await),
    };
    let keys = match derive_record_keys(
        &shared,
        &params.psk,
        &client_hello.nonce,
        &server_nonce,
    ) {
        Ok(k) => k,
        Err(e) => return Err(fail(&*transport, e).await),
    };

    let (_, msg) = match recv_handshake(&*transport, cfg).await {
        Ok(v) => v,
        Err(e) => return Err(fail(&*transport, e).await),
    };
    let finished = match msg {
        HandshakeMsg::ClientFinished(f) => f,
        _ => return Err(fail(&*transport, fatal("expected client finished")).await),
    };

    if !verify_transcript_tag(&params.psk, &[&client_wire, &server_wire], &finished.tag) {
        return Err(fail(
            &*transport,
            fatal("client transcript tag mismatch (wrong PSK or tampering)"),
        )
        .await);
    }

    debug!(channel_id = %params.channel_id, suite = params.suite.wire_id(), "server handshake complete");
    observer.handshake_done(params.suite);
    Ok(SecureChannel::new(
        transport,
        keys,
        Role::Server,
        cfg,
        params.suite,
    ))
}

fn check_client_hello(
    hello: &ClientHello,
    params: &ChannelParams,
    cfg: &E2eeConfig,
) -> FsResult<()> {
    if !params.channel_id.ct_eq_bytes(&hello.channel_id) {
        return Err(fatal("channel_id mismatch"));
    }
    if hello.suite != params.suite {
        return Err(FsError::new(Stage::Handshake, ErrorCode::InvalidSuite)
            .with_message("client offered an unsupported suite"));
    }

    let now = unix_now();
    let skew = skew_seconds(cfg.clock_skew);
    if now > hello.init_exp.saturating_add(skew) {
        return Err(FsError::new(Stage::Handshake, ErrorCode::InitExpired)
            .with_message("channel init window has expired"));
    }
    let lookahead = skew_seconds(cfg.max_init_lookahead);
    if now < hello.init_exp.saturating_sub(lookahead) {
        return Err(FsError::new(Stage::Handshake, ErrorCode::InitExpired)
            .with_message("channel init window lies too far in the future"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, Psk};
    use crate::suite::CipherSuite;
    use crate::transport::memory;

    fn params(psk_byte: u8, suite: CipherSuite) -> ChannelParams {
        ChannelParams {
            channel_id: ChannelId::parse("ch_1").unwrap(),
            psk: Psk::new([psk_byte; 32]),
            suite,
            init_expire_at: unix_now() + 120,
        }
    }

    async fn run_pair(
        client_params: ChannelParams,
        server_params: ChannelParams,
    ) -> (FsResult<SecureChannel>, FsResult<SecureChannel>) {
        let (ct, st) = memory::pair(8);
        let obs = ObserverCell::default();
        let cfg = E2eeConfig::default();
        let client = client_handshake(ct, &client_params, &cfg, &obs);
        let server = server_handshake(st, &server_params, &cfg, &obs);
        tokio::join!(client, server)
    }

    #[tokio::test]
    async fn x25519_handshake_succeeds() {
        let suite = CipherSuite::X25519HkdfSha256Aes256Gcm;
        let (client, server) = run_pair(params(0, suite), params(0, suite)).await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap().unwrap().as_ref(), b"hello");
        server.send(b"back at you").await.unwrap();
        assert_eq!(
            client.recv().await.unwrap().unwrap().as_ref(),
            b"back at you"
        );
    }

    #[tokio::test]
    async fn p256_handshake_succeeds() {
        let suite = CipherSuite::P256HkdfSha256Aes256Gcm;
        let (client, server) = run_pair(params(0, suite), params(0, suite)).await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        client.send(b"compressed points").await.unwrap();
        assert_eq!(
            server.recv().await.unwrap().unwrap().as_ref(),
            b"compressed points"
        );
    }

    #[tokio::test]
    async fn psk_mismatch_fails_both_sides() {
        let suite = CipherSuite::X25519HkdfSha256Aes256Gcm;
        let (client, server) = run_pair(params(0, suite), params(1, suite)).await;
        let client_err = client.err().expect("client must fail");
        assert_eq!(client_err.code, ErrorCode::HandshakeError);
        // The server either sees the client drop the connection or a bad
        // finished tag, both fatal.
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn channel_id_mismatch_rejected() {
        let suite = CipherSuite::X25519HkdfSha256Aes256Gcm;
        let mut server_params = params(0, suite);
        server_params.channel_id = ChannelId::parse("ch_other").unwrap();
        let (_, server) = run_pair(params(0, suite), server_params).await;
        let err = server.err().expect("server must reject");
        assert_eq!(err.code, ErrorCode::HandshakeError);
    }

    #[tokio::test]
    async fn expired_init_rejected() {
        let suite = CipherSuite::X25519HkdfSha256Aes256Gcm;
        let mut client_params = params(0, suite);
        client_params.init_expire_at = unix_now() - 3600;
        let mut server_params = params(0, suite);
        server_params.init_expire_at = client_params.init_expire_at;
        let (_, server) = run_pair(client_params, server_params).await;
        let err = server.err().expect("server must reject");
        assert_eq!(err.code, ErrorCode::InitExpired);
    }

    #[tokio::test]
    async fn far_future_init_rejected() {
        let suite = CipherSuite::X25519HkdfSha256Aes256Gcm;
        let mut client_params = params(0, suite);
        client_params.init_expire_at = unix_now() + 365 * 24 * 3600;
        let (_, server) = run_pair(client_params, params(0, suite)).await;
        let err = server.err().expect("server must reject");
        assert_eq!(err.code, ErrorCode::InitExpired);
    }

    #[tokio::test]
    async fn suite_mismatch_rejected() {
        let (_, server) = run_pair(
            params(0, CipherSuite::X25519HkdfSha256Aes256Gcm),
            params(0, CipherSuite::P256HkdfSha256Aes256Gcm),
        )
        .await;
        let err = server.err().expect("server must reject");
        assert_eq!(err.code, ErrorCode::InvalidSuite);
    }
}
