//! Handshake message framing.
//!
//! Every handshake message travels as exactly one binary transport message:
//!
//! ```text
//! magic(4) = 46 53 01 02 | version(1) = 1 | type(1) | payload_len(4 BE) | payload
//! ```
//!
//! All multi-byte integers are big-endian. Payload length is capped by the
//! configured `max_handshake_payload`; anything over is fatal before parsing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::suite::CipherSuite;

use super::{MAGIC, VERSION};

pub const TYPE_CLIENT_HELLO: u8 = 1;
pub const TYPE_SERVER_HELLO: u8 = 2;
pub const TYPE_CLIENT_FINISHED: u8 = 3;

pub const HEADER_LEN: usize = 10;
pub const NONCE_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub suite: CipherSuite,
    pub features: u16,
    pub channel_id: Vec<u8>,
    pub ephemeral_pub: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub init_exp: i64,
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub suite: CipherSuite,
    pub features: u16,
    pub ephemeral_pub: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

#[derive(Debug, Clone)]
pub struct ClientFinished {
    pub tag: [u8; TAG_LEN],
}

#[derive(Debug)]
pub enum HandshakeMsg {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    ClientFinished(ClientFinished),
}

fn fatal(msg: impl Into<String>) -> FsError {
    FsError::new(Stage::Handshake, ErrorCode::HandshakeError).with_message(msg)
}

fn put_header(out: &mut BytesMut, msg_type: u8, payload_len: usize) {
    out.put_slice(&MAGIC);
    out.put_u8(VERSION);
    out.put_u8(msg_type);
    out.put_u32(payload_len as u32);
}

pub fn encode_client_hello(msg: &ClientHello) -> Bytes {
    let payload_len =
        2 + 2 + 2 + msg.channel_id.len() + msg.ephemeral_pub.len() + NONCE_LEN + 8;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload_len);
    put_header(&mut out, TYPE_CLIENT_HELLO, payload_len);
    out.put_u16(msg.suite.wire_id());
    out.put_u16(msg.features);
    out.put_u16(msg.channel_id.len() as u16);
    out.put_slice(&msg.channel_id);
    out.put_slice(&msg.ephemeral_pub);
    out.put_slice(&msg.nonce);
    out.put_i64(msg.init_exp);
    out.freeze()
}

pub fn encode_server_hello(msg: &ServerHello) -> BytesMut {
    let payload_len = 2 + 2 + msg.ephemeral_pub.len() + NONCE_LEN + TAG_LEN;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload_len);
    put_header(&mut out, TYPE_SERVER_HELLO, payload_len);
    out.put_u16(msg.suite.wire_id());
    out.put_u16(msg.features);
    out.put_slice(&msg.ephemeral_pub);
    out.put_slice(&msg.nonce);
    out.put_slice(&msg.tag);
    out
}

pub fn encode_client_finished(msg: &ClientFinished) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + TAG_LEN);
    put_header(&mut out, TYPE_CLIENT_FINISHED, TAG_LEN);
    out.put_slice(&msg.tag);
    out.freeze()
}

/// Parse one full transport message into a handshake message.
pub fn decode(buf: &[u8], max_payload: usize) -> FsResult<HandshakeMsg> {
    if buf.len() < HEADER_LEN {
        return Err(fatal("handshake message shorter than header"));
    }
    if buf[0..4] != MAGIC {
        return Err(fatal("bad magic"));
    }
    if buf[4] != VERSION {
        return Err(fatal(format!("unsupported version {}", buf[4])));
    }
    let msg_type = buf[5];
    let payload_len = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    if payload_len > max_payload {
        return Err(fatal(format!(
            "handshake payload of {payload_len} bytes exceeds cap of {max_payload}"
        )));
    }
    let payload = &buf[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(fatal("handshake payload length mismatch"));
    }

    match msg_type {
        TYPE_CLIENT_HELLO => decode_client_hello(payload).map(HandshakeMsg::ClientHello),
        TYPE_SERVER_HELLO => decode_server_hello(payload).map(HandshakeMsg::ServerHello),
        TYPE_CLIENT_FINISHED => {
            if payload.len() != TAG_LEN {
                return Err(fatal("client finished has wrong length"));
            }
            let mut tag = [0u8; TAG_LEN];
            tag.copy_from_slice(payload);
            Ok(HandshakeMsg::ClientFinished(ClientFinished { tag }))
        }
        other => Err(fatal(format!("unknown handshake message type {other}"))),
    }
}

fn decode_client_hello(p: &[u8]) -> FsResult<ClientHello> {
    if p.len() < 6 {
        return Err(fatal("client hello truncated"));
    }
    let suite = CipherSuite::from_wire_id(u16::from_be_bytes([p[0], p[1]]))
        .map_err(|e| e.at_stage(Stage::Handshake))?;
    let features = u16::from_be_bytes([p[2], p[3]]);
    let channel_id_len = u16::from_be_bytes([p[4], p[5]]) as usize;
    let pub_len = suite.public_key_len();

    let want = 6 + channel_id_len + pub_len + NONCE_LEN + 8;
    if p.len() != want {
        return Err(fatal("client hello has wrong length"));
    }

    let mut at = 6;
    let channel_id = p[at..at + channel_id_len].to_vec();
    at += channel_id_len;
    let ephemeral_pub = p[at..at + pub_len].to_vec();
    at += pub_len;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&p[at..at + NONCE_LEN]);
    at += NONCE_LEN;
    let init_exp = i64::from_be_bytes(p[at..at + 8].try_into().expect("8 bytes"));

    Ok(ClientHello {
        suite,
        features,
        channel_id,
        ephemeral_pub,
        nonce,
        init_exp,
    })
}

fn decode_server_hello(p: &[u8]) -> FsResult<ServerHello> {
    if p.len() < 4 {
        return Err(fatal("server hello truncated"));
    }
    let suite = CipherSuite::from_wire_id(u16::from_be_bytes([p[0], p[1]]))
        .map_err(|e| e.at_stage(Stage::Handshake))?;
    let features = u16::from_be_bytes([p[2], p[3]]);
    let pub_len = suite.public_key_len();

    let want = 4 + pub_len + NONCE_LEN + TAG_LEN;
    if p.len() != want {
        return Err(fatal("server hello has wrong length"));
    }

    let mut at = 4;
    let ephemeral_pub = p[at..at + pub_len].to_vec();
    at += pub_len;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&p[at..at + NONCE_LEN]);
    at += NONCE_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&p[at..at + TAG_LEN]);

    Ok(ServerHello {
        suite,
        features,
        ephemeral_pub,
        nonce,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2ee::DEFAULT_MAX_HANDSHAKE_PAYLOAD;

    fn sample_hello() -> ClientHello {
        ClientHello {
            suite: CipherSuite::X25519HkdfSha256Aes256Gcm,
            features: 1,
            channel_id: b"ch_1".to_vec(),
            ephemeral_pub: vec![9u8; 32],
            nonce: [3u8; 32],
            init_exp: 1_700_000_000,
        }
    }

    #[test]
    fn client_hello_round_trip() {
        let wire = encode_client_hello(&sample_hello());
        assert_eq!(&wire[0..4], &MAGIC);
        assert_eq!(wire[4], VERSION);
        assert_eq!(wire[5], TYPE_CLIENT_HELLO);
        match decode(&wire, DEFAULT_MAX_HANDSHAKE_PAYLOAD).unwrap() {
            HandshakeMsg::ClientHello(ch) => {
                assert_eq!(ch.channel_id, b"ch_1");
                assert_eq!(ch.init_exp, 1_700_000_000);
                assert_eq!(ch.ephemeral_pub.len(), 32);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn server_hello_round_trip() {
        let wire = encode_server_hello(&ServerHello {
            suite: CipherSuite::P256HkdfSha256Aes256Gcm,
            features: 1,
            ephemeral_pub: vec![5u8; 33],
            nonce: [7u8; 32],
            tag: [8u8; 16],
        });
        match decode(&wire, DEFAULT_MAX_HANDSHAKE_PAYLOAD).unwrap() {
            HandshakeMsg::ServerHello(sh) => {
                assert_eq!(sh.ephemeral_pub.len(), 33);
                assert_eq!(sh.tag, [8u8; 16]);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut wire = encode_client_hello(&sample_hello()).to_vec();
        wire[0] = 0xff;
        let err = decode(&wire, DEFAULT_MAX_HANDSHAKE_PAYLOAD).unwrap_err();
        assert_eq!(err.code, ErrorCode::HandshakeError);
    }

    #[test]
    fn bad_version_rejected() {
        let mut wire = encode_client_hello(&sample_hello()).to_vec();
        wire[4] = 2;
        assert!(decode(&wire, DEFAULT_MAX_HANDSHAKE_PAYLOAD).is_err());
    }

    #[test]
    fn payload_over_cap_rejected() {
        let wire = encode_client_hello(&sample_hello());
        let err = decode(&wire, 8).unwrap_err();
        assert_eq!(err.code, ErrorCode::HandshakeError);
    }

    #[test]
    fn payload_at_cap_accepted() {
        let wire = encode_client_hello(&sample_hello());
        let payload_len = wire.len() - HEADER_LEN;
        assert!(decode(&wire, payload_len).is_ok());
        assert!(decode(&wire, payload_len - 1).is_err());
    }

    #[test]
    fn unknown_suite_rejected() {
        let mut wire = encode_client_hello(&sample_hello()).to_vec();
        // suite is the first payload field
        wire[HEADER_LEN] = 0xff;
        wire[HEADER_LEN + 1] = 0xff;
        let err = decode(&wire, DEFAULT_MAX_HANDSHAKE_PAYLOAD).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSuite);
    }

    #[test]
    fn truncated_payload_rejected() {
        let wire = encode_client_hello(&sample_hello());
        let cut = &wire[..wire.len() - 3];
        assert!(decode(cut, DEFAULT_MAX_HANDSHAKE_PAYLOAD).is_err());
    }
}
