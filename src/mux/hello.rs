//! The per-stream greeting.
//!
//! Immediately after a stream opens, the opener sends one length-prefixed
//! JSON frame `{"kind": <string>, "v": 1}`. The acceptor reads it under its
//! own size cap and uses `kind` to pick a handler. A bad greeting is a
//! non-fatal, per-stream failure.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::frame;

pub const HELLO_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHello {
    pub kind: String,
    pub v: u32,
}

impl StreamHello {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            v: HELLO_VERSION,
        }
    }
}

fn hello_failed(msg: impl Into<String>) -> FsError {
    FsError::new(Stage::Yamux, ErrorCode::StreamHelloFailed).with_message(msg)
}

/// Send the greeting as the first frame on a fresh stream.
pub async fn write_hello<T>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
    kind: &str,
    max_hello: usize,
) -> FsResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_json(framed, &StreamHello::new(kind), max_hello)
        .await
        .map_err(|e| hello_failed(format!("greeting not sent: {e}")))
}

/// Read and validate the greeting. The frame cap is tightened to
/// `max_hello` for this one read, then restored.
pub async fn read_hello<T>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
    max_hello: usize,
) -> FsResult<StreamHello>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let restore = framed.codec().max_frame_length();
    framed.codec_mut().set_max_frame_length(max_hello);
    let result = frame::read_json::<_, StreamHello>(framed).await;
    framed.codec_mut().set_max_frame_length(restore);

    let hello = match result {
        Ok(Some(h)) => h,
        Ok(None) => return Err(hello_failed("stream closed before greeting")),
        Err(e) => return Err(hello_failed(format!("bad greeting frame: {e}"))),
    };
    if hello.v != HELLO_VERSION {
        return Err(hello_failed(format!("unsupported greeting version {}", hello.v)));
    }
    if hello.kind.is_empty() {
        return Err(FsError::new(Stage::Yamux, ErrorCode::MissingStreamKind)
            .with_message("greeting has empty kind"));
    }
    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{framed, DEFAULT_MAX_FRAME, DEFAULT_MAX_HELLO};

    #[tokio::test]
    async fn greeting_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut opener = framed(a, DEFAULT_MAX_FRAME);
        let mut acceptor = framed(b, DEFAULT_MAX_FRAME);

        write_hello(&mut opener, "rpc", DEFAULT_MAX_HELLO).await.unwrap();
        let hello = read_hello(&mut acceptor, DEFAULT_MAX_HELLO).await.unwrap();
        assert_eq!(hello.kind, "rpc");
        assert_eq!(hello.v, 1);
    }

    #[tokio::test]
    async fn empty_kind_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut opener = framed(a, DEFAULT_MAX_FRAME);
        let mut acceptor = framed(b, DEFAULT_MAX_FRAME);

        frame::write_json(&mut opener, &StreamHello::new(""), DEFAULT_MAX_HELLO)
            .await
            .unwrap();
        let err = read_hello(&mut acceptor, DEFAULT_MAX_HELLO).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingStreamKind);
    }

    #[tokio::test]
    async fn wrong_version_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut opener = framed(a, DEFAULT_MAX_FRAME);
        let mut acceptor = framed(b, DEFAULT_MAX_FRAME);

        frame::write_json(
            &mut opener,
            &StreamHello { kind: "rpc".into(), v: 2 },
            DEFAULT_MAX_HELLO,
        )
        .await
        .unwrap();
        let err = read_hello(&mut acceptor, DEFAULT_MAX_HELLO).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamHelloFailed);
    }

    #[tokio::test]
    async fn oversized_greeting_rejected_and_cap_restored() {
        let (a, b) = tokio::io::duplex(65536);
        let mut opener = framed(a, DEFAULT_MAX_FRAME);
        let mut acceptor = framed(b, DEFAULT_MAX_FRAME);

        let huge = StreamHello::new("x".repeat(512));
        frame::write_json(&mut opener, &huge, DEFAULT_MAX_FRAME).await.unwrap();
        let err = read_hello(&mut acceptor, 64).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamHelloFailed);
        assert_eq!(acceptor.codec().max_frame_length(), DEFAULT_MAX_FRAME);
    }
}
