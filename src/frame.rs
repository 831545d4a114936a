//! Length-prefixed JSON framing.
//!
//! Wire form: a 4-byte big-endian payload length, then UTF-8 JSON. Used for
//! StreamHello greetings and every RPC envelope. Size caps are enforced on
//! both directions; an oversized inbound frame never reaches the JSON parser.

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Default cap for RPC frames.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Default cap for StreamHello greetings.
pub const DEFAULT_MAX_HELLO: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds size cap")]
    TooLarge,
    #[error("i/o: {0}")]
    Io(std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        // LengthDelimitedCodec signals a frame over max_frame_length as
        // InvalidData before any payload is surfaced.
        if e.kind() == std::io::ErrorKind::InvalidData {
            FrameError::TooLarge
        } else {
            FrameError::Io(e)
        }
    }
}

impl FrameError {
    pub fn is_too_large(&self) -> bool {
        matches!(self, FrameError::TooLarge)
    }
}

/// Build the framed transport for a raw byte stream.
pub fn framed<T>(io: T, max_frame: usize) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame)
        .new_framed(io)
}

/// Serialize `value` and send it as one frame.
pub async fn write_json<S, V>(sink: &mut S, value: &V, max_frame: usize) -> Result<(), FrameError>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    V: Serialize + ?Sized,
{
    let raw = serde_json::to_vec(value)?;
    if raw.len() > max_frame {
        return Err(FrameError::TooLarge);
    }
    sink.send(Bytes::from(raw)).await?;
    Ok(())
}

/// Read one frame and parse it. `Ok(None)` is a clean EOF.
pub async fn read_json<St, V>(stream: &mut St) -> Result<Option<V>, FrameError>
where
    St: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    V: DeserializeOwned,
{
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(raw)) => Ok(Some(serde_json::from_slice(&raw)?)),
    }
}

/// Read one raw frame without parsing. `Ok(None)` is a clean EOF.
pub async fn read_raw<St>(stream: &mut St) -> Result<Option<BytesMut>, FrameError>
where
    St: Stream<Item = std::io::Result<BytesMut>> + Unpin,
{
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(raw)) => Ok(Some(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Msg {
        kind: String,
        v: u32,
    }

    #[tokio::test]
    async fn round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = framed(a, DEFAULT_MAX_FRAME);
        let mut right = framed(b, DEFAULT_MAX_FRAME);

        let msg = Msg { kind: "rpc".into(), v: 1 };
        write_json(&mut left, &msg, DEFAULT_MAX_FRAME).await.unwrap();
        let got: Msg = read_json(&mut right).await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn wire_form_is_u32_be_prefix() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut left = framed(a, DEFAULT_MAX_FRAME);
        write_json(&mut left, &serde_json::json!({"v":1}), DEFAULT_MAX_FRAME)
            .await
            .unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        let len = u32::from_be_bytes(buf) as usize;
        let mut body = vec![0u8; len];
        b.read_exact(&mut body).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["v"], 1);
    }

    #[tokio::test]
    async fn oversize_outbound_rejected() {
        let (a, _b) = tokio::io::duplex(4096);
        let mut left = framed(a, 16);
        let big = "x".repeat(64);
        let err = write_json(&mut left, &big, 16).await.unwrap_err();
        assert!(err.is_too_large());
    }

    #[tokio::test]
    async fn oversize_inbound_rejected() {
        let (a, b) = tokio::io::duplex(65536);
        let mut left = framed(a, DEFAULT_MAX_FRAME);
        let mut right = framed(b, 32);
        let big = "x".repeat(256);
        write_json(&mut left, &big, DEFAULT_MAX_FRAME).await.unwrap();
        let err = read_json::<_, String>(&mut right).await.unwrap_err();
        assert!(err.is_too_large());
    }

    #[tokio::test]
    async fn eof_is_none() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);
        let mut right = framed(b, DEFAULT_MAX_FRAME);
        let got = read_json::<_, Msg>(&mut right).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn boundary_exact_cap_accepted() {
        // A frame of exactly the cap passes; one byte more fails.
        let (a, b) = tokio::io::duplex(65536);
        let mut left = framed(a, 4096);
        let mut right = framed(b, 34);
        // "x"*32 serializes to 34 bytes with quotes.
        let at_cap = "x".repeat(32);
        write_json(&mut left, &at_cap, 4096).await.unwrap();
        let got: String = read_json(&mut right).await.unwrap().unwrap();
        assert_eq!(got, at_cap);

        let over = "x".repeat(33);
        write_json(&mut left, &over, 4096).await.unwrap();
        let err = read_json::<_, String>(&mut right).await.unwrap_err();
        assert!(err.is_too_large());
    }
}
