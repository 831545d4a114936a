//! WebSocket adapter over tokio-tungstenite.
//!
//! The only file that names the socket library. Everything above sees the
//! [`MessageTransport`] trait: binary messages in, binary messages out.
//! Text frames exist solely for the tunnel attach message, sent through the
//! inherent [`WsTransport::send_text`] before the E2EE handshake starts.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::timeops::with_timeout;
use crate::transport::MessageTransport;

/// Upper bound for one WebSocket message; comfortably above the record cap
/// plus framing overhead.
const MAX_WS_MESSAGE: usize = 4 * 1024 * 1024;

pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Send one text frame (the tunnel attach message).
    pub async fn send_text(&self, text: String) -> FsResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| {
                FsError::new(Stage::Attach, ErrorCode::SendFailed)
                    .with_message("websocket text send failed")
                    .with_source(e)
            })
    }
}

#[async_trait]
impl<S> MessageTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv_binary(&self) -> FsResult<Option<Bytes>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(payload))) => return Ok(Some(Bytes::from(payload))),
                // Pings are answered by the library; text frames are not part
                // of the binary transport contract and are skipped.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    return Err(FsError::new(Stage::Connect, ErrorCode::WebsocketError)
                        .with_message("websocket receive failed")
                        .with_source(e))
                }
            }
        }
    }

    async fn send_binary(&self, payload: Bytes) -> FsResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(payload.to_vec()))
            .await
            .map_err(|e| {
                FsError::new(Stage::Connect, ErrorCode::SendFailed)
                    .with_message("websocket send failed")
                    .with_source(e)
            })
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!(err = %e, "websocket close frame not sent");
        }
        let _ = sink.close().await;
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_WS_MESSAGE),
        max_frame_size: Some(MAX_WS_MESSAGE),
        ..Default::default()
    }
}

/// Dial a `ws://` or `wss://` URL under the connect timeout.
pub async fn connect(
    url: &str,
    timeout: Option<Duration>,
) -> FsResult<WsTransport<MaybeTlsStream<TcpStream>>> {
    let dial = async {
        tokio_tungstenite::connect_async_with_config(url, Some(ws_config()), false)
            .await
            .map_err(|e| {
                FsError::new(Stage::Connect, ErrorCode::WebsocketInitFailed)
                    .with_message(format!("dial {url} failed"))
                    .with_source(e)
            })
    };
    let (ws, _response) = with_timeout(timeout, dial).await?;
    debug!(url, "websocket connected");
    Ok(WsTransport::new(ws))
}

/// Accept one WebSocket on an already-accepted byte stream (the direct
/// path, where the endpoint serves its own socket).
pub async fn accept<S>(io: S) -> FsResult<WsTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ws = tokio_tungstenite::accept_async_with_config(io, Some(ws_config()))
        .await
        .map_err(|e| {
            warn!(err = %e, "websocket accept failed");
            FsError::new(Stage::Connect, ErrorCode::WebsocketInitFailed)
                .with_message("websocket accept failed")
                .with_source(e)
        })?;
    Ok(WsTransport::new(ws))
}
