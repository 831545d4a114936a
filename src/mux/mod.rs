// SPDX-License-Identifier: MIT
//! Stream multiplexer interop.
//!
//! Runs a yamux (v1) session over the secure record stream and exposes two
//! surfaces: opening greeted outbound streams, and dispatching inbound
//! streams to handlers by `kind`. The `yamux::Connection` is poll-driven
//! and makes progress only while polled, so one driver task owns it and
//! serves open requests, inbound streams, and shutdown from a single
//! `poll_fn` loop.
//!
//! Config is yamux defaults; the protocol-level keep-alive stays off.

pub mod dispatch;
pub mod hello;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::Role;
use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::frame;

pub use dispatch::{Dispatcher, StreamFrames, StreamHandler, StreamIo};
pub use hello::StreamHello;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Cap on the StreamHello greeting frame.
    pub max_hello: usize,
    /// Cap on every later frame on a stream.
    pub max_frame: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_hello: frame::DEFAULT_MAX_HELLO,
            max_frame: frame::DEFAULT_MAX_FRAME,
        }
    }
}

struct OpenCmd(oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>);

/// Handle to a running mux session. Cloneable; any clone can open streams
/// or close the session.
#[derive(Clone)]
pub struct MuxSession {
    cmd_tx: mpsc::Sender<OpenCmd>,
    token: CancellationToken,
    cfg: MuxConfig,
}

impl MuxSession {
    /// Start a session over an established byte stream.
    ///
    /// `dispatcher` handles inbound streams; pass `None` on endpoints that
    /// never accept (inbound streams are then refused by drop). Cancelling
    /// `parent` (or calling [`MuxSession::close`]) closes the session; the
    /// returned task resolves when the session has fully wound down.
    pub fn start<Io>(
        io: Io,
        role: Role,
        dispatcher: Option<Arc<Dispatcher>>,
        cfg: MuxConfig,
        parent: &CancellationToken,
    ) -> (MuxSession, JoinHandle<FsResult<()>>)
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let token = parent.child_token();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let mode = match role {
            Role::Client => yamux::Mode::Client,
            Role::Server => yamux::Mode::Server,
        };
        let conn = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let driver = tokio::spawn(drive(conn, cmd_rx, dispatcher, token.clone()));
        (
            MuxSession {
                cmd_tx,
                token,
                cfg,
            },
            driver,
        )
    }

    /// Open a raw outbound substream.
    pub async fn open_stream(&self) -> FsResult<yamux::Stream> {
        let failed = |msg: &str| {
            FsError::new(Stage::Yamux, ErrorCode::OpenStreamFailed).with_message(msg.to_string())
        };
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(OpenCmd(tx))
            .await
            .map_err(|_| failed("session is closed"))?;
        match rx.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(failed("open refused").with_source(e)),
            Err(_) => Err(failed("session closed while opening")),
        }
    }

    /// Open a stream and greet it with `kind`. Returns the framed stream
    /// ready for the kind's protocol.
    pub async fn open_typed(&self, kind: &str) -> FsResult<StreamFrames> {
        use tokio_util::compat::FuturesAsyncReadCompatExt;

        let stream = self.open_stream().await?;
        let mut frames = frame::framed(stream.compat(), self.cfg.max_frame);
        hello::write_hello(&mut frames, kind, self.cfg.max_hello).await?;
        Ok(frames)
    }

    /// Close the session. The driver sends the yamux GoAway and resolves.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

async fn drive<Io>(
    mut conn: yamux::Connection<tokio_util::compat::Compat<Io>>,
    mut cmd_rx: mpsc::Receiver<OpenCmd>,
    dispatcher: Option<Arc<Dispatcher>>,
    token: CancellationToken,
) -> FsResult<()>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending_opens: VecDeque<oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>> =
        VecDeque::new();
    let mut cancelled = pin!(token.clone().cancelled_owned());

    let result = std::future::poll_fn(|cx| {
        // Shutdown wins over everything else.
        if cancelled.as_mut().poll(cx).is_ready() {
            return match conn.poll_close(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(mux_error(e))),
                Poll::Pending => Poll::Pending,
            };
        }

        // Collect open requests. A closed command channel just means every
        // handle is gone; inbound streams may still arrive.
        loop {
            match cmd_rx.poll_recv(cx) {
                Poll::Ready(Some(OpenCmd(reply))) => pending_opens.push_back(reply),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        // Serve pending opens while the connection has credit for them.
        while !pending_opens.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(res) => {
                    if let Some(reply) = pending_opens.pop_front() {
                        let _ = reply.send(res);
                    }
                }
                Poll::Pending => break,
            }
        }

        // Drain inbound streams; this is also what pumps the socket.
        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => match &dispatcher {
                    Some(d) => {
                        tokio::spawn(Arc::clone(d).dispatch(stream));
                    }
                    None => {
                        debug!("refusing inbound stream (no dispatcher)");
                        drop(stream);
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(mux_error(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    // Wake anything still waiting for an open.
    token.cancel();
    for reply in pending_opens {
        let _ = reply.send(Err(yamux::ConnectionError::Closed));
    }
    if let Err(e) = &result {
        warn!(err = %e, "mux session ended with error");
    } else {
        debug!("mux session closed");
    }
    result
}

fn mux_error(e: yamux::ConnectionError) -> FsError {
    FsError::new(Stage::Yamux, ErrorCode::WebsocketError)
        .with_message("mux connection failed")
        .with_source(e)
}
