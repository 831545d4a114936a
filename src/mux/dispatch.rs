//! Stream dispatcher: routes accepted streams to handlers by `kind`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::compat::Compat;
use tracing::debug;

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::observer::ObserverCell;

use super::hello::{self, StreamHello};

/// An accepted (or opened) mux substream as tokio IO.
pub type StreamIo = Compat<yamux::Stream>;

/// The framed view handlers work with. The greeting has already been
/// consumed; every remaining frame is the handler's protocol.
pub type StreamFrames = Framed<StreamIo, LengthDelimitedCodec>;

/// One registered stream protocol. The stream closes when `handle` returns
/// (dropping an open yamux stream resets it, so handlers that want a clean
/// close should drain or shut the stream down themselves).
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, hello: StreamHello, frames: StreamFrames) -> FsResult<()>;
}

/// `kind → handler` table plus the per-stream accept path.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
    observer: ObserverCell,
    max_hello: usize,
    max_frame: usize,
}

impl Dispatcher {
    pub fn new(observer: ObserverCell, max_hello: usize, max_frame: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            observer,
            max_hello,
            max_frame,
        }
    }

    /// Register (or replace) the handler for a stream kind.
    pub fn handle(&self, kind: impl Into<String>, handler: Arc<dyn StreamHandler>) {
        if let Ok(mut map) = self.handlers.write() {
            map.insert(kind.into(), handler);
        }
    }

    fn lookup(&self, kind: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.read().ok()?.get(kind).cloned()
    }

    /// Greet, route, and run one accepted stream. Every failure here is
    /// per-stream: it is reported to the observer and the stream is dropped,
    /// while the session keeps accepting.
    pub(crate) async fn dispatch(self: Arc<Self>, stream: yamux::Stream) {
        use tokio_util::compat::FuturesAsyncReadCompatExt;

        let mut frames = crate::frame::framed(stream.compat(), self.max_frame);
        let hello = match hello::read_hello(&mut frames, self.max_hello).await {
            Ok(h) => h,
            Err(e) => {
                self.observer.stream_error(None, &e);
                return;
            }
        };

        let Some(handler) = self.lookup(&hello.kind) else {
            let err = FsError::new(Stage::Yamux, ErrorCode::MissingHandler)
                .with_message(format!("no handler for stream kind {:?}", hello.kind));
            self.observer.stream_error(Some(&hello.kind), &err);
            return;
        };

        debug!(kind = %hello.kind, "stream dispatched");
        let kind = hello.kind.clone();
        match std::panic::AssertUnwindSafe(handler.handle(hello, frames))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.observer.stream_error(Some(&kind), &e),
            Err(_) => {
                let err = FsError::new(Stage::Yamux, ErrorCode::RpcFailed)
                    .with_message("stream handler panicked");
                self.observer.stream_error(Some(&kind), &err);
            }
        }
    }
}
