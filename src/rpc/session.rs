//! The RPC session: one serve loop, one serialized writer, one client.
//!
//! The session reads frames serially and fans requests out to fresh tasks;
//! every outbound envelope funnels through a single writer task so frame
//! boundaries are never interleaved. The same session object serves both
//! directions — either peer may call, respond, and push notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::frame::{self, FrameError};
use crate::mux::{StreamFrames, StreamHandler, StreamHello};
use crate::observer::ObserverCell;

use super::router::Router;
use super::{Envelope, ErrorBody, CODE_INTERNAL_ERROR, CODE_UNKNOWN_TYPE_ID};

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Cap on one envelope frame in either direction.
    pub max_frame: usize,
    /// Default per-call deadline. `None` (or zero) waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame: frame::DEFAULT_MAX_FRAME,
            call_timeout: None,
        }
    }
}

/// How a call can fail: the callee answered with a structured error, or the
/// transport/session gave out underneath it.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("rpc error: {}", .0.code)]
    Rpc(ErrorBody),
    #[error(transparent)]
    Transport(FsError),
}

impl CallError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, CallError::Transport(e) if e.code == ErrorCode::Canceled)
    }
}

type NotifyFn = Arc<dyn Fn(Value) + Send + Sync>;
type PendingTx = oneshot::Sender<Result<Value, CallError>>;

struct Shared {
    out_tx: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<u32, PendingTx>>,
    subs: Mutex<HashMap<u32, Vec<(u64, NotifyFn)>>>,
    next_id: AtomicU32,
    next_sub_id: AtomicU64,
    token: CancellationToken,
    call_timeout: Option<Duration>,
}

fn canceled() -> FsError {
    FsError::new(Stage::Rpc, ErrorCode::Canceled)
}

impl Shared {
    fn take_pending(&self, id: u32) -> Option<PendingTx> {
        self.pending.lock().ok()?.remove(&id)
    }

    fn fail_all_pending(&self) {
        let drained: Vec<PendingTx> = match self.pending.lock() {
            Ok(mut map) => map.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return,
        };
        for tx in drained {
            let _ = tx.send(Err(CallError::Transport(canceled())));
        }
    }
}

/// Caller-side handle. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

/// Removes its notification handler when dropped or explicitly
/// unsubscribed. Removal is immediate: the handler is gone from the table
/// before `unsubscribe` returns.
pub struct NotifySubscription {
    shared: Weak<Shared>,
    type_id: u32,
    sub_id: u64,
}

impl NotifySubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn remove(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut subs) = shared.subs.lock() {
                if let Some(list) = subs.get_mut(&self.type_id) {
                    list.retain(|(id, _)| *id != self.sub_id);
                    if list.is_empty() {
                        subs.remove(&self.type_id);
                    }
                }
            }
        }
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl RpcClient {
    /// Issue one request and wait for its response, the session's default
    /// timeout, or cancellation — whichever comes first.
    pub async fn call(&self, type_id: u32, payload: Value) -> Result<Value, CallError> {
        self.call_with_timeout(type_id, payload, self.shared.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        type_id: u32,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if id == u32::MAX {
            // Id space exhausted — the session can no longer correlate
            // responses safely.
            self.shared.token.cancel();
            self.shared.fail_all_pending();
            return Err(CallError::Transport(
                FsError::new(Stage::Rpc, ErrorCode::RpcFailed)
                    .with_message("request id space exhausted"),
            ));
        }

        let (tx, rx) = oneshot::channel();
        match self.shared.pending.lock() {
            Ok(mut map) => {
                map.insert(id, tx);
            }
            Err(_) => return Err(CallError::Transport(canceled())),
        }

        if self
            .shared
            .out_tx
            .send(Envelope::Request {
                id,
                type_id,
                payload,
            })
            .await
            .is_err()
        {
            self.shared.take_pending(id);
            return Err(CallError::Transport(
                FsError::new(Stage::Rpc, ErrorCode::SendFailed)
                    .with_message("session writer is gone"),
            ));
        }

        let token = self.shared.token.clone();
        let wait = async {
            tokio::select! {
                _ = token.cancelled() => Err(CallError::Transport(canceled())),
                res = rx => match res {
                    Ok(outcome) => outcome,
                    // Pending slot dropped without an answer: teardown won.
                    Err(_) => Err(CallError::Transport(canceled())),
                },
            }
        };

        match timeout {
            Some(d) if !d.is_zero() => match tokio::time::timeout(d, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.take_pending(id);
                    Err(CallError::Transport(
                        FsError::new(Stage::Rpc, ErrorCode::Timeout)
                            .with_message(format!("call {type_id} timed out")),
                    ))
                }
            },
            _ => wait.await,
        }
    }

    /// Fire-and-forget notification. No id, no response.
    pub async fn notify(&self, type_id: u32, payload: Value) -> FsResult<()> {
        self.shared
            .out_tx
            .send(Envelope::Note { type_id, payload })
            .await
            .map_err(|_| {
                FsError::new(Stage::Rpc, ErrorCode::SendFailed)
                    .with_message("session writer is gone")
            })
    }

    /// Subscribe to notifications of one `type_id`. Handlers run on the
    /// session's read task in arrival order; keep them short.
    pub fn on_notify<F>(&self, type_id: u32, handler: F) -> NotifySubscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let sub_id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.shared.subs.lock() {
            subs.entry(type_id)
                .or_default()
                .push((sub_id, Arc::new(handler)));
        }
        NotifySubscription {
            shared: Arc::downgrade(&self.shared),
            type_id,
            sub_id,
        }
    }

    /// Tear the session down. Every outstanding call observes `canceled`.
    pub fn close(&self) {
        self.shared.token.cancel();
        self.shared.fail_all_pending();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

/// Bind an RPC session to a framed stream.
///
/// Returns the caller handle and the serve task. The serve task resolves
/// when the stream EOFs, the session is cancelled, or a fatal frame error
/// occurs; at that point all outstanding calls have been failed.
pub fn attach<T>(
    framed: Framed<T, LengthDelimitedCodec>,
    router: Arc<Router>,
    cfg: RpcConfig,
    observer: ObserverCell,
    parent: &CancellationToken,
) -> (RpcClient, JoinHandle<FsResult<()>>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let token = parent.child_token();
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(64);
    let (sink, stream) = framed.split();

    let shared = Arc::new(Shared {
        out_tx,
        pending: Mutex::new(HashMap::new()),
        subs: Mutex::new(HashMap::new()),
        next_id: AtomicU32::new(1),
        next_sub_id: AtomicU64::new(1),
        token: token.clone(),
        call_timeout: cfg.call_timeout,
    });

    tokio::spawn(write_loop(
        sink,
        out_rx,
        cfg.max_frame,
        token.clone(),
    ));

    let serve = tokio::spawn(read_loop(
        stream,
        router,
        shared.clone(),
        observer,
        token,
    ));

    (RpcClient { shared }, serve)
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, LengthDelimitedCodec>, bytes::Bytes>,
    mut out_rx: mpsc::Receiver<Envelope>,
    max_frame: usize,
    token: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let env = tokio::select! {
            _ = token.cancelled() => break,
            env = out_rx.recv() => match env {
                Some(env) => env,
                None => break,
            },
        };
        if let Err(e) = frame::write_json(&mut sink, &env, max_frame).await {
            warn!(err = %e, "rpc write failed");
            token.cancel();
            break;
        }
    }
}

async fn read_loop<T>(
    mut stream: SplitStream<Framed<T, LengthDelimitedCodec>>,
    router: Arc<Router>,
    shared: Arc<Shared>,
    observer: ObserverCell,
    token: CancellationToken,
) -> FsResult<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let result = loop {
        let next = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            next = frame::read_json::<_, Envelope>(&mut stream) => next,
        };
        match next {
            Ok(None) => break Ok(()), // peer closed cleanly
            Err(FrameError::TooLarge) => {
                break Err(FsError::new(Stage::Rpc, ErrorCode::FrameTooLarge)
                    .with_message("inbound rpc frame over cap"));
            }
            Err(FrameError::Json(e)) => {
                break Err(FsError::new(Stage::Rpc, ErrorCode::RpcFailed)
                    .with_message("malformed rpc envelope")
                    .with_source(e));
            }
            Err(FrameError::Io(e)) => {
                break Err(FsError::new(Stage::Rpc, ErrorCode::RpcFailed)
                    .with_message("rpc stream failed")
                    .with_source(e));
            }
            Ok(Some(Envelope::Request {
                id,
                type_id,
                payload,
            })) => {
                serve_request(id, type_id, payload, &router, &shared, &observer, &token).await;
            }
            Ok(Some(Envelope::Response { id, payload, error })) => {
                // Either we win and complete the call, or cancellation beat
                // us and the slot is already gone — both fine.
                if let Some(tx) = shared.take_pending(id) {
                    let outcome = match error {
                        Some(body) => Err(CallError::Rpc(body)),
                        None => Ok(payload.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                } else {
                    trace!(id, "response for unknown or raced id");
                }
            }
            Ok(Some(Envelope::Note { type_id, payload })) => {
                deliver_note(&shared, type_id, payload);
            }
        }
    };

    token.cancel();
    shared.fail_all_pending();
    if let Err(e) = &result {
        warn!(err = %e, "rpc session ended with error");
    } else {
        debug!("rpc session closed");
    }
    result
}

async fn serve_request(
    id: u32,
    type_id: u32,
    payload: Value,
    router: &Arc<Router>,
    shared: &Arc<Shared>,
    observer: &ObserverCell,
    token: &CancellationToken,
) {
    let Some(handler) = router.get(type_id) else {
        let _ = shared
            .out_tx
            .send(Envelope::Response {
                id,
                payload: None,
                error: Some(
                    ErrorBody::new(CODE_UNKNOWN_TYPE_ID)
                        .with_message(format!("no handler for type_id {type_id}")),
                ),
            })
            .await;
        return;
    };

    // Each request runs on its own task; responses re-enter the writer
    // queue whenever they finish, in any order.
    let out_tx = shared.out_tx.clone();
    let observer = observer.clone();
    let token = token.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            res = std::panic::AssertUnwindSafe(handler.call(payload)).catch_unwind() => res,
        };
        let (ok, response) = match outcome {
            Ok(Ok(value)) => (
                true,
                Envelope::Response {
                    id,
                    payload: Some(value),
                    error: None,
                },
            ),
            Ok(Err(body)) => (
                false,
                Envelope::Response {
                    id,
                    payload: None,
                    error: Some(body),
                },
            ),
            Err(_) => (
                false,
                Envelope::Response {
                    id,
                    payload: None,
                    error: Some(
                        ErrorBody::new(CODE_INTERNAL_ERROR).with_message("handler panicked"),
                    ),
                },
            ),
        };
        observer.rpc_call(type_id, ok, start.elapsed());
        let _ = out_tx.send(response).await;
    });
}

fn deliver_note(shared: &Arc<Shared>, type_id: u32, payload: Value) {
    let handlers: Vec<NotifyFn> = match shared.subs.lock() {
        Ok(subs) => subs
            .get(&type_id)
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default(),
        Err(_) => return,
    };
    for handler in handlers {
        let payload = payload.clone();
        // A panicking subscriber must not take down the read loop.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(payload)));
    }
}

/// Adapter that plugs RPC into the stream dispatcher: each accepted
/// `"rpc"` stream gets a freshly built router and its own session.
pub struct RpcStreamHandler {
    registrar: Arc<dyn Fn(&mut Router) + Send + Sync>,
    on_session: Option<Arc<dyn Fn(RpcClient) + Send + Sync>>,
    cfg: RpcConfig,
    observer: ObserverCell,
    token: CancellationToken,
}

impl RpcStreamHandler {
    pub fn new(
        registrar: Arc<dyn Fn(&mut Router) + Send + Sync>,
        cfg: RpcConfig,
        observer: ObserverCell,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registrar,
            on_session: None,
            cfg,
            observer,
            token,
        })
    }

    /// Install a hook that receives the per-stream client handle — the
    /// server's way to push notifications back down the same stream.
    pub fn with_session_hook(
        registrar: Arc<dyn Fn(&mut Router) + Send + Sync>,
        on_session: Arc<dyn Fn(RpcClient) + Send + Sync>,
        cfg: RpcConfig,
        observer: ObserverCell,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registrar,
            on_session: Some(on_session),
            cfg,
            observer,
            token,
        })
    }
}

#[async_trait]
impl StreamHandler for RpcStreamHandler {
    async fn handle(&self, _hello: StreamHello, frames: StreamFrames) -> FsResult<()> {
        let mut router = Router::new();
        (self.registrar)(&mut router);
        let (client, serve) = attach(
            frames,
            router.into_shared(),
            self.cfg.clone(),
            self.observer.clone(),
            &self.token,
        );
        if let Some(hook) = &self.on_session {
            hook(client.clone());
        }
        match serve.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FsError::new(Stage::Rpc, ErrorCode::RpcFailed)
                .with_message("rpc serve task aborted")),
        }
    }
}
