// SPDX-License-Identifier: MIT
//! Replaceable observability hooks.
//!
//! Sessions call into one `Observer` for non-fatal dispatch errors, RPC call
//! outcomes, and handshake completions. The observer is swappable at runtime
//! and calls into it never panic the hot path: a panicking observer is
//! caught and dropped on the floor.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::FsError;
use crate::suite::CipherSuite;

/// Hook points exposed by sessions. All methods have empty defaults, must
/// return quickly, and must not block.
pub trait Observer: Send + Sync {
    /// A non-fatal per-stream failure (bad StreamHello, missing handler,
    /// handler panic). The session keeps accepting streams.
    fn stream_error(&self, _kind: Option<&str>, _err: &FsError) {}

    /// One RPC call completed on the server side.
    fn rpc_call(&self, _type_id: u32, _ok: bool, _elapsed: Duration) {}

    /// An E2EE handshake completed and record keys are live.
    fn handshake_done(&self, _suite: CipherSuite) {}
}

/// Default observer: structured log lines only.
pub struct LogObserver;

impl Observer for LogObserver {
    fn stream_error(&self, kind: Option<&str>, err: &FsError) {
        tracing::warn!(kind = kind.unwrap_or("?"), err = %err, "stream error");
    }

    fn rpc_call(&self, type_id: u32, ok: bool, elapsed: Duration) {
        tracing::debug!(
            type_id,
            ok,
            elapsed_ms = elapsed.as_millis() as u64,
            "rpc call complete"
        );
    }

    fn handshake_done(&self, suite: CipherSuite) {
        tracing::debug!(suite = suite.wire_id(), "e2ee handshake complete");
    }
}

/// Shared, atomically replaceable observer slot.
#[derive(Clone)]
pub struct ObserverCell {
    inner: Arc<RwLock<Arc<dyn Observer>>>,
}

impl Default for ObserverCell {
    fn default() -> Self {
        Self::new(Arc::new(LogObserver))
    }
}

impl ObserverCell {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(observer)),
        }
    }

    /// Replace the observer. Takes effect for all subsequent hook calls,
    /// including on sessions already running.
    pub fn replace(&self, observer: Arc<dyn Observer>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = observer;
        }
    }

    fn current(&self) -> Option<Arc<dyn Observer>> {
        self.inner.read().ok().map(|slot| slot.clone())
    }

    pub fn stream_error(&self, kind: Option<&str>, err: &FsError) {
        if let Some(obs) = self.current() {
            let _ = catch_unwind(AssertUnwindSafe(|| obs.stream_error(kind, err)));
        }
    }

    pub fn rpc_call(&self, type_id: u32, ok: bool, elapsed: Duration) {
        if let Some(obs) = self.current() {
            let _ = catch_unwind(AssertUnwindSafe(|| obs.rpc_call(type_id, ok, elapsed)));
        }
    }

    pub fn handshake_done(&self, suite: CipherSuite) {
        if let Some(obs) = self.current() {
            let _ = catch_unwind(AssertUnwindSafe(|| obs.handshake_done(suite)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, Stage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl Observer for Counting {
        fn stream_error(&self, _kind: Option<&str>, _err: &FsError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Observer for Panicky {
        fn stream_error(&self, _kind: Option<&str>, _err: &FsError) {
            panic!("observer bug");
        }
    }

    #[test]
    fn replace_takes_effect() {
        let count = Arc::new(AtomicUsize::new(0));
        let cell = ObserverCell::default();
        cell.replace(Arc::new(Counting(count.clone())));
        let err = FsError::new(Stage::Yamux, ErrorCode::MissingHandler);
        cell.stream_error(Some("echo"), &err);
        cell.stream_error(None, &err);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_observer_is_contained() {
        let cell = ObserverCell::new(Arc::new(Panicky));
        let err = FsError::new(Stage::Yamux, ErrorCode::StreamHelloFailed);
        // Must not propagate the panic.
        cell.stream_error(None, &err);
    }
}
