//! `type_id → handler` routing for incoming requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::ErrorBody;

/// One registered operation. Implemented for any async closure of the right
/// shape, so registration reads as `router.register(1, |payload| async { … })`.
pub trait RpcHandler: Send + Sync {
    fn call(&self, payload: Value) -> BoxFuture<'static, Result<Value, ErrorBody>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorBody>> + Send + 'static,
{
    fn call(&self, payload: Value) -> BoxFuture<'static, Result<Value, ErrorBody>> {
        Box::pin(self(payload))
    }
}

/// Routing table. Built up front; [`Router::into_shared`] closes
/// registration before a server starts serving.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<u32, Arc<dyn RpcHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one `type_id`. Last registration wins.
    pub fn register<H>(&mut self, type_id: u32, handler: H) -> &mut Self
    where
        H: RpcHandler + 'static,
    {
        self.handlers.insert(type_id, Arc::new(handler));
        self
    }

    /// Freeze the table for serving.
    pub fn into_shared(self) -> Arc<Router> {
        Arc::new(self)
    }

    pub(crate) fn get(&self, type_id: u32) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(&type_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
