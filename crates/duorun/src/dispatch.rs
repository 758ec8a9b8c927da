//! # Dispatch Table
//!
//! Method name to handler, shared by a peer with every connection it owns.
//! Registration is safe while traffic is flowing; a request looks its handler
//! up at the moment it arrives.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use duorpc::Value;

use crate::error::Result;
use crate::request::Request;

/// Serves one method.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Value>;
}

/// Adapts an async closure to [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Value> {
        (self.0)(request).await
    }
}

#[derive(Default)]
pub(crate) struct DispatchTable {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `method`. Returns `true` if it replaced an earlier one.
    pub(crate) fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        self.handlers.insert(method.into(), handler).is_some()
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).map(|entry| entry.value().clone())
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }
}
