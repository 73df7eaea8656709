//! Inbound request dispatch
//!
//! Plugins may call back into the host. Each method the host answers is
//! backed by a [`RequestHandler`] registered on the connection.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Host-side handler for one inbound method.
///
/// `cancel` fires when the plugin sends `Cancel` for the request or the
/// connection goes away; the handler's result is discarded in that case.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Option<Value>, cancel: CancellationToken) -> Result<Value>;
}

#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerTable {
    pub(crate) fn insert(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(method).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }
}
