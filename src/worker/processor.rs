//! Event handlers invoked by the worker for each queue item.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::GuardError;
use crate::gateway::{CallRequest, PolicyGateway};
use crate::worker::queue::QueueItem;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler refused the item.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Gateway(#[from] GuardError),
}

/// Processes one queue item. Errors count against the item's retry budget.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError>;
}

/// Accepts every item and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError> {
        tracing::info!(
            event = item.event_name(),
            identity = %item.identity(),
            "Offline event received"
        );
        Ok(())
    }
}

type Router = dyn Fn(&QueueItem) -> Option<CallRequest> + Send + Sync;

/// Turns events into gateway calls.
///
/// The router maps an item to the call that handles it, or `None` when the
/// event needs no call. The item identity becomes the idempotency key unless
/// the router set one, so redelivered events never repeat a write.
pub struct GatewayHandler {
    gateway: Arc<PolicyGateway>,
    router: Box<Router>,
}

impl GatewayHandler {
    pub fn new(
        gateway: Arc<PolicyGateway>,
        router: impl Fn(&QueueItem) -> Option<CallRequest> + Send + Sync + 'static,
    ) -> Self {
        Self {
            gateway,
            router: Box::new(router),
        }
    }
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError> {
        let Some(request) = (self.router)(item) else {
            tracing::debug!(event = item.event_name(), "No route for event");
            return Ok(());
        };
        let request = match request.idempotency_key() {
            Some(_) => request,
            None => request.to_builder().idempotency_key(item.identity()).build(),
        };
        self.gateway.execute(request).await?;
        Ok(())
    }
}
