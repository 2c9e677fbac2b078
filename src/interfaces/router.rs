//! Event-name keyed dispatcher.
//!
//! The usual way for an application to consume events: register handlers per
//! topic, hand the router to `MeshEventBus::start_listening`, and the router's
//! registrations become the queue's subscription set.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use super::{InboundDispatcher, Interest, ProcessingError};
use crate::normalize::InboundEvent;

/// Handler for processing events from the mesh.
pub trait EventHandler: Send + Sync {
    /// Process an inbound event.
    fn handle(&self, event: Arc<InboundEvent>) -> BoxFuture<'static, Result<(), ProcessingError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<InboundEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    fn handle(&self, event: Arc<InboundEvent>) -> BoxFuture<'static, Result<(), ProcessingError>> {
        Box::pin(self(event))
    }
}

/// Routes inbound events to handlers registered by event name.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one topic.
    pub fn on(&mut self, topic: impl Into<String>, handler: impl EventHandler + 'static) -> &mut Self {
        self.handlers
            .entry(topic.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Register a handler for every event routed to the queue.
    ///
    /// Switches the router's interest to [`Interest::ListenAll`].
    pub fn on_all(&mut self, handler: impl EventHandler + 'static) -> &mut Self {
        self.catch_all.push(Arc::new(handler));
        self
    }

    fn handlers_for(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(event)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InboundDispatcher for EventRouter {
    fn interest(&self) -> Interest {
        if !self.catch_all.is_empty() {
            return Interest::ListenAll;
        }
        Interest::topics(self.handlers.keys().cloned())
    }

    async fn dispatch(&self, event: InboundEvent) -> Result<(), ProcessingError> {
        let handlers = self.handlers_for(&event.event);
        if handlers.is_empty() {
            return Err(ProcessingError::recoverable(format!(
                "No handler registered for event \"{}\"",
                event.event
            )));
        }

        debug!(event = %event.event, handlers = handlers.len(), "Dispatching inbound event");
        let event = Arc::new(event);
        for handler in handlers {
            handler.handle(Arc::clone(&event)).await?;
        }
        Ok(())
    }
}
