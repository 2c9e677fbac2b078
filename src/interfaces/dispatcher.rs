//! Inbound dispatch interface.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::normalize::InboundEvent;

/// Failure raised by application logic while processing an inbound event.
///
/// `unrecoverable` marks failures where a redelivery cannot succeed; the
/// consumer uses it to pick a permanent rejection over a retryable failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
    pub unrecoverable: bool,
}

impl ProcessingError {
    /// A failure that may succeed on redelivery.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            unrecoverable: false,
        }
    }

    /// A failure that will never succeed, whatever the number of redeliveries.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            unrecoverable: true,
        }
    }
}

/// Topics the application wants delivered to its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Consume everything routed to the queue; subscriptions are managed out-of-band.
    ListenAll,
    /// Consume exactly these topic patterns.
    Topics(BTreeSet<String>),
}

impl Interest {
    /// Build a topic interest from any iterator of topic patterns.
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Topics(topics.into_iter().map(Into::into).collect())
    }

    /// True when there is nothing to consume.
    pub fn is_empty(&self) -> bool {
        matches!(self, Interest::Topics(topics) if topics.is_empty())
    }
}

impl Default for Interest {
    fn default() -> Self {
        Interest::Topics(BTreeSet::new())
    }
}

/// Entry point into the hosting application's event processing.
///
/// `interest` is consulted once, when listening starts; `dispatch` runs once
/// per consumed message and its outcome decides how the message is settled.
#[async_trait]
pub trait InboundDispatcher: Send + Sync {
    /// Topics currently registered by the application.
    fn interest(&self) -> Interest;

    /// Process one inbound event in the application's transactional context.
    async fn dispatch(&self, event: InboundEvent) -> Result<(), ProcessingError>;
}
