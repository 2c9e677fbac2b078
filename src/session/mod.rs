//! Broker session transport interface.
//!
//! The wire protocol library is a collaborator, not part of this crate: it is
//! reached through [`SessionFactory`], [`BrokerSession`] and
//! [`MessageConsumer`]. Notifications flow back as [`SessionEvent`] and
//! [`ConsumerEvent`] values on unbounded channels handed out at creation time.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// Errors raised synchronously by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Session creation failed: {0}")]
    Session(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Session is not connected")]
    NotConnected,
}

/// Factory-level transport settings, applied once per process.
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryProperties {
    /// Transport log level: 1 = error .. 5 = trace.
    pub log_level: u8,
    /// API behaviour profile.
    pub profile: String,
    /// Passthrough tuning keys.
    pub extra: Map<String, Value>,
}

/// Properties for one broker session.
#[derive(Clone, PartialEq)]
pub struct SessionProperties {
    /// Streaming transport URI.
    pub url: String,
    pub vpn_name: String,
    pub access_token: String,
    /// Passthrough session keys (authentication scheme, reconnect tuning, ...).
    pub extra: Map<String, Value>,
}

impl fmt::Debug for SessionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProperties")
            .field("url", &self.url)
            .field("vpn_name", &self.vpn_name)
            .field("access_token", &"<redacted>")
            .field("extra", &self.extra)
            .finish()
    }
}

/// Queue to bind a consumer to.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
}

/// Properties for a queue consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerProperties {
    pub queue_descriptor: QueueDescriptor,
    /// Settlement outcomes the consumer may use besides acknowledgement.
    pub required_settlement_outcomes: Vec<SettlementOutcome>,
    /// Passthrough consumer keys.
    pub extra: Map<String, Value>,
}

/// Broker delivery guarantee for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Direct,
    Persistent,
}

/// Broker-side disposition of a consumed message, besides acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementOutcome {
    /// Retryable: the broker may redeliver or dead-letter per its own policy.
    #[serde(alias = "failed")]
    Failed,
    /// Permanent: the broker will not redeliver.
    #[serde(alias = "rejected")]
    Rejected,
}

/// Outbound wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Topic destination.
    pub destination: String,
    pub binary_attachment: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    /// Key echoed back in the acknowledgement or rejection notification.
    pub correlation_key: String,
}

/// Body of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

/// A message received from a queue consumer.
pub trait InboundMessage: fmt::Debug + Send + Sync {
    /// Topic the message was published to.
    fn destination(&self) -> &str;

    fn payload(&self) -> Payload;

    /// Accept the message, removing it from the queue.
    fn acknowledge(&self) -> Result<(), TransportError>;

    /// Settle the message with a non-accepting outcome.
    fn settle(&self, outcome: SettlementOutcome) -> Result<(), TransportError>;
}

/// Session notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Up,
    ConnectFailed { reason: String },
    Acknowledged { correlation_key: String },
    Rejected { correlation_key: String, detail: String },
}

/// Consumer notifications.
#[derive(Debug)]
pub enum ConsumerEvent {
    Up,
    Down { reason: String },
    ConnectFailed { reason: String },
    Message(Box<dyn InboundMessage>),
}

/// A connected (or connecting) broker session.
pub trait BrokerSession: Send + Sync {
    /// Start connecting; the outcome arrives as `Up` or `ConnectFailed`.
    fn connect(&self) -> Result<(), TransportError>;

    /// Dispatch a message; the outcome arrives as `Acknowledged` or `Rejected`.
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    fn create_consumer(&self, properties: ConsumerProperties) -> Result<ConsumerHandle, TransportError>;

    /// Replace the credential used when the session next (re)authenticates.
    fn update_authentication_on_reconnect(&self, access_token: &str) -> Result<(), TransportError>;

    fn disconnect(&self) {}
}

/// A queue consumer.
pub trait MessageConsumer: Send + Sync {
    /// Start connecting; the outcome arrives as `Up` or `ConnectFailed`.
    fn connect(&self) -> Result<(), TransportError>;

    fn disconnect(&self) {}
}

/// A created session and its notification stream.
pub struct SessionHandle {
    pub session: Arc<dyn BrokerSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// A created consumer and its notification stream.
pub struct ConsumerHandle {
    pub consumer: Arc<dyn MessageConsumer>,
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

/// Entry point into the transport library.
pub trait SessionFactory: Send + Sync {
    fn create_session(
        &self,
        factory: &FactoryProperties,
        properties: SessionProperties,
    ) -> Result<SessionHandle, TransportError>;
}
