//! In-memory broker session for testing.
//!
//! `MockBroker` plays the broker side: it records every session, message and
//! consumer the adapter creates, acknowledges (or rejects) published messages,
//! and lets a test push inbound messages to the active consumer and observe how
//! they were settled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use super::{
    BrokerSession, ConsumerEvent, ConsumerHandle, ConsumerProperties, FactoryProperties,
    InboundMessage, MessageConsumer, OutboundMessage, Payload, SessionEvent, SessionFactory,
    SessionHandle, SessionProperties, SettlementOutcome, TransportError,
};

/// How a delivered message was settled by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Settled(SettlementOutcome),
}

#[derive(Default)]
struct BrokerState {
    factory_properties: Vec<FactoryProperties>,
    sessions: Vec<SessionProperties>,
    sent: Vec<OutboundMessage>,
    auth_updates: Vec<String>,
    consumers: Vec<ConsumerProperties>,
    session_events: Option<mpsc::UnboundedSender<SessionEvent>>,
    consumer_events: Option<mpsc::UnboundedSender<ConsumerEvent>>,
    fail_connect: Option<String>,
    fail_consumer: Option<String>,
    reject_topics: HashSet<String>,
    hold_acks: bool,
}

/// Shared broker-side state behind the mock session.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session factory bound to this broker.
    pub fn factory(&self) -> Arc<MockSessionFactory> {
        Arc::new(MockSessionFactory {
            broker: self.clone(),
        })
    }

    /// Make the next session connect attempt fail.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.state().fail_connect = Some(reason.into());
    }

    /// Make the next consumer connect attempt fail.
    pub fn fail_consumer(&self, reason: impl Into<String>) {
        self.state().fail_consumer = Some(reason.into());
    }

    /// Reject every message published to `topic`.
    pub fn reject_topic(&self, topic: impl Into<String>) {
        self.state().reject_topics.insert(topic.into());
    }

    /// Stop answering publishes automatically; the test fires outcomes itself.
    pub fn hold_acks(&self, hold: bool) {
        self.state().hold_acks = hold;
    }

    pub fn factory_properties(&self) -> Vec<FactoryProperties> {
        self.state().factory_properties.clone()
    }

    pub fn sessions(&self) -> Vec<SessionProperties> {
        self.state().sessions.clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    pub fn auth_updates(&self) -> Vec<String> {
        self.state().auth_updates.clone()
    }

    pub fn consumers(&self) -> Vec<ConsumerProperties> {
        self.state().consumers.clone()
    }

    /// Push a session notification. Returns false when nobody is listening.
    pub fn emit(&self, event: SessionEvent) -> bool {
        match &self.state().session_events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a message to the active consumer.
    ///
    /// The returned receiver resolves with the consumer's settlement.
    pub fn deliver(
        &self,
        destination: impl Into<String>,
        payload: Payload,
    ) -> oneshot::Receiver<Disposition> {
        let (message, rx) = MockInboundMessage::new(destination, payload);
        if let Some(events) = &self.state().consumer_events {
            let _ = events.send(ConsumerEvent::Message(Box::new(message)));
        }
        rx
    }

    /// Take the active consumer down.
    pub fn consumer_down(&self, reason: impl Into<String>) {
        if let Some(events) = &self.state().consumer_events {
            let _ = events.send(ConsumerEvent::Down {
                reason: reason.into(),
            });
        }
    }
}

/// Session factory handing out [`MockSession`]s.
pub struct MockSessionFactory {
    broker: MockBroker,
}

impl SessionFactory for MockSessionFactory {
    fn create_session(
        &self,
        factory: &FactoryProperties,
        properties: SessionProperties,
    ) -> Result<SessionHandle, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            state.factory_properties.push(factory.clone());
            state.sessions.push(properties);
            state.session_events = Some(tx);
        }
        Ok(SessionHandle {
            session: Arc::new(MockSession {
                broker: self.broker.clone(),
            }),
            events: rx,
        })
    }
}

/// Broker session backed by [`MockBroker`].
pub struct MockSession {
    broker: MockBroker,
}

impl BrokerSession for MockSession {
    fn connect(&self) -> Result<(), TransportError> {
        let failure = self.broker.state().fail_connect.take();
        let event = match failure {
            Some(reason) => SessionEvent::ConnectFailed { reason },
            None => SessionEvent::Up,
        };
        self.broker.emit(event);
        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let (rejected, hold) = {
            let mut state = self.broker.state();
            state.sent.push(message.clone());
            (
                state.reject_topics.contains(&message.destination),
                state.hold_acks,
            )
        };
        if hold {
            return Ok(());
        }
        let correlation_key = message.correlation_key;
        let event = if rejected {
            SessionEvent::Rejected {
                correlation_key,
                detail: format!("Rejected by broker: {}", message.destination),
            }
        } else {
            SessionEvent::Acknowledged { correlation_key }
        };
        self.broker.emit(event);
        Ok(())
    }

    fn create_consumer(&self, properties: ConsumerProperties) -> Result<ConsumerHandle, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            state.consumers.push(properties);
            state.consumer_events = Some(tx);
        }
        Ok(ConsumerHandle {
            consumer: Arc::new(MockConsumer {
                broker: self.broker.clone(),
            }),
            events: rx,
        })
    }

    fn update_authentication_on_reconnect(&self, access_token: &str) -> Result<(), TransportError> {
        self.broker.state().auth_updates.push(access_token.to_string());
        Ok(())
    }
}

/// Queue consumer backed by [`MockBroker`].
pub struct MockConsumer {
    broker: MockBroker,
}

impl MessageConsumer for MockConsumer {
    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let event = match state.fail_consumer.take() {
            Some(reason) => ConsumerEvent::ConnectFailed { reason },
            None => ConsumerEvent::Up,
        };
        if let Some(events) = &state.consumer_events {
            let _ = events.send(event);
        }
        Ok(())
    }
}

/// Inbound message whose settlement is reported back to the test.
#[derive(Debug)]
pub struct MockInboundMessage {
    destination: String,
    payload: Payload,
    disposition: Mutex<Option<oneshot::Sender<Disposition>>>,
}

impl MockInboundMessage {
    /// A standalone message and the receiver its settlement is reported on.
    pub fn new(
        destination: impl Into<String>,
        payload: Payload,
    ) -> (Self, oneshot::Receiver<Disposition>) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            destination: destination.into(),
            payload,
            disposition: Mutex::new(Some(tx)),
        };
        (message, rx)
    }

    fn report(&self, disposition: Disposition) -> Result<(), TransportError> {
        let sender = self
            .disposition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Operation("Message already settled".to_string()))?;
        let _ = sender.send(disposition);
        Ok(())
    }
}

impl InboundMessage for MockInboundMessage {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn payload(&self) -> Payload {
        self.payload.clone()
    }

    fn acknowledge(&self) -> Result<(), TransportError> {
        self.report(Disposition::Acknowledged)
    }

    fn settle(&self, outcome: SettlementOutcome) -> Result<(), TransportError> {
        self.report(Disposition::Settled(outcome))
    }
}
