//! Inbound message handling and settlement.

use std::sync::Arc;

use tracing::{error, info, warn, Instrument};

use crate::interfaces::{InboundDispatcher, ProcessingError};
use crate::normalize::{self, InboundEvent};
use crate::session::{InboundMessage, SettlementOutcome};

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processing succeeded.
    Accept,
    Settle(SettlementOutcome),
    /// Processing failed but no non-accepting outcome is available. The
    /// message is acknowledged so it is not redelivered forever.
    AcceptUnsettled,
}

impl Settlement {
    /// Pick the settlement for a processing result.
    ///
    /// Unrecoverable errors are rejected when the consumer supports it, other
    /// errors fall back to `FAILED`, and without either the message is
    /// acknowledged.
    pub fn for_result(result: &Result<(), ProcessingError>, supported: &[SettlementOutcome]) -> Self {
        match result {
            Ok(()) => Settlement::Accept,
            Err(e) if e.unrecoverable && supported.contains(&SettlementOutcome::Rejected) => {
                Settlement::Settle(SettlementOutcome::Rejected)
            }
            Err(_) if supported.contains(&SettlementOutcome::Failed) => {
                Settlement::Settle(SettlementOutcome::Failed)
            }
            Err(_) => Settlement::AcceptUnsettled,
        }
    }
}

/// Decode, dispatch and settle one message.
pub(crate) async fn handle_message(
    message: Box<dyn InboundMessage>,
    dispatcher: Arc<dyn InboundDispatcher>,
    supported: Arc<[SettlementOutcome]>,
) {
    let topic = message.destination().to_string();
    let consume_span = tracing::info_span!("mesh.consume", topic = %topic);

    async move {
        info!(topic = %topic, "Received message");
        let (data, headers) = normalize::from_wire(&message.payload());
        let event = InboundEvent {
            event: topic.clone(),
            data,
            headers,
        };

        let result = dispatcher.dispatch(event).await;
        if let Err(e) = &result {
            error!(
                topic = %topic,
                error = %e,
                unrecoverable = e.unrecoverable,
                "Error occurred in asynchronous event processing"
            );
        }

        let settled = match Settlement::for_result(&result, &supported) {
            Settlement::Accept => message.acknowledge(),
            Settlement::Settle(outcome) => {
                info!(topic = %topic, outcome = ?outcome, "Settling failed message");
                message.settle(outcome)
            }
            Settlement::AcceptUnsettled => {
                warn!(
                    topic = %topic,
                    "No settlement outcome configured for failures, acknowledging and dropping message"
                );
                message.acknowledge()
            }
        };
        if let Err(e) = settled {
            error!(topic = %topic, error = %e, "Failed to settle message");
        }
    }
    .instrument(consume_span)
    .await
}
