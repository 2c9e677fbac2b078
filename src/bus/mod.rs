//! Event bus over a broker session.
//!
//! This module contains:
//! - `MeshEventBus`: session lifecycle, acknowledged publishing, queue consumption
//! - `PendingDeliveries`: publishes awaiting their acknowledgement
//! - `Settlement`: mapping from processing outcome to broker settlement
//!
//! Startup runs in order: first token, broker validation, session connect,
//! background token refresh. Listening (topology reconciliation, then the
//! queue consumer) starts separately once the application is ready.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{TokenClient, TokenManager, TokenSource};
use crate::config::{ConfigError, ConsumerOptions, EndpointSet, MeshEnvironment, MeshOptions};
use crate::error::MeshError;
use crate::interfaces::{InboundDispatcher, Interest};
use crate::management::TopologyReconciler;
use crate::normalize::{self, OutboundEvent};
use crate::session::{
    BrokerSession, ConsumerEvent, ConsumerHandle, DeliveryMode, MessageConsumer, OutboundMessage,
    SessionEvent, SessionFactory, SessionHandle, SessionProperties, SettlementOutcome,
    TransportError,
};
use crate::validation::{BrokerValidator, ValidationCredentials};

mod consumer;
mod pending;

pub use consumer::Settlement;
pub use pending::{DeliveryOutcome, PendingDeliveries};


// ============================================================================
// Errors and state
// ============================================================================

/// Publish failures, surfaced to the caller and never retried here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Message {correlation_key} rejected by broker: {detail}")]
    Rejected {
        correlation_key: String,
        detail: String,
    },

    #[error("Session closed before the message was acknowledged")]
    SessionClosed,

    #[error("Send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Session or consumer failed to come up.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Session connect failed: {reason}")]
    Session { reason: String },

    #[error("Message consumer for queue \"{queue}\" failed to start: {reason}")]
    Consumer { queue: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Broker session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Up,
    Failed(String),
}

/// Queue consumer lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not listening.
    Idle,
    Connecting,
    Up,
    /// Went down after having been up.
    Down(String),
    Failed(String),
}

struct ActiveConsumer {
    consumer: Arc<dyn MessageConsumer>,
    task: JoinHandle<()>,
}

// ============================================================================
// MeshEventBus
// ============================================================================

/// Broker adapter: one session, one queue, one consumer.
pub struct MeshEventBus {
    session: Arc<dyn BrokerSession>,
    pending: Arc<PendingDeliveries>,
    tokens: Arc<TokenManager>,
    topology: Option<TopologyReconciler>,
    queue: String,
    queue_attributes: Map<String, Value>,
    consumer_options: ConsumerOptions,
    session_state: Arc<watch::Sender<SessionState>>,
    consumer_state: Arc<watch::Sender<ConsumerState>>,
    session_task: Mutex<Option<JoinHandle<()>>>,
    refresh: Mutex<Option<crate::auth::RefreshTask>>,
    consumer: tokio::sync::Mutex<Option<ActiveConsumer>>,
}

impl MeshEventBus {
    /// Connect using credentials from `options` or the platform environment.
    ///
    /// Resolves once the session is up; any startup failure is returned and
    /// leaves nothing running.
    pub async fn connect(
        options: MeshOptions,
        environment: MeshEnvironment,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, MeshError> {
        let credentials = environment.credentials(&options)?;
        let endpoints = credentials.endpoints()?;
        let client = credentials.client_credentials(environment.vcap.as_ref())?;

        let vcap = environment
            .vcap
            .as_ref()
            .ok_or(ConfigError::MissingVcapServices)?;
        let validator = BrokerValidator::new(ValidationCredentials::from_vcap(vcap)?)?;
        let tokens: Arc<dyn TokenSource> = Arc::new(TokenClient::new(client)?);

        Self::connect_with(
            options,
            endpoints,
            &environment.app,
            tokens,
            &validator,
            factory,
        )
        .await
    }

    /// Connect with already-resolved endpoints and collaborators.
    pub async fn connect_with(
        options: MeshOptions,
        endpoints: EndpointSet,
        app: &crate::config::AppMetadata,
        token_source: Arc<dyn TokenSource>,
        validator: &BrokerValidator,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, MeshError> {
        let tokens = TokenManager::acquire(token_source).await?;
        validator
            .validate(&endpoints.management_uri, options.subaccount_id.as_deref())
            .await?;

        let queue = app.resolve_queue_name(options.queue.name_template());
        let topology = if options.skip_management {
            info!(queue = %queue, "Topology management skipped");
            None
        } else {
            Some(TopologyReconciler::new(&endpoints, Arc::clone(&tokens))?)
        };

        let (session_state, _) = watch::channel(SessionState::Disconnected);
        let session_state = Arc::new(session_state);
        let (consumer_state, _) = watch::channel(ConsumerState::Idle);

        let SessionHandle { session, events } = factory
            .create_session(
                &options.factory_properties(),
                SessionProperties {
                    url: endpoints.smf_uri.clone(),
                    vpn_name: endpoints.vpn.clone(),
                    access_token: tokens.access_token(),
                    extra: options.session_extra(),
                },
            )
            .map_err(ConnectError::from)?;

        let pending = Arc::new(PendingDeliveries::new());
        let (up_tx, up_rx) = oneshot::channel();
        let session_task = tokio::spawn(run_session_events(
            events,
            Arc::clone(&pending),
            Arc::clone(&session_state),
            up_tx,
        ));

        session_state.send_replace(SessionState::Connecting);
        info!(url = %endpoints.smf_uri, vpn = %endpoints.vpn, "Connecting broker session");
        let connected = match session.connect() {
            Ok(()) => match up_rx.await {
                Ok(result) => result.map_err(|reason| ConnectError::Session { reason }),
                Err(_) => Err(ConnectError::Session {
                    reason: "session closed before coming up".to_string(),
                }),
            },
            Err(e) => Err(ConnectError::Transport(e)),
        };
        if let Err(e) = connected {
            error!(error = %e, "Broker session failed to connect");
            session_state.send_replace(SessionState::Failed(e.to_string()));
            session.disconnect();
            session_task.abort();
            return Err(e.into());
        }

        let reauthenticate = Arc::clone(&session);
        let refresh = tokens.spawn_refresh(move |token| {
            if let Err(e) = reauthenticate.update_authentication_on_reconnect(&token.access_token) {
                warn!(error = %e, "Failed to update session authentication");
            }
        });

        Ok(Self {
            session,
            pending,
            tokens,
            topology,
            queue,
            queue_attributes: options.queue.attributes(),
            consumer_options: options.consumer,
            session_state,
            consumer_state: Arc::new(consumer_state),
            session_task: Mutex::new(Some(session_task)),
            refresh: Mutex::new(Some(refresh)),
            consumer: tokio::sync::Mutex::new(None),
        })
    }

    /// Publish `data` with `headers` to topic `event`.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        data: Value,
        headers: Map<String, Value>,
    ) -> Result<(), DeliveryError> {
        self.publish(OutboundEvent::new(event, data).with_headers(headers))
            .await
    }

    /// Publish persistently and wait for the broker's acknowledgement.
    #[tracing::instrument(name = "mesh.publish", skip_all, fields(topic = %event.event))]
    pub async fn publish(&self, event: OutboundEvent) -> Result<(), DeliveryError> {
        let correlation_key = Uuid::new_v4().to_string();
        let outcome = self.pending.register(correlation_key.clone())?;

        let message = OutboundMessage {
            destination: event.event.clone(),
            binary_attachment: normalize::encode(&event),
            delivery_mode: DeliveryMode::Persistent,
            correlation_key: correlation_key.clone(),
        };
        info!(topic = %event.event, "Emit");

        if let Err(e) = self.session.send(message) {
            self.pending.remove(&correlation_key);
            return Err(e.into());
        }

        match outcome.await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(topic = %event.event, error = %e, "Publish not acknowledged");
                }
                result
            }
            Err(_) => Err(DeliveryError::SessionClosed),
        }
    }

    /// Provision topology and start consuming the queue.
    ///
    /// Does nothing when the dispatcher registers no topics, or when a
    /// consumer is already running.
    pub async fn start_listening(
        &self,
        dispatcher: Arc<dyn InboundDispatcher>,
    ) -> Result<(), MeshError> {
        let mut active = self.consumer.lock().await;
        if active.is_some() {
            debug!(queue = %self.queue, "Consumer already running");
            return Ok(());
        }

        let interest = dispatcher.interest();
        if interest.is_empty() {
            info!(queue = %self.queue, "No topics registered, not consuming");
            return Ok(());
        }

        if let Err(e) = self.provision(&interest).await {
            error!(queue = %self.queue, error = %e, "Topology provisioning failed");
            self.consumer_state
                .send_replace(ConsumerState::Failed(e.to_string()));
            return Err(e);
        }

        let started = self.start_consumer(dispatcher).await;
        match started {
            Ok(consumer) => {
                *active = Some(consumer);
                Ok(())
            }
            Err(e) => {
                self.consumer_state
                    .send_replace(ConsumerState::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Ensure the queue, then its subscriptions when the interest names topics.
    async fn provision(&self, interest: &Interest) -> Result<(), MeshError> {
        let Some(topology) = &self.topology else {
            return Ok(());
        };
        topology
            .ensure_queue(&self.queue, &self.queue_attributes)
            .await?;
        match interest {
            Interest::Topics(topics) => {
                topology.reconcile_subscriptions(&self.queue, topics).await?;
            }
            Interest::ListenAll => {
                debug!(queue = %self.queue, "Listening to all, subscriptions left untouched");
            }
        }
        Ok(())
    }

    async fn start_consumer(
        &self,
        dispatcher: Arc<dyn InboundDispatcher>,
    ) -> Result<ActiveConsumer, ConnectError> {
        self.consumer_state.send_replace(ConsumerState::Connecting);
        let ConsumerHandle {
            consumer,
            mut events,
        } = self
            .session
            .create_consumer(self.consumer_options.properties(&self.queue))?;
        consumer.connect()?;

        let supported: Arc<[SettlementOutcome]> =
            Arc::from(self.consumer_options.required_settlement_outcomes.as_slice());
        let failed = |reason: String| ConnectError::Consumer {
            queue: self.queue.clone(),
            reason,
        };

        loop {
            match events.recv().await {
                Some(ConsumerEvent::Up) => break,
                Some(ConsumerEvent::ConnectFailed { reason }) => {
                    error!(queue = %self.queue, reason = %reason, "Could not connect to queue");
                    consumer.disconnect();
                    return Err(failed(reason));
                }
                Some(ConsumerEvent::Down { reason }) => {
                    error!(queue = %self.queue, reason = %reason, "Queue down");
                    consumer.disconnect();
                    return Err(failed(reason));
                }
                Some(ConsumerEvent::Message(message)) => {
                    tokio::spawn(consumer::handle_message(
                        message,
                        Arc::clone(&dispatcher),
                        Arc::clone(&supported),
                    ));
                }
                None => return Err(failed("consumer closed".to_string())),
            }
        }

        info!(queue = %self.queue, "Consumer connected");
        self.consumer_state.send_replace(ConsumerState::Up);
        let task = tokio::spawn(run_consumer_events(
            events,
            dispatcher,
            supported,
            Arc::clone(&self.consumer_state),
            self.queue.clone(),
        ));
        Ok(ActiveConsumer { consumer, task })
    }

    /// Stop refreshing, stop consuming and close the session.
    pub async fn shutdown(&self) {
        let refresh = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(refresh) = refresh {
            refresh.shutdown().await;
        }

        if let Some(active) = self.consumer.lock().await.take() {
            active.task.abort();
            active.consumer.disconnect();
            self.consumer_state.send_replace(ConsumerState::Idle);
        }

        self.session.disconnect();
        let session_task = self
            .session_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = session_task {
            task.abort();
        }
        self.pending.close();
        self.session_state.send_replace(SessionState::Disconnected);
        info!(queue = %self.queue, "Event mesh adapter shut down");
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session_state.subscribe()
    }

    pub fn consumer_state(&self) -> watch::Receiver<ConsumerState> {
        self.consumer_state.subscribe()
    }

    /// Resolved queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Number of publishes awaiting an outcome.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for MeshEventBus {
    fn drop(&mut self) {
        if let Some(task) = self
            .session_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(active) = self.consumer.get_mut().take() {
            active.task.abort();
        }
    }
}

// ============================================================================
// Event loops
// ============================================================================

/// Route session notifications until the session's event stream ends.
async fn run_session_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    pending: Arc<PendingDeliveries>,
    state: Arc<watch::Sender<SessionState>>,
    up: oneshot::Sender<Result<(), String>>,
) {
    let mut up = Some(up);

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Up => {
                state.send_replace(SessionState::Up);
                match up.take() {
                    Some(tx) => {
                        info!("Broker session up");
                        let _ = tx.send(Ok(()));
                    }
                    None => info!("Broker session reconnected"),
                }
            }
            SessionEvent::ConnectFailed { reason } => {
                error!(reason = %reason, "Broker session connect failed");
                state.send_replace(SessionState::Failed(reason.clone()));
                if let Some(tx) = up.take() {
                    let _ = tx.send(Err(reason));
                }
            }
            SessionEvent::Acknowledged { correlation_key } => {
                if !pending.resolve(&correlation_key, Ok(())) {
                    debug!(correlation_key = %correlation_key, "Acknowledgement for unknown message");
                }
            }
            SessionEvent::Rejected {
                correlation_key,
                detail,
            } => {
                let outcome = Err(DeliveryError::Rejected {
                    correlation_key: correlation_key.clone(),
                    detail,
                });
                if !pending.resolve(&correlation_key, outcome) {
                    debug!(correlation_key = %correlation_key, "Rejection for unknown message");
                }
            }
        }
    }

    debug!("Session event stream ended");
    state.send_replace(SessionState::Disconnected);
    pending.close();
}

/// Handle consumer notifications after the consumer first came up.
async fn run_consumer_events(
    mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
    dispatcher: Arc<dyn InboundDispatcher>,
    supported: Arc<[SettlementOutcome]>,
    state: Arc<watch::Sender<ConsumerState>>,
    queue: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConsumerEvent::Message(message) => {
                tokio::spawn(consumer::handle_message(
                    message,
                    Arc::clone(&dispatcher),
                    Arc::clone(&supported),
                ));
            }
            ConsumerEvent::Up => {
                info!(queue = %queue, "Consumer reconnected");
                state.send_replace(ConsumerState::Up);
            }
            ConsumerEvent::Down { reason } => {
                error!(queue = %queue, reason = %reason, "Queue down");
                state.send_replace(ConsumerState::Down(reason));
            }
            ConsumerEvent::ConnectFailed { reason } => {
                error!(queue = %queue, reason = %reason, "Could not connect to queue");
                state.send_replace(ConsumerState::Failed(reason));
            }
        }
    }
    debug!(queue = %queue, "Consumer event stream ended");
}
