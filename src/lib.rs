//! Event Mesh - broker adapter for an event mesh service.
//!
//! Connects an application to a topic-based message broker: obtains and
//! refreshes OAuth2 tokens, validates the broker binding, provisions the
//! application's queue and its topic subscriptions, publishes events with
//! broker acknowledgement, and consumes the queue with explicit settlement.
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let environment = MeshEnvironment::from_env()?.with_app(config.app);
//! let bus = MeshEventBus::connect(config.messaging, environment, factory).await?;
//!
//! let mut router = EventRouter::new();
//! router.on("orders/created", |event: Arc<InboundEvent>| async move { Ok(()) });
//! bus.start_listening(Arc::new(router)).await?;
//!
//! bus.emit("orders/shipped", json!({"id": 1}), Map::new()).await?;
//! ```

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod management;
pub mod normalize;
pub mod session;
pub mod utils;
pub mod validation;

pub use bus::{ConnectError, ConsumerState, DeliveryError, MeshEventBus, SessionState};
pub use config::{Config, MeshEnvironment, MeshOptions};
pub use error::{MeshError, Result};
pub use interfaces::{EventRouter, InboundDispatcher, Interest, ProcessingError};
pub use normalize::{InboundEvent, OutboundEvent};
