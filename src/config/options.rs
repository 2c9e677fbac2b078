//! Adapter options.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::level_filters::LevelFilter;

use super::credentials::MeshCredentials;
use crate::session::{ConsumerProperties, FactoryProperties, QueueDescriptor, SettlementOutcome};

/// Queue name used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "$appId";
/// Transport API profile.
pub const DEFAULT_FACTORY_PROFILE: &str = "version10";
/// Session authentication scheme for token-based sessions.
pub const OAUTH2_AUTHENTICATION_SCHEME: &str = "AuthenticationScheme_oauth2";

/// Options recognised by the adapter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshOptions {
    /// Broker binding. Discovered from bound services when absent.
    pub credentials: Option<MeshCredentials>,
    pub queue: QueueOptions,
    pub consumer: ConsumerOptions,
    /// Hint passed to broker validation.
    #[serde(alias = "subaccountId")]
    pub subaccount_id: Option<String>,
    /// Leave queue and subscription provisioning to someone else.
    #[serde(alias = "skipManagement")]
    pub skip_management: bool,
    /// Transport log level override (1 = error .. 5 = trace).
    #[serde(alias = "logLevel")]
    pub log_level: Option<u8>,
    /// Passthrough transport factory keys.
    #[serde(alias = "clientFactory")]
    pub client_factory: Map<String, Value>,
    /// Passthrough session keys.
    pub session: Map<String, Value>,
}

/// Queue identity and attributes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: Option<String>,
    /// Takes precedence over `name`.
    #[serde(alias = "queueName")]
    pub queue_name: Option<String>,
    /// Queue attributes sent when provisioning the queue.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl QueueOptions {
    /// Configured name template, before placeholder substitution.
    pub fn name_template(&self) -> &str {
        self.queue_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(DEFAULT_QUEUE_NAME)
    }

    /// Provisioning attributes: defaults overlaid with configured attributes.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attributes = match json!({
            "permission": "consume",
            "ingressEnabled": true,
            "egressEnabled": true,
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.attributes {
            attributes.insert(key.clone(), value.clone());
        }
        attributes
    }
}

/// Queue consumer options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Non-accepting outcomes the consumer may settle with.
    #[serde(alias = "requiredSettlementOutcomes")]
    pub required_settlement_outcomes: Vec<SettlementOutcome>,
    /// Passthrough consumer keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            required_settlement_outcomes: vec![SettlementOutcome::Failed, SettlementOutcome::Rejected],
            extra: Map::new(),
        }
    }
}

impl ConsumerOptions {
    /// Consumer properties bound to `queue`.
    pub fn properties(&self, queue: &str) -> ConsumerProperties {
        ConsumerProperties {
            queue_descriptor: QueueDescriptor {
                name: queue.to_string(),
                durable: true,
            },
            required_settlement_outcomes: self.required_settlement_outcomes.clone(),
            extra: self.extra.clone(),
        }
    }
}

impl MeshOptions {
    /// Transport factory properties.
    pub fn factory_properties(&self) -> FactoryProperties {
        FactoryProperties {
            log_level: self.log_level.unwrap_or_else(default_log_level),
            profile: DEFAULT_FACTORY_PROFILE.to_string(),
            extra: self.client_factory.clone(),
        }
    }

    /// Passthrough session keys, including the OAuth2 authentication scheme.
    pub fn session_extra(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert(
            "authenticationScheme".to_string(),
            Value::String(OAUTH2_AUTHENTICATION_SCHEME.to_string()),
        );
        for (key, value) in &self.session {
            extra.insert(key.clone(), value.clone());
        }
        extra
    }
}

/// One step less verbose than the active tracing level, never below errors.
fn default_log_level() -> u8 {
    let current = LevelFilter::current();
    let level: u8 = if current >= LevelFilter::TRACE {
        5
    } else if current >= LevelFilter::DEBUG {
        4
    } else if current >= LevelFilter::INFO {
        3
    } else if current >= LevelFilter::WARN {
        2
    } else {
        1
    };
    level.saturating_sub(1).max(1)
}
