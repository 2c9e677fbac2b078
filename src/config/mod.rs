//! Adapter configuration.
//!
//! Options are loaded from YAML files and `EVENT_MESH__*` environment
//! variables. Broker credentials and application identity come from the
//! platform environment (`VCAP_SERVICES`, `VCAP_APPLICATION`) unless the
//! options carry them explicitly.

mod credentials;
mod options;
mod vcap;

pub use credentials::{
    AuthServiceCredentials, EndpointCredentials, EndpointSet, MeshCredentials, BINDING_FORMAT,
    MANAGEMENT_PATH, SERVICE_NAME,
};
pub use options::{
    ConsumerOptions, MeshOptions, QueueOptions, DEFAULT_FACTORY_PROFILE, DEFAULT_QUEUE_NAME,
    OAUTH2_AUTHENTICATION_SCHEME,
};
pub use vcap::{
    AppMetadata, BoundService, VcapServices, APP_ID_PLACEHOLDER, VCAP_APPLICATION_ENV_VAR,
    VCAP_SERVICES_ENV_VAR,
};

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "event-mesh.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENT_MESH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENT_MESH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENT_MESH_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid broker credentials: {reason}. Expected a binding of the form:\n{format}", format = BINDING_FORMAT)]
    Credentials { reason: String },

    #[error("{var} is not valid JSON: {source}")]
    InvalidJson {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("No bound service \"{0}\"")]
    ServiceNotBound(String),

    #[error("VCAP_SERVICES is not set")]
    MissingVcapServices,

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file {path} is not valid YAML: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[source] serde_json::Error),
}

/// Main adapter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging options for the broker adapter.
    pub messaging: MeshOptions,
    /// Application identity override. Read from `VCAP_APPLICATION` when absent.
    pub app: Option<AppMetadata>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `event-mesh.yaml` in the current directory (if it exists)
    /// 2. File given by `path`
    /// 3. File named by `EVENT_MESH_CONFIG`
    /// 4. `EVENT_MESH__*` environment variables
    ///
    /// Files keep their key spelling, so camelCase options and queue
    /// attributes reach the broker as written. Environment keys match
    /// existing keys ignoring case and underscores.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment};

        let mut merged = Value::Object(Map::new());
        merge(&mut merged, read_yaml(Path::new(DEFAULT_CONFIG_FILE), false)?);

        if let Some(config_path) = path {
            merge(&mut merged, read_yaml(Path::new(config_path), true)?);
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            merge(&mut merged, read_yaml(Path::new(&config_path), true)?);
        }

        let environment: Value = ConfigLib::builder()
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        merge(&mut merged, environment);

        serde_json::from_value(merged).map_err(ConfigError::Invalid)
    }
}

/// Parse one YAML layer. A missing optional file is an empty layer.
fn read_yaml(path: &Path, required: bool) -> Result<Value, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Null),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Deep-merge `layer` over `base`. Objects merge key by key, anything else
/// replaces. An existing key keeps its spelling when `layer` names it
/// differently (`skip_management` over `skipManagement`).
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                let key = base
                    .keys()
                    .find(|existing| same_key(existing, &key))
                    .cloned()
                    .unwrap_or(key);
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn same_key(a: &str, b: &str) -> bool {
    let folded = |key: &str| -> String {
        key.chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect()
    };
    folded(a) == folded(b)
}

/// What the platform environment says about this deployment.
#[derive(Debug, Clone, Default)]
pub struct MeshEnvironment {
    pub vcap: Option<VcapServices>,
    pub app: AppMetadata,
}

impl MeshEnvironment {
    /// Read `VCAP_SERVICES` and `VCAP_APPLICATION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            vcap: VcapServices::from_env()?,
            app: AppMetadata::from_env()?,
        })
    }

    /// Replace the application identity when configuration provides one.
    pub fn with_app(mut self, app: Option<AppMetadata>) -> Self {
        if let Some(app) = app {
            self.app = app;
        }
        self
    }

    /// Broker binding: explicit credentials win over the bound service.
    pub fn credentials(&self, options: &MeshOptions) -> Result<MeshCredentials, ConfigError> {
        match (&options.credentials, &self.vcap) {
            (Some(credentials), _) => Ok(credentials.clone()),
            (None, Some(vcap)) => MeshCredentials::from_vcap(vcap),
            (None, None) => Err(ConfigError::ServiceNotBound(SERVICE_NAME.to_string())),
        }
    }
}
