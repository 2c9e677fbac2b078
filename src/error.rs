//! Crate-level error type.

use crate::auth::AuthError;
use crate::bus::{ConnectError, DeliveryError};
use crate::config::ConfigError;
use crate::management::{ManagementError, TopologyError};
use crate::validation::ValidationError;

/// Any failure of the adapter's startup or listening sequence.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] ManagementError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub type Result<T> = std::result::Result<T, MeshError>;
