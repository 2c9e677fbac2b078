//! Startup check that the broker is provisioned for this application.
//!
//! The validation service is a separate bound service (plan
//! `aem-validation-service-plan`) with its own OAuth2 client. The broker's
//! management host name is posted to it once, before the session connects.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::{AuthError, ClientCredentials, TokenClient, TokenSource};
use crate::config::VcapServices;

/// Plan of the bound validation service.
pub const VALIDATION_SERVICE_PLAN: &str = "aem-validation-service-plan";

/// Broker validation errors. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing credentials for the validation service (plan \"{plan}\"): {0}", plan = VALIDATION_SERVICE_PLAN)]
    Credentials(String),

    #[error("Management URI \"{0}\" has no host")]
    InvalidUri(String),

    #[error("Failed to obtain validation token: {0}")]
    Token(#[from] AuthError),

    #[error("Validation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Error during broker validation: {status} - {detail}")]
    Server { status: u16, detail: String },

    #[error("Broker \"{host}\" is not provisioned for this application (status {status})")]
    NotProvisioned { host: String, status: u16 },
}

/// Credentials of the bound validation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationCredentials {
    pub client: ClientCredentials,
    /// Validation endpoint.
    pub uri: String,
    pub service_instance_id: String,
}

impl ValidationCredentials {
    /// Find the validation service among bound services.
    pub fn from_vcap(vcap: &VcapServices) -> Result<Self, ValidationError> {
        let service = vcap.by_plan(VALIDATION_SERVICE_PLAN).ok_or_else(|| {
            ValidationError::Credentials("no service binding found".to_string())
        })?;
        Self::from_value(&service.credentials)
    }

    /// Read `handshake.oa2.{clientid, clientsecret, tokenendpoint}`,
    /// `handshake.uri` and `serviceinstanceid`. All are required.
    pub fn from_value(credentials: &Value) -> Result<Self, ValidationError> {
        let field = |pointer: &str| {
            credentials
                .pointer(pointer)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ValidationError::Credentials(format!("{} is missing", pointer)))
        };

        Ok(Self {
            client: ClientCredentials::with_secret(
                field("/handshake/oa2/tokenendpoint")?,
                field("/handshake/oa2/clientid")?,
                field("/handshake/oa2/clientsecret")?,
            ),
            uri: field("/handshake/uri")?,
            service_instance_id: field("/serviceinstanceid")?,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationRequest<'a> {
    host_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subaccount_id: Option<&'a str>,
}

/// Host part of a management URI.
pub fn host_name(management_uri: &str) -> Result<String, ValidationError> {
    reqwest::Url::parse(management_uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| ValidationError::InvalidUri(management_uri.to_string()))
}

/// Confirms the broker instance belongs to this application.
pub struct BrokerValidator {
    http: reqwest::Client,
    uri: String,
    tokens: Arc<dyn TokenSource>,
}

impl BrokerValidator {
    pub fn new(credentials: ValidationCredentials) -> Result<Self, ValidationError> {
        let tokens = Arc::new(TokenClient::new(credentials.client)?);
        Ok(Self::with_token_source(credentials.uri, tokens))
    }

    /// Validator posting to `uri` with tokens from `tokens`.
    pub fn with_token_source(uri: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            uri: uri.into(),
            tokens,
        }
    }

    /// Check that the broker behind `management_uri` is provisioned.
    #[tracing::instrument(name = "mesh.validate", skip_all, fields(%management_uri))]
    pub async fn validate(
        &self,
        management_uri: &str,
        subaccount_id: Option<&str>,
    ) -> Result<(), ValidationError> {
        let host = host_name(management_uri)?;

        let token = self.tokens.fetch_token().await?;
        debug!(endpoint = %self.uri, host = %host, "Validating broker");

        let response = self
            .http
            .post(&self.uri)
            .bearer_auth(&token.access_token)
            .json(&ValidationRequest {
                host_name: &host,
                subaccount_id,
            })
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200 => {
                info!("Broker validated");
                Ok(())
            }
            500 => {
                let detail = response.text().await.unwrap_or_default();
                Err(ValidationError::Server { status, detail })
            }
            _ => Err(ValidationError::NotProvisioned { host, status }),
        }
    }
}
