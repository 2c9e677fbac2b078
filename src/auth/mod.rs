//! OAuth2 access token lifecycle.
//!
//! [`TokenManager`] owns the one live [`Token`]. Readers take cheap `Arc`
//! snapshots; a background [`RefreshTask`] replaces the token wholesale shortly
//! before it expires and hands each new token to a callback (the broker
//! session re-authenticates from it). Refresh failures are logged and retried
//! on a fixed delay for as long as the task runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};


/// Delay before retrying a failed refresh.
pub const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Seconds before expiry at which a token is refreshed.
pub const REFRESH_MARGIN_SECS: u64 = 10;
/// Prefix of the `resource` parameter scoping a token to an API.
pub const RESOURCE_URN_PREFIX: &str = "urn:sap:identity:application:provider:name:";

/// Token acquisition errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),

    #[error("Invalid client certificate: {0}")]
    Identity(String),
}

/// How the client proves its identity to the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientSecret {
    Secret(String),
    /// PEM certificate and private key presented as a TLS client identity.
    Certificate { certificate: String, key: String },
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientSecret::Secret(_) => f.write_str("Secret(<redacted>)"),
            ClientSecret::Certificate { .. } => f.write_str("Certificate(<redacted>)"),
        }
    }
}

/// Client-credentials grant parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub token_endpoint: String,
    pub client_id: String,
    pub secret: ClientSecret,
    /// API the token is scoped to, sent as `resource`.
    pub api: Option<String>,
}

impl ClientCredentials {
    pub fn with_secret(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            secret: ClientSecret::Secret(secret.into()),
            api: None,
        }
    }

    /// Form fields of the token request.
    fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("response_type", "token".to_string()),
            ("client_id", self.client_id.clone()),
        ];
        if let ClientSecret::Secret(secret) = &self.secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(api) = &self.api {
            form.push(("resource", format!("{}{}", RESOURCE_URN_PREFIX, api)));
        }
        form
    }
}

/// An access token. Replaced, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    /// Lifetime in seconds, as granted.
    pub expires_in: u64,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl Token {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            issued_at: Utc::now(),
        }
    }

    /// Time after issue at which the token should be replaced.
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(self.expires_in.saturating_sub(REFRESH_MARGIN_SECS))
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::seconds(i64::try_from(self.expires_in).unwrap_or(i64::MAX))
    }
}

/// Anything that can mint a fresh token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Token, AuthError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Client-credentials grant against an OAuth2 token endpoint.
pub struct TokenClient {
    http: reqwest::Client,
    credentials: ClientCredentials,
}

impl TokenClient {
    /// Build a client for `credentials`.
    ///
    /// Certificate credentials are installed as the TLS client identity.
    pub fn new(credentials: ClientCredentials) -> Result<Self, AuthError> {
        let mut builder = reqwest::Client::builder();
        if let ClientSecret::Certificate { certificate, key } = &credentials.secret {
            let pem = format!("{}\n{}", certificate.trim_end(), key);
            let identity = reqwest::Identity::from_pem(pem.as_bytes())
                .map_err(|e| AuthError::Identity(e.to_string()))?;
            builder = builder.identity(identity);
        }
        Ok(Self {
            http: builder.build()?,
            credentials,
        })
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }
}

#[async_trait]
impl TokenSource for TokenClient {
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        debug!(
            endpoint = %self.credentials.token_endpoint,
            client_id = %self.credentials.client_id,
            "Requesting access token"
        );
        let response = self
            .http
            .post(&self.credentials.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&self.credentials.form())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedResponse(
                "access_token is empty".to_string(),
            ));
        }
        Ok(Token::new(parsed.access_token, parsed.expires_in))
    }
}

/// Holder of the current access token.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    current: watch::Sender<Arc<Token>>,
}

impl TokenManager {
    /// Fetch the first token. Failure here is fatal to the caller.
    pub async fn acquire(source: Arc<dyn TokenSource>) -> Result<Arc<Self>, AuthError> {
        let token = source.fetch_token().await?;
        info!(expires_in = token.expires_in, "Access token acquired");
        let (current, _) = watch::channel(Arc::new(token));
        Ok(Arc::new(Self { source, current }))
    }

    /// Snapshot of the live token.
    pub fn current(&self) -> Arc<Token> {
        Arc::clone(&self.current.borrow())
    }

    pub fn access_token(&self) -> String {
        self.current.borrow().access_token.clone()
    }

    /// Receiver notified on every replacement.
    pub fn watch(&self) -> watch::Receiver<Arc<Token>> {
        self.current.subscribe()
    }

    /// Start the background refresh loop.
    ///
    /// The loop sleeps until the current token is due, fetches a new one,
    /// swaps it in and calls `on_refreshed`. A failed fetch is retried every
    /// [`TOKEN_RETRY_DELAY`] until one succeeds.
    pub fn spawn_refresh<F>(self: &Arc<Self>, on_refreshed: F) -> RefreshTask
    where
        F: Fn(Arc<Token>) + Send + Sync + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let backoff_builder = ConstantBuilder::default()
                .with_delay(TOKEN_RETRY_DELAY)
                .with_max_times(usize::MAX);
            let mut backoff_iter = backoff_builder.build();
            let mut delay = manager.current().refresh_delay();
            debug!(refresh_in_secs = delay.as_secs(), "Token refresh task started");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match manager.source.fetch_token().await {
                    Ok(token) => {
                        backoff_iter = backoff_builder.build();
                        let token = Arc::new(token);
                        delay = token.refresh_delay();
                        manager.current.send_replace(Arc::clone(&token));
                        info!(
                            expires_in = token.expires_in,
                            refresh_in_secs = delay.as_secs(),
                            "Access token refreshed"
                        );
                        on_refreshed(token);
                    }
                    Err(e) => {
                        delay = backoff_iter.next().unwrap_or(TOKEN_RETRY_DELAY);
                        warn!(
                            error = %e,
                            retry_in_secs = delay.as_secs(),
                            "Access token refresh failed, retrying"
                        );
                    }
                }
            }
            info!("Token refresh task stopped");
        });

        RefreshTask {
            cancel: cancel_tx,
            handle: Some(handle),
        }
    }
}

/// Handle to the background refresh loop. Dropping it aborts the loop.
pub struct RefreshTask {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshTask {
    /// Signal the loop to stop after its current step.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
