//! Broker topology reconciliation over the management (SEMP v2) API.
//!
//! Ensures the application's durable queue exists and that its topic
//! subscriptions match the topics the application handles. Every call is
//! idempotent: an existing queue or subscription on create, or a missing
//! subscription on delete, counts as success.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use reqwest::{header, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::auth::TokenManager;
use crate::config::EndpointSet;


const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
const NOT_FOUND: &str = "NOT_FOUND";

/// Kind of management operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CreateQueueFailed,
    GetSubscriptionsFailed,
    CreateSubscriptionFailed,
    DeleteSubscriptionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CreateQueueFailed => "CREATE_QUEUE_FAILED",
            ErrorCode::GetSubscriptionsFailed => "GET_SUBSCRIPTIONS_FAILED",
            ErrorCode::CreateSubscriptionFailed => "CREATE_SUBSCRIPTION_FAILED",
            ErrorCode::DeleteSubscriptionFailed => "DELETE_SUBSCRIPTION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker resource a management operation was acting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Queue { queue: String },
    Subscription { queue: String, topic: Option<String> },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Queue { queue } => write!(f, "QUEUE \"{}\"", queue),
            Target::Subscription { queue, topic: None } => {
                write!(f, "SUBSCRIPTION on queue \"{}\"", queue)
            }
            Target::Subscription {
                queue,
                topic: Some(topic),
            } => write!(f, "SUBSCRIPTION \"{}\" on queue \"{}\"", topic, queue),
        }
    }
}

/// Error reported by the management API in `meta.error`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.status, description),
            None => f.write_str(&self.status),
        }
    }
}

/// Why a management call failed.
#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker returned {0}")]
    Api(ApiError),

    #[error("unexpected response ({status}): {body}")]
    Unexpected { status: u16, body: String },
}

/// A failed management operation, tagged with what was being changed.
#[derive(Debug, thiserror::Error)]
#[error("{code} for {target}: {reason}")]
pub struct ManagementError {
    pub code: ErrorCode,
    pub target: Target,
    #[source]
    pub reason: FailureReason,
}

/// Topology reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Invalid management URI \"{0}\"")]
    InvalidUri(String),

    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error("Subscriptions of queue \"{queue}\" could not be reconciled: {}", summarize(.failures))]
    Subscriptions {
        queue: String,
        failures: Vec<ManagementError>,
    },
}

fn summarize(failures: &[ManagementError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of [`TopologyReconciler::ensure_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Created,
    AlreadyExists,
}

/// Subscription changes needed to reach the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl SubscriptionPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// `to_add = desired - current`, `to_remove = current - desired`.
pub fn diff_subscriptions(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> SubscriptionPlan {
    SubscriptionPlan {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SempResponse {
    data: Value,
    meta: SempMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SempMeta {
    error: Option<ApiError>,
    paging: Option<SempPaging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SempPaging {
    next_page_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionEntry {
    subscription_topic: String,
}

/// Management API client for one VPN.
pub struct TopologyReconciler {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    queues_url: Url,
}

impl TopologyReconciler {
    pub fn new(endpoints: &EndpointSet, tokens: Arc<TokenManager>) -> Result<Self, TopologyError> {
        let mut queues_url = Url::parse(&endpoints.management_uri)
            .map_err(|_| TopologyError::InvalidUri(endpoints.management_uri.clone()))?;
        queues_url
            .path_segments_mut()
            .map_err(|_| TopologyError::InvalidUri(endpoints.management_uri.clone()))?
            .pop_if_empty()
            .extend(["msgVpns", endpoints.vpn.as_str(), "queues"]);

        Ok(Self {
            http: reqwest::Client::new(),
            tokens,
            queues_url,
        })
    }

    /// `{management}/msgVpns/{vpn}/queues`.
    pub fn queues_url(&self) -> &Url {
        &self.queues_url
    }

    /// `{queues}/{queue}/subscriptions`, with the queue name percent-encoded.
    pub fn subscriptions_url(&self, queue: &str) -> Url {
        let mut url = self.queues_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend([queue, "subscriptions"]);
        }
        url
    }

    fn subscription_url(&self, queue: &str, topic: &str) -> Url {
        let mut url = self.subscriptions_url(queue);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(topic);
        }
        url
    }

    /// Send one authorized request and unpack the management envelope.
    ///
    /// The bearer token is read at call time so a refresh is picked up by the
    /// next request.
    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<SempResponse, FailureReason> {
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(self.tokens.access_token())
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<SempResponse>(&text) {
            Ok(SempResponse {
                meta: SempMeta {
                    error: Some(api_error),
                    ..
                },
                ..
            }) => Err(FailureReason::Api(api_error)),
            Ok(parsed) if status.is_success() => Ok(parsed),
            Err(_) if status.is_success() && text.trim().is_empty() => Ok(SempResponse::default()),
            _ => Err(FailureReason::Unexpected {
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    /// Create the queue unless it already exists.
    ///
    /// `queueName` is added to `attributes` when they don't name the queue.
    #[tracing::instrument(name = "mesh.ensure_queue", skip_all, fields(%queue))]
    pub async fn ensure_queue(
        &self,
        queue: &str,
        attributes: &Map<String, Value>,
    ) -> Result<QueueStatus, ManagementError> {
        let mut body = attributes.clone();
        body.entry("queueName")
            .or_insert_with(|| Value::String(queue.to_string()));

        let result = self
            .call(Method::POST, self.queues_url.clone(), Some(Value::Object(body)))
            .await;
        match result {
            Ok(_) => {
                info!(queue = %queue, "Queue created");
                Ok(QueueStatus::Created)
            }
            Err(FailureReason::Api(e)) if e.status == ALREADY_EXISTS => {
                debug!(queue = %queue, "Queue already exists");
                Ok(QueueStatus::AlreadyExists)
            }
            Err(reason) => {
                let err = ManagementError {
                    code: ErrorCode::CreateQueueFailed,
                    target: Target::Queue {
                        queue: queue.to_string(),
                    },
                    reason,
                };
                error!(error = %err, "Queue could not be created");
                Err(err)
            }
        }
    }

    /// Current subscription topics of `queue`, across all pages.
    pub async fn list_subscriptions(&self, queue: &str) -> Result<BTreeSet<String>, ManagementError> {
        let failed = |reason: FailureReason| ManagementError {
            code: ErrorCode::GetSubscriptionsFailed,
            target: Target::Subscription {
                queue: queue.to_string(),
                topic: None,
            },
            reason,
        };

        let mut topics = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.subscriptions_url(queue));
        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!(queue = %queue, url = %url, "Subscription paging repeated a page, stopping");
                break;
            }
            let response = self
                .call(Method::GET, url.clone(), None)
                .await
                .map_err(failed)?;
            let entries: Vec<SubscriptionEntry> =
                serde_json::from_value(response.data.clone()).map_err(|e| {
                    failed(FailureReason::Unexpected {
                        status: StatusCode::OK.as_u16(),
                        body: format!("subscription list: {}", e),
                    })
                })?;
            topics.extend(entries.into_iter().map(|entry| entry.subscription_topic));

            next = match response.meta.paging.and_then(|paging| paging.next_page_uri) {
                Some(uri) => Some(url.join(&uri).map_err(|e| {
                    failed(FailureReason::Unexpected {
                        status: StatusCode::OK.as_u16(),
                        body: format!("next page URI \"{}\": {}", uri, e),
                    })
                })?),
                None => None,
            };
        }

        debug!(queue = %queue, count = topics.len(), "Fetched subscriptions");
        Ok(topics)
    }

    /// Subscribe `queue` to `topic`. An existing subscription is success.
    pub async fn add_subscription(&self, queue: &str, topic: &str) -> Result<(), ManagementError> {
        info!(queue = %queue, topic = %topic, "Creating subscription");
        let body = json!({ "subscriptionTopic": topic });
        match self
            .call(Method::POST, self.subscriptions_url(queue), Some(body))
            .await
        {
            Ok(_) => Ok(()),
            Err(FailureReason::Api(e)) if e.status == ALREADY_EXISTS => Ok(()),
            Err(reason) => Err(ManagementError {
                code: ErrorCode::CreateSubscriptionFailed,
                target: Target::Subscription {
                    queue: queue.to_string(),
                    topic: Some(topic.to_string()),
                },
                reason,
            }),
        }
    }

    /// Unsubscribe `queue` from `topic`. An absent subscription is success.
    pub async fn delete_subscription(&self, queue: &str, topic: &str) -> Result<(), ManagementError> {
        info!(queue = %queue, topic = %topic, "Deleting subscription");
        match self
            .call(Method::DELETE, self.subscription_url(queue, topic), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(FailureReason::Api(e)) if e.status == NOT_FOUND => Ok(()),
            Err(reason) => Err(ManagementError {
                code: ErrorCode::DeleteSubscriptionFailed,
                target: Target::Subscription {
                    queue: queue.to_string(),
                    topic: Some(topic.to_string()),
                },
                reason,
            }),
        }
    }

    /// Bring the subscriptions of `queue` in line with `desired`.
    ///
    /// Deletions and additions run concurrently and independently; changes
    /// that succeeded are kept even when others fail. Every failure is
    /// reported in [`TopologyError::Subscriptions`].
    #[tracing::instrument(name = "mesh.reconcile", skip_all, fields(%queue, desired = desired.len()))]
    pub async fn reconcile_subscriptions(
        &self,
        queue: &str,
        desired: &BTreeSet<String>,
    ) -> Result<SubscriptionPlan, TopologyError> {
        let current = self.list_subscriptions(queue).await?;
        let plan = diff_subscriptions(&current, desired);
        if plan.is_empty() {
            debug!(queue = %queue, "Subscriptions up to date");
            return Ok(plan);
        }

        let deletions = join_all(
            plan.to_remove
                .iter()
                .map(|topic| self.delete_subscription(queue, topic)),
        );
        let additions = join_all(
            plan.to_add
                .iter()
                .map(|topic| self.add_subscription(queue, topic)),
        );
        let (deleted, added) = tokio::join!(deletions, additions);

        let failures: Vec<ManagementError> = deleted
            .into_iter()
            .chain(added)
            .filter_map(Result::err)
            .collect();
        if !failures.is_empty() {
            for failure in &failures {
                error!(code = %failure.code, target = %failure.target, reason = %failure.reason, "Subscription change failed");
            }
            return Err(TopologyError::Subscriptions {
                queue: queue.to_string(),
                failures,
            });
        }

        info!(
            queue = %queue,
            added = plan.to_add.len(),
            removed = plan.to_remove.len(),
            "Subscriptions reconciled"
        );
        Ok(plan)
    }
}
