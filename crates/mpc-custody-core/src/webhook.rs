//! Webhook emission for signing-request terminal transitions
//!
//! External collaborators subscribe to signing outcomes; a payload is
//! delivered on every transition into `completed`, `failed`, or
//! `cancelled`. Delivery is fire-and-forget with bounded retry so a slow
//! subscriber never blocks the orchestrator.

use crate::types::{RequestStatus, SigningRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
#[cfg(feature = "webhook-client")]
use tracing::{debug, error, warn};

#[cfg(not(feature = "webhook-client"))]
use tracing::info;

/// Webhook subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Delivery URL
    pub url: String,
    /// Optional secret for HMAC signature
    pub secret: Option<String>,
    /// Events to subscribe to
    pub events: Vec<WebhookEvent>,
    /// Extra headers to include
    pub headers: HashMap<String, String>,
    /// Retry configuration
    pub retry_config: RetryConfig,
    /// Whether the webhook is enabled
    pub enabled: bool,
}

impl WebhookConfig {
    /// Create a config subscribed to every terminal event
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            events: vec![
                WebhookEvent::RequestCompleted,
                WebhookEvent::RequestFailed,
                WebhookEvent::RequestCancelled,
            ],
            headers: HashMap::new(),
            retry_config: RetryConfig::default(),
            enabled: true,
        }
    }

    /// Set webhook secret for HMAC signing
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Set events to subscribe to
    pub fn with_events(mut self, events: Vec<WebhookEvent>) -> Self {
        self.events = events;
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Check if subscribed to event
    pub fn is_subscribed(&self, event: &WebhookEvent) -> bool {
        self.enabled && self.events.contains(event)
    }
}

/// Terminal-transition events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    /// Combined signature produced
    RequestCompleted,
    /// Combination failed, quorum unreachable, or expired
    RequestFailed,
    /// Cancelled by an actor
    RequestCancelled,
}

impl WebhookEvent {
    /// Event for a terminal status; `None` for non-terminal states
    pub fn for_status(status: RequestStatus) -> Option<Self> {
        match status {
            RequestStatus::Completed => Some(WebhookEvent::RequestCompleted),
            RequestStatus::Failed => Some(WebhookEvent::RequestFailed),
            RequestStatus::Cancelled => Some(WebhookEvent::RequestCancelled),
            _ => None,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type
    pub event: WebhookEvent,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Signing request id
    pub request_id: String,
    /// Owning wallet (row id)
    pub wallet_id: String,
    /// Owning organization
    pub org_id: String,
    /// Target chain name
    pub chain: String,
    /// Terminal status
    pub status: RequestStatus,
    /// Combined signature (hex), present on completion
    pub combined_signature: Option<String>,
    /// Broadcast transaction hash, present when a broadcaster ran
    pub tx_hash: Option<String>,
    /// Error detail, present on failure
    pub error: Option<String>,
}

impl WebhookPayload {
    fn from_request(event: WebhookEvent, request: &SigningRequest) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            request_id: request.id.clone(),
            wallet_id: request.wallet_id.clone(),
            org_id: request.org_id.clone(),
            chain: request.chain.to_string(),
            status: request.status,
            combined_signature: request.combined_signature.clone(),
            tx_hash: request.tx_hash.clone(),
            error: request.error.clone(),
        }
    }
}

/// Delivery status for a webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    /// Webhook URL
    pub url: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// HTTP status code (if available)
    pub status_code: Option<u16>,
    /// Number of attempts
    pub attempts: u32,
    /// Error message (if failed)
    pub error: Option<String>,
    /// Delivery timestamp
    pub delivered_at: DateTime<Utc>,
}

/// Webhook service for terminal-transition notifications
pub struct WebhookService {
    /// Configured webhooks
    webhooks: Arc<RwLock<Vec<WebhookConfig>>>,
    /// HTTP client
    #[cfg(feature = "webhook-client")]
    client: reqwest::Client,
    /// Delivery history (for debugging)
    delivery_history: Arc<RwLock<Vec<DeliveryStatus>>>,
    /// Maximum history entries
    max_history: usize,
}

impl WebhookService {
    /// Create a new webhook service
    pub fn new() -> Self {
        Self {
            webhooks: Arc::new(RwLock::new(Vec::new())),
            #[cfg(feature = "webhook-client")]
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|err| {
                    warn!(error = %err, "webhook client built without timeout");
                    reqwest::Client::new()
                }),
            delivery_history: Arc::new(RwLock::new(Vec::new())),
            max_history: 1000,
        }
    }

    /// Add a webhook configuration
    pub async fn add_webhook(&self, config: WebhookConfig) {
        self.webhooks.write().await.push(config);
    }

    /// Remove a webhook by URL
    pub async fn remove_webhook(&self, url: &str) {
        self.webhooks.write().await.retain(|w| w.url != url);
    }

    /// Get all configured webhooks
    pub async fn list_webhooks(&self) -> Vec<WebhookConfig> {
        self.webhooks.read().await.clone()
    }

    /// Emit the event for a request that just reached a terminal state.
    /// No-op when the request's status is non-terminal.
    pub async fn notify_terminal(&self, request: &SigningRequest) {
        let Some(event) = WebhookEvent::for_status(request.status) else {
            return;
        };
        let payload = WebhookPayload::from_request(event, request);
        self.send_event(event, payload).await;
    }

    /// Send event to all subscribed webhooks
    async fn send_event(&self, event: WebhookEvent, payload: WebhookPayload) {
        let webhooks = self.webhooks.read().await;
        let subscribed: Vec<_> = webhooks
            .iter()
            .filter(|w| w.is_subscribed(&event))
            .cloned()
            .collect();
        drop(webhooks);

        for webhook in subscribed {
            let payload_clone = payload.clone();
            let service = self.clone();

            // Spawn delivery task
            tokio::spawn(async move {
                service.deliver(&webhook, payload_clone).await;
            });
        }
    }

    /// Deliver payload to a webhook with retries
    #[cfg(feature = "webhook-client")]
    async fn deliver(&self, webhook: &WebhookConfig, payload: WebhookPayload) {
        let payload_json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize webhook payload: {}", e);
                return;
            }
        };

        let mut attempt = 0;
        let mut delay_ms = webhook.retry_config.initial_delay_ms;

        loop {
            attempt += 1;

            let mut request = self
                .client
                .post(&webhook.url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Event", format!("{:?}", payload.event))
                .header("X-Delivery-Attempt", attempt.to_string());

            // Add custom headers
            for (key, value) in &webhook.headers {
                request = request.header(key, value);
            }

            // Add HMAC signature if secret is configured
            if let Some(secret) = &webhook.secret {
                let signature = compute_hmac_signature(secret, &payload_json);
                request = request.header("X-Webhook-Signature", signature);
            }

            let result = request.body(payload_json.clone()).send().await;

            match result {
                Ok(response) => {
                    let status_code = response.status().as_u16();
                    let success = response.status().is_success();

                    self.record_delivery(DeliveryStatus {
                        url: webhook.url.clone(),
                        success,
                        status_code: Some(status_code),
                        attempts: attempt,
                        error: if success {
                            None
                        } else {
                            Some(format!("HTTP {}", status_code))
                        },
                        delivered_at: Utc::now(),
                    })
                    .await;

                    if success {
                        debug!(
                            url = %webhook.url,
                            event = ?payload.event,
                            "Webhook delivered successfully"
                        );
                        return;
                    }

                    warn!(
                        url = %webhook.url,
                        status = status_code,
                        attempt,
                        "Webhook delivery failed"
                    );
                }
                Err(e) => {
                    warn!(
                        url = %webhook.url,
                        error = %e,
                        attempt,
                        "Webhook request failed"
                    );
                }
            }

            if attempt >= webhook.retry_config.max_attempts {
                error!(
                    url = %webhook.url,
                    event = ?payload.event,
                    attempts = attempt,
                    "Webhook delivery failed after max retries"
                );

                self.record_delivery(DeliveryStatus {
                    url: webhook.url.clone(),
                    success: false,
                    status_code: None,
                    attempts: attempt,
                    error: Some("Max retries exceeded".to_string()),
                    delivered_at: Utc::now(),
                })
                .await;

                return;
            }

            // Wait before retry
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

            // Exponential backoff
            delay_ms = ((delay_ms as f64 * webhook.retry_config.backoff_multiplier) as u64)
                .min(webhook.retry_config.max_delay_ms);
        }
    }

    /// Deliver (stub for builds without outbound HTTP)
    #[cfg(not(feature = "webhook-client"))]
    async fn deliver(&self, webhook: &WebhookConfig, payload: WebhookPayload) {
        info!(
            url = %webhook.url,
            event = ?payload.event,
            "Webhook delivery (webhook-client feature disabled)"
        );
    }

    /// Record delivery status
    #[cfg(feature = "webhook-client")]
    async fn record_delivery(&self, status: DeliveryStatus) {
        let mut history = self.delivery_history.write().await;
        history.push(status);

        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(0..excess);
        }
    }

    /// Get recent delivery history
    pub async fn get_delivery_history(&self, limit: usize) -> Vec<DeliveryStatus> {
        let history = self.delivery_history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for WebhookService {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WebhookService {
    fn clone(&self) -> Self {
        Self {
            webhooks: Arc::clone(&self.webhooks),
            #[cfg(feature = "webhook-client")]
            client: self.client.clone(),
            delivery_history: Arc::clone(&self.delivery_history),
            max_history: self.max_history,
        }
    }
}

/// Compute HMAC-SHA256 signature
#[cfg(feature = "webhook-client")]
fn compute_hmac_signature(secret: &str, payload: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    let result = mac.finalize();

    format!("sha256={}", hex::encode(result.into_bytes()))
}
