use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::{Locale, ServiceError, ServiceResult};

type HmacSha256 = Hmac<Sha256>;

/// User-facing notifications raised by lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationEvent {
    OrderCreated,
    OrderPaymentValidated,
    OrderPaymentRejected,
    OrderProcessing,
    OrderDispatched,
    OrderDelivered,
    OrderCompleted,
    OrderCancelled,
    OrderReopened,
    RemittanceCreated,
    RemittancePaymentValidated,
    RemittancePaymentRejected,
    RemittanceProcessing,
    RemittanceDelivered,
    RemittanceCompleted,
    RemittanceCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: Uuid,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            phone: None,
            email: None,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: serde_json::Value,
        recipient: &Recipient,
        locale: Locale,
    ) -> ServiceResult<()>;
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: serde_json::Value,
        recipient: &Recipient,
        locale: Locale,
    ) -> ServiceResult<()> {
        info!(
            target: "notifications",
            %event,
            user_id = %recipient.user_id,
            locale = locale.as_str(),
            %payload,
            "notification"
        );
        Ok(())
    }
}

/// Body posted to the notification webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub event: NotificationEvent,
    pub locale: Locale,
    pub recipient: Recipient,
    pub payload: serde_json::Value,
    pub sent_at: chrono::DateTime<Utc>,
}

/// HMAC signature generator for webhook authentication
#[derive(Clone)]
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Hex HMAC-SHA256 over `{timestamp}.{body}`.
    pub fn sign_payload(&self, timestamp: &str, body: &str) -> ServiceResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {e}")))?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

const MAX_ATTEMPTS: u32 = 10;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`, saturating.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Posts signed JSON notifications to a webhook (e.g. a WhatsApp relay).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    signer: Option<SignatureGenerator>,
    max_retries: u32,
    base_backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        secret: Option<String>,
        request_timeout: Duration,
    ) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            signer: secret.map(SignatureGenerator::new),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
        })
    }

    /// Attempts are clamped to `1..=10`.
    pub fn with_retries(mut self, max_retries: u32, base_backoff: Duration) -> Self {
        self.max_retries = max_retries.clamp(1, MAX_ATTEMPTS);
        self.base_backoff = base_backoff;
        self
    }

    #[instrument(skip(self, message), fields(event = %message.event))]
    async fn send_webhook(&self, message: &WebhookMessage) -> ServiceResult<()> {
        let body = serde_json::to_string(message)?;
        let timestamp = message.sent_at.to_rfc3339();
        let signature = self
            .signer
            .as_ref()
            .map(|s| s.sign_payload(&timestamp, &body))
            .transpose()?;

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Timestamp", &timestamp)
                .body(body.clone());

            if let Some(ref sig) = signature {
                request = request.header("X-Signature", sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Notification delivered to {}", self.url);
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "Notification delivery failed with status: {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Notification delivery error: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(retry_backoff(self.base_backoff, attempt)).await;
            }
        }

        error!("Notification delivery failed after {} attempts", self.max_retries);
        Err(ServiceError::ExternalServiceError(format!(
            "Failed to deliver notification after {} attempts",
            self.max_retries
        )))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: serde_json::Value,
        recipient: &Recipient,
        locale: Locale,
    ) -> ServiceResult<()> {
        let message = WebhookMessage {
            event,
            locale,
            recipient: recipient.clone(),
            payload,
            sent_at: Utc::now(),
        };
        self.send_webhook(&message).await
    }
}
