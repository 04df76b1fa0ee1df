use crate::envelope::build_envelope;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wabridge_core::store::SessionStore;
use wabridge_core::types::{Message, MessageStatus, Organization, WebhookLog, WebhookStatus};
use wabridge_session::InboundSink;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// When set, deliveries carry an `X-Signature: sha256=<hex>` HMAC of the
    /// raw body.
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            secret: None,
        }
    }
}

/// At-least-once forwarding of inbound messages to the tenant's CRM webhook,
/// with exponential backoff and an audit row per attempt. Retries live on
/// in-process timers; deliveries lost at shutdown are rediscovered by the
/// periodic sync job.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn SessionStore>,
    client: reqwest::Client,
    config: WebhookConfig,
}

fn sign_body(secret: &str, body: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    let hex = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    format!("sha256={}", hex)
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn SessionStore>, config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store,
            client,
            config,
        }
    }

    /// Run the full delivery cycle for one message, including retries.
    /// Used directly by the sync job; the live inbound path spawns it.
    pub async fn deliver_and_wait(&self, message: Message) {
        let org = match self.store.get_organization(message.org_id).await {
            Ok(Some(org)) => org,
            Ok(None) => {
                warn!(org_id = %message.org_id, "webhook skipped: organization not found");
                return;
            }
            Err(e) => {
                error!(org_id = %message.org_id, error = %e, "webhook skipped: org lookup failed");
                return;
            }
        };
        let Some(url) = org.webhook_url.clone() else {
            debug!(org_id = %org.id, "no webhook url configured");
            return;
        };

        let envelope = build_envelope(&message);
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "envelope serialization failed");
                return;
            }
        };

        for retry in 0..=self.config.max_retries {
            if retry > 0 {
                let delay = self.config.retry_base_delay * 2u32.saturating_pow(retry - 1);
                tokio::time::sleep(delay).await;
            }

            match self.post(&org, &url, &body).await {
                Ok((status, response_body)) => {
                    let crm_id = extract_crm_id(&response_body);
                    self.write_log(WebhookLog {
                        id: Uuid::new_v4(),
                        org_id: org.id,
                        message_id: message.id,
                        url: url.clone(),
                        payload: envelope.clone(),
                        http_status: Some(status),
                        response_body: Some(response_body),
                        retry_count: retry as i64,
                        status: WebhookStatus::Success,
                        error_message: None,
                        created_at: Utc::now(),
                    })
                    .await;

                    if let Err(e) = self
                        .store
                        .mark_message_synced(message.id, crm_id.as_deref())
                        .await
                    {
                        error!(message_id = %message.id, error = %e, "failed to mark message synced");
                    }
                    info!(message_id = %message.id, org_id = %org.id, retry, "webhook delivered");
                    return;
                }
                Err((http_status, error_message)) => {
                    warn!(
                        message_id = %message.id,
                        org_id = %org.id,
                        retry,
                        status = ?http_status,
                        error = %error_message,
                        "webhook delivery failed"
                    );
                    self.write_log(WebhookLog {
                        id: Uuid::new_v4(),
                        org_id: org.id,
                        message_id: message.id,
                        url: url.clone(),
                        payload: envelope.clone(),
                        http_status,
                        response_body: None,
                        retry_count: retry as i64,
                        status: WebhookStatus::Failed,
                        error_message: Some(error_message),
                        created_at: Utc::now(),
                    })
                    .await;
                }
            }
        }

        // Retries exhausted
        if let Err(e) = self
            .store
            .update_message_status(message.id, MessageStatus::Failed)
            .await
        {
            error!(message_id = %message.id, error = %e, "failed to mark message failed");
        }
    }

    async fn post(
        &self,
        org: &Organization,
        url: &str,
        body: &[u8],
    ) -> std::result::Result<(u16, String), (Option<u16>, String)> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        if let Some(api_key) = &org.crm_api_key {
            request = request.bearer_auth(api_key);
        }
        if let Some(location_id) = &org.crm_location_id {
            request = request.header("X-Location-Id", location_id);
        }
        if let Some(secret) = &self.config.secret {
            request = request.header("X-Signature", sign_body(secret, body));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let response_body = response.text().await.unwrap_or_default();
                if (200..300).contains(&status) {
                    Ok((status, response_body))
                } else {
                    Err((Some(status), format!("upstream returned {}", status)))
                }
            }
            Err(e) => Err((None, e.to_string())),
        }
    }

    async fn write_log(&self, log: WebhookLog) {
        if let Err(e) = self.store.log_webhook(&log).await {
            error!(
                message_id = %log.message_id,
                org_id = %log.org_id,
                url = %log.url,
                error = %e,
                "failed to write webhook audit row"
            );
        }
    }
}

/// The CRM echoes the created record id in its response body; accept the
/// common field spellings.
fn extract_crm_id(response_body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(response_body).ok()?;
    value
        .get("id")
        .or_else(|| value.get("messageId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl InboundSink for WebhookDispatcher {
    async fn deliver(&self, message: Message) {
        // The retry cycle can take seconds; never block the supervisor's
        // event loop on it
        let this = self.clone();
        tokio::spawn(async move {
            this.deliver_and_wait(message).await;
        });
    }
}
