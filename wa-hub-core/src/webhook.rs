//! HMAC-signed webhook dispatch.
//!
//! Fire-and-forget by contract: `dispatch` never returns an error to its
//! caller and never blocks a state transition on network I/O. Reuses a
//! single `reqwest::Client` across dispatches and signs each body with
//! HMAC-SHA256.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use wa_hub_model::{Instance, WebhookEvent, WebhookPayload};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-wa-hub-signature";

#[derive(Debug, Clone)]
pub struct WebhookAuth {
    pub bearer_token: Option<String>,
    pub bypass_header: Option<(String, String)>,
}

pub struct WebhookDispatcher {
    client: Client,
    secret: Arc<str>,
    timeout: Duration,
    auth: WebhookAuth,
}

impl WebhookDispatcher {
    pub fn new(secret: impl Into<Arc<str>>, timeout: Duration, auth: WebhookAuth) -> Self {
        Self {
            client: Client::new(),
            secret: secret.into(),
            timeout,
            auth,
        }
    }

    /// Dispatch `event` for `instance` with `data`. Never fails loudly: every
    /// error path is logged and the call returns regardless — webhook
    /// delivery failures are never propagated to the caller.
    pub async fn dispatch(&self, instance: &Instance, event: WebhookEvent, data: serde_json::Value) {
        if instance.webhook.url.trim().is_empty() {
            return;
        }
        if !instance.webhook.accepts(event.as_str()) {
            return;
        }

        let payload = WebhookPayload {
            event: event.as_str(),
            instance_id: instance.id.clone(),
            data,
        };

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, instance = %instance.id, "failed to serialize webhook payload");
                return;
            }
        };

        let signature = self.sign(&body);

        let mut request = self
            .client
            .post(&instance.webhook.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body);

        if let Some(token) = &self.auth.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some((name, value)) = &self.auth.bypass_header {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(instance = %instance.id, event = event.as_str(), "webhook delivered");
            }
            Ok(response) => {
                warn!(
                    instance = %instance.id,
                    event = event.as_str(),
                    status = %response.status(),
                    "webhook POST returned non-success status"
                );
            }
            Err(err) => {
                warn!(instance = %instance.id, event = event.as_str(), error = %err, "webhook POST failed");
            }
        }
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::Mac as _;
    use wa_hub_model::{InstanceId, WebhookConfig};

    fn instance_with(url: &str) -> Instance {
        Instance {
            id: InstanceId::parse("inst-1").unwrap(),
            name: "Test".into(),
            created_at: chrono::Utc::now(),
            webhook: WebhookConfig::new(url).unwrap(),
            typing_enabled: false,
            typing_apply_to: Default::default(),
        }
    }

    #[test]
    fn signature_matches_expected_hmac() {
        let dispatcher = WebhookDispatcher::new(
            "shh",
            Duration::from_secs(10),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        );
        let body = br#"{"event":"ready"}"#;
        let signature = dispatcher.sign(body);

        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn drops_silently_without_a_webhook_url() {
        let dispatcher = WebhookDispatcher::new(
            "shh",
            Duration::from_secs(10),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        );
        let mut instance = instance_with("http://example.invalid/hook");
        instance.webhook.url = String::new();
        // Should return immediately without attempting any network call.
        dispatcher
            .dispatch(&instance, WebhookEvent::Ready, serde_json::json!({}))
            .await;
    }

    #[tokio::test]
    async fn drops_silently_when_event_not_in_filter() {
        let dispatcher = WebhookDispatcher::new(
            "shh",
            Duration::from_secs(10),
            WebhookAuth {
                bearer_token: None,
                bypass_header: None,
            },
        );
        let mut instance = instance_with("http://example.invalid/hook");
        instance.webhook.events.insert("qr".into());
        dispatcher
            .dispatch(&instance, WebhookEvent::Ready, serde_json::json!({}))
            .await;
    }
}
