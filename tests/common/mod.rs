use leadsync::{SyncConfig, SyncManager};
use leadsync_webhook::{WebhookClient, WebhookConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Nothing listens on the discard port, so every call is a network failure.
#[allow(dead_code)]
pub const UNREACHABLE: &str = "http://127.0.0.1:9";

pub fn open_sync(base_url: &str, dir: &Path) -> Arc<SyncManager<WebhookClient>> {
    open_sync_with(base_url, SyncConfig::for_tests(dir), 2_000)
}

#[allow(dead_code)]
pub fn open_sync_with(
    base_url: &str,
    config: SyncConfig,
    timeout_ms: u64,
) -> Arc<SyncManager<WebhookClient>> {
    let mut webhook = WebhookConfig::new(base_url);
    webhook.timeout_ms = timeout_ms;
    webhook.client_id = "integration-test".to_string();
    SyncManager::open(config, Arc::new(WebhookClient::new(webhook))).unwrap()
}

/// Answer `POST /webhook/{op}` with `body`.
#[allow(dead_code)]
pub async fn mount_op(server: &MockServer, op: &str, status: u16, body: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/webhook/{}", op)))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

#[allow(dead_code)]
pub fn sample_leads() -> Value {
    serde_json::json!([
        {
            "id": "L1",
            "name": "Dana Ortiz",
            "phone": "+1 555 0101",
            "stage": "Contacted",
            "temperature": "Hot",
            "updatedAt": "2026-01-10T09:00:00Z"
        },
        {
            "id": "L2",
            "name": "Sam Reyes",
            "phone": "+1 555 0102",
            "updatedAt": "2026-01-11T09:00:00Z"
        }
    ])
}
