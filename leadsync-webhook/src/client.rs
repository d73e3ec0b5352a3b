use crate::config::WebhookConfig;
use leadsync::{Backend, BackendError, WebhookOp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the webhook automation backend
pub struct WebhookClient {
    config: WebhookConfig,
    http_client: reqwest::Client,
    last_success: Arc<AtomicU64>, // Unix timestamp in seconds
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn truncate(body: String) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
            last_success: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    fn map_send_error(&self, op: WebhookOp, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.config.timeout_ms)
        } else {
            BackendError::Network(format!("{} request failed: {}", op, e))
        }
    }
}

impl Backend for WebhookClient {
    async fn call(
        &self,
        op: WebhookOp,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let url = self.config.url_for(op);
        tracing::debug!("[WEBHOOK] {} -> {}", op, url);

        let mut request = self
            .http_client
            .post(&url)
            .header("X-Leadsync-Client", &self.config.client_id)
            .json(payload);
        if let Some(auth) = &self.config.auth {
            request = request.header(auth.name.as_str(), auth.value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(op, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(op, e))?;

        if !status.is_success() {
            tracing::warn!("[WEBHOOK] {} returned {}", op, status);
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        self.last_success.store(now_secs(), Ordering::Relaxed);

        // n8n answers some webhooks with an empty 200
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| BackendError::Decode(format!("{} response: {}", op, e)))
    }

    async fn probe(&self) -> bool {
        // Any HTTP answer means the backend is reachable
        match self.http_client.get(self.config.probe_url()).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!("[WEBHOOK] probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WebhookClient {
        let mut config = WebhookConfig::new(server.uri());
        config.client_id = "test-host".to_string();
        WebhookClient::new(config)
    }

    #[test]
    fn test_client_creation() {
        let client = WebhookClient::new(WebhookConfig::new("http://localhost:5678"));
        assert_eq!(client.last_success_timestamp(), 0);
        assert_eq!(client.config().timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_call_posts_payload_to_operation_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/createLead"))
            .and(header("X-Leadsync-Client", "test-host"))
            .and(body_json(json!({"id": "L1", "name": "Ana"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let out = client
            .call(WebhookOp::CreateLead, &json!({"id": "L1", "name": "Ana"}))
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert!(client.last_success_timestamp() > 0);
    }

    #[tokio::test]
    async fn test_http_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/updateLead"))
            .respond_with(ResponseTemplate::new(422).set_body_string("phone is invalid"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .call(WebhookOp::UpdateLead, &json!({"id": "L1"}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Http {
                status: 422,
                body: "phone is invalid".to_string()
            }
        );
        assert_eq!(err.classify(), leadsync::FailureKind::Validation);
    }

    #[tokio::test]
    async fn test_empty_body_is_null_and_garbage_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/deleteLead"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook/getLeads"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(
            client
                .call(WebhookOp::DeleteLead, &json!({"id": "L1"}))
                .await
                .unwrap(),
            serde_json::Value::Null
        );
        assert!(matches!(
            client.call(WebhookOp::GetLeads, &json!({})).await,
            Err(BackendError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut config = WebhookConfig::new(server.uri());
        config.timeout_ms = 50;
        let err = WebhookClient::new(config)
            .call(WebhookOp::GetAgents, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(50));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        // Port 9 (discard) is closed on any sane test machine
        let client = WebhookClient::new(WebhookConfig::new("http://127.0.0.1:9"));
        let err = client
            .call(WebhookOp::GetLeads, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.classify(), leadsync::FailureKind::Network);
        assert!(!client.probe().await);
    }

    #[tokio::test]
    async fn test_probe_accepts_any_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        assert!(client_for(&server).probe().await);
    }

    #[tokio::test]
    async fn test_auth_header_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = WebhookConfig::new(server.uri());
        config.auth = Some(crate::config::AuthHeader {
            name: "Authorization".to_string(),
            value: "Bearer t0k".to_string(),
        });
        let out = WebhookClient::new(config)
            .call(WebhookOp::GetTasks, &json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!([]));
    }
}
