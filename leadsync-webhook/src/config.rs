use leadsync::WebhookOp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// e.g. "https://n8n.example.com"
    pub base_url: String,
    /// Per-operation path overrides, keyed by operation name
    /// (`getLeads`, `createLead`, ...). Unlisted operations use
    /// `/webhook/{operation}`.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthHeader>,
    /// Path probed for reachability; the base URL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_path: Option<String>,
    /// Sent as `X-Leadsync-Client` so the automations can tell callers apart.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHeader {
    pub name: String,
    pub value: String,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl WebhookConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            paths: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            auth: None,
            probe_path: None,
            client_id: default_client_id(),
        }
    }

    /// Load webhook configuration from {data_dir}/webhooks.json or fall
    /// back to environment variables.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let webhooks_json = data_dir.join("webhooks.json");

        if webhooks_json.exists() {
            match std::fs::read_to_string(&webhooks_json) {
                Ok(content) => match serde_json::from_str::<WebhookConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded webhook config: base_url={}, overrides={}",
                            config.base_url,
                            config.paths.len()
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse webhooks.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read webhooks.json: {}, using defaults", e);
                }
            }
        }

        let base_url = std::env::var("LEADSYNC_WEBHOOK_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5678".to_string());
        let mut config = WebhookConfig::new(base_url);
        if let Some(ms) = std::env::var("LEADSYNC_WEBHOOK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout_ms = ms;
        }
        if let Ok(token) = std::env::var("LEADSYNC_WEBHOOK_TOKEN") {
            config.auth = Some(AuthHeader {
                name: "Authorization".to_string(),
                value: format!("Bearer {}", token),
            });
        }

        tracing::info!(
            "No webhooks.json found, using base_url={}",
            config.base_url
        );
        config
    }

    pub fn url_for(&self, op: WebhookOp) -> String {
        let path = self
            .paths
            .get(op.as_str())
            .cloned()
            .unwrap_or_else(|| format!("/webhook/{}", op.as_str()));
        join_url(&self.base_url, &path)
    }

    pub fn probe_url(&self) -> String {
        match &self.probe_path {
            Some(p) => join_url(&self.base_url, p),
            None => self.base_url.clone(),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
