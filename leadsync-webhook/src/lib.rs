//! [`leadsync::Backend`] over HTTP, for n8n-style webhook automations.
//!
//! Every operation is a `POST` of the JSON payload to
//! `{base_url}/webhook/{operation}` unless `webhooks.json` maps it
//! elsewhere.

pub mod client;
pub mod config;

pub use client::WebhookClient;
pub use config::{AuthHeader, WebhookConfig};
