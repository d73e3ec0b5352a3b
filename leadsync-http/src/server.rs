use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::{
    complete_task, create_agent, create_lead, delete_agent, delete_lead, dismiss_failed,
    generate_message, health, invalidate_cache, list_agents, list_failed, list_leads, list_locks,
    list_notifications, list_tasks, mark_notification_read, retry_failed, schedule_task,
    sync_status, update_agent, update_lead, AppState,
};
use crate::middleware::{allow_private_network, normalize_content_type};
use crate::openapi::ApiDoc;
use leadsync::{SyncConfig, SyncManager};
use leadsync_webhook::{WebhookClient, WebhookConfig};

/// All routes with the production middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/:id", put(update_lead).delete(delete_lead))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/:id", put(update_agent).delete(delete_agent))
        .route("/api/tasks", get(list_tasks).post(schedule_task))
        .route("/api/tasks/:id/complete", post(complete_task))
        .route("/api/notifications", get(list_notifications))
        .route(
            "/api/notifications/:id/read",
            post(mark_notification_read),
        )
        .route("/api/messages/generate", post(generate_message))
        .route("/api/sync/status", get(sync_status))
        .route("/api/sync/failed", get(list_failed))
        .route(
            "/api/sync/failed/:id",
            axum::routing::delete(dismiss_failed),
        )
        .route("/api/sync/failed/:id/retry", post(retry_failed))
        .route("/api/sync/locks", get(list_locks))
        .route("/api/cache/invalidate", post(invalidate_cache))
        .with_state(state.clone());

    let health_route = Router::new()
        .route("/health", get(health))
        .with_state(state);

    let swagger = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi());

    let max_body_mb: usize = std::env::var("LEADSYNC_MAX_BODY_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    Router::new()
        .merge(health_route)
        .merge(swagger)
        .merge(api)
        .layer(DefaultBodyLimit::max(max_body_mb * 1024 * 1024))
        .layer(middleware::from_fn(normalize_content_type))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive().max_age(std::time::Duration::from_secs(86400)))
        .layer(middleware::from_fn(allow_private_network))
}

pub async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    let webhook_config = WebhookConfig::load_or_default(&config.data_dir);
    tracing::info!(
        base_url = %webhook_config.base_url,
        timeout_ms = webhook_config.timeout_ms,
        client_id = %webhook_config.client_id,
        "Webhook backend configured"
    );
    let backend = Arc::new(WebhookClient::new(webhook_config));

    let sync = SyncManager::open(config, backend)?;
    sync.start()?;

    let state = Arc::new(AppState { sync: sync.clone() });
    let app = build_router(state);

    let bind_addr =
        std::env::var("LEADSYNC_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:7800".to_string());
    tracing::info!("Starting leadsync on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining");
}
