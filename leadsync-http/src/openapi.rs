use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "leadsync API",
        version = "0.1.0",
        description = "Local sync daemon for a webhook-backed real-estate CRM. Reads are cached and fall back to the local snapshot; writes are applied optimistically and queued for retry when the backend is unreachable.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:7800", description = "Local daemon")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::leads::list_leads,
        crate::handlers::leads::create_lead,
        crate::handlers::leads::update_lead,
        crate::handlers::leads::delete_lead,
        crate::handlers::agents::list_agents,
        crate::handlers::agents::create_agent,
        crate::handlers::agents::update_agent,
        crate::handlers::agents::delete_agent,
        crate::handlers::tasks::list_tasks,
        crate::handlers::tasks::schedule_task,
        crate::handlers::tasks::complete_task,
        crate::handlers::notifications::list_notifications,
        crate::handlers::notifications::mark_notification_read,
        crate::handlers::messages::generate_message,
        crate::handlers::sync::sync_status,
        crate::handlers::sync::list_failed,
        crate::handlers::sync::retry_failed,
        crate::handlers::sync::dismiss_failed,
        crate::handlers::sync::list_locks,
        crate::handlers::cache::invalidate_cache,
    ),
    components(
        schemas(
            leadsync::Lead,
            leadsync::NewLead,
            leadsync::LeadPatch,
            leadsync::LeadStage,
            leadsync::Temperature,
            leadsync::Agent,
            leadsync::NewAgent,
            leadsync::AgentPatch,
            leadsync::FollowUpTask,
            leadsync::NewTask,
            leadsync::TaskChannel,
            leadsync::TaskStatus,
            leadsync::Notification,
            leadsync::MessageRequest,
            leadsync::GeneratedMessage,
            leadsync::ListingSource,
            leadsync::FailedOperation,
            leadsync::FailedOpStatus,
            leadsync::FailureKind,
            leadsync::FailedOpCounts,
            leadsync::CacheStats,
            leadsync::Lease,
            leadsync::SyncStatus,
            crate::dto::DeleteResponse,
            crate::dto::InvalidateCacheRequest,
            crate::dto::InvalidateCacheResponse,
            crate::dto::RetryResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check"),
        (name = "leads", description = "Lead pipeline"),
        (name = "agents", description = "Sales agents"),
        (name = "tasks", description = "Scheduled follow-ups"),
        (name = "notifications", description = "Notification feed"),
        (name = "messages", description = "AI-drafted outreach messages"),
        (name = "sync", description = "Retry queue, leases and sync status"),
        (name = "cache", description = "Read cache maintenance"),
    ),
)]
pub struct ApiDoc;
