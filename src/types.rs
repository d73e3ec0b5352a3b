use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::WebhookOp;

/// Lead identifier as issued by the webhook backend (or generated locally
/// for optimistic creates).
pub type LeadId = String;
/// Agent identifier.
pub type AgentId = String;

/// Pipeline stage of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum LeadStage {
    #[default]
    New,
    Contacted,
    Qualified,
    Viewing,
    Negotiation,
    Closed,
    Lost,
}

impl std::fmt::Display for LeadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeadStage::New => "New",
            LeadStage::Contacted => "Contacted",
            LeadStage::Qualified => "Qualified",
            LeadStage::Viewing => "Viewing",
            LeadStage::Negotiation => "Negotiation",
            LeadStage::Closed => "Closed",
            LeadStage::Lost => "Lost",
        };
        f.write_str(s)
    }
}

/// How warm a lead is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Temperature {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Temperature::Hot => write!(f, "Hot"),
            Temperature::Warm => write!(f, "Warm"),
            Temperature::Cold => write!(f, "Cold"),
        }
    }
}

/// A prospective buyer or seller tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub stage: LeadStage,
    #[serde(default)]
    pub temperature: Temperature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<AgentId>,
    /// Absent when the webhook leaves it out; never filled in on decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input for creating a lead. The id is assigned locally so the optimistic
/// record and the webhook payload agree on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NewLead {
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub stage: LeadStage,
    #[serde(default)]
    pub temperature: Temperature,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assigned_agent_id: Option<AgentId>,
}

impl NewLead {
    pub fn into_lead(self, id: LeadId, now: DateTime<Utc>) -> crate::error::Result<Lead> {
        if self.name.trim().is_empty() {
            return Err(crate::error::SyncError::InvalidRecord(
                "lead name must not be empty".to_string(),
            ));
        }
        Ok(Lead {
            id,
            name: self.name,
            phone: self.phone,
            email: self.email,
            stage: self.stage,
            temperature: self.temperature,
            source: self.source,
            budget: self.budget,
            notes: self.notes,
            assigned_agent_id: self.assigned_agent_id,
            created_at: Some(now),
            updated_at: Some(now),
        })
    }
}

/// Partial update for a lead; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LeadPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<LeadStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<AgentId>,
}

impl LeadPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.stage.is_none()
            && self.temperature.is_none()
            && self.source.is_none()
            && self.budget.is_none()
            && self.notes.is_none()
            && self.assigned_agent_id.is_none()
    }

    pub fn apply_to(&self, lead: &mut Lead, now: DateTime<Utc>) {
        if let Some(v) = &self.name {
            lead.name = v.clone();
        }
        if let Some(v) = &self.phone {
            lead.phone = v.clone();
        }
        if let Some(v) = &self.email {
            lead.email = Some(v.clone());
        }
        if let Some(v) = self.stage {
            lead.stage = v;
        }
        if let Some(v) = self.temperature {
            lead.temperature = v;
        }
        if let Some(v) = &self.source {
            lead.source = Some(v.clone());
        }
        if let Some(v) = self.budget {
            lead.budget = Some(v);
        }
        if let Some(v) = &self.notes {
            lead.notes = Some(v.clone());
        }
        if let Some(v) = &self.assigned_agent_id {
            lead.assigned_agent_id = Some(v.clone());
        }
        lead.updated_at = Some(now);
    }
}

/// A sales agent leads can be assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl NewAgent {
    pub fn into_agent(self, id: AgentId) -> crate::error::Result<Agent> {
        if self.name.trim().is_empty() {
            return Err(crate::error::SyncError::InvalidRecord(
                "agent name must not be empty".to_string(),
            ));
        }
        Ok(Agent {
            id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            active: true,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl AgentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.active.is_none()
    }

    pub fn apply_to(&self, agent: &mut Agent) {
        if let Some(v) = &self.name {
            agent.name = v.clone();
        }
        if let Some(v) = &self.email {
            agent.email = v.clone();
        }
        if let Some(v) = &self.phone {
            agent.phone = Some(v.clone());
        }
        if let Some(v) = self.active {
            agent.active = v;
        }
    }
}

/// Outreach channel for a follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TaskChannel {
    WhatsApp,
    Email,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TaskStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
    Failed,
}

/// A scheduled outreach action tied to a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FollowUpTask {
    pub id: String,
    pub lead_id: LeadId,
    pub channel: TaskChannel,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Input for scheduling a follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NewTask {
    pub lead_id: LeadId,
    pub channel: TaskChannel,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Notification {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<LeadId>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Request for an AI-written outreach message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MessageRequest {
    pub lead_id: LeadId,
    pub channel: TaskChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct GeneratedMessage {
    pub lead_id: LeadId,
    pub channel: TaskChannel,
    pub message: String,
}

/// The record sets mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Leads,
    Agents,
    Tasks,
    Notifications,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Leads,
        Collection::Agents,
        Collection::Tasks,
        Collection::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Leads => "leads",
            Collection::Agents => "agents",
            Collection::Tasks => "tasks",
            Collection::Notifications => "notifications",
        }
    }

    /// Webhook operation that returns the full collection.
    pub fn fetch_op(&self) -> WebhookOp {
        match self {
            Collection::Leads => WebhookOp::GetLeads,
            Collection::Agents => WebhookOp::GetAgents,
            Collection::Tasks => WebhookOp::GetTasks,
            Collection::Notifications => WebhookOp::GetNotifications,
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that lives in one of the mirrored collections.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
}

impl Record for Lead {
    const COLLECTION: Collection = Collection::Leads;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Agent {
    const COLLECTION: Collection = Collection::Agents;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for FollowUpTask {
    const COLLECTION: Collection = Collection::Tasks;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Notification {
    const COLLECTION: Collection = Collection::Notifications;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A list read, tagged with whether it came from a fallback source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Listing<T> {
    pub items: Vec<T>,
    /// `true` when the backend could not be reached and the items were
    /// served from the local snapshot or a stale cache entry.
    pub stale: bool,
    pub source: ListingSource,
}

/// The record a write left in the local store. When the backend could
/// not be reached the change still stands, and `queued_as` names the
/// failed operation that will replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Written<T> {
    #[serde(flatten)]
    pub record: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_as: Option<String>,
}

impl<T> Written<T> {
    pub fn confirmed(record: T) -> Self {
        Self {
            record,
            queued_as: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queued_as.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Written<U> {
        Written {
            record: f(self.record),
            queued_as: self.queued_as,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ListingSource {
    Cache,
    Backend,
    Store,
}
