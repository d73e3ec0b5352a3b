//! # leadsync
//!
//! Client-side sync layer for a real-estate CRM whose business logic lives
//! behind slow, unreliable webhooks. leadsync keeps a local snapshot of
//! leads, agents, follow-up tasks and notifications, answers reads from a
//! staleness cache, applies writes optimistically, queues the ones the
//! backend did not take, and keeps duplicate writes out with leased locks.
//!
//! Everything hangs off one [`SyncManager`], generic over the [`Backend`]
//! it talks to. `leadsync-webhook` provides the HTTP backend and
//! `leadsync-http` serves the manager to a frontend on localhost.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use leadsync::{Backend, BackendError, SyncConfig, SyncManager, WebhookOp};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Backend for Echo {
//!     async fn call(
//!         &self,
//!         _op: WebhookOp,
//!         payload: &serde_json::Value,
//!     ) -> Result<serde_json::Value, BackendError> {
//!         Ok(payload.clone())
//!     }
//!
//!     async fn probe(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn run() -> leadsync::Result<()> {
//! let sync = SyncManager::open(SyncConfig::from_env(), Arc::new(Echo))?;
//! sync.start()?;
//!
//! let leads = sync.list_leads().await?;
//! println!("{} leads (stale: {})", leads.items.len(), leads.stale);
//!
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Dependencies | Use case |
//! |---------|-------------|----------|
//! | `axum-support` | axum | [`SyncError`] implements `IntoResponse` |
//! | `openapi` | utoipa | OpenAPI schema generation for the record types |
//!
//! Both are enabled by default.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod failed_ops;
pub mod journal;
pub mod lease;
pub mod manager;
pub mod optimistic;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod types;

pub use backend::{Backend, BackendError, WebhookOp};
pub use cache::{CacheConfig, CacheManager, CacheStats};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use error::{Result, SyncError};
pub use failed_ops::{
    FailedOpCounts, FailedOpStatus, FailedOperation, FailedOperationsManager, FailureKind,
    RetryPolicy,
};
pub use lease::{Lease, LeaseGuard, LeaseManager, LockEvent};
pub use manager::{SyncManager, SyncStatus};
pub use optimistic::{OptimisticManager, Outcome, Pending};
pub use retry::RetryWorker;
pub use store::LocalStore;
pub use types::*;
