//! Leased locks that keep duplicate writes out of the backend.
//!
//! A lease maps a lock key (usually `operation:entity-id`) to its holder,
//! a fencing token and an expiry. Every successful acquire hands out a
//! token larger than any before it, so a holder whose lease lapsed and
//! was taken over can tell its token is stale. Changes are broadcast as
//! [`LockEvent`]s.

use crate::backend::WebhookOp;
use crate::cache::cache_key;
use crate::clock::SharedClock;
use crate::error::{Result, SyncError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Lease {
    pub key: String,
    pub owner: String,
    pub token: u64,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Lease {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn remaining_ms_at(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LockEvent {
    Acquired { key: String, owner: String, token: u64 },
    Renewed { key: String, token: u64, expires_at_ms: u64 },
    Released { key: String, token: u64 },
    Expired { key: String, token: u64 },
}

/// Identity used when the caller does not name an owner: host and pid.
pub fn default_owner() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Lock key for a write. Entity writes lock on `op:id`; writes without an
/// id (creates before an id is known, generic payloads) lock on the
/// payload hash.
pub fn dedup_key(op: WebhookOp, payload: &serde_json::Value) -> String {
    match payload
        .get("id")
        .or_else(|| payload.get("leadId"))
        .and_then(|v| v.as_str())
    {
        Some(id) => format!("{}:{}", op.as_str(), id),
        None => cache_key(op.as_str(), payload),
    }
}

pub struct LeaseManager {
    leases: DashMap<String, Lease>,
    next_token: AtomicU64,
    default_ttl_ms: u64,
    clock: SharedClock,
    events: broadcast::Sender<LockEvent>,
}

impl LeaseManager {
    pub fn new(default_ttl_ms: u64, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            leases: DashMap::new(),
            next_token: AtomicU64::new(1),
            default_ttl_ms,
            clock,
            events,
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LockEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Take the lease on `key`, or take over an expired one.
    pub fn acquire(&self, key: &str, owner: &str, ttl_ms: Option<u64>) -> Result<Lease> {
        let now = self.clock.now_ms();
        let ttl = ttl_ms.unwrap_or(self.default_ttl_ms);

        let (lease, expired) = match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if !held.is_expired_at(now) {
                    tracing::debug!(
                        "[LEASE] {} busy: held by {} (token {})",
                        key,
                        held.owner,
                        held.token
                    );
                    return Err(SyncError::LeaseHeld {
                        key: key.to_string(),
                        owner: held.owner.clone(),
                        expires_at_ms: held.expires_at_ms,
                    });
                }
                let expired_token = held.token;
                let lease = self.new_lease(key, owner, now, ttl);
                slot.insert(lease.clone());
                (lease, Some(expired_token))
            }
            Entry::Vacant(slot) => {
                let lease = self.new_lease(key, owner, now, ttl);
                slot.insert(lease.clone());
                (lease, None)
            }
        };

        if let Some(token) = expired {
            tracing::info!("[LEASE] {} taken over from expired token {}", key, token);
            self.emit(LockEvent::Expired {
                key: key.to_string(),
                token,
            });
        }
        tracing::debug!("[LEASE] {} acquired by {} (token {})", key, owner, lease.token);
        self.emit(LockEvent::Acquired {
            key: key.to_string(),
            owner: owner.to_string(),
            token: lease.token,
        });
        Ok(lease)
    }

    fn new_lease(&self, key: &str, owner: &str, now: u64, ttl: u64) -> Lease {
        Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            acquired_at_ms: now,
            expires_at_ms: now + ttl,
        }
    }

    /// Acquire and wrap the lease in a guard that releases it on drop.
    pub fn acquire_guard(
        self: &Arc<Self>,
        key: &str,
        owner: &str,
        ttl_ms: Option<u64>,
    ) -> Result<LeaseGuard> {
        let lease = self.acquire(key, owner, ttl_ms)?;
        Ok(LeaseGuard {
            manager: Arc::clone(self),
            lease,
            released: false,
        })
    }

    /// Extend a live lease by its default TTL from now.
    pub fn renew(&self, key: &str, token: u64) -> Result<Lease> {
        let now = self.clock.now_ms();
        let renewed = {
            let mut slot = self.leases.get_mut(key).ok_or_else(|| SyncError::StaleLease {
                key: key.to_string(),
                token,
            })?;
            if slot.token != token || slot.is_expired_at(now) {
                return Err(SyncError::StaleLease {
                    key: key.to_string(),
                    token,
                });
            }
            slot.expires_at_ms = now + self.default_ttl_ms;
            slot.clone()
        };
        self.emit(LockEvent::Renewed {
            key: key.to_string(),
            token,
            expires_at_ms: renewed.expires_at_ms,
        });
        Ok(renewed)
    }

    /// Release `key` if `token` still holds it.
    pub fn release(&self, key: &str, token: u64) -> Result<()> {
        match self.leases.remove_if(key, |_, lease| lease.token == token) {
            Some(_) => {
                tracing::debug!("[LEASE] {} released (token {})", key, token);
                self.emit(LockEvent::Released {
                    key: key.to_string(),
                    token,
                });
                Ok(())
            }
            None => Err(SyncError::StaleLease {
                key: key.to_string(),
                token,
            }),
        }
    }

    /// Whether `token` is the live holder of `key`.
    pub fn is_current(&self, key: &str, token: u64) -> bool {
        let now = self.clock.now_ms();
        self.leases
            .get(key)
            .map(|l| l.token == token && !l.is_expired_at(now))
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<Lease> {
        let now = self.clock.now_ms();
        self.leases
            .get(key)
            .filter(|l| !l.is_expired_at(now))
            .map(|l| l.clone())
    }

    /// Drop expired leases. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut expired = Vec::new();
        self.leases.retain(|key, lease| {
            if lease.is_expired_at(now) {
                expired.push((key.clone(), lease.token));
                false
            } else {
                true
            }
        });
        for (key, token) in &expired {
            tracing::info!("[LEASE] {} expired (token {})", key, token);
            self.emit(LockEvent::Expired {
                key: key.clone(),
                token: *token,
            });
        }
        expired.len()
    }

    /// Live leases sorted by key.
    pub fn list(&self) -> Vec<Lease> {
        let now = self.clock.now_ms();
        let mut all: Vec<Lease> = self
            .leases
            .iter()
            .filter(|l| !l.is_expired_at(now))
            .map(|l| l.clone())
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.leases.iter().filter(|l| !l.is_expired_at(now)).count()
    }
}

/// Holds a lease until dropped or released.
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn token(&self) -> u64 {
        self.lease.token
    }

    pub fn is_current(&self) -> bool {
        self.manager.is_current(&self.lease.key, self.lease.token)
    }

    pub fn renew(&mut self) -> Result<()> {
        self.lease = self.manager.renew(&self.lease.key, self.lease.token)?;
        Ok(())
    }

    /// Drive `fut` to completion, renewing the lease every half TTL so a
    /// slow call does not outlive it. A failed renewal is logged and the
    /// future still runs; check [`LeaseGuard::is_current`] afterwards.
    pub async fn hold_during<F: Future>(&mut self, fut: F) -> F::Output {
        let period = Duration::from_millis((self.manager.default_ttl_ms() / 2).max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => {
                    if let Err(e) = self.renew() {
                        tracing::warn!("[LEASE] {} lost mid-call: {}", self.lease.key, e);
                    }
                }
            }
        }
    }

    /// Release now. Fails if the lease lapsed and was taken over.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.lease.key, self.lease.token)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            // Stale token means someone else holds it now; nothing to do
            let _ = self.manager.release(&self.lease.key, self.lease.token);
        }
    }
}
