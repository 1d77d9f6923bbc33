//! Named leases for replication critical sections.
//!
//! Leases carry a TTL so a crashed holder cannot block the backend forever,
//! and acquisition waits at most a bounded time before failing with
//! [`Error::LeaseTimeout`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Lease name guarding placement and pair creation for a backend
pub fn replication_lease_name(backend_id: &str) -> String {
    format!("{}-replication", backend_id)
}

/// Lease name guarding teardown of one volume's replica
pub fn volume_lease_name(backend_id: &str, device_id: &str) -> String {
    format!("{}-volume-{}", backend_id, device_id)
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lease name.
    pub name: String,
    /// Fencing token, unique per grant.
    pub token: u64,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease is considered abandoned.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Check if the lease has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Port for named, TTL-bounded mutual exclusion.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Acquire `name`, waiting up to the manager's bound if it is held.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Lease>;

    /// Release a lease. Releasing an expired or taken-over lease is a no-op.
    async fn release(&self, lease: &Lease) -> Result<()>;
}

pub type LeaseManagerRef = Arc<dyn LeaseManager>;

/// Process-local lease manager.
pub struct InMemoryLeaseManager {
    leases: DashMap<String, Lease>,
    released: Notify,
    next_token: AtomicU64,
    wait: Duration,
}

impl InMemoryLeaseManager {
    /// Create a manager that waits at most `wait` for a busy lease.
    pub fn new(wait: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            released: Notify::new(),
            next_token: AtomicU64::new(1),
            wait,
        }
    }

    /// Number of leases currently granted (expired ones included).
    pub fn held(&self) -> usize {
        self.leases.len()
    }

    /// Grant the lease if it is free or its holder has expired.
    fn try_grant(&self, name: &str, ttl: Duration) -> Option<Lease> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let lease = Lease {
            name: name.to_string(),
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            acquired_at: now,
            expires_at: now + ttl,
        };

        match self.leases.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
                Some(lease)
            }
            Entry::Occupied(mut slot) if slot.get().is_expired() => {
                warn!(
                    "Lease {} (token {}) expired, granting to a new holder",
                    name,
                    slot.get().token
                );
                slot.insert(lease.clone());
                Some(lease)
            }
            Entry::Occupied(_) => None,
        }
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + self.wait;

        loop {
            // Register for wakeups before checking so a release in between is not lost
            let released = self.released.notified();

            if let Some(lease) = self.try_grant(name, ttl) {
                debug!("Acquired lease {} (token {})", name, lease.token);
                return Ok(lease);
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(Error::LeaseTimeout {
                    name: name.to_string(),
                });
            }
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let removed = self
            .leases
            .remove_if(&lease.name, |_, held| held.token == lease.token);

        if removed.is_some() {
            debug!("Released lease {} (token {})", lease.name, lease.token);
            self.released.notify_waiters();
        } else {
            warn!(
                "Lease {} (token {}) was no longer held at release",
                lease.name, lease.token
            );
        }
        Ok(())
    }
}
