//! Round-scoped exclusivity leases
//!
//! A lease grants one coordinator instance the right to aggregate and publish
//! a round. Grants carry a fencing token; a lease is only valid while the
//! provider still records the same holder and token.

use async_trait::async_trait;
use fedchain_types::RoundId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease service unavailable: {0}")]
    Unavailable(String),
}

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub round_id: RoundId,
    pub holder: String,
    pub token: u64,
}

#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Try to acquire (or re-acquire) the lease for a round
    ///
    /// Returns `None` if another holder owns an unexpired lease. Acquiring a
    /// lease already owned by `holder` refreshes it and keeps its token.
    async fn acquire(&self, round_id: RoundId, holder: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError>;

    /// Whether the lease is still valid
    async fn is_held(&self, lease: &Lease) -> Result<bool, LeaseError>;

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError>;
}

#[derive(Debug)]
struct LeaseEntry {
    holder: String,
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    entries: HashMap<RoundId, LeaseEntry>,
    next_token: u64,
}

/// Process-local lease provider
#[derive(Debug, Default)]
pub struct LocalLeaseProvider {
    table: Mutex<LeaseTable>,
}

impl LocalLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a round's lease regardless of holder (simulates expiry or takeover)
    pub fn revoke(&self, round_id: RoundId) {
        self.table.lock().entries.remove(&round_id);
    }

    /// Current holder of a round's lease, if unexpired
    pub fn holder(&self, round_id: RoundId) -> Option<String> {
        let table = self.table.lock();
        table
            .entries
            .get(&round_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.holder.clone())
    }
}

#[async_trait]
impl LeaseProvider for LocalLeaseProvider {
    async fn acquire(&self, round_id: RoundId, holder: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let mut table = self.table.lock();
        let now = Instant::now();

        if let Some(entry) = table.entries.get_mut(&round_id) {
            if entry.expires_at > now {
                if entry.holder != holder {
                    return Ok(None);
                }
                entry.expires_at = now + ttl;
                return Ok(Some(Lease {
                    round_id,
                    holder: holder.to_string(),
                    token: entry.token,
                }));
            }
        }

        table.next_token += 1;
        let token = table.next_token;
        table.entries.insert(
            round_id,
            LeaseEntry {
                holder: holder.to_string(),
                token,
                expires_at: now + ttl,
            },
        );
        tracing::debug!("Lease for round {} granted to {} (token {})", round_id, holder, token);

        Ok(Some(Lease {
            round_id,
            holder: holder.to_string(),
            token,
        }))
    }

    async fn is_held(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let table = self.table.lock();
        Ok(table.entries.get(&lease.round_id).is_some_and(|e| {
            e.holder == lease.holder && e.token == lease.token && e.expires_at > Instant::now()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut table = self.table.lock();
        let owned = table
            .entries
            .get(&lease.round_id)
            .is_some_and(|e| e.holder == lease.holder && e.token == lease.token);
        if owned {
            table.entries.remove(&lease.round_id);
        }
        Ok(())
    }
}
