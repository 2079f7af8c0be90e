//! TTL leases over cluster ids.
//!
//! A lease is a conditional write on the store's lease table: it can be
//! taken only when no live lease exists, and only its holder can renew or
//! release it. Leases expire on their own, so a crashed operator never
//! blocks a cluster for longer than one TTL.
//!
//! Each successful acquisition bumps a per-resource fencing token. The
//! orchestrator presents `(holder, token)` as a [`Fence`] with every
//! transition so a holder whose lease lapsed cannot write after a new
//! holder took over.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{Fence, Lease};

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Lease operations layered on a [`StateStore`].
#[derive(Clone)]
pub struct LeaseManager {
    store: StateStore,
}

impl LeaseManager {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Take the lease if nobody holds a live one. Returns `false` on contention.
    pub fn acquire(&self, resource_id: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        Ok(self.acquire_fenced(resource_id, holder, ttl)?.is_some())
    }

    /// Take the lease and return it, including its fencing token.
    ///
    /// Any live lease blocks acquisition, including one owned by the same
    /// holder; use [`renew`](Self::renew) to extend a lease you hold.
    pub fn acquire_fenced(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> StateResult<Option<Lease>> {
        let ttl = ttl_ms(ttl);
        let acquired = self.store.modify_lease(resource_id, |current, now| {
            match current {
                Some(lease) if lease.is_valid_at(now) => (None, None),
                previous => {
                    let token = previous.map_or(0, |l| l.fencing_token) + 1;
                    let lease = Lease {
                        resource_id: resource_id.to_string(),
                        holder: holder.to_string(),
                        acquired_at_ms: now,
                        expires_at_ms: now.saturating_add(ttl),
                        fencing_token: token,
                        released: false,
                    };
                    (Some(lease.clone()), Some(lease))
                }
            }
        })?;

        match &acquired {
            Some(lease) => debug!(
                %resource_id,
                %holder,
                token = lease.fencing_token,
                expires_at_ms = lease.expires_at_ms,
                "lease acquired"
            ),
            None => warn!(%resource_id, %holder, "lease contended"),
        }
        Ok(acquired)
    }

    /// Extend the lease to `now + ttl`. Only the current live holder may renew.
    pub fn renew(&self, resource_id: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        self.extend(resource_id, holder, None, ttl)
    }

    /// Like [`renew`](Self::renew), but also requires the fencing token
    /// to match, so a holder cannot extend a lease it re-acquired elsewhere.
    pub fn renew_fenced(&self, resource_id: &str, fence: &Fence, ttl: Duration) -> StateResult<bool> {
        self.extend(resource_id, &fence.holder, Some(fence.token), ttl)
    }

    fn extend(
        &self,
        resource_id: &str,
        holder: &str,
        token: Option<u64>,
        ttl: Duration,
    ) -> StateResult<bool> {
        let ttl = ttl_ms(ttl);
        let renewed = self.store.modify_lease(resource_id, |current, now| match current {
            Some(mut lease)
                if lease.is_held_by(holder, now)
                    && token.is_none_or(|t| t == lease.fencing_token) =>
            {
                lease.expires_at_ms = now.saturating_add(ttl);
                (Some(lease), true)
            }
            _ => (None, false),
        })?;

        if renewed {
            debug!(%resource_id, %holder, "lease renewed");
        } else {
            warn!(%resource_id, %holder, "lease renewal refused");
        }
        Ok(renewed)
    }

    /// Give the lease up. Idempotent for the holder that last owned it;
    /// `false` for anyone else.
    pub fn release(&self, resource_id: &str, holder: &str) -> StateResult<bool> {
        let released = self.store.modify_lease(resource_id, |current, _now| match current {
            Some(lease) if lease.holder == holder && lease.released => (None, true),
            Some(mut lease) if lease.holder == holder => {
                lease.released = true;
                (Some(lease), true)
            }
            _ => (None, false),
        })?;
        debug!(%resource_id, %holder, released, "lease release");
        Ok(released)
    }

    /// The live lease on a resource, if any.
    pub fn current(&self, resource_id: &str) -> StateResult<Option<Lease>> {
        let now = self.store.now_ms();
        Ok(self
            .store
            .get_lease(resource_id)?
            .filter(|lease| lease.is_valid_at(now)))
    }

    pub fn is_held_by(&self, resource_id: &str, holder: &str) -> StateResult<bool> {
        let now = self.store.now_ms();
        Ok(self
            .store
            .get_lease(resource_id)?
            .is_some_and(|lease| lease.is_held_by(holder, now)))
    }

    /// Whether `fence` still matches the live lease.
    pub fn check_fence(&self, resource_id: &str, fence: &Fence) -> StateResult<bool> {
        let now = self.store.now_ms();
        Ok(self
            .store
            .get_lease(resource_id)?
            .is_some_and(|lease| fence.admits(&lease, now)))
    }
}
