//! Lease records and the authoritative lease table.
//!
//! The table maps hardware addresses (canonical lowercase hex) to lease
//! records and coordinates with the [`AddressPool`] so the two views of
//! address ownership never diverge. It implements the server-side lease
//! lifecycle:
//!
//! - Created → Offered → Bound → Released transitions
//! - Static reservations exempt from expiry and eviction
//! - An expiry sweep that demotes overdue leases to Released
//! - Eviction of stale leases when the pool runs dry
//! - Bulk load of externally persisted leases at construction
//!
//! # Thread Safety
//!
//! All operations are thread-safe behind an internal [`RwLock`]. Change
//! notifications carry cloned snapshots on a broadcast channel and are
//! sent only after the lock has been released.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::options::DhcpOption;
use crate::pool::AddressPool;

/// Buffered lease events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Created,
    Offered,
    Bound,
    Released,
}

/// A binding of a client hardware address to an IPv4 address.
///
/// `hwaddr` is the stable lookup key. `address` stays
/// [`Ipv4Addr::UNSPECIFIED`] until an address is allocated. A zero
/// `lease_time_seconds` means the lease never auto-expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub hwaddr: String,
    pub client_id: String,
    pub hostname: Option<String>,
    pub address: Ipv4Addr,
    pub status: LeaseStatus,
    pub is_static: bool,
    pub lease_time_seconds: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub options: Vec<DhcpOption>,
}

impl Lease {
    pub fn new(hwaddr: String, client_id: String, lease_time_seconds: u32, now: DateTime<Utc>) -> Self {
        Self {
            hwaddr,
            client_id,
            hostname: None,
            address: Ipv4Addr::UNSPECIFIED,
            status: LeaseStatus::Created,
            is_static: false,
            lease_time_seconds,
            start: now,
            end: now,
            options: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_time_seconds != 0 && now > self.end
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_seconds().max(0)
    }
}

/// Snapshot-carrying change notifications emitted by the table.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    Added(Lease),
    Changed(Lease),
    Removed(Lease),
}

#[derive(Debug, Default)]
struct TableState {
    leases: HashMap<String, Lease>,
    /// Reverse lookup: address → hwaddr of the lease holding it.
    by_address: HashMap<Ipv4Addr, String>,
    /// Records already surfaced through an `Added` event.
    announced: HashSet<String>,
}

impl TableState {
    fn insert(&mut self, lease: Lease) {
        if lease.address != Ipv4Addr::UNSPECIFIED {
            self.by_address.insert(lease.address, lease.hwaddr.clone());
        }
        self.leases.insert(lease.hwaddr.clone(), lease);
    }

    fn drop_record(&mut self, hwaddr: &str) -> Option<Lease> {
        let lease = self.leases.remove(hwaddr)?;
        if lease.address != Ipv4Addr::UNSPECIFIED {
            self.by_address.remove(&lease.address);
        }
        self.announced.remove(hwaddr);
        Some(lease)
    }

    /// `Added` on first visibility, `Changed` afterwards.
    fn visibility_event(&mut self, lease: &Lease) -> LeaseEvent {
        if self.announced.insert(lease.hwaddr.clone()) {
            LeaseEvent::Added(lease.clone())
        } else {
            LeaseEvent::Changed(lease.clone())
        }
    }
}

/// The authoritative, concurrent lease table.
pub struct LeaseTable {
    state: RwLock<TableState>,
    pool: Arc<AddressPool>,
    clock: SharedClock,
    default_lease_time_seconds: u32,
    events: broadcast::Sender<LeaseEvent>,
}

impl LeaseTable {
    pub fn new(pool: Arc<AddressPool>, clock: SharedClock, default_lease_time_seconds: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(TableState::default()),
            pool,
            clock,
            default_lease_time_seconds,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    fn emit(&self, events: Vec<LeaseEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    pub async fn get_by_hwaddr(&self, hwaddr: &str) -> Option<Lease> {
        let state = self.state.read().await;
        state.leases.get(hwaddr).cloned()
    }

    pub async fn get_by_address(&self, addr: Ipv4Addr) -> Option<Lease> {
        let state = self.state.read().await;
        state
            .by_address
            .get(&addr)
            .and_then(|hwaddr| state.leases.get(hwaddr).cloned())
    }

    /// Inserts a fresh Created record for `hwaddr` with the default lease
    /// time. No event fires until the record is first updated.
    pub async fn create(&self, hwaddr: &str) -> Result<Lease> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if state.leases.contains_key(hwaddr) {
            return Err(Error::AlreadyExists(hwaddr.to_string()));
        }

        let lease = Lease::new(
            hwaddr.to_string(),
            hwaddr.to_string(),
            self.default_lease_time_seconds,
            now,
        );
        state.leases.insert(hwaddr.to_string(), lease.clone());
        Ok(lease)
    }

    /// Merges `lease` into the stored record keyed by its hwaddr.
    ///
    /// A static record's address is immutable. Transitioning into Offered
    /// or Bound stamps `start`/`end` and allocates an address from the
    /// pool if the record has none yet.
    pub async fn update(&self, lease: &Lease) -> Result<Lease> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let stored = state
            .leases
            .get(&lease.hwaddr)
            .cloned()
            .ok_or_else(|| Error::NotFound(lease.hwaddr.clone()))?;

        if stored.is_static
            && lease.address != stored.address
            && lease.address != Ipv4Addr::UNSPECIFIED
        {
            return Err(Error::StaticViolation(stored.hwaddr.clone()));
        }

        let mut next = stored.clone();
        if !stored.is_static {
            next.address = lease.address;
        }
        next.options = lease.options.clone();
        next.hostname = lease.hostname.clone();
        next.client_id = lease.client_id.clone();
        next.status = lease.status;
        next.lease_time_seconds = lease.lease_time_seconds;

        if matches!(next.status, LeaseStatus::Offered | LeaseStatus::Bound) {
            next.start = now;
            next.end = now + TimeDelta::seconds(next.lease_time_seconds as i64);
            if next.address == Ipv4Addr::UNSPECIFIED {
                next.address = self
                    .pool
                    .allocate_any()
                    .await
                    .ok_or(Error::PoolExhausted)?;
            }
        }

        if next.address != Ipv4Addr::UNSPECIFIED
            && let Some(holder) = state.by_address.get(&next.address)
            && holder != &next.hwaddr
        {
            return Err(Error::Conflict(next.address));
        }

        if stored.address != next.address {
            if stored.address != Ipv4Addr::UNSPECIFIED {
                state.by_address.remove(&stored.address);
                self.pool.mark_unused(stored.address).await;
            }
            if next.address != Ipv4Addr::UNSPECIFIED {
                // The caller may have picked the address without going
                // through an allocator.
                self.pool.allocate_specific(next.address).await;
            }
        }

        state.insert(next.clone());
        let event = state.visibility_event(&next);
        drop(state);

        self.emit(vec![event]);
        Ok(next)
    }

    /// Removes the record and returns its address to the pool. Static
    /// leases cannot be removed.
    pub async fn remove(&self, lease: &Lease) -> Result<Lease> {
        let mut state = self.state.write().await;

        match state.leases.get(&lease.hwaddr) {
            None => return Err(Error::NotFound(lease.hwaddr.clone())),
            Some(stored) if stored.is_static => {
                return Err(Error::StaticViolation(lease.hwaddr.clone()));
            }
            Some(_) => {}
        }

        let Some(removed) = state.drop_record(&lease.hwaddr) else {
            return Err(Error::NotFound(lease.hwaddr.clone()));
        };
        if removed.address != Ipv4Addr::UNSPECIFIED {
            self.pool.mark_unused(removed.address).await;
        }
        drop(state);

        self.emit(vec![LeaseEvent::Removed(removed.clone())]);
        Ok(removed)
    }

    /// Pins the record to `lease.address`. Creates the record when absent.
    /// Idempotent: repeating the call with the same address is a no-op and
    /// emits nothing.
    pub async fn make_static(&self, lease: &Lease) -> Result<Lease> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if let Some(existing) = state.leases.get(&lease.hwaddr)
            && existing.is_static
            && existing.address == lease.address
        {
            return Ok(existing.clone());
        }

        let mut events = Vec::new();

        // The target address may only be taken over from a released
        // dynamic lease; anything else is a conflict.
        if let Some(holder) = state.by_address.get(&lease.address).cloned()
            && holder != lease.hwaddr
        {
            let evictable = state
                .leases
                .get(&holder)
                .is_some_and(|other| !other.is_static && other.status == LeaseStatus::Released);
            if !evictable {
                return Err(Error::Conflict(lease.address));
            }
            if let Some(evicted) = state.drop_record(&holder) {
                events.push(LeaseEvent::Removed(evicted));
            }
        }

        let updated = match state.leases.get(&lease.hwaddr).cloned() {
            Some(mut existing) => {
                if existing.address != lease.address && existing.address != Ipv4Addr::UNSPECIFIED {
                    state.by_address.remove(&existing.address);
                    self.pool.mark_unused(existing.address).await;
                }
                existing.is_static = true;
                existing.address = lease.address;
                existing
            }
            None => {
                let client_id = if lease.client_id.is_empty() {
                    lease.hwaddr.clone()
                } else {
                    lease.client_id.clone()
                };
                let mut fresh = Lease::new(
                    lease.hwaddr.clone(),
                    client_id,
                    self.default_lease_time_seconds,
                    now,
                );
                fresh.hostname = lease.hostname.clone();
                fresh.is_static = true;
                fresh.address = lease.address;
                fresh.status = LeaseStatus::Bound;
                fresh.end = now + TimeDelta::seconds(fresh.lease_time_seconds as i64);
                fresh
            }
        };

        self.pool.allocate_specific(lease.address).await;
        state.insert(updated.clone());
        events.push(state.visibility_event(&updated));
        drop(state);

        self.emit(events);
        Ok(updated)
    }

    /// Clears the static flag, returning the lease to normal expiry rules.
    pub async fn make_dynamic(&self, lease: &Lease) -> Result<Lease> {
        let mut state = self.state.write().await;

        let Some(stored) = state.leases.get_mut(&lease.hwaddr) else {
            return Err(Error::NotFound(lease.hwaddr.clone()));
        };
        stored.is_static = false;
        let updated = stored.clone();
        let event = state.visibility_event(&updated);
        drop(state);

        self.emit(vec![event]);
        Ok(updated)
    }

    /// Removes the stalest reclaimable lease (released, or past its end)
    /// and hands its address to the caller. Ties on `end` break toward
    /// the numerically smallest address.
    pub async fn evict_oldest_expired(&self) -> Option<Ipv4Addr> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let victim = state
            .leases
            .values()
            .filter(|lease| {
                !lease.is_static
                    && lease.address != Ipv4Addr::UNSPECIFIED
                    && (lease.status == LeaseStatus::Released || lease.is_expired(now))
            })
            .min_by_key(|lease| (lease.end, u32::from(lease.address)))
            .map(|lease| lease.hwaddr.clone())?;

        let evicted = state.drop_record(&victim)?;
        drop(state);

        let address = evicted.address;
        self.emit(vec![LeaseEvent::Removed(evicted)]);
        Some(address)
    }

    /// Any free address, falling back to evicting the oldest expired lease
    /// when the pool is dry.
    pub async fn allocate_any(&self) -> Option<Ipv4Addr> {
        if let Some(addr) = self.pool.allocate_any().await {
            return Some(addr);
        }
        self.evict_oldest_expired().await
    }

    /// A specific address: from the pool, or reclaimed from the released
    /// dynamic lease holding it. Addresses outside the configured range
    /// pass through unchanged (the operator has opted to accept them).
    pub async fn allocate_specific(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.pool.allocate_specific(addr).await.is_some() {
            return Some(addr);
        }

        let mut state = self.state.write().await;
        if let Some(holder) = state.by_address.get(&addr).cloned() {
            let evictable = state
                .leases
                .get(&holder)
                .is_some_and(|lease| !lease.is_static && lease.status == LeaseStatus::Released);
            if !evictable {
                return None;
            }
            let evicted = state.drop_record(&holder)?;
            drop(state);
            self.emit(vec![LeaseEvent::Removed(evicted)]);
            return Some(addr);
        }
        drop(state);

        if !self.pool.in_range(addr) {
            return Some(addr);
        }
        None
    }

    /// Clones of every record, in no particular order.
    pub async fn snapshot(&self) -> Vec<Lease> {
        let state = self.state.read().await;
        state.leases.values().cloned().collect()
    }

    /// Bulk-inserts externally persisted leases. Only valid on an empty
    /// table; each address is reserved against the pool first and leases
    /// the pool refuses are skipped. Returns the number loaded.
    pub async fn load(&self, leases: Vec<Lease>) -> usize {
        let mut state = self.state.write().await;
        if !state.leases.is_empty() {
            return 0;
        }

        let mut loaded = 0;
        for lease in leases {
            if state.leases.contains_key(&lease.hwaddr) {
                continue;
            }
            if lease.address != Ipv4Addr::UNSPECIFIED {
                if state.by_address.contains_key(&lease.address) {
                    continue;
                }
                let reserved = self.pool.allocate_specific(lease.address).await.is_some();
                if !reserved && self.pool.in_range(lease.address) {
                    continue;
                }
            }
            state.announced.insert(lease.hwaddr.clone());
            state.insert(lease);
            loaded += 1;
        }
        loaded
    }

    /// One pass of the expiry sweeper: demotes every overdue non-static
    /// lease to Released. Leases with zero lease time never expire.
    pub async fn sweep_expired(&self) {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let mut changed = Vec::new();
        for lease in state.leases.values_mut() {
            if lease.is_static || lease.status == LeaseStatus::Released {
                continue;
            }
            if lease.lease_time_seconds != 0 && lease.end < now {
                lease.status = LeaseStatus::Released;
                changed.push(LeaseEvent::Changed(lease.clone()));
            }
        }
        drop(state);

        self.emit(changed);
    }
}
