use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// The set of addresses the server may hand out.
///
/// The range is fixed at construction; `unused` starts as the full range
/// and shrinks as addresses are allocated. A single mutex serializes all
/// operations; nothing performs I/O while holding it. The pool knows
/// nothing about leases: reclaiming an address held by an expired lease
/// is the lease table's job.
#[derive(Debug)]
pub struct AddressPool {
    first: Ipv4Addr,
    last: Ipv4Addr,
    unused: Mutex<BTreeSet<Ipv4Addr>>,
}

fn parse_range(range: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let range = range.trim();

    if let Some((start, end)) = range.split_once('-') {
        let first: Ipv4Addr = start.trim().parse().map_err(|_| {
            Error::InvalidConfig(format!("invalid range start: {}", start.trim()))
        })?;
        let last: Ipv4Addr = end.trim().parse().map_err(|_| {
            Error::InvalidConfig(format!("invalid range end: {}", end.trim()))
        })?;
        if u32::from(first) > u32::from(last) {
            return Err(Error::InvalidConfig(format!(
                "range start {} is above range end {}",
                first, last
            )));
        }
        return Ok((first, last));
    }

    let network: Ipv4Net = range
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid pool range: {}", range)))?;
    let mut hosts = network.hosts();
    let first = hosts
        .next()
        .ok_or_else(|| Error::InvalidConfig(format!("network {} has no host addresses", range)))?;
    let last = hosts.last().unwrap_or(first);
    Ok((first, last))
}

impl AddressPool {
    /// Builds a pool from `a.b.c.d-a.b.c.e` or CIDR notation. For CIDR the
    /// host addresses are used (network and broadcast excluded below /31).
    pub fn new(range: &str) -> Result<Self> {
        let (first, last) = parse_range(range)?;
        let unused = (u32::from(first)..=u32::from(last))
            .map(Ipv4Addr::from)
            .collect();

        Ok(Self {
            first,
            last,
            unused: Mutex::new(unused),
        })
    }

    pub fn in_range(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) >= u32::from(self.first) && u32::from(addr) <= u32::from(self.last)
    }

    pub fn range_len(&self) -> usize {
        (u32::from(self.last) - u32::from(self.first) + 1) as usize
    }

    pub async fn unused_len(&self) -> usize {
        self.unused.lock().await.len()
    }

    pub async fn is_unused(&self, addr: Ipv4Addr) -> bool {
        self.unused.lock().await.contains(&addr)
    }

    /// Removes and returns the numerically smallest unused address.
    pub async fn allocate_any(&self) -> Option<Ipv4Addr> {
        self.unused.lock().await.pop_first()
    }

    /// Removes and returns `addr` if it is currently unused.
    pub async fn allocate_specific(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.unused.lock().await.take(&addr).is_some() {
            Some(addr)
        } else {
            None
        }
    }

    /// Returns `addr` to the unused set. Out-of-range addresses are ignored;
    /// double-insertion is harmless.
    pub async fn mark_unused(&self, addr: Ipv4Addr) {
        if self.in_range(addr) {
            self.unused.lock().await.insert(addr);
        }
    }
}
