//! IP lease allocation over the VM record set
//!
//! Addresses come from a fixed /16 pool and are handed out sequentially
//! from `.0.2`. An address stays taken as long as any record holds it,
//! running or not: leases are sticky for a VM's lifetime and only return
//! to the pool when the record is deleted.
//!
//! The allocator is a pure function of the records it is given. Callers
//! must hold the store lock across load → allocate → save.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{Result, VmmError};
use crate::vm::record::{NetworkLease, VMRecord};

/// Prefix length of the pool, matching the 255.255.0.0 boot netmask
pub const POOL_PREFIX: u8 = 16;

#[derive(Debug, Clone)]
pub struct IpAllocator {
    network: Ipv4Addr,
    gateway: Ipv4Addr,
}

impl IpAllocator {
    /// Pool is the /16 containing `gateway`
    pub fn new(gateway: Ipv4Addr) -> Self {
        let mask = u32::MAX << (32 - POOL_PREFIX);
        Self {
            network: Ipv4Addr::from(u32::from(gateway) & mask),
            gateway,
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// CIDR notation of the pool, e.g. `172.16.0.0/16`
    pub fn subnet(&self) -> String {
        format!("{}/{}", self.network, POOL_PREFIX)
    }

    /// Lowest free address from `.0.2` upwards, skipping the gateway
    pub fn next_free(&self, records: &[VMRecord]) -> Result<Ipv4Addr> {
        let taken: HashSet<Ipv4Addr> = records.iter().filter_map(|r| r.ip_address).collect();

        let base = u32::from(self.network);
        let broadcast = base | (u32::MAX >> POOL_PREFIX);

        (base + 2..broadcast)
            .map(Ipv4Addr::from)
            .find(|ip| *ip != self.gateway && !taken.contains(ip))
            .ok_or_else(|| VmmError::NotFound(format!("free address in {}", self.subnet())))
    }

    /// Full network identity for a new lease
    pub fn allocate(&self, records: &[VMRecord]) -> Result<NetworkLease> {
        let ip = self.next_free(records)?;
        Ok(NetworkLease {
            ip_address: ip,
            gateway: self.gateway,
            mac_address: mac_for(ip),
            tap_device: tap_name_for(ip),
        })
    }
}

/// Locally administered MAC embedding the IPv4 address: `06:00:AC:10:00:02`
pub fn mac_for(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("06:00:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d)
}

/// TAP name unique per lease; interface names are capped at 15 characters
pub fn tap_name_for(ip: Ipv4Addr) -> String {
    let [_, _, c, d] = ip.octets();
    format!("vmm-{}-{}", c, d)
}
