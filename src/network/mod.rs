//! Per-VM networking
//!
//! Each VM gets a sticky lease (IP, MAC, TAP name) from [`IpAllocator`]
//! and, while running, a TAP device enslaved to a shared bridge. The
//! bridge and NAT rules are created lazily by the first `start`, not at
//! install time, and the outbound interface is looked up from the default
//! route on every setup.

pub mod allocator;
pub mod host;

use std::sync::Arc;

use tracing::{info, warn};

pub use allocator::{IpAllocator, POOL_PREFIX};
pub use host::{HostNetwork, IpTablesNetwork};

use crate::error::{Result, ResultExt};
use crate::vm::record::{NetworkLease, PortForward, VMRecord};

pub struct NetworkManager {
    host: Arc<dyn HostNetwork>,
    allocator: IpAllocator,
    bridge: String,
}

impl NetworkManager {
    pub fn new(host: Arc<dyn HostNetwork>, allocator: IpAllocator, bridge: impl Into<String>) -> Self {
        Self {
            host,
            allocator,
            bridge: bridge.into(),
        }
    }

    /// Next free lease given every record in the store
    pub fn allocate_lease(&self, records: &[VMRecord]) -> Result<NetworkLease> {
        self.allocator.allocate(records)
    }

    /// Bridge + NAT (idempotent), then the VM's TAP device and port forwards
    ///
    /// On failure, the TAP device created here is removed again.
    pub fn setup(&self, lease: &NetworkLease, forwards: &[PortForward]) -> Result<()> {
        let out_iface = self.host.default_route_interface()?;

        self.host
            .ensure_bridge(&self.bridge, self.allocator.gateway(), POOL_PREFIX)
            .with_context(|| format!("setting up bridge {}", self.bridge))?;
        self.host
            .ensure_nat(&self.bridge, &self.allocator.subnet(), &out_iface)
            .context("setting up NAT")?;

        self.host
            .create_tap(&lease.tap_device, &self.bridge)
            .with_context(|| format!("creating TAP device {}", lease.tap_device))?;
        info!(tap = %lease.tap_device, ip = %lease.ip_address, bridge = %self.bridge, "TAP device ready");

        for forward in forwards {
            if let Err(e) = self.host.add_port_forward(&out_iface, lease.ip_address, forward) {
                self.teardown(lease, forwards);
                return Err(e).with_context(|| {
                    format!("forwarding host port {} to {}", forward.host_port, lease.ip_address)
                });
            }
        }

        Ok(())
    }

    /// Remove port forwards and the TAP device
    ///
    /// Runs every step even if earlier ones fail: a leftover TAP device
    /// makes the next start fail with "device busy". Returns false if any
    /// step failed.
    pub fn teardown(&self, lease: &NetworkLease, forwards: &[PortForward]) -> bool {
        let mut clean = true;

        if !forwards.is_empty() {
            match self.host.default_route_interface() {
                Ok(out_iface) => {
                    for forward in forwards {
                        if let Err(e) = self.host.remove_port_forward(&out_iface, lease.ip_address, forward) {
                            warn!(host_port = forward.host_port, error = %e, "failed to remove port forward");
                            clean = false;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot resolve default route, port forwards left in place");
                    clean = false;
                }
            }
        }

        if let Err(e) = self.host.delete_tap(&lease.tap_device) {
            warn!(tap = %lease.tap_device, error = %e, "failed to delete TAP device");
            clean = false;
        }

        clean
    }

    pub fn tap_exists(&self, tap: &str) -> bool {
        self.host.tap_exists(tap)
    }
}
