//! VM Record - durable identity and state of one microVM
//!
//! One record per VM, persisted as `{base}/vms/{name}.json`. The `state`
//! field is observed, not just declared: it is reconciled against the real
//! process state on every read (see [`super::process::reconcile`]).
//!
//! ```text
//!   create        start (acquire)       confirmed alive
//! ─────────► Created ──────────► Starting ──────────► Running
//!                                   │                    │
//!                       failure     │                    │ stop / process gone
//!                                   ▼                    ▼
//!                                Stopped ◄───────────────┘
//!                                   │  start (restart)    delete
//!                                   └──────► Starting     ─────► (removed)
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmmError};

/// Lifecycle state of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VMState {
    /// Record written, nothing allocated
    Created,
    /// Resources being acquired, hypervisor launching
    Starting,
    /// Hypervisor process confirmed alive
    Running,
    /// Hypervisor process confirmed dead
    Stopped,
}

impl VMState {
    /// States from which `start` may proceed
    pub fn can_start(self) -> bool {
        matches!(self, VMState::Created | VMState::Stopped)
    }
}

impl fmt::Display for VMState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VMState::Created => "created",
            VMState::Starting => "starting",
            VMState::Running => "running",
            VMState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One host-directory-to-guest-block-device binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    /// Filesystem label and image filename component
    pub guest_tag: String,
    pub read_only: bool,
    /// `{mounts_dir}/{vm_name}-{guest_tag}.ext4`, set once the image is built
    #[serde(default)]
    pub image_path: Option<PathBuf>,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, guest_tag: impl Into<String>, read_only: bool) -> Self {
        Self {
            host_path: host_path.into(),
            guest_tag: guest_tag.into(),
            read_only,
            image_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Host port forwarded to a guest port through DNAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

impl PortForward {
    /// Parse `host:guest[/tcp|udp]`, protocol defaults to tcp
    pub fn parse(spec: &str) -> Result<Self> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some((_, other)) => {
                return Err(VmmError::InvalidInput(format!(
                    "invalid protocol '{}' in port spec '{}': expected tcp or udp",
                    other, spec
                )))
            }
            None => (spec, Protocol::Tcp),
        };

        let invalid = || {
            VmmError::InvalidInput(format!(
                "invalid port spec '{}': expected 'host_port:guest_port[/tcp|udp]'",
                spec
            ))
        };

        let (host, guest) = ports.split_once(':').ok_or_else(invalid)?;
        let host_port: u16 = host.parse().map_err(|_| invalid())?;
        let guest_port: u16 = guest.parse().map_err(|_| invalid())?;
        if host_port == 0 || guest_port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host_port,
            guest_port,
            protocol,
        })
    }
}

/// Identity plus declared and observed state of one microVM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VMRecord {
    pub name: String,
    pub id: String,
    pub state: VMState,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub tap_device: Option<String>,
    /// Firecracker pid, 0 when not running. Only meaningful together with the socket.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl VMRecord {
    /// Network identity as one tuple, present only once all parts are leased
    pub fn lease(&self) -> Option<NetworkLease> {
        Some(NetworkLease {
            ip_address: self.ip_address?,
            gateway: self.gateway?,
            mac_address: self.mac_address.clone()?,
            tap_device: self.tap_device.clone()?,
        })
    }

    pub fn set_lease(&mut self, lease: Option<NetworkLease>) {
        match lease {
            Some(lease) => {
                self.ip_address = Some(lease.ip_address);
                self.gateway = Some(lease.gateway);
                self.mac_address = Some(lease.mac_address);
                self.tap_device = Some(lease.tap_device);
            }
            None => {
                self.ip_address = None;
                self.gateway = None;
                self.mac_address = None;
                self.tap_device = None;
            }
        }
    }
}

/// Network identity of a VM: sticky for the VM's lifetime once allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLease {
    pub ip_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac_address: String,
    pub tap_device: String,
}

/// Names become filename components, so they share the guest tag charset
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 64 {
        return Err(VmmError::InvalidInput(format!(
            "invalid {} '{}': must be 1-64 characters",
            kind, value
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(VmmError::InvalidInput(format!(
            "invalid {} '{}': only alphanumeric, dash, and underscore allowed",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VMState::Running).unwrap(), "\"running\"");
        let state: VMState = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(state, VMState::Stopped);
    }

    #[test]
    fn test_can_start() {
        assert!(VMState::Created.can_start());
        assert!(VMState::Stopped.can_start());
        assert!(!VMState::Running.can_start());
        assert!(!VMState::Starting.can_start());
    }

    #[test]
    fn test_port_forward_parse() {
        let pf = PortForward::parse("8080:80").unwrap();
        assert_eq!(pf.host_port, 8080);
        assert_eq!(pf.guest_port, 80);
        assert_eq!(pf.protocol, Protocol::Tcp);

        let pf = PortForward::parse("5353:53/udp").unwrap();
        assert_eq!(pf.protocol, Protocol::Udp);

        assert!(PortForward::parse("8080").unwrap_err().is_invalid_input());
        assert!(PortForward::parse("8080:80/sctp").unwrap_err().is_invalid_input());
        assert!(PortForward::parse("0:80").unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("VM name", "web-01_a").is_ok());
        assert!(validate_name("VM name", "").is_err());
        assert!(validate_name("VM name", "../etc").is_err());
        assert!(validate_name("VM name", "a b").is_err());
    }
}
