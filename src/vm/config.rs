//! Firecracker VM configuration structures
//!
//! The payload structs mirror the JSON bodies of Firecracker API requests.
//! [`LaunchConfig`] is everything needed to boot one VM, and the builders
//! below turn it into the boot arguments and ordered drive list.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Serialize;

/// Base kernel command line for every VM
pub const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Netmask of the /16 address pool
pub const POOL_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);

/// Drive id of the root device, always attached first
pub const ROOTFS_DRIVE_ID: &str = "rootfs";

/// Boot source configuration for the VM kernel
#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// Block device (drive) configuration
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// vCPU and memory sizing
#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

/// virtio-net interface backed by a host TAP device
#[derive(Serialize, Debug, Clone)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

/// VM action (e.g., "InstanceStart", "SendCtrlAltDel")
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

/// An additional block device built from a host directory
#[derive(Debug, Clone, PartialEq)]
pub struct MountDrive {
    pub image_path: PathBuf,
    pub tag: String,
    pub read_only: bool,
}

/// Everything needed to launch one Firecracker VM
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub vm_name: String,
    pub socket_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub log_path: PathBuf,
    pub cpus: u32,
    pub memory_mb: u32,
    pub tap_device: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub mount_drives: Vec<MountDrive>,
}

impl LaunchConfig {
    /// Kernel command line: base args plus the static IP parameter when configured
    ///
    /// Format: `ip=<client-ip>::<gateway-ip>:<netmask>::eth0:off`
    pub fn boot_args(&self) -> String {
        match (self.ip_address, self.gateway) {
            (Some(ip), Some(gw)) => format!(
                "{} ip={}::{}:{}::eth0:off",
                BASE_BOOT_ARGS, ip, gw, POOL_NETMASK
            ),
            _ => BASE_BOOT_ARGS.to_string(),
        }
    }

    /// Rootfs first, then mounts in declaration order as mount0, mount1, ...
    ///
    /// Guest device names (vda, vdb, ...) are positional, so this order is
    /// what the guest sees.
    pub fn drives(&self) -> Vec<Drive> {
        let mut drives = Vec::with_capacity(1 + self.mount_drives.len());
        drives.push(Drive {
            drive_id: ROOTFS_DRIVE_ID.to_string(),
            path_on_host: self.rootfs_path.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        });

        for (i, mount) in self.mount_drives.iter().enumerate() {
            drives.push(Drive {
                drive_id: format!("mount{}", i),
                path_on_host: mount.image_path.display().to_string(),
                is_root_device: false,
                is_read_only: mount.read_only,
            });
        }

        drives
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            vcpu_count: self.cpus,
            mem_size_mib: self.memory_mb,
        }
    }

    /// `eth0` bound to the TAP device, when networking is configured
    pub fn network_interface(&self) -> Option<NetworkInterface> {
        let tap = self.tap_device.as_ref()?;
        Some(NetworkInterface {
            iface_id: "eth0".to_string(),
            host_dev_name: tap.clone(),
            guest_mac: self.mac_address.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_config() -> LaunchConfig {
        LaunchConfig {
            vm_name: "t1".to_string(),
            socket_path: PathBuf::from("/run/t1.sock"),
            kernel_path: PathBuf::from("/k/vmlinux.bin"),
            rootfs_path: PathBuf::from("/vms/t1.ext4"),
            log_path: PathBuf::from("/logs/t1.log"),
            cpus: 2,
            memory_mb: 1024,
            tap_device: None,
            mac_address: None,
            ip_address: None,
            gateway: None,
            mount_drives: Vec::new(),
        }
    }

    #[test]
    fn test_boot_args_without_network() {
        assert_eq!(launch_config().boot_args(), "console=ttyS0 reboot=k panic=1 pci=off");
    }

    #[test]
    fn test_boot_args_with_static_ip() {
        let mut cfg = launch_config();
        cfg.ip_address = Some(Ipv4Addr::new(172, 16, 0, 2));
        cfg.gateway = Some(Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(
            cfg.boot_args(),
            "console=ttyS0 reboot=k panic=1 pci=off ip=172.16.0.2::172.16.0.1:255.255.0.0::eth0:off"
        );
    }

    #[test]
    fn test_boot_args_need_both_ip_and_gateway() {
        let mut cfg = launch_config();
        cfg.ip_address = Some(Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(cfg.boot_args(), BASE_BOOT_ARGS);
    }

    #[test]
    fn test_drive_ordering() {
        let mut cfg = launch_config();
        cfg.mount_drives = vec![
            MountDrive {
                image_path: PathBuf::from("/mounts/t1-code.ext4"),
                tag: "code".to_string(),
                read_only: true,
            },
            MountDrive {
                image_path: PathBuf::from("/mounts/t1-data.ext4"),
                tag: "data".to_string(),
                read_only: false,
            },
        ];

        let drives = cfg.drives();
        let ids: Vec<_> = drives.iter().map(|d| d.drive_id.as_str()).collect();
        assert_eq!(ids, vec!["rootfs", "mount0", "mount1"]);

        assert!(drives[0].is_root_device);
        assert!(!drives[0].is_read_only);
        assert_eq!(drives[1].path_on_host, "/mounts/t1-code.ext4");
        assert!(drives[1].is_read_only);
        assert!(!drives[2].is_root_device);
        assert!(!drives[2].is_read_only);
    }

    #[test]
    fn test_network_interface_requires_tap() {
        let mut cfg = launch_config();
        assert!(cfg.network_interface().is_none());
        cfg.tap_device = Some("vmmtap0".to_string());
        cfg.mac_address = Some("06:00:AC:10:00:02".to_string());
        let iface = cfg.network_interface().unwrap();
        assert_eq!(iface.iface_id, "eth0");
        assert_eq!(iface.host_dev_name, "vmmtap0");
    }
}
