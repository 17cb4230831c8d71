//! Boot-time guest configuration
//!
//! The guest's IP comes from the `ip=` kernel parameter. Everything else
//! it needs to be reachable (hostname, DNS, SSH key) is written into the
//! VM's own rootfs copy before boot, through a loop mount.

use std::fs::{self, Permissions};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, ResultExt};
use crate::mount::{mount_loop, DiskBackend};

#[derive(Debug, Clone, Default)]
pub struct GuestConfig {
    pub hostname: String,
    pub dns_servers: Vec<String>,
    pub ssh_public_key: Option<String>,
}

impl GuestConfig {
    pub fn resolv_conf(&self) -> String {
        self.dns_servers
            .iter()
            .map(|server| format!("nameserver {}\n", server))
            .collect()
    }

    pub fn hosts(&self) -> String {
        format!(
            "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n::1\tlocalhost ip6-localhost ip6-loopback\n",
            self.hostname
        )
    }
}

/// Write hostname, DNS and SSH configuration into `rootfs`
pub fn inject_guest_config(backend: &dyn DiskBackend, rootfs: &Path, config: &GuestConfig) -> Result<()> {
    let mounted = mount_loop(backend, rootfs)?;
    let root = mounted.path();

    write_guest_file(root, "etc/hostname", &format!("{}\n", config.hostname), 0o644)?;
    write_guest_file(root, "etc/hosts", &config.hosts(), 0o644)?;
    write_guest_file(root, "etc/resolv.conf", &config.resolv_conf(), 0o644)?;

    if let Some(key) = &config.ssh_public_key {
        let ssh_dir = root.join("root/.ssh");
        fs::create_dir_all(&ssh_dir)?;
        fs::set_permissions(&ssh_dir, Permissions::from_mode(0o700))?;
        write_guest_file(root, "root/.ssh/authorized_keys", &format!("{}\n", key.trim()), 0o600)?;
    }

    // Not every image ships systemd-networkd
    if let Err(e) = enable_networkd(root) {
        warn!(error = %e, "could not enable systemd-networkd in guest");
    }

    debug!(rootfs = %rootfs.display(), hostname = %config.hostname, "guest configuration injected");
    mounted.unmount()
}

/// Replace `rel` under `root` with a regular file
///
/// An existing symlink is removed first: an absolute link such as
/// `/etc/resolv.conf -> /run/...` would otherwise be followed on the host.
fn write_guest_file(root: &Path, rel: &str, contents: &str, mode: u32) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(&path).is_ok() {
        fs::remove_file(&path).with_context(|| format!("replacing guest file {}", rel))?;
    }
    fs::write(&path, contents).with_context(|| format!("writing guest file {}", rel))?;
    fs::set_permissions(&path, Permissions::from_mode(mode))?;
    Ok(())
}

fn enable_networkd(root: &Path) -> Result<()> {
    let unit = Path::new("/lib/systemd/system/systemd-networkd.service");
    let wants = root.join("etc/systemd/system/multi-user.target.wants");
    let link = wants.join("systemd-networkd.service");

    if fs::symlink_metadata(&link).is_ok() {
        return Ok(());
    }
    fs::create_dir_all(&wants)?;
    symlink(unit, &link)?;
    Ok(())
}
