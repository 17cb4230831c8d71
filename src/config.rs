//! Configuration and on-disk layout
//!
//! All durable state lives under one base directory:
//!
//! ```text
//! ~/.vmm/
//! ├── config.json          ← optional, missing fields fall back to defaults
//! ├── vms/                 ← {name}.json records + {name}.ext4 rootfs copies
//! ├── kernels/             ← vmlinux.bin, ...
//! ├── rootfs/              ← rootfs.ext4 (shared default), ...
//! ├── mounts/              ← {name}-{tag}.ext4 host directory images
//! ├── sockets/             ← {name}.sock Firecracker API sockets
//! ├── logs/                ← {name}.log Firecracker stdout/stderr
//! └── run/                 ← vmm.lock advisory lock, runtime state
//! ```

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};

pub const DEFAULT_KERNEL_URL: &str =
    "https://s3.amazonaws.com/spec.ccfc.min/img/quickstart_guide/x86_64/kernels/vmlinux.bin";
pub const DEFAULT_ROOTFS_URL: &str =
    "https://s3.amazonaws.com/spec.ccfc.min/img/quickstart_guide/x86_64/rootfs/bionic.rootfs.ext4";

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "VMM_HOME";

const CONFIG_FILE: &str = "config.json";

/// User-tunable defaults, read from `{base}/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub default_cpus: u32,
    pub default_memory_mb: u32,
    pub default_disk_mb: u32,
    pub bridge_name: String,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<String>,
    pub ssh_public_key_path: Option<PathBuf>,
    pub firecracker_bin: PathBuf,
    pub kernel_url: String,
    pub rootfs_url: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_cpus: 1,
            default_memory_mb: 512,
            default_disk_mb: 1024,
            bridge_name: "vmm-br0".to_string(),
            gateway: Ipv4Addr::new(172, 16, 0, 1),
            dns_servers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            ssh_public_key_path: None,
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_url: DEFAULT_KERNEL_URL.to_string(),
            rootfs_url: DEFAULT_ROOTFS_URL.to_string(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    /// Load `config.json` from the base directory; a missing file yields defaults
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

/// Resolve the base directory: `$VMM_HOME`, else `~/.vmm` of the invoking user
///
/// Under sudo, `$HOME` may point at root's home; `SUDO_USER` is resolved
/// through the passwd database so state stays in the real user's home.
pub fn default_base_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }

    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        if let Ok(Some(user)) = nix::unistd::User::from_name(&sudo_user) {
            return user.dir.join(".vmm");
        }
    }

    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".vmm")
}

/// Deterministic filesystem addresses derived from the base directory
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.base.join("vms")
    }

    pub fn kernels_dir(&self) -> PathBuf {
        self.base.join("kernels")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.base.join("rootfs")
    }

    pub fn mounts_dir(&self) -> PathBuf {
        self.base.join("mounts")
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.base.join("sockets")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{}.json", name))
    }

    pub fn vm_rootfs(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{}.ext4", name))
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.sock", name))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", name))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.run_dir().join("vmm.lock")
    }

    /// Create every directory of the layout
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.vms_dir(),
            self.kernels_dir(),
            self.rootfs_dir(),
            self.mounts_dir(),
            self.sockets_dir(),
            self.logs_dir(),
            self.run_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }
}
