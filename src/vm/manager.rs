//! VM Manager - the create/start/stop/delete state machine
//!
//! The VMManager is responsible for:
//! - Writing and reconciling VM records
//! - Materializing per-VM disks (rootfs copy, mount images)
//! - Leasing an IP and plumbing the TAP device and NAT rules
//! - Launching and stopping the Firecracker process
//! - Rolling back exactly the resources a failed start acquired
//!
//! Every command is a short-lived process, so the record is persisted after
//! each transition; a crash mid-operation leaves a record a later command
//! can reconcile.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::{LaunchConfig, MountDrive};
use super::lifecycle::{FirecrackerProcess, Hypervisor};
use super::process::{reconcile, ProcessInspector, SystemInspector};
use super::record::{validate_name, Mount, NetworkLease, PortForward, VMRecord, VMState};
use super::store::VMStore;
use crate::config::{Config, Paths};
use crate::error::{Result, ResultExt, VmmError};
use crate::guest::{inject_guest_config, GuestConfig};
use crate::image::{remove_if_exists, ImageManager};
use crate::mount::{DiskBackend, MountManager, ShellDiskBackend, MB};
use crate::network::{HostNetwork, IpAllocator, IpTablesNetwork, NetworkManager};

/// The OS-facing capabilities the manager drives
#[derive(Clone)]
pub struct Backends {
    pub disk: Arc<dyn DiskBackend>,
    pub network: Arc<dyn HostNetwork>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub inspector: Arc<dyn ProcessInspector>,
}

impl Backends {
    /// Real tools, real processes
    pub fn system(config: &Config) -> Self {
        let inspector: Arc<dyn ProcessInspector> = Arc::new(SystemInspector);
        Self {
            disk: Arc::new(ShellDiskBackend),
            network: Arc::new(IpTablesNetwork),
            hypervisor: Arc::new(FirecrackerProcess::new(
                config.firecracker_bin.clone(),
                inspector.clone(),
            )),
            inspector,
        }
    }
}

/// Resource request for a new VM; `None` falls back to the config defaults
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_mb: Option<u32>,
    pub mounts: Vec<Mount>,
    pub port_forwards: Vec<PortForward>,
    pub ssh_key_path: Option<PathBuf>,
}

pub struct VMManager {
    paths: Paths,
    config: Config,
    store: VMStore,
    images: ImageManager,
    mounts: MountManager,
    network: NetworkManager,
    backends: Backends,
}

impl VMManager {
    pub fn new(paths: Paths, config: Config, backends: Backends) -> Self {
        let store = VMStore::new(paths.clone());
        let images = ImageManager::new(paths.kernels_dir(), paths.rootfs_dir(), paths.vms_dir());
        let mounts = MountManager::new(paths.mounts_dir(), backends.disk.clone());
        let network = NetworkManager::new(
            backends.network.clone(),
            IpAllocator::new(config.gateway),
            config.bridge_name.clone(),
        );

        Self {
            paths,
            config,
            store,
            images,
            mounts,
            network,
            backends,
        }
    }

    pub fn images(&self) -> &ImageManager {
        &self.images
    }

    pub fn store(&self) -> &VMStore {
        &self.store
    }

    /// Write a new record in state Created. Allocates no disk, IP or TAP.
    #[instrument(skip(self, options), fields(vm = %name))]
    pub fn create(&self, name: &str, options: CreateOptions) -> Result<VMRecord> {
        validate_name("VM name", name)?;

        let mut seen = HashSet::new();
        for mount in &options.mounts {
            validate_name("mount tag", &mount.guest_tag)?;
            if !seen.insert(mount.guest_tag.as_str()) {
                return Err(VmmError::InvalidInput(format!(
                    "mount tag '{}' used more than once",
                    mount.guest_tag
                )));
            }
        }

        let mounts = options
            .mounts
            .into_iter()
            .map(|mut m| {
                m.image_path = Some(self.mounts.image_path(name, &m.guest_tag));
                m
            })
            .collect();

        let _lock = self.store.lock()?;
        if self.store.exists(name) {
            return Err(VmmError::AlreadyExists(format!("VM '{}'", name)));
        }

        let record = VMRecord {
            name: name.to_string(),
            id: Uuid::now_v7().to_string(),
            state: VMState::Created,
            cpus: options.cpus.unwrap_or(self.config.default_cpus),
            memory_mb: options.memory_mb.unwrap_or(self.config.default_memory_mb),
            disk_mb: options.disk_mb.unwrap_or(self.config.default_disk_mb),
            kernel_path: self.images.default_kernel_path(),
            rootfs_path: self.paths.vm_rootfs(name),
            socket_path: self.paths.socket_path(name),
            log_path: self.paths.log_path(name),
            ip_address: None,
            gateway: None,
            mac_address: None,
            tap_device: None,
            pid: 0,
            mounts,
            port_forwards: options.port_forwards,
            ssh_key_path: options.ssh_key_path,
            created_at: Utc::now(),
        };

        if record.cpus == 0 || record.memory_mb == 0 {
            return Err(VmmError::InvalidInput(
                "cpus and memory must be greater than zero".to_string(),
            ));
        }

        self.store.save(&record)?;
        info!(id = %record.id, "VM created");
        Ok(record)
    }

    /// Reconciled record
    pub fn get(&self, name: &str) -> Result<VMRecord> {
        let mut record = self.store.load(name)?;
        self.reconcile_and_persist(&mut record)?;
        Ok(record)
    }

    /// All records, reconciled
    pub fn list(&self) -> Result<Vec<VMRecord>> {
        let mut records = self.store.list()?;
        for record in &mut records {
            self.reconcile_and_persist(record)?;
        }
        Ok(records)
    }

    fn reconcile_and_persist(&self, record: &mut VMRecord) -> Result<bool> {
        let before = record.state;
        let changed = reconcile(self.backends.inspector.as_ref(), record);
        if changed {
            info!(vm = %record.name, from = %before, to = %record.state, "state reconciled");
            self.store.save(record)?;
        }
        Ok(changed)
    }

    /// Boot a Created or Stopped VM
    ///
    /// rootfs copy → mount images → network → guest config → hypervisor.
    /// On failure only what this attempt acquired is released, and the
    /// record is left Stopped.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn start(&self, name: &str) -> Result<VMRecord> {
        let start_time = Instant::now();
        self.backends.inspector.check_admin()?;
        if let Some(user) = self.backends.inspector.current_privileged_user() {
            debug!(user = %user, "running on behalf of sudo user");
        }

        let (mut record, previous_lease, lease) = {
            let _lock = self.store.lock()?;
            let mut record = self.store.load(name)?;
            self.reconcile_and_persist(&mut record)?;

            if !record.state.can_start() {
                return Err(VmmError::StateConflict {
                    name: name.to_string(),
                    state: record.state.to_string(),
                    operation: "start".to_string(),
                });
            }

            let previous_lease = record.lease();
            let lease = match &previous_lease {
                Some(lease) => lease.clone(),
                None => self.network.allocate_lease(&self.store.list()?)?,
            };

            record.set_lease(Some(lease.clone()));
            record.state = VMState::Starting;
            record.pid = 0;
            self.store.save(&record)?;
            (record, previous_lease, lease)
        };

        info!(ip = %lease.ip_address, tap = %lease.tap_device, "starting VM");

        let mut network_up = false;
        match self.bring_up(&mut record, &lease, &mut network_up).await {
            Ok(pid) => {
                record.pid = pid;
                record.state = VMState::Running;
                self.store.save(&record)?;
                info!(
                    pid,
                    boot_time_ms = start_time.elapsed().as_millis() as u64,
                    "VM running"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(error = %e, "start failed, rolling back");
                if network_up {
                    self.network.teardown(&lease, &record.port_forwards);
                }
                record.pid = 0;
                record.state = VMState::Stopped;
                record.set_lease(previous_lease);
                if let Err(save_err) = self.store.save(&record) {
                    warn!(error = %save_err, "failed to persist rollback");
                }
                Err(e).with_context(|| format!("starting VM '{}'", name))
            }
        }
    }

    async fn bring_up(&self, record: &mut VMRecord, lease: &NetworkLease, network_up: &mut bool) -> Result<u32> {
        if !record.kernel_path.exists() {
            record.kernel_path = self.images.resolve_default_kernel()?;
        }
        record.rootfs_path = self.images.create_vm_rootfs(&record.name)?;
        self.grow_rootfs(record)?;

        for mount in &mut record.mounts {
            self.mounts.sync_mount_image(mount, &record.name)?;
        }
        self.store.save(record)?;

        self.network.setup(lease, &record.port_forwards)?;
        *network_up = true;

        let guest = self.guest_config(record)?;
        inject_guest_config(self.backends.disk.as_ref(), &record.rootfs_path, &guest)
            .context("injecting guest configuration")?;

        let launch = self.launch_config(record, lease);
        self.backends.hypervisor.start_vm(&launch).await
    }

    /// Resize the fresh rootfs copy up to `disk_mb`; a larger base image is left alone
    fn grow_rootfs(&self, record: &VMRecord) -> Result<()> {
        let image = &record.rootfs_path;
        let current_mb = fs::metadata(image)
            .with_context(|| format!("reading size of {}", image.display()))?
            .len()
            / MB;
        let wanted_mb = u64::from(record.disk_mb);
        if wanted_mb <= current_mb {
            return Ok(());
        }

        info!(vm = %record.name, from_mb = current_mb, to_mb = wanted_mb, "growing root filesystem");
        if let Err(e) = self.backends.disk.check_filesystem(image) {
            warn!(image = %image.display(), error = %e, "filesystem check failed, resizing anyway");
        }
        self.backends
            .disk
            .grow_filesystem(image, wanted_mb)
            .with_context(|| format!("growing {}", image.display()))
    }

    fn guest_config(&self, record: &VMRecord) -> Result<GuestConfig> {
        let key_path = record
            .ssh_key_path
            .as_ref()
            .or(self.config.ssh_public_key_path.as_ref());

        let ssh_public_key = match key_path {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("reading SSH public key {}", path.display()))?,
            ),
            None => None,
        };

        Ok(GuestConfig {
            hostname: record.name.clone(),
            dns_servers: self.config.dns_servers.clone(),
            ssh_public_key,
        })
    }

    fn launch_config(&self, record: &VMRecord, lease: &NetworkLease) -> LaunchConfig {
        LaunchConfig {
            vm_name: record.name.clone(),
            socket_path: record.socket_path.clone(),
            kernel_path: record.kernel_path.clone(),
            rootfs_path: record.rootfs_path.clone(),
            log_path: record.log_path.clone(),
            cpus: record.cpus,
            memory_mb: record.memory_mb,
            tap_device: Some(lease.tap_device.clone()),
            mac_address: Some(lease.mac_address.clone()),
            ip_address: Some(lease.ip_address),
            gateway: Some(lease.gateway),
            mount_drives: record
                .mounts
                .iter()
                .map(|m| MountDrive {
                    image_path: m
                        .image_path
                        .clone()
                        .unwrap_or_else(|| self.mounts.image_path(&record.name, &m.guest_tag)),
                    tag: m.guest_tag.clone(),
                    read_only: m.read_only,
                })
                .collect(),
        }
    }

    /// Stop a Running VM; anything else is a successful no-op
    ///
    /// The TAP device is released even when stopping the process failed.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn stop(&self, name: &str) -> Result<VMRecord> {
        let mut record = self.store.load(name)?;
        let was_up = matches!(record.state, VMState::Running | VMState::Starting);
        self.reconcile_and_persist(&mut record)?;

        if record.state != VMState::Running {
            // Crashed since the last command: its TAP device is still around
            if was_up {
                if let Some(lease) = record.lease() {
                    self.backends.inspector.check_admin()?;
                    self.network.teardown(&lease, &record.port_forwards);
                }
            }
            info!(state = %record.state, "VM not running, nothing to stop");
            return Ok(record);
        }

        self.backends.inspector.check_admin()?;
        info!(pid = record.pid, "stopping VM");
        let stopped = self
            .backends
            .hypervisor
            .stop_vm(&record.socket_path, record.pid)
            .await;

        if let Some(lease) = record.lease() {
            self.network.teardown(&lease, &record.port_forwards);
        }

        match stopped {
            Ok(()) => {
                record.state = VMState::Stopped;
                record.pid = 0;
                self.store.save(&record)?;
                info!("VM stopped");
                Ok(record)
            }
            Err(e) => {
                if !self.backends.hypervisor.is_running(&record.socket_path, record.pid) {
                    record.state = VMState::Stopped;
                    record.pid = 0;
                }
                self.store.save(&record)?;
                Err(e).with_context(|| format!("stopping VM '{}'", name))
            }
        }
    }

    /// Remove a stopped VM's disks and record; a missing VM is success
    #[instrument(skip(self), fields(vm = %name))]
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut record = match self.store.load(name) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.reconcile_and_persist(&mut record)?;

        if record.state == VMState::Running {
            return Err(VmmError::StateConflict {
                name: name.to_string(),
                state: record.state.to_string(),
                operation: "delete".to_string(),
            });
        }

        if let Some(lease) = record.lease() {
            if self.network.tap_exists(&lease.tap_device) {
                self.network.teardown(&lease, &record.port_forwards);
            }
        }

        self.images
            .delete_vm_rootfs(name)
            .with_context(|| format!("deleting rootfs of VM '{}'", name))?;
        self.mounts
            .delete_all_mount_images(name, &record.mounts)
            .with_context(|| format!("deleting mount images of VM '{}'", name))?;
        remove_if_exists(&record.socket_path)?;
        remove_if_exists(&record.log_path)?;
        self.store.delete(name)?;

        info!("VM deleted");
        Ok(())
    }
}
