//! In-process fakes for the host-facing seams of `VMManager`
//!
//! Images are plain sparse files; what a loop mount would show is kept in
//! a per-image directory the fake owns, copied into the mount point on
//! `mount` and back on `unmount`.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use vmm::mount::DiskBackend;
use vmm::network::HostNetwork;
use vmm::vm::process::is_running;
use vmm::vm::{Hypervisor, LaunchConfig, PortForward, ProcessInspector, ProcessStatus};
use vmm::{Backends, Config, Paths, Result, VMManager, VmmError};

const MB: u64 = 1024 * 1024;

// ─── Disk ──────────────────────────────────────────────────────────────────

pub struct FakeDisk {
    contents: TempDir,
    mounted: Mutex<HashMap<PathBuf, PathBuf>>,
    pub fail_copy: AtomicBool,
    /// Fail only copies out of this host directory
    pub fail_copy_from: Mutex<Option<PathBuf>>,
}

impl FakeDisk {
    pub fn new() -> Self {
        Self {
            contents: tempfile::tempdir().unwrap(),
            mounted: Mutex::new(HashMap::new()),
            fail_copy: AtomicBool::new(false),
            fail_copy_from: Mutex::new(None),
        }
    }

    /// Directory holding what the filesystem in `image` contains
    pub fn contents_of(&self, image: &Path) -> PathBuf {
        let key = image.to_string_lossy().replace('/', "_");
        self.contents.path().join(key)
    }

    pub fn read_file(&self, image: &Path, rel: &str) -> Option<String> {
        fs::read_to_string(self.contents_of(image).join(rel)).ok()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }
}

impl DiskBackend for FakeDisk {
    fn create_filesystem(&self, image: &Path, size_mb: u64, _label: &str) -> Result<()> {
        File::create(image)?.set_len(size_mb * MB)?;
        let contents = self.contents_of(image);
        let _ = fs::remove_dir_all(&contents);
        fs::create_dir_all(contents.join("lost+found"))?;
        Ok(())
    }

    fn mount(&self, image: &Path, mount_point: &Path) -> Result<()> {
        if !image.exists() {
            return Err(VmmError::not_found_path("image", image));
        }
        let contents = self.contents_of(image);
        fs::create_dir_all(&contents)?;
        copy_tree(&contents, mount_point)?;
        self.mounted
            .lock()
            .unwrap()
            .insert(mount_point.to_path_buf(), image.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let image = self
            .mounted
            .lock()
            .unwrap()
            .remove(mount_point)
            .ok_or_else(|| VmmError::InvalidInput(format!("{} is not mounted", mount_point.display())))?;
        let contents = self.contents_of(&image);
        fs::remove_dir_all(&contents)?;
        fs::create_dir_all(&contents)?;
        copy_tree(mount_point, &contents)?;
        for entry in fs::read_dir(mount_point)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn check_filesystem(&self, _image: &Path) -> Result<()> {
        Ok(())
    }

    fn grow_filesystem(&self, image: &Path, new_size_mb: u64) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .open(image)?
            .set_len(new_size_mb * MB)?;
        Ok(())
    }

    fn archive_copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let from_failing_dir = self.fail_copy_from.lock().unwrap().as_deref() == Some(src);
        if self.fail_copy.load(Ordering::SeqCst) || from_failing_dir {
            return Err(VmmError::ExternalToolFailure {
                tool: "tar".to_string(),
                status: "exit status: 2".to_string(),
                output: "tar: write error: No space left on device".to_string(),
            });
        }
        copy_tree(src, dst)
    }
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ─── Network ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct NetState {
    pub bridges: BTreeSet<String>,
    pub nat: bool,
    pub taps: BTreeSet<String>,
    pub forwards: Vec<(Ipv4Addr, PortForward)>,
}

#[derive(Default)]
pub struct FakeNetwork {
    pub state: Mutex<NetState>,
    pub fail_delete_tap: AtomicBool,
}

impl FakeNetwork {
    pub fn taps(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().taps.clone()
    }

    pub fn forward_count(&self) -> usize {
        self.state.lock().unwrap().forwards.len()
    }
}

impl HostNetwork for FakeNetwork {
    fn default_route_interface(&self) -> Result<String> {
        Ok("eth0".to_string())
    }

    fn ensure_bridge(&self, bridge: &str, _gateway: Ipv4Addr, _prefix: u8) -> Result<()> {
        self.state.lock().unwrap().bridges.insert(bridge.to_string());
        Ok(())
    }

    fn ensure_nat(&self, _bridge: &str, _subnet: &str, _out_iface: &str) -> Result<()> {
        self.state.lock().unwrap().nat = true;
        Ok(())
    }

    fn create_tap(&self, tap: &str, _bridge: &str) -> Result<()> {
        self.state.lock().unwrap().taps.insert(tap.to_string());
        Ok(())
    }

    fn delete_tap(&self, tap: &str) -> Result<()> {
        if self.fail_delete_tap.load(Ordering::SeqCst) {
            return Err(VmmError::ExternalToolFailure {
                tool: "ip link delete".to_string(),
                status: "exit status: 2".to_string(),
                output: "RTNETLINK answers: Device or resource busy".to_string(),
            });
        }
        self.state.lock().unwrap().taps.remove(tap);
        Ok(())
    }

    fn tap_exists(&self, tap: &str) -> bool {
        self.state.lock().unwrap().taps.contains(tap)
    }

    fn add_port_forward(&self, _out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()> {
        self.state.lock().unwrap().forwards.push((guest_ip, *forward));
        Ok(())
    }

    fn remove_port_forward(&self, _out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .forwards
            .retain(|(ip, f)| !(*ip == guest_ip && f == forward));
        Ok(())
    }
}

// ─── Processes ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeInspector {
    alive: Mutex<HashSet<u32>>,
    pub deny_admin: AtomicBool,
}

impl FakeInspector {
    pub fn spawn(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    /// The process died without the manager noticing
    pub fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessInspector for FakeInspector {
    fn exists(&self, pid: u32) -> ProcessStatus {
        if self.alive.lock().unwrap().contains(&pid) {
            ProcessStatus::Alive
        } else {
            ProcessStatus::Dead
        }
    }

    fn current_privileged_user(&self) -> Option<String> {
        None
    }

    fn check_admin(&self) -> Result<()> {
        if self.deny_admin.load(Ordering::SeqCst) {
            return Err(VmmError::PermissionDenied("CAP_NET_ADMIN is required".to_string()));
        }
        Ok(())
    }
}

pub struct FakeHypervisor {
    inspector: Arc<FakeInspector>,
    next_pid: AtomicU32,
    pub fail_start: AtomicBool,
    pub launches: Mutex<Vec<LaunchConfig>>,
}

impl FakeHypervisor {
    pub fn new(inspector: Arc<FakeInspector>) -> Self {
        Self {
            inspector,
            next_pid: AtomicU32::new(40_000),
            fail_start: AtomicBool::new(false),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn last_launch(&self) -> Option<LaunchConfig> {
        self.launches.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn start_vm(&self, config: &LaunchConfig) -> Result<u32> {
        self.launches.lock().unwrap().push(config.clone());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(VmmError::Api {
                endpoint: "/actions".to_string(),
                status: 400,
                body: "{\"fault_message\":\"Invalid kernel\"}".to_string(),
            });
        }

        if let Some(parent) = config.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&config.socket_path)?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.inspector.spawn(pid);
        Ok(pid)
    }

    async fn stop_vm(&self, socket_path: &Path, pid: u32) -> Result<()> {
        self.inspector.kill(pid);
        let _ = fs::remove_file(socket_path);
        Ok(())
    }

    fn is_running(&self, socket_path: &Path, pid: u32) -> bool {
        is_running(self.inspector.as_ref(), socket_path, pid)
    }
}

// ─── Harness ───────────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub paths: Paths,
    pub disk: Arc<FakeDisk>,
    pub network: Arc<FakeNetwork>,
    pub inspector: Arc<FakeInspector>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub manager: VMManager,
}

impl Harness {
    /// Fresh base directory with a default kernel and rootfs installed
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("vmm"));
        paths.ensure().unwrap();

        fs::write(paths.kernels_dir().join("vmlinux.bin"), b"kernel").unwrap();
        File::create(paths.rootfs_dir().join("rootfs.ext4"))
            .unwrap()
            .set_len(4 * MB)
            .unwrap();

        let disk = Arc::new(FakeDisk::new());
        let network = Arc::new(FakeNetwork::default());
        let inspector = Arc::new(FakeInspector::default());
        let hypervisor = Arc::new(FakeHypervisor::new(inspector.clone()));

        let backends = Backends {
            disk: disk.clone(),
            network: network.clone(),
            hypervisor: hypervisor.clone(),
            inspector: inspector.clone(),
        };
        let manager = VMManager::new(paths.clone(), config, backends);

        Self {
            dir,
            paths,
            disk,
            network,
            inspector,
            hypervisor,
            manager,
        }
    }

    /// A host directory with `files` of the given sizes in bytes
    pub fn host_dir(&self, name: &str, files: &[(&str, u64)]) -> PathBuf {
        let dir = self.dir.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, size) in files {
            File::create(dir.join(file)).unwrap().set_len(*size).unwrap();
        }
        dir
    }
}
