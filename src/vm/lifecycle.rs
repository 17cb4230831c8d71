//! Firecracker process lifecycle
//!
//! Spawning the hypervisor, waiting for its API socket, configuring and
//! booting it, and shutting it down again. [`Hypervisor`] is the seam the
//! orchestrator drives; [`FirecrackerProcess`] is the real implementation.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::config::LaunchConfig;
use super::firecracker::FirecrackerClient;
use super::process::{is_running, ProcessInspector, ProcessStatus};
use crate::error::{Result, ResultExt, VmmError};

/// Graceful shutdown window before escalating to SIGKILL
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long Firecracker gets to create its API socket
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a SIGKILLed process gets to disappear
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Starts, stops and inspects hypervisor processes
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Launch and boot a VM; returns the pid once the process is confirmed alive
    async fn start_vm(&self, config: &LaunchConfig) -> Result<u32>;

    /// Shut a VM down; returns once the process is confirmed gone
    async fn stop_vm(&self, socket_path: &Path, pid: u32) -> Result<()>;

    fn is_running(&self, socket_path: &Path, pid: u32) -> bool;
}

/// Real Firecracker launcher
pub struct FirecrackerProcess {
    firecracker_bin: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    shutdown_timeout: Duration,
}

impl FirecrackerProcess {
    pub fn new(firecracker_bin: impl Into<PathBuf>, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            firecracker_bin: firecracker_bin.into(),
            inspector,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Configure machine, boot source, drives and network, then InstanceStart
    async fn configure_and_boot(&self, client: &FirecrackerClient, config: &LaunchConfig) -> Result<()> {
        client
            .machine_config(&config.machine_config())
            .await
            .context("configuring machine")?;

        let boot_args = config.boot_args();
        debug!(vm = %config.vm_name, boot_args = %boot_args, "boot source");
        client
            .boot_source(config.kernel_path.display().to_string(), boot_args)
            .await
            .context("configuring boot source")?;

        for drive in config.drives() {
            client
                .add_drive(&drive)
                .await
                .with_context(|| format!("attaching drive {}", drive.drive_id))?;
        }

        if let Some(iface) = config.network_interface() {
            client
                .add_network_interface(&iface)
                .await
                .with_context(|| format!("attaching network interface {}", iface.host_dev_name))?;
        }

        client.start().await.context("starting instance")
    }

    /// Poll until the inspector reports the process gone
    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inspector.exists(pid) == ProcessStatus::Dead {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn graceful_shutdown(&self, socket_path: &Path, pid: u32) -> Result<()> {
        let client = FirecrackerClient::new(socket_path);
        client.send_ctrl_alt_del().await.context("sending CtrlAltDel")?;

        if self.wait_for_exit(pid, self.shutdown_timeout).await {
            Ok(())
        } else {
            Err(VmmError::Timeout(format!(
                "graceful shutdown of pid {} exceeded {:?}",
                pid, self.shutdown_timeout
            )))
        }
    }

    async fn force_kill(&self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| VmmError::InvalidInput(format!("pid {} out of range", pid)))?;

        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                return Err(VmmError::PermissionDenied(format!(
                    "not allowed to signal Firecracker pid {}",
                    pid
                )))
            }
            Err(e) => return Err(VmmError::Io(e.into())),
        }

        if self.wait_for_exit(pid, KILL_TIMEOUT).await {
            Ok(())
        } else {
            Err(VmmError::Timeout(format!("pid {} still alive after SIGKILL", pid)))
        }
    }
}

#[async_trait]
impl Hypervisor for FirecrackerProcess {
    async fn start_vm(&self, config: &LaunchConfig) -> Result<u32> {
        if !config.kernel_path.exists() {
            return Err(VmmError::not_found_path("kernel", &config.kernel_path));
        }
        if !config.rootfs_path.exists() {
            return Err(VmmError::not_found_path("rootfs", &config.rootfs_path));
        }

        remove_stale_socket(&config.socket_path)?;

        let firecracker_bin = resolve_binary(&self.firecracker_bin)?;
        let mut child = spawn_firecracker(&firecracker_bin, &config.socket_path, &config.log_path)?;
        let pid = child.id();
        info!(vm = %config.vm_name, pid, "firecracker spawned");

        let booted = async {
            wait_for_api_socket(&config.socket_path, &mut child, SOCKET_TIMEOUT).await?;
            let client = FirecrackerClient::new(&config.socket_path);
            client.instance_info().await.context("probing Firecracker API")?;
            self.configure_and_boot(&client, config).await?;
            confirm_alive(&mut child, &config.log_path)
        }
        .await;

        if let Err(e) = booted {
            warn!(vm = %config.vm_name, pid, error = %e, "boot failed, killing firecracker");
            let _ = child.kill();
            let _ = child.wait();
            let _ = remove_stale_socket(&config.socket_path);
            return Err(e);
        }

        Ok(pid)
    }

    async fn stop_vm(&self, socket_path: &Path, pid: u32) -> Result<()> {
        if !self.is_running(socket_path, pid) {
            debug!(pid, "firecracker already gone");
            return remove_stale_socket(socket_path);
        }

        if let Err(e) = self.graceful_shutdown(socket_path, pid).await {
            warn!(pid, error = %e, "graceful shutdown failed, forcing stop");
            self.force_kill(pid).await?;
        }

        remove_stale_socket(socket_path)
    }

    fn is_running(&self, socket_path: &Path, pid: u32) -> bool {
        is_running(self.inspector.as_ref(), socket_path, pid)
    }
}

/// Spawn a Firecracker process bound to `api_socket`
///
/// The child runs in its own session so it outlives this command, with
/// stdout/stderr appended to `log_path`.
pub fn spawn_firecracker(firecracker_bin: &Path, api_socket: &Path, log_path: &Path) -> Result<Child> {
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    if let Some(dir) = api_socket.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating socket directory {}", dir.display()))?;
    }

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    // SAFETY: pre_exec runs after fork() but before exec() in the child process.
    // setsid() is async-signal-safe.
    let child = unsafe {
        Command::new(firecracker_bin)
            .arg("--api-sock")
            .arg(api_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            })
            .spawn()
    }
    .with_context(|| format!("spawning {}", firecracker_bin.display()))?;

    Ok(child)
}

/// Wait for the Firecracker API socket to appear
///
/// Fails early if the process exits before creating the socket.
pub async fn wait_for_api_socket(socket_path: &Path, child: &mut Child, timeout: Duration) -> Result<()> {
    let start_time = Instant::now();

    loop {
        if socket_path.exists() {
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            return Err(VmmError::ExternalToolFailure {
                tool: "firecracker".to_string(),
                status: status.to_string(),
                output: "exited before creating its API socket".to_string(),
            });
        }

        if start_time.elapsed() > timeout {
            return Err(VmmError::Timeout(format!(
                "Firecracker API socket {} not ready after {:?}",
                socket_path.display(),
                timeout
            )));
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The process must still be running after InstanceStart
fn confirm_alive(child: &mut Child, log_path: &Path) -> Result<()> {
    match child.try_wait()? {
        None => Ok(()),
        Some(status) => Err(VmmError::ExternalToolFailure {
            tool: "firecracker".to_string(),
            status: status.to_string(),
            output: tail_file(log_path, 20),
        }),
    }
}

/// Remove a socket left behind by a crashed instance; absent is fine
pub fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    match fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing socket {}", socket_path.display())),
    }
}

/// Configured path if it exists, else `firecracker` on `$PATH`
pub fn resolve_binary(configured: &Path) -> Result<PathBuf> {
    if configured.is_file() {
        return Ok(configured.to_path_buf());
    }

    let name = configured
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("firecracker"));

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            VmmError::NotFound(format!(
                "firecracker binary at {} or in PATH",
                configured.display()
            ))
        })
}

fn tail_file(path: &Path, lines: usize) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
