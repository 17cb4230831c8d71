//! Process inspection and state reconciliation
//!
//! No daemon watches the Firecracker processes, so a record's `state` is
//! only as fresh as the last command that wrote it. Before any operation
//! branches on state, [`reconcile`] recomputes it from two independent
//! signals:
//!
//! 1. the API socket file exists
//! 2. a null signal to the recorded pid does not report "no such process"
//!
//! A permission-denied liveness check counts as alive: the process exists but runs
//! at a different privilege level (root-launched Firecracker checked by a
//! regular user).
//!
//! Known gap: after a crash the pid may be reused by an unrelated process
//! while a stale socket file remains. Socket presence is necessary but not
//! sufficient; `stop` removes the socket once the process is confirmed gone
//! so later reads converge on Stopped.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::record::{VMRecord, VMState};
use crate::error::{Result, VmmError};

/// Outcome of probing a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive,
    Dead,
    /// Exists, but owned by another privilege level
    Unauthorized,
}

/// Capability seam over the host's process table and privileges
pub trait ProcessInspector: Send + Sync {
    fn exists(&self, pid: u32) -> ProcessStatus;

    /// The real user behind a privileged invocation (`SUDO_USER`), if any
    fn current_privileged_user(&self) -> Option<String>;

    /// Fail with `PermissionDenied` if the host operations of start/stop
    /// (TAP devices, iptables, loop mounts) are not permitted
    fn check_admin(&self) -> Result<()>;
}

/// Real inspector: `kill(pid, 0)` and the process capability sets
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    fn exists(&self, pid: u32) -> ProcessStatus {
        let Ok(raw) = i32::try_from(pid) else {
            return ProcessStatus::Dead;
        };
        if raw <= 0 {
            return ProcessStatus::Dead;
        }

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => ProcessStatus::Alive,
            Err(Errno::EPERM) => ProcessStatus::Unauthorized,
            Err(_) => ProcessStatus::Dead,
        }
    }

    fn current_privileged_user(&self) -> Option<String> {
        std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty())
    }

    fn check_admin(&self) -> Result<()> {
        for cap in [caps::Capability::CAP_NET_ADMIN, caps::Capability::CAP_SYS_ADMIN] {
            let held = caps::has_cap(None, caps::CapSet::Effective, cap).map_err(|e| {
                VmmError::PermissionDenied(format!("unable to read capabilities: {}", e))
            })?;
            if !held {
                return Err(VmmError::PermissionDenied(format!(
                    "{} is required to manage TAP devices, iptables rules and loop mounts (run with sudo)",
                    cap
                )));
            }
        }
        Ok(())
    }
}

/// Liveness: socket present AND the pid check does not say dead
pub fn is_running(inspector: &dyn ProcessInspector, socket_path: &Path, pid: u32) -> bool {
    if !socket_path.exists() {
        return false;
    }
    if pid == 0 {
        return false;
    }

    match inspector.exists(pid) {
        ProcessStatus::Alive | ProcessStatus::Unauthorized => true,
        ProcessStatus::Dead => false,
    }
}

/// Recompute `record.state` from the live process. Returns true if it changed.
///
/// Running or Starting without a live process becomes Stopped. Created and
/// Stopped are left alone when nothing is running.
pub fn reconcile(inspector: &dyn ProcessInspector, record: &mut VMRecord) -> bool {
    let before = record.state;

    if is_running(inspector, &record.socket_path, record.pid) {
        record.state = VMState::Running;
    } else if matches!(record.state, VMState::Running | VMState::Starting) {
        record.state = VMState::Stopped;
        record.pid = 0;
    }

    record.state != before
}
