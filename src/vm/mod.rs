//! Firecracker VM management module
//!
//! This module provides abstractions for managing Firecracker VMs including:
//! - VM records and their on-disk store
//! - VM configuration (boot source, drives, machine config, network)
//! - Firecracker API client
//! - Process spawning, liveness probing and shutdown
//! - The create/start/stop/delete orchestrator

pub mod config;
pub mod firecracker;
pub mod lifecycle;
pub mod manager;
pub mod process;
pub mod record;
pub mod store;

pub use config::{LaunchConfig, MountDrive};
pub use firecracker::FirecrackerClient;
pub use lifecycle::{FirecrackerProcess, Hypervisor};
pub use manager::{Backends, CreateOptions, VMManager};
pub use process::{ProcessInspector, ProcessStatus, SystemInspector};
pub use record::{Mount, NetworkLease, PortForward, Protocol, VMRecord, VMState};
pub use store::VMStore;
