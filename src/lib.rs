//! vmm - a single-host manager for Firecracker microVMs
//!
//! Each command is a short-lived process: state lives in one JSON record
//! per VM and is reconciled against the host (process liveness, API
//! socket) on every read.
//!
//! # Modules
//!
//! - `vm` - records, Firecracker launch/stop and the lifecycle orchestrator
//! - `image` - kernel and base rootfs storage, per-VM rootfs copies
//! - `mount` - host directories exported to guests as ext4 images
//! - `network` - IP leases, bridge, TAP devices and NAT
//! - `guest` - hostname/DNS/SSH configuration written into the rootfs
//! - `config` - settings file and on-disk layout
//! - `tracing` - logging and optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use vmm::{Backends, Config, CreateOptions, Paths, VMManager};
//!
//! let paths = Paths::new(vmm::config::default_base_dir());
//! let config = Config::load(&paths.base)?;
//! let manager = VMManager::new(paths, config.clone(), Backends::system(&config));
//!
//! manager.create("t1", CreateOptions::default())?;
//! let vm = manager.start("t1").await?;
//! ```

pub mod config;
pub mod error;
pub mod guest;
pub mod image;
pub mod mount;
pub mod network;
pub mod tracing;
pub mod vm;

pub use config::{Config, Paths};
pub use error::{Result, VmmError};
pub use vm::{Backends, CreateOptions, VMManager, VMRecord, VMState};
