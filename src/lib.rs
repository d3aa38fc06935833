//! qemu-fleet: launch a declared set of QEMU virtual machines on one host.
//!
//! A TOML (or YAML) file declares machines and bridged networks. At startup
//! every network gets a host bridge; every machine then launches concurrently
//! with its own scratch directory, cloud-init seed image, optional tap device
//! and optional per-VM UEFI firmware.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod supervisor;
pub mod vm;

pub use error::{LaunchError, Result};
