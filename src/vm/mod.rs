//! Virtual machine launching for qemu-fleet.
//!
//! Provides host bridge and tap management, per-VM UEFI firmware staging,
//! cloud-init seed images, boot-image resolution, QEMU argument assembly and
//! the per-machine launch sequence that ties them together.

pub mod arch;
pub mod firmware;
pub mod image;
pub mod launch;
pub mod network;
pub mod qemu;
pub mod seed;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use arch::{Arch, FirmwarePair, HostCaps};
pub use firmware::FirmwareStager;
pub use image::{HttpFetcher, ImageFetcher};
pub use launch::Launcher;
pub use network::NetworkManager;
pub use qemu::{LaunchParams, NetAttachment, QemuCommand};
pub use seed::SeedBuilder;
