//! Guest architectures and everything that varies by architecture.
//!
//! Every per-architecture decision (QEMU defaults, firmware templates,
//! variable-store layout, distro image label) is read from [`Arch::profile`]
//! so no other module matches on architecture names.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LaunchError;

/// Size of the blank variable store required by fixed-size architectures.
pub const FIXED_VARS_SIZE: u64 = 64 * 1024 * 1024;

/// Presence of this directory means the KVM module is loaded.
pub const KVM_MODULE_PATH: &str = "/sys/module/kvm";

/// Device node QEMU opens when acceleration is enabled.
pub const KVM_DEVICE_PATH: &str = "/dev/kvm";

/// Supported guest architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

/// Paths of a read-only boot-code image and a variable-store image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwarePair {
    pub code: PathBuf,
    pub vars: PathBuf,
}

impl FirmwarePair {
    pub fn new(code: impl Into<PathBuf>, vars: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            vars: vars.into(),
        }
    }
}

/// How the firmware variable store must be prepared for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarsLayout {
    /// Blank, zero-filled image of exactly this many bytes; the boot code is
    /// padded to the same size.
    FixedSize(u64),
    /// Regular file the firmware rewrites in place; a private copy of the
    /// template is enough.
    InPlace,
}

/// Associated data for one architecture.
#[derive(Debug, Clone, Copy)]
pub struct ArchProfile {
    pub cpu_model: &'static str,
    pub machine_type: &'static str,
    pub default_cores: u32,
    pub firmware_code: &'static str,
    pub firmware_vars: &'static str,
    pub vars_layout: VarsLayout,
    /// Architecture label used in Ubuntu cloud image file names.
    pub distro_label: &'static str,
}

const X86_64_PROFILE: ArchProfile = ArchProfile {
    cpu_model: "host",
    machine_type: "q35",
    default_cores: 4,
    firmware_code: "/usr/share/OVMF/OVMF_CODE_4M.secboot.fd",
    firmware_vars: "/usr/share/OVMF/OVMF_VARS_4M.ms.fd",
    vars_layout: VarsLayout::InPlace,
    distro_label: "amd64",
};

const AARCH64_PROFILE: ArchProfile = ArchProfile {
    cpu_model: "max",
    machine_type: "virt",
    default_cores: 4,
    firmware_code: "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    firmware_vars: "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    vars_layout: VarsLayout::FixedSize(FIXED_VARS_SIZE),
    distro_label: "arm64",
};

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::X86_64, Arch::Aarch64];

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    pub fn profile(self) -> &'static ArchProfile {
        match self {
            Arch::X86_64 => &X86_64_PROFILE,
            Arch::Aarch64 => &AARCH64_PROFILE,
        }
    }

    /// The canonical firmware template shipped by the host distribution.
    pub fn firmware_template(self) -> FirmwarePair {
        let p = self.profile();
        FirmwarePair::new(p.firmware_code, p.firmware_vars)
    }

    /// Name of the architecture-qualified QEMU binary.
    pub fn qemu_binary(self) -> String {
        format!("qemu-system-{}", self.as_str())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(LaunchError::UnsupportedArch(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Host detection
// ---------------------------------------------------------------------------

/// The host machine name as reported by `uname(2)` (e.g. `x86_64`).
///
/// Read once per process.
pub fn host_machine() -> Option<&'static str> {
    static MACHINE: OnceLock<Option<String>> = OnceLock::new();
    MACHINE.get_or_init(read_uname_machine).as_deref()
}

fn read_uname_machine() -> Option<String> {
    let uts = nix::sys::utsname::uname().ok()?;
    Some(uts.machine().to_string_lossy().into_owned())
}

/// What the host offers for hardware acceleration.
///
/// The module check is a filesystem existence test, not a capability check,
/// so it is only a hint. `kvm_device_usable` adds an open(2) of the device
/// node so a permission problem downgrades to emulation instead of failing
/// the QEMU start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps {
    pub arch: Option<Arch>,
    pub kvm_module: bool,
    pub kvm_device_usable: bool,
}

impl HostCaps {
    pub fn detect() -> Self {
        let arch = host_machine().and_then(|m| m.parse().ok());
        let kvm_module = Path::new(KVM_MODULE_PATH).exists();
        let kvm_device_usable = kvm_module
            && std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(KVM_DEVICE_PATH)
                .is_ok();
        debug!(?arch, kvm_module, kvm_device_usable, "detected host capabilities");
        Self {
            arch,
            kvm_module,
            kvm_device_usable,
        }
    }

    /// Host capabilities that never allow acceleration.
    pub fn emulation_only() -> Self {
        Self {
            arch: None,
            kvm_module: false,
            kvm_device_usable: false,
        }
    }

    /// Whether a VM of `vm_arch` should be started with acceleration.
    pub fn accel_for(&self, vm_arch: Arch) -> bool {
        if self.arch != Some(vm_arch) || !self.kvm_module {
            return false;
        }
        if !self.kvm_device_usable {
            warn!(
                arch = %vm_arch,
                "{KVM_MODULE_PATH} exists but {KVM_DEVICE_PATH} is not usable, falling back to emulation"
            );
            return false;
        }
        true
    }

    /// Host architecture, falling back to the compile-time target.
    pub fn arch_or_target(&self) -> Option<Arch> {
        self.arch.or_else(|| std::env::consts::ARCH.parse().ok())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_arches_and_aliases() {
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
    }

    #[test]
    fn unknown_arch_is_unsupported() {
        let err = "riscv64".parse::<Arch>().unwrap_err();
        assert!(matches!(err, LaunchError::UnsupportedArch(ref a) if a == "riscv64"));
    }

    #[test]
    fn profiles_match_firmware_layouts() {
        assert_eq!(Arch::X86_64.profile().vars_layout, VarsLayout::InPlace);
        assert_eq!(
            Arch::Aarch64.profile().vars_layout,
            VarsLayout::FixedSize(64 * 1024 * 1024)
        );
        assert_eq!(Arch::Aarch64.qemu_binary(), "qemu-system-aarch64");
        assert_eq!(Arch::X86_64.profile().distro_label, "amd64");
    }

    #[test]
    fn accel_requires_matching_arch_and_kvm() {
        let caps = HostCaps {
            arch: Some(Arch::X86_64),
            kvm_module: true,
            kvm_device_usable: true,
        };
        assert!(caps.accel_for(Arch::X86_64));
        assert!(!caps.accel_for(Arch::Aarch64));

        let no_module = HostCaps {
            kvm_module: false,
            ..caps
        };
        assert!(!no_module.accel_for(Arch::X86_64));
    }

    #[test]
    fn unusable_kvm_device_falls_back_to_emulation() {
        let caps = HostCaps {
            arch: Some(Arch::Aarch64),
            kvm_module: true,
            kvm_device_usable: false,
        };
        assert!(!caps.accel_for(Arch::Aarch64));
    }

    #[test]
    fn host_machine_is_stable() {
        assert_eq!(host_machine(), host_machine());
    }

    #[test]
    fn host_machine_matches_build_target() {
        let machine = host_machine().expect("uname succeeds on linux");
        assert!(!machine.is_empty());
        assert!(!machine.contains('\0'));
        if let Ok(arch) = machine.parse::<Arch>() {
            assert_eq!(arch.to_string(), std::env::consts::ARCH);
        }
    }
}
