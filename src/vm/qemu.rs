//! QEMU command-line assembly.
//!
//! Argument order is fixed: architecture defaults, memory and console,
//! snapshot, acceleration, network, firmware, then the boot disk and seed
//! image as the last two drives.

use std::fmt;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::vm::arch::{Arch, FirmwarePair};

/// Locally administered OUI used for every synthesized MAC address.
pub const LOCAL_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// Host port forwarded to the guest's SSH port in NAT mode.
pub const NAT_SSH_HOST_PORT: u16 = 2222;
pub const GUEST_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// [`LOCAL_OUI`] followed by three random octets.
    ///
    /// The generator is reseeded from the wall clock on every call. Two VMs
    /// started in the same instant may still collide.
    pub fn random_local() -> Self {
        let seed = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        let [a, b, c] = LOCAL_OUI;
        MacAddr([a, b, c, rng.random(), rng.random(), rng.random()])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// How the guest NIC reaches the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAttachment {
    /// User-mode NAT with SSH forwarded from [`NAT_SSH_HOST_PORT`].
    Nat,
    /// A host tap device already attached to a bridge.
    Tap { device: String, mac: MacAddr },
}

impl NetAttachment {
    pub fn tap(device: impl Into<String>) -> Self {
        NetAttachment::Tap {
            device: device.into(),
            mac: MacAddr::random_local(),
        }
    }
}

/// Fully resolved inputs for one VM process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub image: PathBuf,
    pub seed: PathBuf,
    pub arch: Arch,
    pub memory_mb: u32,
    /// Overrides the architecture's default core count.
    pub cpus: Option<u32>,
    pub uefi: bool,
    /// Disk writes are committed (no `-snapshot`).
    pub persistent: bool,
    pub custom_vars: Option<PathBuf>,
    pub net: NetAttachment,
}

/// A program name and its arguments, ready for the process runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl QemuCommand {
    /// Assemble the QEMU invocation for `params`.
    ///
    /// `firmware` is the staged pair and is only consulted when UEFI is on.
    pub fn build(params: &LaunchParams, accel: bool, firmware: Option<&FirmwarePair>) -> Self {
        let profile = params.arch.profile();
        // `-cpu host` needs KVM.
        let cpu = match (profile.cpu_model, accel) {
            ("host", false) => "max",
            (model, _) => model,
        };
        let cores = params.cpus.unwrap_or(profile.default_cores);

        let mut args: Vec<String> = vec![
            "-cpu".into(),
            cpu.into(),
            "-machine".into(),
            profile.machine_type.into(),
            "-smp".into(),
            cores.to_string(),
            "-m".into(),
            params.memory_mb.to_string(),
            "-nographic".into(),
        ];

        if !params.persistent {
            args.push("-snapshot".into());
        }
        if accel {
            args.push("--enable-kvm".into());
        }

        match &params.net {
            NetAttachment::Nat => {
                args.push("-netdev".into());
                args.push(format!(
                    "id=net00,type=user,hostfwd=tcp::{NAT_SSH_HOST_PORT}-:{GUEST_SSH_PORT}"
                ));
                args.push("-device".into());
                args.push("virtio-net-pci,netdev=net00".into());
            }
            NetAttachment::Tap { device, mac } => {
                args.push("-netdev".into());
                args.push(format!(
                    "tap,id=net0,ifname={device},script=no,downscript=no"
                ));
                args.push("-device".into());
                args.push(format!("e1000,netdev=net0,mac={mac}"));
            }
        }

        if let (true, Some(fw)) = (params.uefi, firmware) {
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,file={},readonly=true",
                fw.code.display()
            ));
            args.push("-drive".into());
            args.push(format!("if=pflash,format=raw,file={}", fw.vars.display()));
        }

        args.push("-drive".into());
        args.push(format!("if=virtio,format=qcow2,file={}", params.image.display()));
        args.push("-drive".into());
        args.push(format!("if=virtio,format=raw,file={}", params.seed.display()));

        QemuCommand {
            program: params.arch.qemu_binary(),
            args,
        }
    }

    /// Values of every `-drive` option, in order.
    pub fn drives(&self) -> Vec<&str> {
        self.args
            .windows(2)
            .filter(|w| w[0] == "-drive")
            .map(|w| w[1].as_str())
            .collect()
    }
}
