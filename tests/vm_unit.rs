//! Launch-sequence tests against the library API.
//!
//! These tests run the real orchestration code with a recording process
//! runner, so nothing is executed on the host: no bridges are created, no
//! QEMU is started and no image is downloaded. They need no root, no KVM and
//! no firmware packages, and run as part of the standard `cargo test`
//! invocation with no feature flags required.
//!
//! Tested in this file:
//! - end-to-end aarch64 UEFI launch: both pflash drives live in the scratch
//!   directory and have the fixed size while QEMU runs
//! - x86_64 UEFI launch leaves the firmware template byte-for-byte unchanged
//! - scratch directories are gone after success and after failure
//! - concurrent machines on one network receive distinct tap devices

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use qemu_fleet::command::{ProcessRunner, RecordingRunner};
use qemu_fleet::config::{FleetConfig, MachineSpec, UserSpec};
use qemu_fleet::supervisor::Supervisor;
use qemu_fleet::vm::arch::FIXED_VARS_SIZE;
use qemu_fleet::vm::image::ImageFetcher;
use qemu_fleet::vm::{Arch, FirmwarePair, FirmwareStager, HostCaps, Launcher, NetworkManager};
use qemu_fleet::{LaunchError, Result};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fails every download; tests always name an explicit image.
struct OfflineFetcher;

#[async_trait]
impl ImageFetcher for OfflineFetcher {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<()> {
        Err(LaunchError::Download(format!("{url}: offline")))
    }
}

/// Records commands and, when QEMU is started, the size of every pflash
/// image it was handed, read while the scratch directory still exists.
#[derive(Clone, Default)]
struct InspectingRunner {
    inner: RecordingRunner,
    pflash_sizes: Arc<Mutex<Vec<(PathBuf, u64)>>>,
}

#[async_trait]
impl ProcessRunner for InspectingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        if program.starts_with("qemu-system-") {
            for path in pflash_files(args) {
                let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                self.pflash_sizes.lock().unwrap().push((path, len));
            }
        }
        self.inner.run(program, args).await
    }
}

fn pflash_files(args: &[String]) -> Vec<PathBuf> {
    args.iter()
        .filter_map(|a| a.strip_prefix("if=pflash,format=raw,file="))
        .map(|rest| PathBuf::from(rest.trim_end_matches(",readonly=true")))
        .collect()
}

struct Fleet {
    dir: tempfile::TempDir,
    template: FirmwarePair,
}

impl Fleet {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        let template = FirmwarePair::new(dir.path().join("CODE.fd"), dir.path().join("VARS.fd"));
        std::fs::write(&template.code, vec![0xEF; 2 * 1024 * 1024]).unwrap();
        std::fs::write(&template.vars, vec![0x11; 128 * 1024]).unwrap();
        Self { dir, template }
    }

    fn scratch_root(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn image(&self, name: &str) -> PathBuf {
        self.dir.path().join("images").join(name)
    }

    fn launcher(&self, config: &FleetConfig, runner: Arc<dyn ProcessRunner>) -> (Launcher, Arc<NetworkManager>) {
        let networks = Arc::new(NetworkManager::new(Arc::clone(&runner)));
        let stager = FirmwareStager::default()
            .with_template(Arch::X86_64, self.template.clone())
            .with_template(Arch::Aarch64, self.template.clone());
        let launcher = Launcher::new(config, Arc::clone(&networks), runner, Arc::new(OfflineFetcher))
            .with_host_caps(HostCaps::emulation_only())
            .with_firmware(stager)
            .with_scratch_root(self.scratch_root());
        (launcher, networks)
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch_root()).unwrap().next().is_none()
    }
}

fn uefi_machine(image: &Path, arch: &str) -> MachineSpec {
    MachineSpec {
        image: Some(image.to_path_buf()),
        arch: Some(arch.to_string()),
        uefi: true,
        snapshot: true,
        users: BTreeMap::from([(
            "default".to_string(),
            UserSpec {
                password: Some("passw0rd".to_string()),
                ..Default::default()
            },
        )]),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Firmware through the full launch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aarch64_uefi_launch_uses_private_fixed_size_pflash() {
    let fleet = Fleet::new();
    let runner = InspectingRunner::default();
    let (launcher, _) = fleet.launcher(&FleetConfig::default(), Arc::new(runner.clone()));

    let spec = uefi_machine(&fleet.image("arm.qcow2"), "aarch64");
    launcher.launch("arm", &spec).await.unwrap();

    let qemu = runner.inner.calls_to("qemu-system-aarch64");
    assert_eq!(qemu.len(), 1);
    let pflash = pflash_files(&qemu[0].args);
    assert_eq!(pflash.len(), 2, "code and vars drives expected");
    for path in &pflash {
        assert!(
            path.starts_with(fleet.scratch_root()),
            "{} is outside the scratch directory",
            path.display()
        );
        assert_ne!(path, &fleet.template.vars);
        assert_ne!(path, &fleet.template.code);
    }

    let sizes = runner.pflash_sizes.lock().unwrap().clone();
    assert_eq!(sizes.len(), 2);
    assert!(sizes.iter().all(|(_, len)| *len == FIXED_VARS_SIZE), "got {sizes:?}");

    assert!(fleet.scratch_is_empty(), "scratch directory must be removed");
}

#[tokio::test]
async fn x86_64_uefi_launch_leaves_template_untouched() {
    let fleet = Fleet::new();
    let before = std::fs::read(&fleet.template.vars).unwrap();
    let runner = InspectingRunner::default();
    let (launcher, _) = fleet.launcher(&FleetConfig::default(), Arc::new(runner.clone()));

    let spec = uefi_machine(&fleet.image("pc.qcow2"), "x86_64");
    launcher.launch("pc", &spec).await.unwrap();

    let qemu = &runner.inner.calls_to("qemu-system-x86_64")[0];
    let pflash = pflash_files(&qemu.args);
    assert_eq!(pflash[0], fleet.template.code, "code is the shared read-only template");
    assert!(pflash[1].starts_with(fleet.scratch_root()));
    assert!(qemu.args.iter().any(|a| a.ends_with(",readonly=true")));

    assert_eq!(std::fs::read(&fleet.template.vars).unwrap(), before);
}

// ---------------------------------------------------------------------------
// Scratch directory lifetime
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scratch_is_removed_after_success_and_failure() {
    let fleet = Fleet::new();
    let spec = uefi_machine(&fleet.image("a.qcow2"), "aarch64");

    let ok: Arc<dyn ProcessRunner> = Arc::new(RecordingRunner::new());
    let (launcher, _) = fleet.launcher(&FleetConfig::default(), ok);
    launcher.launch("ok", &spec).await.unwrap();
    assert!(fleet.scratch_is_empty());

    let failing: Arc<dyn ProcessRunner> = Arc::new(RecordingRunner::failing("qemu-system"));
    let (launcher, _) = fleet.launcher(&FleetConfig::default(), failing);
    assert!(launcher.launch("bad", &spec).await.is_err());
    assert!(fleet.scratch_is_empty());
}

#[tokio::test]
async fn seed_tool_failure_aborts_launch_and_cleans_up() {
    let fleet = Fleet::new();
    let runner = RecordingRunner::failing("cloud-localds");
    let (launcher, _) = fleet.launcher(&FleetConfig::default(), Arc::new(runner.clone()));

    let err = launcher
        .launch("seedless", &uefi_machine(&fleet.image("s.qcow2"), "x86_64"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::SeedTool(_)), "got {err:?}");
    assert!(runner.calls_to("qemu-system-x86_64").is_empty());
    assert!(fleet.scratch_is_empty());
}

// ---------------------------------------------------------------------------
// Networking through the supervisor
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn machines_on_one_network_get_distinct_taps() {
    let fleet = Fleet::new();
    let mut config = FleetConfig::from_toml_str("[networks.lan]\ntype = \"bridge\"\n").unwrap();
    for i in 0..6 {
        config.machines.insert(
            format!("vm{i}"),
            MachineSpec {
                image: Some(fleet.image(&format!("vm{i}.qcow2"))),
                arch: Some("x86_64".to_string()),
                network: Some("lan".to_string()),
                ..Default::default()
            },
        );
    }

    let runner = RecordingRunner::new();
    let (launcher, networks) = fleet.launcher(&config, Arc::new(runner.clone()));
    let report = Supervisor::new(Arc::clone(&networks), Arc::new(launcher))
        .run(&config, &[])
        .await
        .unwrap();
    assert_eq!(report.succeeded().len(), 6);

    let mut taps = networks.taps("lan").await.unwrap();
    taps.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("qfleetlantap{i}")).collect();
    assert_eq!(taps, expected);

    let mut ifnames: Vec<String> = runner
        .calls_to("qemu-system-x86_64")
        .iter()
        .flat_map(|c| c.args.iter())
        .filter_map(|a| a.strip_prefix("tap,id=net0,ifname="))
        .map(|rest| rest.split(',').next().unwrap_or_default().to_string())
        .collect();
    ifnames.sort();
    assert_eq!(ifnames, expected, "each VM must be handed its own tap");
    assert!(fleet.scratch_is_empty());
}
