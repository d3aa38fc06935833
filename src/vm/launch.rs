//! Per-machine launch orchestration.
//!
//! One [`Launcher`] is shared by every machine task. A launch runs these
//! steps in order and stops at the first failure:
//!
//! 1. validate the machine and resolve its architecture
//! 2. create a private scratch directory
//! 3. resolve the boot image (explicit path or downloaded cloud image)
//! 4. build the cloud-init seed image
//! 5. allocate a tap device when the machine names a network
//! 6. stage UEFI firmware when enabled
//! 7. run QEMU until it exits
//!
//! The scratch directory is removed whatever the outcome, including when the
//! launch future is dropped or a step panics. Tap devices allocated before a
//! later failure are not released.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use crate::command::{ProcessRunner, display_command};
use crate::config::{FleetConfig, MachineSpec, NetworkSpec};
use crate::error::{IoContext, LaunchError, Result};
use crate::vm::arch::{Arch, HostCaps};
use crate::vm::firmware::FirmwareStager;
use crate::vm::image::{ImageFetcher, resolve_image};
use crate::vm::network::NetworkManager;
use crate::vm::qemu::{LaunchParams, NetAttachment, QemuCommand};
use crate::vm::seed::SeedBuilder;

pub struct Launcher {
    declared: BTreeMap<String, NetworkSpec>,
    networks: Arc<NetworkManager>,
    runner: Arc<dyn ProcessRunner>,
    fetcher: Arc<dyn ImageFetcher>,
    seeds: SeedBuilder,
    firmware: FirmwareStager,
    host: HostCaps,
    scratch_root: Option<PathBuf>,
}

impl Launcher {
    /// A launcher for the machines of `config`, probing the host once.
    pub fn new(
        config: &FleetConfig,
        networks: Arc<NetworkManager>,
        runner: Arc<dyn ProcessRunner>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            declared: config.networks.clone(),
            networks,
            seeds: SeedBuilder::new(Arc::clone(&runner)),
            runner,
            fetcher,
            firmware: FirmwareStager::from_config(config),
            host: HostCaps::detect(),
            scratch_root: None,
        }
    }

    pub fn with_host_caps(mut self, host: HostCaps) -> Self {
        self.host = host;
        self
    }

    pub fn with_firmware(mut self, firmware: FirmwareStager) -> Self {
        self.firmware = firmware;
        self
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Launch machine `name` and wait for its QEMU process to exit.
    pub async fn launch(&self, name: &str, spec: &MachineSpec) -> Result<()> {
        self.launch_inner(name, spec)
            .instrument(info_span!("launch", machine = %name))
            .await
    }

    async fn launch_inner(&self, name: &str, spec: &MachineSpec) -> Result<()> {
        spec.validate(&self.declared)?;
        let arch = self.resolve_arch(spec)?;

        let scratch = self.scratch_dir(name)?;
        debug!(scratch = %scratch.path().display(), "scratch directory created");

        let outcome = self.run_steps(spec, arch, scratch.path()).await;

        let path = scratch.path().to_path_buf();
        match scratch.close() {
            Ok(()) => debug!(scratch = %path.display(), "scratch directory removed"),
            Err(e) => warn!(scratch = %path.display(), error = %e, "failed to remove scratch directory"),
        }
        outcome
    }

    fn resolve_arch(&self, spec: &MachineSpec) -> Result<Arch> {
        match spec.arch_name() {
            Some(name) => name.parse(),
            None => self.host.arch_or_target().ok_or_else(|| {
                LaunchError::Config("`arch` is not set and the host architecture is unknown".to_string())
            }),
        }
    }

    fn scratch_dir(&self, name: &str) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("qemu-fleet-{name}-");
        builder.prefix(&prefix);
        match &self.scratch_root {
            Some(root) => builder
                .tempdir_in(root)
                .io_context("create scratch directory", root),
            None => builder
                .tempdir()
                .io_context("create scratch directory", std::env::temp_dir()),
        }
    }

    async fn run_steps(&self, spec: &MachineSpec, arch: Arch, scratch: &Path) -> Result<()> {
        let image = resolve_image(spec, arch, scratch, self.fetcher.as_ref()).await?;
        info!(image = %image.display(), arch = %arch, "boot image resolved");

        let seed = self.seeds.build(scratch, &spec.users).await?;

        let net = match spec.network_name() {
            Some(network) => {
                let device = self.networks.new_tap_device(network).await?;
                NetAttachment::tap(device)
            }
            None => NetAttachment::Nat,
        };

        let params = LaunchParams {
            image,
            seed,
            arch,
            memory_mb: spec.memory_mb()?,
            cpus: spec.cpus,
            uefi: spec.uefi,
            persistent: !spec.snapshot,
            custom_vars: spec.uefi_vars_path().map(Path::to_path_buf),
            net,
        };

        let firmware = if params.uefi {
            let persistent_image = params.persistent.then_some(params.image.as_path());
            Some(
                self.firmware
                    .stage(scratch, arch, params.custom_vars.as_deref(), persistent_image)
                    .await?,
            )
        } else {
            None
        };

        let accel = self.host.accel_for(arch);
        let cmd = QemuCommand::build(&params, accel, firmware.as_ref());
        info!(
            accel,
            snapshot = !params.persistent,
            uefi = params.uefi,
            "starting vm: {}",
            display_command(&cmd.program, &cmd.args)
        );

        self.runner.run(&cmd.program, &cmd.args).await?;
        info!("vm exited");
        Ok(())
    }
}
