//! Per-VM UEFI firmware staging.
//!
//! QEMU needs two pflash images: read-only boot code and a writable
//! variable store. The distribution ships one canonical template per
//! architecture that every VM shares, so a VM must never be handed the
//! template itself as its writable store:
//!
//! ```text
//! fixed-size (aarch64)                     in-place (x86_64)
//! ───────────────────                      ─────────────────
//! scratch/UEFI_CODE.img  64 MiB, template  template code (read-only, shared)
//!                        written at 0
//! scratch/UEFI_VARS.img  64 MiB, zeroes    scratch/UEFI_VARS.img  copy of template vars
//! ```
//!
//! With persistent disks (snapshot mode off) the variable store is instead
//! kept next to the disk image as `EFI_VARS.fd`, so boot-order changes made
//! by the guest survive relaunches of the same disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::error::{IoContext, LaunchError, Result};
use crate::vm::arch::{Arch, FirmwarePair, VarsLayout};

/// Variable store kept next to a persistent disk image.
pub const SIDECAR_VARS_NAME: &str = "EFI_VARS.fd";

const STAGED_CODE_NAME: &str = "UEFI_CODE.img";
const STAGED_VARS_NAME: &str = "UEFI_VARS.img";

/// Location of the persistent variable store for `image`.
pub fn sidecar_vars_path(image: &Path) -> PathBuf {
    match image.parent() {
        Some(dir) => dir.join(SIDECAR_VARS_NAME),
        None => PathBuf::from(SIDECAR_VARS_NAME),
    }
}

/// Produces per-VM firmware images from the canonical templates.
#[derive(Debug, Clone)]
pub struct FirmwareStager {
    templates: HashMap<Arch, FirmwarePair>,
}

impl Default for FirmwareStager {
    fn default() -> Self {
        Self {
            templates: Arch::ALL
                .iter()
                .map(|arch| (*arch, arch.firmware_template()))
                .collect(),
        }
    }
}

impl FirmwareStager {
    /// Templates from the configuration, falling back to the distribution paths.
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            templates: Arch::ALL
                .iter()
                .map(|arch| (*arch, config.firmware_template(*arch)))
                .collect(),
        }
    }

    pub fn with_template(mut self, arch: Arch, template: FirmwarePair) -> Self {
        self.templates.insert(arch, template);
        self
    }

    pub fn template(&self, arch: Arch) -> FirmwarePair {
        self.templates
            .get(&arch)
            .cloned()
            .unwrap_or_else(|| arch.firmware_template())
    }

    /// Stage firmware for one VM inside `scratch`.
    ///
    /// `custom_vars` replaces the template as the source of the variable
    /// store. `persistent_image` is the boot disk when its writes are kept;
    /// without a custom store, the variable store then lives next to that
    /// disk: an existing sidecar is reused as-is, otherwise the freshly
    /// staged store is copied there.
    pub async fn stage(
        &self,
        scratch: &Path,
        arch: Arch,
        custom_vars: Option<&Path>,
        persistent_image: Option<&Path>,
    ) -> Result<FirmwarePair> {
        let template = self.template(arch);
        let vars_source = custom_vars.unwrap_or(template.vars.as_path());

        let mut staged = match arch.profile().vars_layout {
            VarsLayout::FixedSize(size) => {
                stage_fixed_size(scratch, &template.code, custom_vars, size).await?
            }
            VarsLayout::InPlace => stage_in_place(scratch, &template.code, vars_source).await?,
        };

        if let (Some(image), None) = (persistent_image, custom_vars) {
            let sidecar = sidecar_vars_path(image);
            if fs::try_exists(&sidecar)
                .await
                .io_context("check firmware vars sidecar", &sidecar)?
            {
                info!(vars = %sidecar.display(), "reusing persistent firmware vars");
            } else {
                fs::copy(&staged.vars, &sidecar)
                    .await
                    .io_context("write firmware vars sidecar", &sidecar)?;
                info!(vars = %sidecar.display(), "created persistent firmware vars");
            }
            staged.vars = sidecar;
        }

        debug!(
            arch = %arch,
            code = %staged.code.display(),
            vars = %staged.vars.display(),
            "firmware staged"
        );
        Ok(staged)
    }
}

/// Blank store plus padded boot code, both exactly `size` bytes.
async fn stage_fixed_size(
    scratch: &Path,
    template_code: &Path,
    custom_vars: Option<&Path>,
    size: u64,
) -> Result<FirmwarePair> {
    let vars = scratch.join(STAGED_VARS_NAME);
    create_zeroed(&vars, size).await?;
    if let Some(custom) = custom_vars {
        copy_into(custom, &vars, size).await?;
    }

    let code = scratch.join(STAGED_CODE_NAME);
    create_zeroed(&code, size).await?;
    copy_into(template_code, &code, size).await?;

    Ok(FirmwarePair { code, vars })
}

/// Private copy of the vars; the boot code stays the shared read-only template.
async fn stage_in_place(scratch: &Path, template_code: &Path, vars_source: &Path) -> Result<FirmwarePair> {
    let vars = scratch.join(STAGED_VARS_NAME);
    fs::copy(vars_source, &vars)
        .await
        .io_context("copy firmware vars template", vars_source)?;
    Ok(FirmwarePair {
        code: template_code.to_path_buf(),
        vars,
    })
}

async fn create_zeroed(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path)
        .await
        .io_context("create firmware image", path)?;
    file.set_len(size)
        .await
        .io_context("size firmware image", path)?;
    Ok(())
}

/// Write `src` over the start of the existing `dst` without truncating it.
async fn copy_into(src: &Path, dst: &Path, limit: u64) -> Result<()> {
    let mut input = File::open(src)
        .await
        .io_context("open firmware template", src)?;
    let len = input
        .metadata()
        .await
        .io_context("stat firmware template", src)?
        .len();
    if len > limit {
        return Err(LaunchError::io(
            "firmware template larger than pflash image",
            src,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{len} bytes exceeds {limit}"),
            ),
        ));
    }

    let mut output = OpenOptions::new()
        .write(true)
        .open(dst)
        .await
        .io_context("open firmware image", dst)?;
    tokio::io::copy(&mut input, &mut output)
        .await
        .io_context("copy firmware template", dst)?;
    output.flush().await.io_context("flush firmware image", dst)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
