//! Boot-image resolution: an explicit disk path, or an Ubuntu cloud image
//! selected by release suite and architecture and downloaded into the VM's
//! scratch directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::MachineSpec;
use crate::error::{IoContext, LaunchError, Result};
use crate::vm::arch::Arch;

pub const CLOUD_IMAGE_BASE: &str = "http://cloud-images.ubuntu.com/releases";

/// Release code names and their version numbers.
pub const SUITES: &[(&str, &str)] = &[
    ("bionic", "18.04"),
    ("focal", "20.04"),
    ("impish", "21.10"),
    ("jammy", "22.04"),
    ("noble", "24.04"),
];

pub fn suite_version(suite: &str) -> Option<&'static str> {
    SUITES
        .iter()
        .find(|(name, _)| *name == suite)
        .map(|(_, version)| *version)
}

/// File name and URL of the cloud image for `suite` on `arch`.
pub fn cloud_image(suite: &str, arch: Arch) -> Result<(String, String)> {
    let version = suite_version(suite).ok_or_else(|| {
        let known: Vec<&str> = SUITES.iter().map(|(name, _)| *name).collect();
        LaunchError::Config(format!(
            "unknown suite '{suite}' (known: {})",
            known.join(", ")
        ))
    })?;
    let file = format!(
        "ubuntu-{version}-server-cloudimg-{}.img",
        arch.profile().distro_label
    );
    let url = format!("{CLOUD_IMAGE_BASE}/{suite}/release/{file}");
    Ok((file, url))
}

// ---------------------------------------------------------------------------
// Fetchers
// ---------------------------------------------------------------------------

/// Downloads a URL to a local file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Plain HTTP download, streamed to disk chunk by chunk.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LaunchError::Download(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url = %url, "downloading image");
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LaunchError::Download(format!("{url}: {e}")))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(LaunchError::Download(format!("{url}: HTTP {status}")));
        }

        let mut out = tokio::fs::File::create(dest)
            .await
            .io_context("create image file", dest)?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| LaunchError::Download(format!("{url}: {e}")))?
        {
            out.write_all(&chunk)
                .await
                .io_context("write image file", dest)?;
            written += chunk.len() as u64;
        }
        out.flush().await.io_context("flush image file", dest)?;

        info!(path = %dest.display(), bytes = written, "image downloaded");
        Ok(())
    }
}

/// Logs the download instead of performing it.
#[derive(Debug, Default, Clone)]
pub struct DryRunFetcher;

#[async_trait]
impl ImageFetcher for DryRunFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        info!(dry_run = true, url = %url, path = %dest.display(), "would download image");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// The boot disk for `spec`: its explicit image, or a cloud image fetched
/// into `scratch`.
///
/// Lookup and download failures both surface as [`LaunchError::Config`]
/// carrying the underlying reason and a hint about the accepted settings.
pub async fn resolve_image(
    spec: &MachineSpec,
    arch: Arch,
    scratch: &Path,
    fetcher: &dyn ImageFetcher,
) -> Result<PathBuf> {
    if let Some(image) = spec.image_path() {
        debug!(image = %image.display(), "using configured image");
        return Ok(image.to_path_buf());
    }

    let Some(suite) = spec.suite() else {
        return Err(LaunchError::Config(usage("no image specified", None)));
    };
    let (file, url) = cloud_image(suite, arch).map_err(|e| match e {
        LaunchError::Config(reason) => LaunchError::Config(usage(&reason, None)),
        other => other,
    })?;

    let dest = scratch.join(file);
    match fetcher.fetch(&url, &dest).await {
        Ok(()) => Ok(dest),
        Err(LaunchError::Cancelled(what)) => Err(LaunchError::Cancelled(what)),
        Err(e) => Err(LaunchError::Config(usage(
            &format!("failed to download image for {suite} {arch}"),
            Some(&e),
        ))),
    }
}

fn usage(reason: &str, cause: Option<&LaunchError>) -> String {
    let hint = "set `image`, or both `suite` and `arch`";
    match cause {
        Some(cause) => format!("{reason}: {cause}; {hint}"),
        None => format!("{reason}; {hint}"),
    }
}
