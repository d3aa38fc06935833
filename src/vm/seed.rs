//! First-boot guest configuration sealed into a seed disk image.
//!
//! The document is cloud-init `#cloud-config` YAML; `cloud-localds` turns it
//! into a small raw image that the guest reads as a NoCloud datasource.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::command::ProcessRunner;
use crate::config::UserSpec;
use crate::error::{IoContext, LaunchError, Result};

pub const USER_DATA_NAME: &str = "user-data.yaml";
pub const SEED_IMAGE_NAME: &str = "seed.img";
pub const SEED_TOOL: &str = "cloud-localds";

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// User whose password wins when several users declare one.
const PRIMARY_USER: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chpasswd: Option<ChPasswd>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_import_id: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChPasswd {
    pub expire: bool,
}

impl CloudConfig {
    /// Merge every declared user into one document.
    pub fn from_users(users: &BTreeMap<String, UserSpec>) -> Self {
        let declared = |u: &UserSpec| u.password.clone().filter(|p| !p.is_empty());
        let password = users
            .get(PRIMARY_USER)
            .and_then(declared)
            .or_else(|| users.values().find_map(declared));

        let mut doc = CloudConfig {
            chpasswd: password.as_ref().map(|_| ChPasswd { expire: false }),
            password,
            ..Default::default()
        };
        for user in users.values() {
            push_unique(&mut doc.ssh_import_id, &user.ssh_import_id);
            push_unique(&mut doc.ssh_authorized_keys, &user.ssh_authorized_keys);
        }
        doc
    }

    pub fn render(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).map_err(encode_error)?;
        Ok(format!("{CLOUD_CONFIG_HEADER}{body}"))
    }
}

/// User-data is built from configuration; failing to encode it is a
/// configuration error.
fn encode_error(e: serde_yaml::Error) -> LaunchError {
    LaunchError::Config(format!("encode user-data: {e}"))
}

fn push_unique(into: &mut Vec<String>, items: &[String]) {
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !into.iter().any(|have| have == item) {
            into.push(item.to_string());
        }
    }
}

/// Writes the user-data document and runs the seed-image tool on it.
#[derive(Clone)]
pub struct SeedBuilder {
    runner: Arc<dyn ProcessRunner>,
}

impl SeedBuilder {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Build `<scratch>/seed.img` for `users` and return its path.
    pub async fn build(&self, scratch: &Path, users: &BTreeMap<String, UserSpec>) -> Result<PathBuf> {
        let doc = CloudConfig::from_users(users);
        let user_data = scratch.join(USER_DATA_NAME);
        let seed = scratch.join(SEED_IMAGE_NAME);

        tokio::fs::write(&user_data, doc.render()?)
            .await
            .io_context("write user-data", &user_data)?;
        debug!(
            path = %user_data.display(),
            password = doc.password.is_some(),
            imports = doc.ssh_import_id.len(),
            keys = doc.ssh_authorized_keys.len(),
            "wrote user-data"
        );

        let args = vec![
            seed.to_string_lossy().into_owned(),
            user_data.to_string_lossy().into_owned(),
        ];
        self.runner
            .run(SEED_TOOL, &args)
            .await
            .map_err(|e| match e {
                LaunchError::Process { reason, .. } => LaunchError::SeedTool(reason),
                other => other,
            })?;

        info!(seed = %seed.display(), "seed image built");
        Ok(seed)
    }
}
