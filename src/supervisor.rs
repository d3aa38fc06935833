//! Top-level run: network setup, then one concurrent launch per machine.
//!
//! Network setup is fatal for the whole run. Machine failures are isolated:
//! every launch runs to completion and its outcome lands in the
//! [`FleetReport`].

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::vm::{Launcher, NetworkManager};

/// Outcome of every launched machine, keyed by machine name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub outcomes: BTreeMap<String, std::result::Result<(), String>>,
}

impl FleetReport {
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(n, r)| r.as_ref().err().map(|e| (n.as_str(), e.as_str())))
            .collect()
    }

    /// Machines were launched and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.succeeded().is_empty()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.all_failed() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

pub struct Supervisor {
    networks: Arc<NetworkManager>,
    launcher: Arc<Launcher>,
}

impl Supervisor {
    pub fn new(networks: Arc<NetworkManager>, launcher: Arc<Launcher>) -> Self {
        Self { networks, launcher }
    }

    /// Start every declared network, then launch the selected machines
    /// concurrently and wait for all of them.
    ///
    /// An empty `only` selects every machine.
    pub async fn run(&self, config: &FleetConfig, only: &[String]) -> Result<FleetReport> {
        if let Some(missing) = only.iter().find(|n| !config.machines.contains_key(*n)) {
            bail!("no machine named '{missing}' in the configuration");
        }

        self.networks
            .start_networks(&config.networks)
            .await
            .context("network setup failed")?;

        let selected: Vec<(String, _)> = config
            .machines
            .iter()
            .filter(|(name, _)| only.is_empty() || only.contains(*name))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        if selected.is_empty() {
            warn!("no machines to launch");
        }

        let mut handles = Vec::with_capacity(selected.len());
        for (name, spec) in selected {
            let launcher = Arc::clone(&self.launcher);
            let task_name = name.clone();
            let handle = tokio::spawn(async move { launcher.launch(&task_name, &spec).await });
            handles.push((name, handle));
        }
        info!(machines = handles.len(), "all machines dispatched");

        let mut report = FleetReport::default();
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(())) => {
                    info!(machine = %name, "machine finished");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(machine = %name, error = %e, "machine launch failed");
                    Err(e.to_string())
                }
                Err(join) => {
                    error!(machine = %name, error = %join, "machine task aborted");
                    Err(format!("task aborted: {join}"))
                }
            };
            report.outcomes.insert(name, outcome);
        }
        Ok(report)
    }
}
