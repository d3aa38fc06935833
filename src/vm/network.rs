//! Host bridges and the tap devices allocated on them.
//!
//! ## Naming
//!
//! ```text
//! network "lan"  ─►  bridge  qfleetlan
//!                        ├─► tap qfleetlantap0   (first VM on lan)
//!                        └─► tap qfleetlantap1   (second VM on lan)
//! ```
//!
//! The tap index is the number of taps already allocated on that bridge, so
//! names are deterministic and never reused within a process.
//!
//! ## Concurrency
//!
//! One [`NetworkManager`] is shared by every launch task. Each bridge owns its
//! own async lock, held across the whole "compute name, create device,
//! record name" sequence, so two tasks racing on the same network can never
//! observe the same index while tasks on different networks do not block
//! each other.
//!
//! Bridges and taps are never removed; they outlive the process and must be
//! cleaned up externally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::command::ProcessRunner;
use crate::config::{NetworkKind, NetworkSpec};
use crate::error::{LaunchError, Result};

/// Prefix shared by every bridge and tap name created by this tool.
pub const BRIDGE_PREFIX: &str = "qfleet";

/// Bridge interface name for a network.
pub fn bridge_name(network: &str) -> String {
    format!("{BRIDGE_PREFIX}{network}")
}

/// Tap interface name for the `index`-th tap on a network.
pub fn tap_name(network: &str, index: usize) -> String {
    format!("{BRIDGE_PREFIX}{network}tap{index}")
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug)]
struct Bridge {
    name: String,
    taps: Vec<String>,
}

/// Owns the bridges declared in the configuration and their tap registries.
pub struct NetworkManager {
    runner: Arc<dyn ProcessRunner>,
    bridges: RwLock<HashMap<String, Arc<tokio::sync::Mutex<Bridge>>>>,
}

impl NetworkManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            bridges: RwLock::new(HashMap::new()),
        }
    }

    /// Create one host bridge per declared network and register an empty tap
    /// list for it.
    ///
    /// Stops at the first bridge that cannot be created. Registering a
    /// network twice fails with [`LaunchError::NetworksAlreadyStarted`]
    /// before anything is created.
    pub async fn start_networks(&self, networks: &BTreeMap<String, NetworkSpec>) -> Result<()> {
        {
            let bridges = self.read_bridges()?;
            if let Some(name) = networks.keys().find(|n| bridges.contains_key(*n)) {
                return Err(LaunchError::NetworksAlreadyStarted(name.clone()));
            }
        }

        for (name, spec) in networks {
            match spec.kind {
                NetworkKind::Bridge => {
                    let bridge = bridge_name(name);
                    self.create_bridge(&bridge).await?;

                    let mut bridges = self.write_bridges()?;
                    if bridges.contains_key(name) {
                        return Err(LaunchError::NetworksAlreadyStarted(name.clone()));
                    }
                    bridges.insert(
                        name.clone(),
                        Arc::new(tokio::sync::Mutex::new(Bridge {
                            name: bridge.clone(),
                            taps: Vec::new(),
                        })),
                    );
                    info!(network = %name, bridge = %bridge, "bridge ready");
                }
            }
        }
        Ok(())
    }

    /// Allocate, create and attach the next tap device on `network`.
    ///
    /// Fails with [`LaunchError::UnknownNetwork`] and allocates nothing when
    /// the network was never started. The name is recorded as soon as the
    /// device exists on the host, so a failure while attaching or raising it
    /// still consumes the index. Only a failed `tuntap add` leaves it free.
    pub async fn new_tap_device(&self, network: &str) -> Result<String> {
        let bridge = self
            .read_bridges()?
            .get(network)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownNetwork(network.to_string()))?;

        let mut bridge = bridge.lock().await;
        let tap = tap_name(network, bridge.taps.len());
        debug!(network = %network, tap = %tap, "allocating tap device");

        self.runner
            .run("ip", &args(&["tuntap", "add", "dev", &tap, "mode", "tap"]))
            .await?;
        bridge.taps.push(tap.clone());

        let master = bridge.name.clone();
        self.runner
            .run("ip", &args(&["link", "set", &tap, "master", &master]))
            .await?;
        self.runner
            .run("ip", &args(&["link", "set", &tap, "up"]))
            .await?;

        info!(network = %network, tap = %tap, bridge = %bridge.name, "tap device attached");
        Ok(tap)
    }

    /// Snapshot of the taps allocated on `network`, in allocation order.
    pub async fn taps(&self, network: &str) -> Option<Vec<String>> {
        let bridge = self.read_bridges().ok()?.get(network).cloned()?;
        let bridge = bridge.lock().await;
        Some(bridge.taps.clone())
    }

    /// Names of the registered networks.
    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read_bridges()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn create_bridge(&self, bridge: &str) -> Result<()> {
        self.runner
            .run("ip", &args(&["link", "add", bridge, "type", "bridge"]))
            .await?;
        self.runner
            .run("ip", &args(&["link", "set", bridge, "up"]))
            .await
    }

    fn read_bridges(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<Bridge>>>>>
    {
        self.bridges
            .read()
            .map_err(|_| LaunchError::Config("network registry lock poisoned".to_string()))
    }

    fn write_bridges(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<Bridge>>>>>
    {
        self.bridges
            .write()
            .map_err(|_| LaunchError::Config("network registry lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
