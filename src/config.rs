//! Declarative machine and network configuration.
//!
//! The whole run is described by one [`FleetConfig`], read once at startup
//! from TOML (or YAML when the file extension says so) and never mutated
//! afterwards.
//!
//! Parsing only rejects documents that cannot be decoded. Semantic checks
//! that concern a single machine live in [`MachineSpec::validate`] and run
//! inside that machine's launch, so one bad entry fails only its own VM.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, LaunchError, Result};
use crate::vm::arch::{Arch, FirmwarePair};

pub const DEFAULT_MEMORY: &str = "2G";

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub machines: BTreeMap<String, MachineSpec>,
    #[serde(alias = "network")]
    pub networks: BTreeMap<String, NetworkSpec>,
    /// Replacement firmware templates, keyed by architecture name.
    pub firmware: BTreeMap<String, FirmwarePair>,
}

/// One virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineSpec {
    /// Boot disk image. When absent, `suite` + `arch` select a cloud image.
    pub image: Option<PathBuf>,
    pub suite: Option<String>,
    pub arch: Option<String>,
    /// Memory size: `2048`, `2048M`, `2G`. Defaults to [`DEFAULT_MEMORY`].
    pub memory: Option<String>,
    pub uefi: bool,
    /// `true` discards disk writes on exit; `false` commits them.
    pub snapshot: bool,
    /// Name of a declared network; absent means user-mode NAT.
    pub network: Option<String>,
    /// Overrides the architecture's default core count.
    pub cpus: Option<u32>,
    /// Custom firmware variable store used instead of the template.
    pub uefi_vars: Option<PathBuf>,
    pub users: BTreeMap<String, UserSpec>,
}

/// First-boot credentials for one guest user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserSpec {
    pub password: Option<String>,
    #[serde(alias = "sshimportid")]
    pub ssh_import_id: Vec<String>,
    #[serde(alias = "ssh_keys", alias = "sshkeys")]
    pub ssh_authorized_keys: Vec<String>,
}

/// One virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    #[serde(rename = "type", default)]
    pub kind: NetworkKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Bridge,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl FleetConfig {
    /// Read and decode the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).io_context("read config", path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        if is_yaml {
            Self::from_yaml_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LaunchError::Config(format!("invalid TOML: {e}")))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| LaunchError::Config(format!("invalid YAML: {e}")))
    }

    /// Firmware template for `arch`, honouring `[firmware.<arch>]` overrides.
    pub fn firmware_template(&self, arch: Arch) -> FirmwarePair {
        self.firmware
            .iter()
            .find(|(name, _)| name.parse::<Arch>().ok() == Some(arch))
            .map(|(_, pair)| pair.clone())
            .unwrap_or_else(|| arch.firmware_template())
    }
}

// ---------------------------------------------------------------------------
// Per-machine checks
// ---------------------------------------------------------------------------

impl MachineSpec {
    /// Check the machine against the declared networks.
    pub fn validate(&self, networks: &BTreeMap<String, NetworkSpec>) -> Result<()> {
        if self.image_path().is_none() && (self.suite().is_none() || self.arch_name().is_none()) {
            return Err(LaunchError::Config(
                "no image specified: set `image`, or both `suite` and `arch`".to_string(),
            ));
        }
        if let Some(network) = self.network_name() {
            if !networks.contains_key(network) {
                return Err(LaunchError::UnknownNetwork(network.to_string()));
            }
        }
        if let Some(0) = self.cpus {
            return Err(LaunchError::Config("`cpus` must be at least 1".to_string()));
        }
        self.memory_mb()?;
        Ok(())
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_deref().filter(|p| !p.as_os_str().is_empty())
    }

    pub fn suite(&self) -> Option<&str> {
        non_empty(self.suite.as_deref())
    }

    pub fn arch_name(&self) -> Option<&str> {
        non_empty(self.arch.as_deref())
    }

    pub fn network_name(&self) -> Option<&str> {
        non_empty(self.network.as_deref())
    }

    pub fn uefi_vars_path(&self) -> Option<&Path> {
        self.uefi_vars.as_deref().filter(|p| !p.as_os_str().is_empty())
    }

    /// Memory in MiB.
    pub fn memory_mb(&self) -> Result<u32> {
        parse_memory_to_mb(non_empty(self.memory.as_deref()).unwrap_or(DEFAULT_MEMORY))
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes.
///
/// A bare number is taken as megabytes, which is also what QEMU's `-m`
/// assumes.
pub fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(LaunchError::Config("memory size cannot be empty".to_string()));
    }

    let (number_str, kib_per_unit) = if let Some(num) = memory_str
        .strip_suffix('G')
        .or_else(|| memory_str.strip_suffix('g'))
    {
        (num, 1024.0 * 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('M')
        .or_else(|| memory_str.strip_suffix('m'))
    {
        (num, 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('K')
        .or_else(|| memory_str.strip_suffix('k'))
    {
        (num, 1.0)
    } else {
        (memory_str, 1024.0)
    };

    let number: f64 = number_str
        .trim()
        .parse()
        .map_err(|_| LaunchError::Config(format!("invalid memory size '{memory_str}'")))?;

    let mb = number * kib_per_unit / 1024.0;
    if !(mb >= 1.0 && mb <= u32::MAX as f64) {
        return Err(LaunchError::Config(format!(
            "memory size '{memory_str}' is out of range"
        )));
    }
    Ok(mb as u32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[networks.lan]
type = "bridge"

[machines.web]
suite = "jammy"
arch = "x86_64"
memory = "2G"
uefi = true
network = "lan"

[machines.web.users.default]
password = "secret"
ssh_import_id = ["gh:foo"]

[machines.db]
image = "/var/lib/images/db.qcow2"
arch = "aarch64"
snapshot = true

[firmware.aarch64]
code = "/opt/fw/code.fd"
vars = "/opt/fw/vars.fd"
"#;

    #[test]
    fn parses_full_toml_document() {
        let cfg = FleetConfig::from_toml_str(SAMPLE).expect("sample parses");
        assert_eq!(cfg.machines.len(), 2);
        assert_eq!(cfg.networks["lan"].kind, NetworkKind::Bridge);

        let web = &cfg.machines["web"];
        assert_eq!(web.suite(), Some("jammy"));
        assert!(web.uefi);
        assert!(!web.snapshot);
        assert_eq!(web.network_name(), Some("lan"));
        assert_eq!(web.users["default"].ssh_import_id, vec!["gh:foo"]);

        let db = &cfg.machines["db"];
        assert_eq!(db.image_path(), Some(Path::new("/var/lib/images/db.qcow2")));
        assert!(db.snapshot);
        assert_eq!(db.memory_mb().unwrap(), 2048);
    }

    #[test]
    fn firmware_override_replaces_template() {
        let cfg = FleetConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            cfg.firmware_template(Arch::Aarch64).code,
            PathBuf::from("/opt/fw/code.fd")
        );
        assert_eq!(cfg.firmware_template(Arch::X86_64), Arch::X86_64.firmware_template());
    }

    #[test]
    fn parses_yaml_with_legacy_keys() {
        let yaml = r#"
network:
  lan:
    type: bridge
machines:
  vm1:
    image: /tmp/disk.img
    arch: x86_64
    network: lan
    users:
      default:
        sshimportid: ["lp:someone"]
        sshkeys: ["ssh-ed25519 AAAA test"]
"#;
        let cfg = FleetConfig::from_yaml_str(yaml).expect("yaml parses");
        assert!(cfg.networks.contains_key("lan"));
        let user = &cfg.machines["vm1"].users["default"];
        assert_eq!(user.ssh_import_id, vec!["lp:someone"]);
        assert_eq!(user.ssh_authorized_keys, vec!["ssh-ed25519 AAAA test"]);
    }

    #[test]
    fn unknown_network_type_is_rejected() {
        let err = FleetConfig::from_toml_str("[networks.lan]\ntype = \"macvtap\"\n").unwrap_err();
        assert!(matches!(err, LaunchError::Config(_)));
    }

    #[test]
    fn missing_image_requires_suite_and_arch() {
        let spec = MachineSpec {
            suite: Some("jammy".to_string()),
            ..Default::default()
        };
        let err = spec.validate(&BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("no image specified"), "got: {err}");
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let spec = MachineSpec {
            image: Some(PathBuf::new()),
            suite: Some(String::new()),
            arch: Some("x86_64".to_string()),
            network: Some(String::new()),
            ..Default::default()
        };
        assert!(spec.image_path().is_none());
        assert!(spec.network_name().is_none());
        assert!(spec.validate(&BTreeMap::new()).is_err());
    }

    #[test]
    fn undeclared_network_fails_validation() {
        let spec = MachineSpec {
            image: Some(PathBuf::from("/tmp/a.img")),
            network: Some("wan".to_string()),
            ..Default::default()
        };
        let err = spec.validate(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, LaunchError::UnknownNetwork(ref n) if n == "wan"), "got: {err}");
    }

    #[test]
    fn memory_parsing() {
        assert_eq!(parse_memory_to_mb("2048").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("2048M").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("2G").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("1.5g").unwrap(), 1536);
        assert_eq!(parse_memory_to_mb("524288K").unwrap(), 512);
        assert!(parse_memory_to_mb("").is_err());
        assert!(parse_memory_to_mb("lots").is_err());
        assert!(parse_memory_to_mb("0").is_err());
    }

    #[test]
    fn default_memory_applies() {
        let spec = MachineSpec::default();
        assert_eq!(spec.memory_mb().unwrap(), 2048);
    }
}
