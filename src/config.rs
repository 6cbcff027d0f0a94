//! YAML configuration for the controller and node processes.
//!
//! Numeric fields left at zero and empty strings are filled by
//! [`apply_defaults`], mirroring how operators hand-edit these files: an
//! omitted field means "use the shipped default", not "disable".

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use crate::addr::first_scoped_cidr;

pub const DEFAULT_MTU: i64 = 1280;
pub const DEFAULT_WG_INTERFACE: &str = "wg0";
pub const DEFAULT_WG_PORT: u16 = 51820;
pub const DEFAULT_KEEPALIVE_SEC: u64 = 25;
pub const DEFAULT_DIRECT_MODE: &str = "auto";
pub const DEFAULT_KEEPALIVE_INTERVAL_SEC: u64 = 30;
pub const DEFAULT_STUN_INTERVAL_SEC: u64 = 60;
pub const DEFAULT_CANDIDATES_INTERVAL_SEC: u64 = 30;
pub const DEFAULT_DIRECT_INTERVAL_SEC: u64 = 60;
pub const DEFAULT_POLICY_ROUTING_TABLE: u32 = 51820;
pub const DEFAULT_POLICY_ROUTING_PRIORITY: u32 = 1000;
pub const DEFAULT_DIRECT_KEEPALIVE_SEC: u64 = 25;
pub const DEFAULT_DIRECT_KEEPALIVE_SYMMETRIC_SEC: u64 = 15;
pub const DEFAULT_DIRECT_KEEPALIVE_UNKNOWN_SEC: u64 = 20;
pub const DEFAULT_PROBE_PORT: u16 = 51900;
pub const DEFAULT_P2P_READY_MODE: &str = "mutual";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SEC: u64 = 3;
pub const DEFAULT_HEALTH_CHECK_FAILURES: u32 = 3;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SEC: u64 = 2;

/// Top-level configuration holding controller and/or node settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,
}

/// Settings for the controller/server process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen: String,
    pub data_dir: String,
    pub wg_interface: String,
    pub wg_port: u16,
    pub mtu: i64,
    pub wg_address: String,
    pub wg_private_key: String,
    pub wg_apply: bool,
    pub direct_mode: String,
    pub keepalive_sec: u64,
    pub stun_servers: Vec<String>,
    pub metrics_path: String,
    pub server_public_key: String,
    pub server_endpoint: String,
    pub server_allowed_ips: Vec<String>,
    pub server_keepalive_sec: u64,
    pub vpn_cidr: String,
    /// Controls when a peer pair is marked safe for /32 direct injection.
    /// `mutual` requires recent success in both directions (conservative);
    /// `either` accepts one direction (permissive).
    pub p2p_ready_mode: String,
    pub probe_port: u16,
}

/// Settings for the agent process running on a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub controller: String,
    pub wg_interface: String,
    pub wg_config_path: String,
    pub wg_private_key: String,
    pub wg_public_key: String,
    pub wg_listen_port: u16,
    pub probe_port: u16,
    pub vpn_ip: String,
    pub mtu: i64,
    pub direct_mode: String,
    pub keepalive_sec: u64,
    pub stun_servers: Vec<String>,
    pub metrics_path: String,
    pub server_public_key: String,
    pub server_endpoint: String,
    pub server_allowed_ips: Vec<String>,
    pub server_keepalive_sec: u64,
    /// None means enabled. The unset/false distinction matters: operators
    /// explicitly write `false` to opt out.
    pub policy_routing_enabled: Option<bool>,
    pub policy_routing_table: u32,
    pub policy_routing_priority: u32,
    pub policy_routing_cidr: String,
    pub direct_keepalive_sec: u64,
    pub direct_keepalive_symmetric_sec: u64,
    pub direct_keepalive_unknown_sec: u64,
    pub keepalive_interval_sec: u64,
    pub stun_interval_sec: u64,
    pub candidates_interval_sec: u64,
    pub direct_interval_sec: u64,
    /// When set, the WireGuard endpoint other peers should dial for direct
    /// injection. Use for port-forwarded nodes (e.g. "WAN_IP:51820"); when
    /// unset the controller publishes the endpoint it observes on its own
    /// interface.
    pub advertise_wg_endpoint: String,
    /// When set, the direct-probe address other peers should use (e.g.
    /// "WAN_IP:51900"). Required with port-forwarding because STUN on the
    /// probe socket returns a random mapped port.
    pub advertise_public_addr: String,
    pub health_check_interval_sec: u64,
    pub health_check_failures: u32,
    pub health_check_timeout_sec: u64,
}

impl NodeConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_sec)
    }

    pub fn stun_interval(&self) -> Duration {
        Duration::from_secs(self.stun_interval_sec)
    }

    pub fn candidates_interval(&self) -> Duration {
        Duration::from_secs(self.candidates_interval_sec)
    }

    pub fn direct_interval(&self) -> Duration {
        Duration::from_secs(self.direct_interval_sec)
    }

    pub fn health_check_timeout(&self) -> Duration {
        if self.health_check_timeout_sec == 0 {
            return Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SEC);
        }
        Duration::from_secs(self.health_check_timeout_sec)
    }

    /// True unless the operator explicitly wrote `policy_routing_enabled: false`.
    pub fn policy_routing_enabled(&self) -> bool {
        self.policy_routing_enabled.unwrap_or(true)
    }
}

/// Reads and parses a YAML config file, then fills defaults.
pub fn load(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut cfg: Config =
        serde_yaml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
    apply_defaults(&mut cfg);
    Ok(cfg)
}

/// Writes a YAML config file atomically with owner-only permissions.
pub fn save(path: &Path, cfg: &Config) -> Result<()> {
    let mut cfg = cfg.clone();
    apply_defaults(&mut cfg);
    let data = serde_yaml::to_string(&cfg)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    atomic_write(path, data.as_bytes(), 0o600)
}

/// Atomic replace: temp file in the target directory, fsync, rename. The
/// temp file is cleaned up automatically on the error path.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Minimal validation for required fields.
pub fn validate(cfg: &Config) -> Result<()> {
    if cfg.controller.is_none() && cfg.node.is_none() {
        bail!("config must contain controller or node section");
    }
    if let Some(c) = &cfg.controller {
        if c.listen.is_empty() {
            bail!("controller.listen is required");
        }
        if c.wg_apply {
            if c.wg_private_key.is_empty() {
                bail!("controller.wg_private_key is required when wg_apply is true");
            }
            if c.wg_address.is_empty() {
                bail!("controller.wg_address is required when wg_apply is true");
            }
        }
    }
    if let Some(n) = &cfg.node {
        if n.name.is_empty() {
            bail!("node.name is required");
        }
        if n.controller.is_empty()
            && (n.server_public_key.is_empty()
                || n.server_endpoint.is_empty()
                || n.server_allowed_ips.is_empty())
        {
            bail!("node.controller is required unless server fields are set");
        }
    }
    Ok(())
}

/// Fills default values for fields left empty or zero.
pub fn apply_defaults(cfg: &mut Config) {
    if let Some(c) = cfg.controller.as_mut() {
        if c.wg_interface.is_empty() {
            c.wg_interface = DEFAULT_WG_INTERFACE.to_string();
        }
        if c.wg_port == 0 {
            c.wg_port = DEFAULT_WG_PORT;
        }
        if c.mtu == 0 {
            c.mtu = DEFAULT_MTU;
        }
        if c.direct_mode.is_empty() {
            c.direct_mode = DEFAULT_DIRECT_MODE.to_string();
        }
        if c.keepalive_sec == 0 {
            c.keepalive_sec = DEFAULT_KEEPALIVE_SEC;
        }
        if c.p2p_ready_mode.is_empty() {
            c.p2p_ready_mode = DEFAULT_P2P_READY_MODE.to_string();
        }
        if c.probe_port == 0 {
            c.probe_port = DEFAULT_PROBE_PORT;
        }
    }

    if let Some(n) = cfg.node.as_mut() {
        if n.wg_interface.is_empty() {
            n.wg_interface = DEFAULT_WG_INTERFACE.to_string();
        }
        if n.wg_config_path.is_empty() {
            n.wg_config_path = format!("/etc/wireguard/{}.conf", n.wg_interface);
        }
        if n.probe_port == 0 {
            n.probe_port = DEFAULT_PROBE_PORT;
        }
        if n.policy_routing_cidr.is_empty() {
            n.policy_routing_cidr = first_scoped_cidr(&n.server_allowed_ips);
        }
        if n.policy_routing_table == 0 {
            n.policy_routing_table = DEFAULT_POLICY_ROUTING_TABLE;
        }
        if n.policy_routing_priority == 0 {
            n.policy_routing_priority = DEFAULT_POLICY_ROUTING_PRIORITY;
        }
        if n.direct_keepalive_sec == 0 {
            n.direct_keepalive_sec = DEFAULT_DIRECT_KEEPALIVE_SEC;
        }
        if n.direct_keepalive_symmetric_sec == 0 {
            n.direct_keepalive_symmetric_sec = DEFAULT_DIRECT_KEEPALIVE_SYMMETRIC_SEC;
        }
        if n.direct_keepalive_unknown_sec == 0 {
            n.direct_keepalive_unknown_sec = DEFAULT_DIRECT_KEEPALIVE_UNKNOWN_SEC;
        }
        if n.mtu == 0 {
            n.mtu = DEFAULT_MTU;
        }
        if n.direct_mode.is_empty() {
            n.direct_mode = DEFAULT_DIRECT_MODE.to_string();
        }
        if n.keepalive_sec == 0 {
            n.keepalive_sec = DEFAULT_KEEPALIVE_SEC;
        }
        if n.keepalive_interval_sec == 0 {
            n.keepalive_interval_sec = DEFAULT_KEEPALIVE_INTERVAL_SEC;
        }
        if n.stun_interval_sec == 0 {
            n.stun_interval_sec = DEFAULT_STUN_INTERVAL_SEC;
        }
        if n.candidates_interval_sec == 0 {
            n.candidates_interval_sec = DEFAULT_CANDIDATES_INTERVAL_SEC;
        }
        if n.direct_interval_sec == 0 {
            n.direct_interval_sec = DEFAULT_DIRECT_INTERVAL_SEC;
        }
        if n.health_check_interval_sec == 0 {
            n.health_check_interval_sec = DEFAULT_HEALTH_CHECK_INTERVAL_SEC;
        }
        if n.health_check_failures == 0 {
            n.health_check_failures = DEFAULT_HEALTH_CHECK_FAILURES;
        }
        if n.health_check_timeout_sec == 0 {
            n.health_check_timeout_sec = DEFAULT_HEALTH_CHECK_TIMEOUT_SEC;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_defaults_node() {
        let mut cfg = Config {
            node: Some(NodeConfig {
                name: "edge-1".to_string(),
                controller: "10.0.0.1:8080".to_string(),
                server_allowed_ips: vec!["10.7.0.0/24".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        apply_defaults(&mut cfg);
        let n = cfg.node.unwrap();
        assert_eq!(n.wg_interface, "wg0");
        assert_eq!(n.wg_config_path, "/etc/wireguard/wg0.conf");
        assert_eq!(n.probe_port, 51900);
        assert_eq!(n.policy_routing_cidr, "10.7.0.0/24");
        assert_eq!(n.direct_keepalive_symmetric_sec, 15);
        assert_eq!(n.direct_keepalive_unknown_sec, 20);
        assert_eq!(n.health_check_interval_sec, 3);
        assert!(n.policy_routing_enabled());
    }

    #[test]
    fn test_policy_routing_unset_vs_false() {
        let yaml = "node:\n  name: a\n  controller: b\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.node.as_ref().unwrap().policy_routing_enabled, None);
        assert!(cfg.node.unwrap().policy_routing_enabled());

        let yaml = "node:\n  name: a\n  controller: b\n  policy_routing_enabled: false\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.node.as_ref().unwrap().policy_routing_enabled, Some(false));
        assert!(!cfg.node.unwrap().policy_routing_enabled());
    }

    #[test]
    fn test_validate_requires_sections() {
        assert!(validate(&Config::default()).is_err());

        let cfg = Config {
            controller: Some(ControllerConfig::default()),
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());

        let cfg = Config {
            controller: Some(ControllerConfig {
                listen: "127.0.0.1:8080".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_validate_wg_apply_requirements() {
        let cfg = Config {
            controller: Some(ControllerConfig {
                listen: "127.0.0.1:8080".to_string(),
                wg_apply: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_validate_node_needs_controller_or_server_fields() {
        let cfg = Config {
            node: Some(NodeConfig {
                name: "edge-1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());

        let cfg = Config {
            node: Some(NodeConfig {
                name: "edge-1".to_string(),
                server_public_key: "pk".to_string(),
                server_endpoint: "1.2.3.4:51820".to_string(),
                server_allowed_ips: vec!["10.7.0.0/24".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_save_load_round_trip_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let cfg = Config {
            node: Some(NodeConfig {
                name: "edge-1".to_string(),
                controller: "10.0.0.1:8080".to_string(),
                vpn_ip: "10.7.0.2/32".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        save(&path, &cfg).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.node.as_ref().unwrap().vpn_ip, "10.7.0.2/32");
        assert_eq!(loaded.node.unwrap().probe_port, 51900);
    }
}
