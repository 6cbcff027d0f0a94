//! Persistent node registry: the controller's ground truth.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::addr::{add_ipv4, mask_ipv4, parse_ipv4_cidr};
use crate::config::atomic_write;

/// Cap on usable prefix size so a typo'd vpn_cidr cannot send allocation
/// walking millions of addresses. The fleet targets tens to low thousands
/// of nodes.
const MAX_CIDR_SIZE: u64 = 1 << 20;

/// One registered node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeEntry {
    pub id: String,
    pub name: String,
    pub pub_key: String,
    pub vpn_ip: String,
    pub endpoint: String,
    pub probe_port: u16,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status: String,
    pub nat_type: String,
    pub public_addr: String,
}

/// The registry file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub updated_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeEntry>,
}

impl Registry {
    /// Loads the registry from disk. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Registry> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Registry::default())
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let mut reg: Registry = serde_yaml::from_str(&data)
            .with_context(|| format!("parse registry {}", path.display()))?;
        // Older registries may predate stable ids; keep id and name in sync
        // so callers can consistently address nodes by node_id.
        for node in reg.nodes.iter_mut() {
            if node.id.is_empty() && !node.name.is_empty() {
                node.id = node.name.clone();
            }
            if node.name.is_empty() && !node.id.is_empty() {
                node.name = node.id.clone();
            }
        }
        Ok(reg)
    }

    /// Writes the registry to disk atomically with owner-only permissions.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());
        let data = serde_yaml::to_string(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        atomic_write(path, data.as_bytes(), 0o600)
    }

    pub fn find_by_name(&mut self, name: &str) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn find_by_id(&mut self, id: &str) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

/// Picks the first free host address in `cidr`, returned as `a.b.c.d/32`.
///
/// The network and broadcast addresses are never handed out, and the first
/// host is reserved for the hub's own interface address.
pub fn allocate_vpn_ip(cidr: &str, reg: &Registry) -> Result<String> {
    if cidr.is_empty() {
        bail!("vpn_cidr is required for allocation");
    }
    let Some((addr, bits)) = parse_ipv4_cidr(cidr) else {
        bail!("vpn_cidr {cidr} is not a valid IPv4 prefix");
    };

    let size = 1u64 << (32 - u32::from(bits));
    if size > MAX_CIDR_SIZE {
        bail!("vpn_cidr {cidr} is too large (size={size})");
    }

    let used: HashSet<Ipv4Addr> = reg
        .nodes
        .iter()
        .filter_map(|n| claimed_host(&n.vpn_ip))
        .collect();

    let base = mask_ipv4(addr, bits);
    // Offset 0 is the network address, offset 1 the hub, size-1 broadcast.
    for i in 2..size.saturating_sub(1) {
        let candidate = add_ipv4(base, i as u32);
        if !used.contains(&candidate) {
            return Ok(format!("{candidate}/32"));
        }
    }
    bail!("no available vpn_ip in {cidr}")
}

fn claimed_host(value: &str) -> Option<Ipv4Addr> {
    if value.is_empty() {
        return None;
    }
    if let Some((addr, _)) = parse_ipv4_cidr(value) {
        return Some(addr);
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::load(&tmp.path().join("registry.yaml")).unwrap();
        assert!(reg.nodes.is_empty());
        assert!(reg.updated_at.is_none());
    }

    #[test]
    fn test_save_round_trip_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.yaml");

        let mut reg = Registry {
            nodes: vec![NodeEntry {
                id: "1".to_string(),
                name: "n1".to_string(),
                vpn_ip: "10.7.0.2/32".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        reg.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let out = Registry::load(&path).unwrap();
        assert_eq!(out.nodes.len(), 1);
        assert_eq!(out.nodes[0].name, "n1");
        assert_eq!(out.nodes[0].vpn_ip, "10.7.0.2/32");
        assert!(out.updated_at.is_some());
    }

    #[test]
    fn test_load_backfills_missing_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.yaml");
        std::fs::write(&path, "nodes:\n- name: legacy\n  vpn_ip: 10.7.0.5/32\n").unwrap();

        let reg = Registry::load(&path).unwrap();
        assert_eq!(reg.nodes[0].id, "legacy");
    }

    #[test]
    fn test_allocate_starts_past_hub_host() {
        let ip = allocate_vpn_ip("10.7.0.0/24", &Registry::default()).unwrap();
        assert_eq!(ip, "10.7.0.2/32");
    }

    #[test]
    fn test_allocate_skips_claimed() {
        let reg = Registry {
            nodes: vec![
                NodeEntry {
                    name: "a".to_string(),
                    vpn_ip: "10.7.0.2/32".to_string(),
                    ..Default::default()
                },
                NodeEntry {
                    name: "b".to_string(),
                    vpn_ip: "10.7.0.3".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let ip = allocate_vpn_ip("10.7.0.0/24", &reg).unwrap();
        assert_eq!(ip, "10.7.0.4/32");
    }

    #[test]
    fn test_allocate_rejects_missing_and_invalid_cidr() {
        assert!(allocate_vpn_ip("", &Registry::default()).is_err());
        assert!(allocate_vpn_ip("not-a-cidr", &Registry::default()).is_err());
        assert!(allocate_vpn_ip("2001:db8::/64", &Registry::default()).is_err());
    }

    #[test]
    fn test_allocate_rejects_huge_cidr() {
        assert!(allocate_vpn_ip("10.0.0.0/8", &Registry::default()).is_err());
    }

    #[test]
    fn test_allocate_exhaustion() {
        // /30 has usable hosts .1 (hub) and .2; only .2 is allocatable.
        let mut reg = Registry::default();
        let first = allocate_vpn_ip("10.7.0.0/30", &reg).unwrap();
        assert_eq!(first, "10.7.0.2/32");
        reg.nodes.push(NodeEntry {
            name: "a".to_string(),
            vpn_ip: first,
            ..Default::default()
        });
        assert!(allocate_vpn_ip("10.7.0.0/30", &reg).is_err());
    }
}
