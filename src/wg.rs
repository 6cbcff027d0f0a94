//! WireGuard interface management: config rendering, `ip`/`wg` invocation,
//! and live peer-state inspection.
//!
//! All side effects go through [`Runner`] so tests can substitute a
//! recording implementation. Peer updates use `wg syncconf` with a rendered
//! config written to a temp file; the relay (hub) peer is always part of the
//! rendered config, so direct-peer churn can never evict it.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::runner::{OsRunner, Runner};

/// A WireGuard peer entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Peer {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
    pub keepalive_sec: u64,
}

/// Minimal WireGuard settings for the controller host.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub interface: String,
    pub private_key: String,
    pub address: String,
    pub listen_port: u16,
    pub mtu: i64,
}

/// Renders a full WireGuard config for a node using hub-only topology.
pub fn render_node(cfg: &NodeConfig) -> Result<String> {
    require_node_fields(cfg)?;
    if cfg.vpn_ip.is_empty() {
        bail!("vpn_ip is required");
    }

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", cfg.wg_private_key));
    out.push_str(&format!("Address = {}\n", cfg.vpn_ip));
    if cfg.mtu > 0 {
        out.push_str(&format!("MTU = {}\n", cfg.mtu));
    }
    if cfg.wg_listen_port > 0 {
        out.push_str(&format!("ListenPort = {}\n", cfg.wg_listen_port));
    }
    out.push_str(&hub_peer_section(cfg));
    Ok(out)
}

/// Renders a `wg setconf`-compatible config (no Address/MTU) with the hub
/// peer first, followed by any direct peers.
pub fn render_set_conf(cfg: &NodeConfig, peers: &[Peer]) -> Result<String> {
    require_node_fields(cfg)?;

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", cfg.wg_private_key));
    if cfg.wg_listen_port > 0 {
        out.push_str(&format!("ListenPort = {}\n", cfg.wg_listen_port));
    }
    out.push_str(&hub_peer_section(cfg));

    for peer in peers {
        if peer.public_key.is_empty() || peer.endpoint.is_empty() || peer.allowed_ips.is_empty() {
            continue;
        }
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
        out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
        if peer.keepalive_sec > 0 {
            out.push_str(&format!("PersistentKeepalive = {}\n", peer.keepalive_sec));
        }
    }
    Ok(out)
}

fn hub_peer_section(cfg: &NodeConfig) -> String {
    let mut out = String::new();
    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", cfg.server_public_key));
    out.push_str(&format!("Endpoint = {}\n", cfg.server_endpoint));
    out.push_str(&format!(
        "AllowedIPs = {}\n",
        cfg.server_allowed_ips.join(", ")
    ));
    if cfg.server_keepalive_sec > 0 {
        out.push_str(&format!(
            "PersistentKeepalive = {}\n",
            cfg.server_keepalive_sec
        ));
    }
    out
}

fn require_node_fields(cfg: &NodeConfig) -> Result<()> {
    if cfg.wg_private_key.is_empty() {
        bail!("wg_private_key is required");
    }
    if cfg.server_public_key.is_empty() {
        bail!("server_public_key is required");
    }
    if cfg.server_endpoint.is_empty() {
        bail!("server_endpoint is required");
    }
    if cfg.server_allowed_ips.is_empty() {
        bail!("server_allowed_ips is required");
    }
    Ok(())
}

/// Renders `wg setconf` config for the controller interface.
pub fn render_server_set_conf(cfg: &ServerConfig, peers: &[Peer]) -> Result<String> {
    if cfg.private_key.is_empty() {
        bail!("wg_private_key is required");
    }

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", cfg.private_key));
    if cfg.listen_port > 0 {
        out.push_str(&format!("ListenPort = {}\n", cfg.listen_port));
    }

    for peer in peers {
        if peer.public_key.is_empty() || peer.allowed_ips.is_empty() {
            continue;
        }
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
        if !peer.endpoint.is_empty() {
            out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
        }
        if peer.keepalive_sec > 0 {
            out.push_str(&format!("PersistentKeepalive = {}\n", peer.keepalive_sec));
        }
    }
    Ok(out)
}

/// Writes a rendered WireGuard config with 0600 permissions.
pub fn write_config(path: &std::path::Path, content: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Parses `wg show <iface> dump` output into pubkey -> endpoint, skipping
/// peers without a live endpoint.
pub fn parse_wg_dump_endpoints(dump: &str) -> HashMap<String, String> {
    let mut endpoints = HashMap::new();
    // First line is interface info.
    for line in dump.trim().lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let pub_key = fields[0];
        let endpoint = fields[2];
        if pub_key.is_empty()
            || endpoint.is_empty()
            || endpoint == "(none)"
            || endpoint == "0.0.0.0:0"
            || endpoint == "[::]:0"
        {
            continue;
        }
        endpoints.insert(pub_key.to_string(), endpoint.to_string());
    }
    endpoints
}

/// Drives `ip` and `wg` for one host.
pub struct Manager {
    runner: Arc<dyn Runner>,
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new(Arc::new(OsRunner))
    }
}

impl Manager {
    pub fn new(runner: Arc<dyn Runner>) -> Manager {
        Manager { runner }
    }

    /// Brings up the node interface: create, address, MTU, up, syncconf,
    /// routes, policy rule.
    pub fn up(&self, cfg: &NodeConfig, set_conf: &str) -> Result<()> {
        if cfg.wg_interface.is_empty() {
            bail!("wg_interface is required");
        }
        if cfg.vpn_ip.is_empty() {
            bail!("vpn_ip is required");
        }
        self.ensure_interface(&cfg.wg_interface)?;
        self.runner.run(
            "ip",
            &["address", "replace", &cfg.vpn_ip, "dev", &cfg.wg_interface],
        )?;
        if cfg.mtu > 0 {
            self.runner.run(
                "ip",
                &[
                    "link",
                    "set",
                    "dev",
                    &cfg.wg_interface,
                    "mtu",
                    &cfg.mtu.to_string(),
                ],
            )?;
        }
        self.runner
            .run("ip", &["link", "set", "dev", &cfg.wg_interface, "up"])?;

        self.sync_conf(&cfg.wg_interface, set_conf)?;
        for cidr in &cfg.server_allowed_ips {
            self.runner
                .run("ip", &["route", "replace", cidr, "dev", &cfg.wg_interface])?;
        }
        if cfg.policy_routing_enabled() {
            self.ensure_policy_rule(
                cfg.policy_routing_priority,
                cfg.policy_routing_table,
                &cfg.policy_routing_cidr,
            )?;
        }
        Ok(())
    }

    /// Removes the node interface and its policy routing state.
    pub fn down(&self, cfg: &NodeConfig) -> Result<()> {
        if cfg.policy_routing_enabled() {
            let _ = self.flush_policy_table(cfg.policy_routing_table);
            let _ = self.delete_policy_rule(
                cfg.policy_routing_priority,
                cfg.policy_routing_table,
                &cfg.policy_routing_cidr,
            );
        }
        if cfg.wg_interface.is_empty() {
            bail!("wg_interface is required");
        }
        match self
            .runner
            .run("ip", &["link", "del", "dev", &cfg.wg_interface])
        {
            Ok(()) => Ok(()),
            Err(e)
                if e.to_string().contains("Cannot find device")
                    || e.to_string().contains("does not exist") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Basic interface + wg status output.
    pub fn status(&self, iface: &str) -> Result<String> {
        if iface.is_empty() {
            bail!("wg_interface is required");
        }
        let ip_out = self
            .runner
            .output("ip", &["-brief", "addr", "show", "dev", iface]);
        let wg_out = self.runner.output("wg", &["show", iface]);
        match (&ip_out, &wg_out) {
            (Err(ip_err), Err(wg_err)) => bail!("ip: {ip_err}; wg: {wg_err}"),
            _ => {}
        }

        let mut out = String::new();
        if let Ok(text) = ip_out {
            if !text.is_empty() {
                out.push_str("ip:\n");
                out.push_str(&text);
            }
        }
        if let Ok(text) = wg_out {
            if !text.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str("wg:\n");
                out.push_str(&text);
            }
        }
        Ok(out)
    }

    /// Syncs direct peers into the interface and refreshes the policy table.
    pub fn apply_peers(&self, cfg: &NodeConfig, peers: &[Peer]) -> Result<()> {
        let set_conf = render_set_conf(cfg, peers)?;
        self.sync_conf(&cfg.wg_interface, &set_conf)?;
        if cfg.policy_routing_enabled() {
            self.ensure_policy_rule(
                cfg.policy_routing_priority,
                cfg.policy_routing_table,
                &cfg.policy_routing_cidr,
            )?;
            self.flush_policy_table(cfg.policy_routing_table)?;
            for peer in peers {
                for cidr in &peer.allowed_ips {
                    self.runner.run(
                        "ip",
                        &[
                            "route",
                            "replace",
                            cidr,
                            "dev",
                            &cfg.wg_interface,
                            "table",
                            &cfg.policy_routing_table.to_string(),
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Controller side: ensures the interface is up and syncs peers.
    pub fn apply_server(&self, cfg: &ServerConfig, peers: &[Peer]) -> Result<()> {
        if cfg.interface.is_empty() {
            bail!("wg_interface is required");
        }
        if cfg.address.is_empty() {
            bail!("wg_address is required");
        }
        self.ensure_interface(&cfg.interface)?;
        self.runner.run(
            "ip",
            &["address", "replace", &cfg.address, "dev", &cfg.interface],
        )?;
        if cfg.mtu > 0 {
            self.runner.run(
                "ip",
                &[
                    "link",
                    "set",
                    "dev",
                    &cfg.interface,
                    "mtu",
                    &cfg.mtu.to_string(),
                ],
            )?;
        }
        self.runner
            .run("ip", &["link", "set", "dev", &cfg.interface, "up"])?;

        let set_conf = render_server_set_conf(cfg, peers)?;
        self.sync_conf(&cfg.interface, &set_conf)
    }

    /// Peer public key -> endpoint as currently observed by WireGuard.
    ///
    /// This is the only reliable way to learn the NAT-mapped UDP port for wg
    /// traffic when the peer is behind NAT; STUN performed on a different
    /// socket yields a different mapping.
    pub fn peer_endpoints(&self, iface: &str) -> Result<HashMap<String, String>> {
        if iface.is_empty() {
            bail!("wg_interface is required");
        }
        let out = self.runner.output("wg", &["show", iface, "dump"])?;
        Ok(parse_wg_dump_endpoints(&out))
    }

    fn ensure_interface(&self, iface: &str) -> Result<()> {
        if self.interface_exists(iface) {
            return Ok(());
        }
        match self
            .runner
            .run("ip", &["link", "add", "dev", iface, "type", "wireguard"])
        {
            Ok(()) => Ok(()),
            // Concurrent `up` runs may have raced us here.
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn interface_exists(&self, iface: &str) -> bool {
        self.runner
            .output("ip", &["link", "show", "dev", iface])
            .is_ok()
    }

    fn sync_conf(&self, iface: &str, content: &str) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix("wgfleet-wg-")
            .suffix(".conf")
            .tempfile()
            .context("create temp wg config")?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        let path = tmp.path().to_string_lossy().to_string();
        self.runner.run("wg", &["syncconf", iface, &path])
    }

    fn ensure_policy_rule(&self, priority: u32, table: u32, cidr: &str) -> Result<()> {
        if priority == 0 || table == 0 {
            bail!("invalid policy routing settings");
        }
        if cidr.is_empty() || cidr == "0.0.0.0/0" || cidr == "::/0" {
            bail!("policy_routing_cidr is required and must be scoped");
        }
        match self.runner.run(
            "ip",
            &[
                "rule",
                "add",
                "pref",
                &priority.to_string(),
                "to",
                cidr,
                "lookup",
                &table.to_string(),
            ],
        ) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delete_policy_rule(&self, priority: u32, table: u32, cidr: &str) -> Result<()> {
        if priority == 0 || table == 0 {
            return Ok(());
        }
        let priority = priority.to_string();
        let table = table.to_string();
        let mut args = vec!["rule", "del", "pref", priority.as_str()];
        if !cidr.is_empty() {
            args.extend_from_slice(&["to", cidr]);
        }
        args.extend_from_slice(&["lookup", table.as_str()]);
        match self.runner.run("ip", &args) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such file") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn flush_policy_table(&self, table: u32) -> Result<()> {
        if table == 0 {
            return Ok(());
        }
        self.runner
            .run("ip", &["route", "flush", "table", &table.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and serves canned output for `output` calls.
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        pub outputs: HashMap<String, String>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                outputs: HashMap::new(),
            }
        }

        pub fn with_output(mut self, cmd: &str, out: &str) -> Self {
            self.outputs.insert(cmd.to_string(), out.to_string());
            self
        }

        fn record(&self, name: &str, args: &[&str]) -> String {
            let call = format!("{name} {}", args.join(" "));
            self.calls.lock().unwrap().push(call.clone());
            call
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, name: &str, args: &[&str]) -> Result<()> {
            self.record(name, args);
            Ok(())
        }

        fn output(&self, name: &str, args: &[&str]) -> Result<String> {
            let call = self.record(name, args);
            match self.outputs.get(&call) {
                Some(out) => Ok(out.clone()),
                None => Err(anyhow::anyhow!("no canned output for {call}")),
            }
        }
    }

    fn node_cfg() -> NodeConfig {
        NodeConfig {
            name: "edge-1".to_string(),
            wg_interface: "wg0".to_string(),
            wg_private_key: "PRIV".to_string(),
            wg_listen_port: 51820,
            vpn_ip: "10.7.0.2/32".to_string(),
            mtu: 1280,
            server_public_key: "HUBKEY".to_string(),
            server_endpoint: "198.51.100.1:51820".to_string(),
            server_allowed_ips: vec!["10.7.0.0/24".to_string()],
            server_keepalive_sec: 25,
            policy_routing_table: 51820,
            policy_routing_priority: 1000,
            policy_routing_cidr: "10.7.0.0/24".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_wg_dump_endpoints() {
        let dump = "wg0\t(priv)\t(pub)\t51820\toff\n\
            puba\t(psk)\t39.1.2.3:12345\t10.7.0.2/32\t0\t0\t0\toff\n\
            pubb\t(psk)\t(none)\t10.7.0.3/32\t0\t0\t0\toff\n\
            pubc\t(psk)\t[2001:db8::1]:51820\t10.7.0.4/32\t0\t0\t0\toff\n\
            pubd\t(psk)\t0.0.0.0:0\t10.7.0.5/32\t0\t0\t0\toff\n";

        let m = parse_wg_dump_endpoints(dump);
        assert_eq!(m.get("puba").map(String::as_str), Some("39.1.2.3:12345"));
        assert!(!m.contains_key("pubb"));
        assert_eq!(
            m.get("pubc").map(String::as_str),
            Some("[2001:db8::1]:51820")
        );
        assert!(!m.contains_key("pubd"));
    }

    #[test]
    fn test_render_node_hub_topology() {
        let conf = render_node(&node_cfg()).unwrap();
        assert!(conf.contains("[Interface]\nPrivateKey = PRIV\n"));
        assert!(conf.contains("Address = 10.7.0.2/32\n"));
        assert!(conf.contains("MTU = 1280\n"));
        assert!(conf.contains("[Peer]\nPublicKey = HUBKEY\n"));
        assert!(conf.contains("AllowedIPs = 10.7.0.0/24\n"));
        assert!(conf.contains("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_render_set_conf_keeps_hub_first_and_skips_incomplete_peers() {
        let peers = vec![
            Peer {
                public_key: "K_b".to_string(),
                endpoint: "198.51.100.2:51820".to_string(),
                allowed_ips: vec!["10.7.0.3/32".to_string()],
                keepalive_sec: 25,
            },
            Peer {
                public_key: "K_c".to_string(),
                endpoint: String::new(),
                allowed_ips: vec!["10.7.0.4/32".to_string()],
                keepalive_sec: 25,
            },
        ];
        let conf = render_set_conf(&node_cfg(), &peers).unwrap();
        let hub = conf.find("PublicKey = HUBKEY").unwrap();
        let direct = conf.find("PublicKey = K_b").unwrap();
        assert!(hub < direct);
        assert!(!conf.contains("K_c"));
        assert!(!conf.contains("Address ="));
    }

    #[test]
    fn test_render_set_conf_requires_server_fields() {
        let mut cfg = node_cfg();
        cfg.server_public_key.clear();
        assert!(render_set_conf(&cfg, &[]).is_err());
    }

    #[test]
    fn test_render_server_set_conf() {
        let cfg = ServerConfig {
            interface: "wg0".to_string(),
            private_key: "SRVPRIV".to_string(),
            address: "10.7.0.1/24".to_string(),
            listen_port: 51820,
            mtu: 1280,
        };
        let peers = vec![Peer {
            public_key: "K_a".to_string(),
            endpoint: String::new(),
            allowed_ips: vec!["10.7.0.2/32".to_string()],
            keepalive_sec: 0,
        }];
        let conf = render_server_set_conf(&cfg, &peers).unwrap();
        assert!(conf.contains("ListenPort = 51820\n"));
        assert!(conf.contains("PublicKey = K_a\n"));
        assert!(!conf.contains("Endpoint ="));
    }

    #[test]
    fn test_peer_endpoints_uses_dump() {
        let runner = RecordingRunner::new().with_output(
            "wg show wg0 dump",
            "wg0\t(priv)\t(pub)\t51820\toff\npub-b\t(psk)\t39.1.2.3:51820\t10.7.0.12/32\t0\t0\t0\toff",
        );
        let mgr = Manager::new(Arc::new(runner));
        let m = mgr.peer_endpoints("wg0").unwrap();
        assert_eq!(m.get("pub-b").map(String::as_str), Some("39.1.2.3:51820"));
    }

    #[test]
    fn test_apply_peers_refreshes_policy_table() {
        let runner = Arc::new(RecordingRunner::new());
        let mgr = Manager::new(runner.clone());
        let peers = vec![Peer {
            public_key: "K_b".to_string(),
            endpoint: "198.51.100.2:51820".to_string(),
            allowed_ips: vec!["10.7.0.3/32".to_string()],
            keepalive_sec: 25,
        }];
        mgr.apply_peers(&node_cfg(), &peers).unwrap();

        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("wg syncconf wg0")));
        assert!(calls
            .iter()
            .any(|c| c == "ip rule add pref 1000 to 10.7.0.0/24 lookup 51820"));
        assert!(calls.iter().any(|c| c == "ip route flush table 51820"));
        assert!(calls
            .iter()
            .any(|c| c == "ip route replace 10.7.0.3/32 dev wg0 table 51820"));
    }

    #[test]
    fn test_down_tolerates_missing_device() {
        struct FailingRunner;
        impl Runner for FailingRunner {
            fn run(&self, _name: &str, _args: &[&str]) -> Result<()> {
                Err(anyhow::anyhow!("Cannot find device \"wg0\""))
            }
            fn output(&self, _name: &str, _args: &[&str]) -> Result<String> {
                Err(anyhow::anyhow!("nope"))
            }
        }
        let mgr = Manager::new(Arc::new(FailingRunner));
        let mut cfg = node_cfg();
        cfg.policy_routing_enabled = Some(false);
        assert!(mgr.down(&cfg).is_ok());
    }
}
