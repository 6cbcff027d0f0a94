//! The long-running node agent: keepalive registration, NAT probing,
//! candidate-driven peer reconciliation, and tunnel health checks.

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};

use crate::addr::{add_ipv4, join_host_port, mask_ipv4, normalize_host_cidr, parse_ipv4_cidr,
    probe_addr};
use crate::api::{
    ApiClient, DirectResultRequest, MetricsRequest, NatProbeRequest, PeerCandidate,
    RegisterRequest,
};
use crate::config::{NodeConfig, DEFAULT_PROBE_PORT};
use crate::direct::{self, SharedSocket, ECHO_PREFIX};
use crate::metrics::{self, Metric};
use crate::wg::{Manager, Peer};

/// Returned by [`run`] when the tunnel health check decides the WireGuard
/// tunnel is no longer passing traffic. The supervisor reacts by re-syncing
/// server configuration and bringing the interface up again.
#[derive(Debug)]
pub struct TunnelDead;

impl fmt::Display for TunnelDead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tunnel health check failed")
    }
}

impl std::error::Error for TunnelDead {}

/// Runs the agent loop until ctrl-c (Ok) or a fatal condition (Err).
pub async fn run(mut cfg: NodeConfig, wg: &Manager) -> Result<()> {
    let client = ApiClient::new(&crate::api::normalize_base_url(&cfg.controller));

    let resp = register(&client, &cfg).await?;
    let node_id = resp.node_id;
    if cfg.vpn_ip.is_empty() && !resp.vpn_ip.is_empty() {
        cfg.vpn_ip = resp.vpn_ip;
    }

    let shared = if cfg.probe_port > 0 {
        let shared = SharedSocket::listen(&format!(":{}", cfg.probe_port)).await?;
        info!("probe responder on {}", shared.local_addr()?);
        Some(shared)
    } else {
        None
    };

    if let Err(e) = fill_server_config(&client, &mut cfg).await {
        warn!("server config fetch failed: {e}");
    }

    let mut keepalive_ticker = interval(cfg.keepalive_interval());
    let mut stun_ticker = interval(cfg.stun_interval());
    let mut candidates_ticker = interval(cfg.candidates_interval());
    let mut direct_ticker = interval(cfg.direct_interval());
    for t in [
        &mut keepalive_ticker,
        &mut stun_ticker,
        &mut candidates_ticker,
        &mut direct_ticker,
    ] {
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    let hub_probe = hub_probe_address(&cfg);
    // First health check only after a full period; the tunnel may still be
    // settling right after startup.
    let health_period = Duration::from_secs(cfg.health_check_interval_sec.max(1));
    let mut health_ticker = interval_at(Instant::now() + health_period, health_period);
    health_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let health_enabled = hub_probe.is_some() && cfg.health_check_interval_sec > 0;
    let mut health_failures: u32 = 0;

    let mut candidates: Vec<PeerCandidate> = Vec::new();
    let mut public_addr = String::new();
    let mut nat_type = String::new();
    let mut active_peers: HashMap<String, Peer> = HashMap::new();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("agent shutting down");
                return Ok(());
            }
            _ = keepalive_ticker.tick() => {
                if let Err(e) = register(&client, &cfg).await {
                    warn!("keepalive register failed: {e}");
                }
            }
            _ = stun_ticker.tick() => {
                if cfg.direct_mode == "off" || cfg.stun_servers.is_empty() {
                    continue;
                }
                let Some(shared) = shared.as_ref() else { continue };
                match direct::probe_nat(shared, &cfg.stun_servers, Duration::from_secs(5)).await {
                    Ok((addr, class)) => {
                        public_addr = addr;
                        nat_type = class.to_string();
                        if let Err(e) = client.submit_nat_probe(&NatProbeRequest {
                            node_id: node_id.clone(),
                            nat_type: nat_type.clone(),
                            public_addr: public_addr.clone(),
                        }).await {
                            warn!("NAT probe submit failed: {e}");
                        }
                    }
                    Err(e) => warn!("STUN probe failed: {e}"),
                }
            }
            _ = candidates_ticker.tick() => {
                match client.candidates(&node_id).await {
                    Ok(resp) => candidates = resp.peers,
                    Err(e) => warn!("candidates fetch failed: {e}"),
                }
            }
            _ = direct_ticker.tick() => {
                if cfg.direct_mode == "off" {
                    continue;
                }
                let desired = build_desired_peers(&candidates, &cfg);

                probe_candidates(
                    &client, &node_id, &candidates, &cfg, &nat_type, &public_addr,
                ).await;

                let server_ready = !cfg.server_public_key.is_empty()
                    && !cfg.server_endpoint.is_empty()
                    && !cfg.server_allowed_ips.is_empty();
                if server_ready && !peers_equal(&active_peers, &desired) {
                    let peer_list: Vec<Peer> = desired.values().cloned().collect();
                    info!("inject wg peers count={}", peer_list.len());
                    match wg.apply_peers(&cfg, &peer_list) {
                        Ok(()) => {
                            info!("inject wg peers ok count={}", peer_list.len());
                            active_peers = desired;
                        }
                        Err(e) => warn!("apply peers failed: {e}"),
                    }
                }
            }
            _ = health_ticker.tick(), if health_enabled => {
                let hub_addr = hub_probe.as_deref().unwrap_or_default();
                if check_tunnel_health(hub_addr, cfg.health_check_timeout()).await {
                    health_failures = 0;
                } else {
                    health_failures += 1;
                    warn!(
                        "health check failed ({health_failures}/{}) hub={hub_addr}",
                        cfg.health_check_failures
                    );
                    if health_failures >= cfg.health_check_failures {
                        return Err(anyhow::Error::new(TunnelDead));
                    }
                }
            }
        }
    }
}

async fn register(client: &ApiClient, cfg: &NodeConfig) -> Result<crate::api::RegisterResponse> {
    client
        .register(&RegisterRequest {
            name: cfg.name.clone(),
            pub_key: cfg.wg_public_key.clone(),
            vpn_ip: cfg.vpn_ip.clone(),
            endpoint: cfg.advertise_wg_endpoint.clone(),
            public_addr: cfg.advertise_public_addr.clone(),
            nat_type: String::new(),
            direct_mode: cfg.direct_mode.clone(),
            probe_port: cfg.probe_port,
        })
        .await
}

/// Fetches server peer settings from the controller when the config does not
/// already carry them.
pub async fn fill_server_config(client: &ApiClient, cfg: &mut NodeConfig) -> Result<()> {
    if !cfg.server_public_key.is_empty()
        && !cfg.server_endpoint.is_empty()
        && !cfg.server_allowed_ips.is_empty()
    {
        if cfg.policy_routing_cidr.is_empty() {
            cfg.policy_routing_cidr = crate::addr::first_scoped_cidr(&cfg.server_allowed_ips);
        }
        return Ok(());
    }
    if cfg.controller.is_empty() {
        anyhow::bail!("node.controller required to fetch server config");
    }
    let resp = client.wg_config(&cfg.name).await?;
    cfg.server_public_key = resp.server_public_key;
    cfg.server_endpoint = resp.server_endpoint;
    cfg.server_allowed_ips = resp.server_allowed_ips;
    cfg.server_keepalive_sec = resp.server_keepalive_sec;
    if cfg.policy_routing_cidr.is_empty() {
        cfg.policy_routing_cidr = crate::addr::first_scoped_cidr(&cfg.server_allowed_ips);
    }
    Ok(())
}

/// Converts the candidate list into the desired direct peer set.
///
/// A peer enters the set only with `p2p_ready`, a non-empty observed
/// endpoint, key, and overlay address. Two candidates claiming the same
/// overlay address would render an invalid config (overlapping AllowedIPs),
/// so the first claim wins and the rest are skipped for this cycle.
pub fn build_desired_peers(
    candidates: &[PeerCandidate],
    cfg: &NodeConfig,
) -> HashMap<String, Peer> {
    let mut desired = HashMap::new();
    let mut allowed_owner: HashMap<String, String> = HashMap::new();

    for peer in candidates {
        let mut inject = peer.p2p_ready;
        // The wg endpoint must be the one the controller observed; the
        // STUN-derived public_addr belongs to the probe socket and its NAT
        // mapping does not match the wg socket.
        let wg_endpoint = &peer.endpoint;
        let allowed_ip = normalize_host_cidr(&peer.vpn_ip);
        if inject && !allowed_ip.is_empty() {
            let claimed_by_other = allowed_owner
                .get(&allowed_ip)
                .filter(|prev| **prev != peer.id)
                .cloned();
            if let Some(prev) = claimed_by_other {
                info!(
                    "skip peer injection name={} id={} vpn_ip={}: duplicate allowed_ip (already owned by {prev})",
                    peer.name, peer.id, peer.vpn_ip
                );
                inject = false;
            } else {
                allowed_owner.insert(allowed_ip.clone(), peer.id.clone());
            }
        }
        if inject && !allowed_ip.is_empty() && !peer.pub_key.is_empty() && !wg_endpoint.is_empty()
        {
            desired.insert(
                peer.id.clone(),
                Peer {
                    public_key: peer.pub_key.clone(),
                    endpoint: wg_endpoint.clone(),
                    allowed_ips: vec![allowed_ip],
                    keepalive_sec: direct_keepalive(cfg, &peer.nat_type),
                },
            );
        }
    }
    desired
}

/// Probes every candidate's probe port and reports the outcome. Successful
/// probes also produce a metric sample.
async fn probe_candidates(
    client: &ApiClient,
    node_id: &str,
    candidates: &[PeerCandidate],
    cfg: &NodeConfig,
    nat_type: &str,
    public_addr: &str,
) {
    for peer in candidates {
        let Some(peer_addr) = probe_addr(&peer.public_addr, &peer.endpoint, peer.probe_port)
        else {
            continue;
        };

        let rtt = match direct::probe_peer(&peer_addr, Duration::from_secs(2)).await {
            Ok(rtt) => rtt,
            Err(e) => {
                let _ = client
                    .submit_direct_result(&DirectResultRequest {
                        node_id: node_id.to_string(),
                        peer_id: peer.id.clone(),
                        success: false,
                        rtt_ms: 0.0,
                        reason: e.to_string(),
                    })
                    .await;
                continue;
            }
        };

        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let _ = client
            .submit_direct_result(&DirectResultRequest {
                node_id: node_id.to_string(),
                peer_id: peer.id.clone(),
                success: true,
                rtt_ms,
                reason: String::new(),
            })
            .await;

        let sample = Metric {
            timestamp: Utc::now(),
            node_id: node_id.to_string(),
            peer_id: peer.id.clone(),
            path: "direct".to_string(),
            rtt_ms,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            throughput_mbps: 0.0,
            mtu: cfg.mtu,
            nat_type: nat_type.to_string(),
            public_addr: public_addr.to_string(),
            relay_reason: String::new(),
        };

        if !cfg.metrics_path.is_empty() {
            if let Err(e) = metrics::append_csv(Path::new(&cfg.metrics_path), &[sample.clone()])
            {
                warn!("append metrics failed: {e}");
            }
        }
        if let Err(e) = client
            .submit_metrics(&MetricsRequest {
                node_id: node_id.to_string(),
                samples: vec![sample],
            })
            .await
        {
            warn!("submit metrics failed: {e}");
        }
    }
}

/// Keepalive period for a direct peer, by its NAT class. Symmetric and
/// unclassified NATs rebind aggressively and need the short period.
pub fn direct_keepalive(cfg: &NodeConfig, nat_type: &str) -> u64 {
    match nat_type {
        "" | "symmetric" => {
            if cfg.direct_keepalive_symmetric_sec > 0 {
                return cfg.direct_keepalive_symmetric_sec;
            }
        }
        "unknown" => {
            if cfg.direct_keepalive_unknown_sec > 0 {
                return cfg.direct_keepalive_unknown_sec;
            }
        }
        _ => {
            if cfg.direct_keepalive_sec > 0 {
                return cfg.direct_keepalive_sec;
            }
        }
    }
    if cfg.direct_keepalive_sec > 0 {
        return cfg.direct_keepalive_sec;
    }
    cfg.keepalive_sec
}

/// Compares the last-applied peer set against the desired one.
pub fn peers_equal(a: &HashMap<String, Peer>, b: &HashMap<String, Peer>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(k, v)| b.get(k) == Some(v))
}

/// The hub's probe address for health checks: first usable host of the
/// first scoped server allowed-ips CIDR, on the well-known probe port.
pub fn hub_probe_address(cfg: &NodeConfig) -> Option<String> {
    if cfg.health_check_interval_sec == 0 || cfg.health_check_failures == 0 {
        return None;
    }
    for cidr in &cfg.server_allowed_ips {
        if cidr.is_empty() || cidr == "0.0.0.0/0" || cidr == "::/0" {
            continue;
        }
        let Some((addr, bits)) = parse_ipv4_cidr(cidr) else {
            continue;
        };
        let hub = add_ipv4(mask_ipv4(addr, bits), 1);
        return Some(join_host_port(&hub.to_string(), DEFAULT_PROBE_PORT));
    }
    None
}

/// Sends a single echo to the hub's probe address and waits for the
/// reflection. Returns true when the echo came back within the timeout.
pub async fn check_tunnel_health(hub_addr: &str, timeout_dur: Duration) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    if socket.connect(hub_addr).await.is_err() {
        return false;
    }

    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    let msg = format!("{ECHO_PREFIX}health-{}", hex::encode(raw));
    if socket.send(msg.as_bytes()).await.is_err() {
        return false;
    }

    let mut buf = [0u8; 256];
    match timeout(timeout_dur, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => buf[..n] == *msg.as_bytes(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::Responder;

    fn keepalive_cfg() -> NodeConfig {
        NodeConfig {
            keepalive_sec: 25,
            direct_keepalive_sec: 30,
            direct_keepalive_unknown_sec: 20,
            direct_keepalive_symmetric_sec: 15,
            ..Default::default()
        }
    }

    fn candidate(id: &str, vpn_ip: &str, endpoint: &str) -> PeerCandidate {
        PeerCandidate {
            id: id.to_string(),
            name: id.to_string(),
            pub_key: format!("key-{id}"),
            vpn_ip: vpn_ip.to_string(),
            endpoint: endpoint.to_string(),
            p2p_ready: true,
            probe_port: 51900,
            ..Default::default()
        }
    }

    #[test]
    fn test_direct_keepalive_selects_by_nat() {
        let cfg = keepalive_cfg();
        assert_eq!(direct_keepalive(&cfg, "symmetric"), 15);
        assert_eq!(direct_keepalive(&cfg, "unknown"), 20);
        assert_eq!(direct_keepalive(&cfg, "cone_or_restricted"), 30);
        assert_eq!(direct_keepalive(&cfg, ""), 15);
    }

    #[test]
    fn test_direct_keepalive_falls_back_to_generic() {
        let cfg = NodeConfig {
            keepalive_sec: 25,
            ..Default::default()
        };
        assert_eq!(direct_keepalive(&cfg, "symmetric"), 25);
        assert_eq!(direct_keepalive(&cfg, "cone_or_restricted"), 25);
    }

    #[test]
    fn test_build_desired_requires_all_fields() {
        let cfg = keepalive_cfg();
        let mut not_ready = candidate("a", "10.7.0.2/32", "1.1.1.1:51820");
        not_ready.p2p_ready = false;
        let no_endpoint = candidate("b", "10.7.0.3/32", "");
        let mut no_key = candidate("c", "10.7.0.4/32", "3.3.3.3:51820");
        no_key.pub_key.clear();
        let good = candidate("d", "10.7.0.5", "4.4.4.4:51820");

        let desired =
            build_desired_peers(&[not_ready, no_endpoint, no_key, good], &cfg);
        assert_eq!(desired.len(), 1);
        let peer = &desired["d"];
        assert_eq!(peer.allowed_ips, vec!["10.7.0.5/32".to_string()]);
        assert_eq!(peer.endpoint, "4.4.4.4:51820");
        assert_eq!(peer.keepalive_sec, 30);
    }

    #[test]
    fn test_build_desired_skips_duplicate_allowed_ips() {
        let cfg = keepalive_cfg();
        let candidates = vec![
            candidate("a", "10.7.0.23/32", "1.1.1.1:1"),
            candidate("b", "10.7.0.23/32", "2.2.2.2:2"),
        ];
        let desired = build_desired_peers(&candidates, &cfg);
        assert_eq!(desired.len(), 1);
        assert!(desired.contains_key("a"));
    }

    #[test]
    fn test_peers_equal_detects_endpoint_change() {
        let peer = Peer {
            public_key: "k1".to_string(),
            endpoint: "1.1.1.1:1".to_string(),
            allowed_ips: vec!["10.0.0.1/32".to_string()],
            keepalive_sec: 25,
        };
        let a: HashMap<String, Peer> = [("p1".to_string(), peer.clone())].into();
        let b: HashMap<String, Peer> = [("p1".to_string(), peer.clone())].into();
        assert!(peers_equal(&a, &b));

        let changed = Peer {
            endpoint: "1.1.1.1:2".to_string(),
            ..peer
        };
        let c: HashMap<String, Peer> = [("p1".to_string(), changed)].into();
        assert!(!peers_equal(&a, &c));
    }

    #[test]
    fn test_reconcile_idempotent_on_unchanged_candidates() {
        let cfg = keepalive_cfg();
        let candidates = vec![candidate("b", "10.7.0.3/32", "198.51.100.2:51820")];

        let first = build_desired_peers(&candidates, &cfg);
        let second = build_desired_peers(&candidates, &cfg);
        assert!(peers_equal(&first, &second));

        // An endpoint change must produce a different desired set.
        let moved = vec![candidate("b", "10.7.0.3/32", "198.51.100.9:51820")];
        let third = build_desired_peers(&moved, &cfg);
        assert!(!peers_equal(&first, &third));
        assert_eq!(third["b"].endpoint, "198.51.100.9:51820");
    }

    #[test]
    fn test_hub_probe_address() {
        let cfg = NodeConfig {
            health_check_interval_sec: 3,
            health_check_failures: 3,
            server_allowed_ips: vec!["10.7.0.0/24".to_string()],
            ..Default::default()
        };
        assert_eq!(hub_probe_address(&cfg).as_deref(), Some("10.7.0.1:51900"));

        let disabled = NodeConfig {
            health_check_interval_sec: 0,
            ..cfg.clone()
        };
        assert_eq!(hub_probe_address(&disabled), None);

        let skips_default = NodeConfig {
            server_allowed_ips: vec!["0.0.0.0/0".to_string(), "10.7.0.0/24".to_string()],
            ..cfg.clone()
        };
        assert_eq!(
            hub_probe_address(&skips_default).as_deref(),
            Some("10.7.0.1:51900")
        );

        let empty = NodeConfig {
            server_allowed_ips: Vec::new(),
            ..cfg
        };
        assert_eq!(hub_probe_address(&empty), None);
    }

    #[tokio::test]
    async fn test_check_tunnel_health_round_trip() {
        let resp = Responder::start(":0").await.unwrap();
        let addr = resp.local_addr().unwrap();
        let hub = format!("127.0.0.1:{}", addr.port());
        assert!(check_tunnel_health(&hub, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_check_tunnel_health_timeout() {
        assert!(!check_tunnel_health("127.0.0.1:19999", Duration::from_millis(500)).await);
    }
}
