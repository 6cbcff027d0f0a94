use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;

use wgfleet::agent::{self, TunnelDead};
use wgfleet::api::{normalize_base_url, ApiClient, DirectResultRequest, MetricsRequest,
    NatProbeRequest, PeerCandidate, RegisterRequest};
use wgfleet::config::{self, Config, ControllerConfig, NodeConfig};
use wgfleet::controller::Server;
use wgfleet::direct::{self, Responder, SharedSocket};
use wgfleet::metrics::{self, Metric};
use wgfleet::registry::Registry;
use wgfleet::wg::{self, Manager};

#[derive(Parser, Debug)]
#[command(
    name = "wgfleet",
    version,
    about = "Controller and agent for a WireGuard-tunneled host fleet",
    long_about = "wgfleet manages a small fleet of WireGuard hosts:\n\
        a controller keeps the peer registry and classifies pair reachability,\n\
        agents probe NAT and peers, inject direct /32 shortcuts when safe,\n\
        and collect path measurements.\n\n\
        Examples:\n  \
          # Run the controller\n  \
          wgfleet controller run --config /etc/wgfleet/controller.yaml\n\n  \
          # Run a node agent under the supervisor\n  \
          wgfleet node serve --config /etc/wgfleet/node.yaml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Controller-side operations
    Controller {
        #[command(subcommand)]
        cmd: ControllerCmd,
    },
    /// Node-side operations
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
    /// Direct probe responder and one-shot tests
    Direct {
        #[command(subcommand)]
        cmd: DirectCmd,
    },
    /// Print peer candidates as seen by the controller
    Discover(ConfigArg),
    /// Measure RTT to a peer over the probe port
    Ping(PingArgs),
    /// Measure throughput and loss to a peer
    Perf(PerfArgs),
    /// Summarize the metrics CSV over a time window
    Stats(StatsArgs),
    /// Export collected metrics
    Export {
        #[command(subcommand)]
        cmd: ExportCmd,
    },
    /// Render config and bring the WireGuard interface up
    Up(UpArgs),
    /// Tear the WireGuard interface down
    Down(DownArgs),
    /// Show interface and wg status
    Status(StatusArgs),
    /// Print tunnel diagnostics
    Doctor(StatusArgs),
}

#[derive(Subcommand, Debug)]
enum ControllerCmd {
    /// Start the controller HTTP API
    Run(ConfigArg),
    /// Print the node registry
    Status(ConfigArg),
}

#[derive(Subcommand, Debug)]
enum NodeCmd {
    /// One-shot registration with the controller
    Join(JoinArgs),
    /// Run the agent loop in the foreground
    Run(ConfigArg),
    /// Supervised agent: sync config, bring wg up, restart on failure
    Serve(ServeArgs),
    /// Pull assignment and server settings into the config file
    SyncConfig(ConfigArg),
}

#[derive(Subcommand, Debug)]
enum DirectCmd {
    /// Run a standalone probe responder
    Serve(DirectServeArgs),
    /// Probe one peer and report the result to the controller
    Test(DirectTestArgs),
}

#[derive(Subcommand, Debug)]
enum ExportCmd {
    /// Copy the metrics CSV to a destination file
    Csv(ExportCsvArgs),
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Path to YAML config
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Node name
    #[arg(long)]
    name: Option<String>,
    /// Controller host:port
    #[arg(long)]
    controller: Option<String>,
    /// WireGuard public key
    #[arg(long)]
    pubkey: Option<String>,
    /// WireGuard VPN IP
    #[arg(long)]
    vpn_ip: Option<String>,
    /// Direct mode: auto|off
    #[arg(long)]
    direct: Option<String>,
    /// Comma-separated STUN servers
    #[arg(long)]
    stun: Option<String>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    config: PathBuf,
    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,
    /// Max retry delay in seconds
    #[arg(long, default_value_t = 30)]
    retry_max_delay: u64,
}

#[derive(Args, Debug)]
struct DirectServeArgs {
    /// Local UDP listen address
    #[arg(long, default_value = ":0")]
    listen: String,
}

#[derive(Args, Debug)]
struct DirectTestArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Peer name or ID
    #[arg(long)]
    peer: String,
    /// Probe timeout in seconds
    #[arg(long, default_value_t = 3)]
    timeout: u64,
}

#[derive(Args, Debug)]
struct PingArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Peer name or ID
    #[arg(long)]
    peer: Option<String>,
    /// Ping all peers
    #[arg(long)]
    all: bool,
    /// Number of probes
    #[arg(long, default_value_t = 5)]
    count: usize,
    /// Probe interval in milliseconds
    #[arg(long, default_value_t = 500)]
    interval: u64,
    /// Probe timeout in seconds
    #[arg(long, default_value_t = 2)]
    timeout: u64,
    /// Submit metrics to the controller
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    submit: bool,
    /// Path selection: auto|direct|relay
    #[arg(long, default_value = "auto")]
    path: String,
}

#[derive(Args, Debug)]
struct PerfArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Peer name or ID
    #[arg(long)]
    peer: String,
    /// Packet count
    #[arg(long, default_value_t = 200)]
    count: usize,
    /// Packet size in bytes
    #[arg(long, default_value_t = 1200)]
    size: usize,
    /// Probe timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,
    /// Submit metrics to the controller
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    submit: bool,
    /// Path selection: auto|direct|relay
    #[arg(long, default_value = "auto")]
    path: String,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Time window in seconds
    #[arg(long, default_value_t = 300)]
    window: i64,
    /// Metrics CSV path override
    #[arg(long)]
    path: Option<String>,
}

#[derive(Args, Debug)]
struct ExportCsvArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output file
    #[arg(long)]
    out: PathBuf,
    /// Metrics CSV path override
    #[arg(long)]
    path: Option<String>,
}

#[derive(Args, Debug)]
struct UpArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// WireGuard config path override
    #[arg(long)]
    wg_config: Option<String>,
    /// Print the rendered config and exit
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct DownArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// WireGuard config path override
    #[arg(long)]
    wg_config: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// WireGuard interface name
    #[arg(long)]
    iface: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Controller { cmd } => match cmd {
            ControllerCmd::Run(args) => controller_run(args).await,
            ControllerCmd::Status(args) => controller_status(args),
        },
        Commands::Node { cmd } => match cmd {
            NodeCmd::Join(args) => node_join(args).await,
            NodeCmd::Run(args) => node_run(args).await,
            NodeCmd::Serve(args) => node_serve(args).await,
            NodeCmd::SyncConfig(args) => node_sync_config(args).await,
        },
        Commands::Direct { cmd } => match cmd {
            DirectCmd::Serve(args) => direct_serve(args).await,
            DirectCmd::Test(args) => direct_test(args).await,
        },
        Commands::Discover(args) => discover(args).await,
        Commands::Ping(args) => ping(args).await,
        Commands::Perf(args) => perf(args).await,
        Commands::Stats(args) => stats(args),
        Commands::Export { cmd } => match cmd {
            ExportCmd::Csv(args) => export_csv(args),
        },
        Commands::Up(args) => up(args).await,
        Commands::Down(args) => down(args),
        Commands::Status(args) => status(args),
        Commands::Doctor(args) => doctor(args),
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => config::load(path),
        None => Ok(Config::default()),
    }
}

fn require_node(cfg: &mut Config) -> Result<&mut NodeConfig> {
    config::apply_defaults(cfg);
    config::validate(cfg)?;
    cfg.node.as_mut().ok_or_else(|| anyhow!("node config required"))
}

async fn controller_run(args: ConfigArg) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    config::validate(&cfg)?;
    let controller = cfg
        .controller
        .ok_or_else(|| anyhow!("controller config required"))?;

    let server = Arc::new(Server::new(controller)?);
    server.listen_and_serve().await
}

fn controller_status(args: ConfigArg) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    let controller: &ControllerConfig = cfg
        .controller
        .as_ref()
        .ok_or_else(|| anyhow!("controller config required"))?;
    if controller.data_dir.is_empty() {
        bail!("controller.data_dir is required");
    }

    let reg = Registry::load(&Path::new(&controller.data_dir).join("registry.yaml"))?;
    if reg.nodes.is_empty() {
        println!("no registered nodes");
        return Ok(());
    }

    let manager = Manager::default();
    let wg_endpoints = if controller.wg_interface.is_empty() {
        Default::default()
    } else {
        manager
            .peer_endpoints(&controller.wg_interface)
            .unwrap_or_default()
    };

    println!(
        "{:<12}  {:<15}  {:<22}  {:<22}  {:<10}  {:<6}  {:<20}  {:<8}",
        "NAME", "VPN_IP", "WG_ENDPOINT", "PUBLIC_ADDR", "NAT", "PORT", "LAST_SEEN", "STATUS"
    );
    for node in &reg.nodes {
        let last_seen = node
            .last_seen_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let wg_ep = if node.pub_key.is_empty() {
            ""
        } else {
            wg_endpoints.get(&node.pub_key).map(String::as_str).unwrap_or("")
        };
        println!(
            "{:<12}  {:<15}  {:<22}  {:<22}  {:<10}  {:<6}  {:<20}  {:<8}",
            node.name, node.vpn_ip, wg_ep, node.public_addr, node.nat_type, node.probe_port,
            last_seen, node.status
        );
    }
    Ok(())
}

async fn node_join(args: JoinArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    let node = cfg.node.get_or_insert_with(NodeConfig::default);
    override_node(node, &args);
    config::apply_defaults(&mut cfg);
    config::validate(&cfg)?;
    let node = cfg.node.as_ref().unwrap();
    if node.wg_public_key.is_empty() {
        bail!("wg_public_key is required");
    }

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let resp = client
        .register(&RegisterRequest {
            name: node.name.clone(),
            pub_key: node.wg_public_key.clone(),
            vpn_ip: node.vpn_ip.clone(),
            direct_mode: node.direct_mode.clone(),
            probe_port: node.probe_port,
            ..Default::default()
        })
        .await?;

    let vpn_ip = if node.vpn_ip.is_empty() && !resp.vpn_ip.is_empty() {
        resp.vpn_ip.clone()
    } else {
        node.vpn_ip.clone()
    };
    println!(
        "registered node_id={} peers={} vpn_ip={}",
        resp.node_id,
        resp.peers.len(),
        vpn_ip
    );
    if let Err(e) = write_back_vpn_ip(&args.config, &mut cfg, &vpn_ip) {
        eprintln!("warning: failed to persist vpn_ip: {e}");
    }

    let node = cfg.node.as_ref().unwrap();
    if node.direct_mode != "off" && !node.stun_servers.is_empty() {
        let shared = SharedSocket::listen(":0").await?;
        match direct::probe_nat(&shared, &node.stun_servers, Duration::from_secs(5)).await {
            Ok((public_addr, nat_type)) => {
                println!("stun public_addr={public_addr} nat={nat_type}");
                client
                    .submit_nat_probe(&NatProbeRequest {
                        node_id: resp.node_id,
                        nat_type: nat_type.to_string(),
                        public_addr,
                    })
                    .await?;
            }
            Err(e) => eprintln!("STUN probe failed: {e}"),
        }
    }
    Ok(())
}

async fn node_run(args: ConfigArg) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    {
        let node = require_node(&mut cfg)?;
        if node.wg_public_key.is_empty() {
            bail!("wg_public_key is required");
        }
    }

    let needs_assignment = {
        let node = cfg.node.as_ref().unwrap();
        node.vpn_ip.is_empty() && !node.controller.is_empty()
    };
    if needs_assignment {
        let resp = {
            let node = cfg.node.as_ref().unwrap();
            let client = ApiClient::new(&normalize_base_url(&node.controller));
            client
                .register(&RegisterRequest {
                    name: node.name.clone(),
                    pub_key: node.wg_public_key.clone(),
                    direct_mode: node.direct_mode.clone(),
                    probe_port: node.probe_port,
                    ..Default::default()
                })
                .await?
        };
        if let Err(e) = write_back_vpn_ip(&args.config, &mut cfg, &resp.vpn_ip) {
            eprintln!("warning: failed to persist vpn_ip: {e}");
        }
        cfg.node.as_mut().unwrap().vpn_ip = resp.vpn_ip;
    }

    let node = cfg.node.unwrap();
    agent::run(node, &Manager::default()).await
}

async fn node_serve(args: ServeArgs) -> Result<()> {
    let mut delay = Duration::from_secs(args.retry_delay.max(1));
    let max_delay = Duration::from_secs(args.retry_max_delay).max(delay);
    let manager = Manager::default();

    loop {
        // Reload each round so operator edits (or the vpn_ip write-back) are
        // picked up before the next attempt.
        let mut cfg = config::load(&args.config)?;
        config::apply_defaults(&mut cfg);
        config::validate(&cfg)?;
        if cfg.node.is_none() {
            bail!("node config required");
        }

        let attempt = async {
            sync_config_once(&Some(args.config.clone()), &mut cfg).await?;
            up_once(&mut cfg, &manager).await?;
            let node = cfg.node.clone().unwrap();
            agent::run(node, &manager).await
        };

        match attempt.await {
            Ok(()) => return Ok(()),
            Err(e) if e.downcast_ref::<TunnelDead>().is_some() => {
                eprintln!("agent exited: {e}; re-syncing tunnel");
            }
            Err(e) => {
                eprintln!("agent exited: {e}");
            }
        }

        tokio::select! {
            _ = signal::ctrl_c() => return Ok(()),
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
}

async fn node_sync_config(args: ConfigArg) -> Result<()> {
    let path = args
        .config
        .clone()
        .ok_or_else(|| anyhow!("--config is required"))?;
    let mut cfg = config::load(&path)?;
    config::apply_defaults(&mut cfg);
    if cfg.node.is_none() {
        bail!("node config required");
    }
    sync_config_once(&args.config, &mut cfg).await?;
    let node = cfg.node.as_ref().unwrap();
    println!(
        "synced vpn_ip={} server_endpoint={}",
        node.vpn_ip, node.server_endpoint
    );
    Ok(())
}

/// Registers with the controller and pulls missing server fields, persisting
/// any updates back to the config file.
async fn sync_config_once(config_path: &Option<PathBuf>, cfg: &mut Config) -> Result<()> {
    let node = cfg.node.as_mut().ok_or_else(|| anyhow!("node config required"))?;
    if node.controller.is_empty() {
        // Server fields might be pre-provisioned; if so, no controller calls.
        if !node.server_public_key.is_empty()
            && !node.server_endpoint.is_empty()
            && !node.server_allowed_ips.is_empty()
        {
            return Ok(());
        }
        bail!("node.controller is required");
    }

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let mut updated = false;

    if !node.wg_public_key.is_empty() {
        let resp = client
            .register(&RegisterRequest {
                name: node.name.clone(),
                pub_key: node.wg_public_key.clone(),
                vpn_ip: node.vpn_ip.clone(),
                direct_mode: node.direct_mode.clone(),
                probe_port: node.probe_port,
                ..Default::default()
            })
            .await?;
        if node.vpn_ip.is_empty() && !resp.vpn_ip.is_empty() {
            node.vpn_ip = resp.vpn_ip;
            updated = true;
        }
    }

    if node.server_public_key.is_empty()
        || node.server_endpoint.is_empty()
        || node.server_allowed_ips.is_empty()
    {
        let resp = client.wg_config(&node.name).await?;
        if node.server_public_key.is_empty() {
            node.server_public_key = resp.server_public_key;
            updated = true;
        }
        if node.server_endpoint.is_empty() {
            node.server_endpoint = resp.server_endpoint;
            updated = true;
        }
        if node.server_allowed_ips.is_empty() {
            node.server_allowed_ips = resp.server_allowed_ips;
            updated = true;
        }
        if node.server_keepalive_sec == 0 && resp.server_keepalive_sec > 0 {
            node.server_keepalive_sec = resp.server_keepalive_sec;
            updated = true;
        }
    }

    if updated {
        if let Some(path) = config_path {
            return config::save(path, cfg);
        }
    }
    Ok(())
}

/// Renders the node config and brings the interface up.
async fn up_once(cfg: &mut Config, manager: &Manager) -> Result<()> {
    let node = cfg.node.as_mut().ok_or_else(|| anyhow!("node config required"))?;

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    agent::fill_server_config(&client, node).await?;
    if node.vpn_ip.is_empty() {
        bail!("node.vpn_ip is required (run sync-config or join first)");
    }

    let conf = wg::render_node(node)?;
    wg::write_config(Path::new(&node.wg_config_path), &conf)?;
    let set_conf = wg::render_set_conf(node, &[])?;
    manager.up(node, &set_conf)
}

async fn direct_serve(args: DirectServeArgs) -> Result<()> {
    let responder = Responder::start(&args.listen).await?;
    println!("direct responder listening on {}", responder.local_addr()?);
    signal::ctrl_c().await?;
    Ok(())
}

async fn direct_test(args: DirectTestArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    let node = cfg.node.as_ref().ok_or_else(|| anyhow!("node config required"))?;

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let candidates = client.candidates(&node.name).await?;

    let (peer_addr, peer_id) = select_peer(&args.peer, &candidates.peers);
    let peer_addr = peer_addr
        .ok_or_else(|| anyhow!("peer {:?} not found or missing public_addr", args.peer))?;

    match direct::probe_peer(&peer_addr, Duration::from_secs(args.timeout)).await {
        Ok(rtt) => {
            println!("direct probe ok peer={peer_addr} rtt={rtt:?}");
            let _ = client
                .submit_direct_result(&DirectResultRequest {
                    node_id: node.name.clone(),
                    peer_id,
                    success: true,
                    rtt_ms: rtt.as_secs_f64() * 1000.0,
                    reason: String::new(),
                })
                .await;
            Ok(())
        }
        Err(e) => {
            let _ = client
                .submit_direct_result(&DirectResultRequest {
                    node_id: node.name.clone(),
                    peer_id,
                    success: false,
                    rtt_ms: 0.0,
                    reason: e.to_string(),
                })
                .await;
            Err(e)
        }
    }
}

async fn discover(args: ConfigArg) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    let node = cfg.node.as_ref().ok_or_else(|| anyhow!("node config required"))?;

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let resp = client.candidates(&node.name).await?;

    if resp.peers.is_empty() {
        println!("no peers");
        return Ok(());
    }

    println!(
        "{:<12}  {:<15}  {:<22}  {:<6}  {:<22}  {:<18}",
        "NAME", "VPN_IP", "WG_ENDPOINT", "PORT", "PUBLIC_ADDR", "NAT_TYPE"
    );
    for peer in &resp.peers {
        println!(
            "{:<12}  {:<15}  {:<22}  {:<6}  {:<22}  {:<18}",
            peer.name, peer.vpn_ip, peer.endpoint, peer.probe_port, peer.public_addr,
            peer.nat_type
        );
    }
    Ok(())
}

async fn ping(args: PingArgs) -> Result<()> {
    if !args.all && args.peer.is_none() {
        bail!("--peer or --all is required");
    }
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    let node = cfg.node.as_ref().ok_or_else(|| anyhow!("node config required"))?;

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let resp = client.candidates(&node.name).await?;

    let peers = filter_peers(&resp.peers, args.peer.as_deref().unwrap_or(""), args.all);
    if peers.is_empty() {
        bail!("no peers matched");
    }

    for peer in peers {
        let (peer_addr, path_label) = select_probe_addr(&peer, &args.path);
        let Some(peer_addr) = peer_addr else {
            println!("peer {} missing address", peer.name);
            continue;
        };

        let mut results = Vec::with_capacity(args.count);
        for seq in 1..=args.count {
            match direct::probe_peer(&peer_addr, Duration::from_secs(args.timeout)).await {
                Ok(rtt) => {
                    let rtt_ms = rtt.as_secs_f64() * 1000.0;
                    results.push(rtt_ms);
                    println!("ping {} seq={seq} rtt={rtt_ms:.2}ms", peer.name);
                }
                Err(_) => println!("ping {} seq={seq} timeout", peer.name),
            }
            sleep(Duration::from_millis(args.interval)).await;
        }

        let metric = summarize_ping(&node.name, &peer.id, &path_label, &results, args.count,
            node.mtu);
        if !node.metrics_path.is_empty() {
            if let Err(e) =
                metrics::append_csv(Path::new(&node.metrics_path), &[metric.clone()])
            {
                eprintln!("append metrics failed: {e}");
            }
        }
        if args.submit {
            let _ = client
                .submit_metrics(&MetricsRequest {
                    node_id: node.name.clone(),
                    samples: vec![metric.clone()],
                })
                .await;
        }
        println!(
            "ping summary peer={} avg={:.2}ms loss={:.2}%",
            peer.name, metric.rtt_ms, metric.loss_pct
        );
    }
    Ok(())
}

async fn perf(args: PerfArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);
    let node = cfg.node.as_ref().ok_or_else(|| anyhow!("node config required"))?;

    let client = ApiClient::new(&normalize_base_url(&node.controller));
    let resp = client.candidates(&node.name).await?;

    let (peer_addr, peer_id, path_label) =
        select_probe_addr_by_name(&args.peer, &resp.peers, &args.path);
    let peer_addr =
        peer_addr.ok_or_else(|| anyhow!("peer {:?} not found or missing address", args.peer))?;

    let (throughput, loss_pct) = direct::perf_probe(
        &peer_addr,
        args.size,
        args.count,
        Duration::from_secs(args.timeout),
    )
    .await?;

    let metric = Metric {
        timestamp: Utc::now(),
        node_id: node.name.clone(),
        peer_id,
        path: path_label,
        rtt_ms: 0.0,
        jitter_ms: 0.0,
        loss_pct,
        throughput_mbps: throughput,
        mtu: node.mtu,
        nat_type: String::new(),
        public_addr: String::new(),
        relay_reason: String::new(),
    };
    if !node.metrics_path.is_empty() {
        if let Err(e) = metrics::append_csv(Path::new(&node.metrics_path), &[metric.clone()]) {
            eprintln!("append metrics failed: {e}");
        }
    }
    if args.submit {
        let _ = client
            .submit_metrics(&MetricsRequest {
                node_id: node.name.clone(),
                samples: vec![metric],
            })
            .await;
    }

    println!(
        "perf peer={} throughput={throughput:.2} Mbps loss={loss_pct:.2}%",
        args.peer
    );
    Ok(())
}

fn stats(args: StatsArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let metrics_path = select_metrics_path(&cfg, args.path.as_deref());
    if metrics_path.is_empty() {
        bail!("metrics path required");
    }

    let items = metrics::read_csv(Path::new(&metrics_path))?;
    let cutoff = Utc::now() - ChronoDuration::seconds(args.window);
    let summary = metrics::summarize(&items, cutoff);
    if summary.count == 0 {
        println!("no samples in window");
        return Ok(());
    }

    println!(
        "samples={} from={} to={}",
        summary.count,
        summary
            .from
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
        summary
            .to
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
    );
    println!(
        "rtt avg={:.2}ms p95={:.2}ms min={:.2}ms max={:.2}ms",
        summary.avg_rtt_ms, summary.p95_rtt_ms, summary.min_rtt_ms, summary.max_rtt_ms
    );
    println!(
        "jitter avg={:.2}ms loss avg={:.2}% throughput avg={:.2} Mbps",
        summary.avg_jitter_ms, summary.avg_loss_pct, summary.avg_throughput_mbps
    );
    Ok(())
}

fn export_csv(args: ExportCsvArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let metrics_path = select_metrics_path(&cfg, args.path.as_deref());
    if metrics_path.is_empty() {
        bail!("metrics path required");
    }

    if let Some(dir) = args.out.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::copy(&metrics_path, &args.out)
        .with_context(|| format!("copy {} to {}", metrics_path, args.out.display()))?;
    println!("exported {}", args.out.display());
    Ok(())
}

async fn up(args: UpArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    {
        let node = require_node(&mut cfg)?;
        if let Some(path) = &args.wg_config {
            node.wg_config_path = path.clone();
        }
        let client = ApiClient::new(&normalize_base_url(&node.controller));
        agent::fill_server_config(&client, node).await?;
    }

    let needs_assignment = {
        let node = cfg.node.as_ref().unwrap();
        node.vpn_ip.is_empty() && !node.controller.is_empty()
    };
    if needs_assignment {
        let resp = {
            let node = cfg.node.as_ref().unwrap();
            let client = ApiClient::new(&normalize_base_url(&node.controller));
            client
                .register(&RegisterRequest {
                    name: node.name.clone(),
                    pub_key: node.wg_public_key.clone(),
                    direct_mode: node.direct_mode.clone(),
                    probe_port: node.probe_port,
                    ..Default::default()
                })
                .await?
        };
        if let Err(e) = write_back_vpn_ip(&args.config, &mut cfg, &resp.vpn_ip) {
            eprintln!("warning: failed to persist vpn_ip: {e}");
        }
        cfg.node.as_mut().unwrap().vpn_ip = resp.vpn_ip;
    }

    let node = cfg.node.as_ref().unwrap();
    let conf = wg::render_node(node)?;
    if args.dry_run {
        print!("{conf}");
        return Ok(());
    }
    wg::write_config(Path::new(&node.wg_config_path), &conf)?;
    let set_conf = wg::render_set_conf(node, &[])?;
    Manager::default().up(node, &set_conf)
}

fn down(args: DownArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    let node = require_node(&mut cfg)?;
    if let Some(path) = &args.wg_config {
        node.wg_config_path = path.clone();
    }
    Manager::default().down(node)
}

fn status(args: StatusArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    if cfg.node.is_some() {
        config::apply_defaults(&mut cfg);
    }

    let iface = match &args.iface {
        Some(iface) => iface.clone(),
        None => cfg
            .node
            .as_ref()
            .map(|n| n.wg_interface.clone())
            .ok_or_else(|| anyhow!("--iface required when node config is missing"))?,
    };

    let out = Manager::default().status(&iface)?;
    println!("{out}");
    Ok(())
}

fn doctor(args: StatusArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    config::apply_defaults(&mut cfg);

    let iface = args
        .iface
        .clone()
        .or_else(|| cfg.node.as_ref().map(|n| n.wg_interface.clone()))
        .or_else(|| cfg.controller.as_ref().map(|c| c.wg_interface.clone()))
        .unwrap_or_else(|| config::DEFAULT_WG_INTERFACE.to_string());

    println!("iface={iface}");
    match Manager::default().status(&iface) {
        Ok(out) => println!("{out}"),
        Err(e) => println!("wg status error: {e}"),
    }

    if let Some(node) = &cfg.node {
        if node.policy_routing_enabled() {
            println!(
                "policy_routing enabled=true table={} priority={} cidr={}",
                node.policy_routing_table, node.policy_routing_priority,
                node.policy_routing_cidr
            );
        } else {
            println!("policy_routing enabled=false");
        }
        if node.probe_port > 0 {
            println!("probe_port={}", node.probe_port);
        }
        for cidr in &node.server_allowed_ips {
            if cidr == "0.0.0.0/0" || cidr == "::/0" {
                println!(
                    "warning: server_allowed_ips includes default route ({cidr}) which may break host internet"
                );
            }
        }
    }
    Ok(())
}

fn override_node(node: &mut NodeConfig, args: &JoinArgs) {
    if let Some(name) = &args.name {
        node.name = name.clone();
    }
    if let Some(controller) = &args.controller {
        node.controller = controller.clone();
    }
    if let Some(pubkey) = &args.pubkey {
        node.wg_public_key = pubkey.clone();
    }
    if let Some(vpn_ip) = &args.vpn_ip {
        node.vpn_ip = vpn_ip.clone();
    }
    if let Some(direct) = &args.direct {
        node.direct_mode = direct.clone();
    }
    if let Some(stun) = &args.stun {
        node.stun_servers = split_list(stun);
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn select_peer(peer: &str, candidates: &[PeerCandidate]) -> (Option<String>, String) {
    for cand in candidates {
        if cand.id == peer || cand.name == peer {
            if !cand.public_addr.is_empty() {
                return (Some(cand.public_addr.clone()), cand.id.clone());
            }
            if !cand.endpoint.is_empty() {
                return (Some(cand.endpoint.clone()), cand.id.clone());
            }
            return (None, cand.id.clone());
        }
    }
    (None, String::new())
}

/// Picks the probe address for a candidate: the STUN public address for the
/// direct path, or the overlay address (through the relay) otherwise.
fn select_probe_addr(peer: &PeerCandidate, path: &str) -> (Option<String>, String) {
    let relay_addr = || {
        if !peer.vpn_ip.is_empty() && peer.probe_port > 0 {
            Some(format!("{}:{}", strip_cidr(&peer.vpn_ip), peer.probe_port))
        } else {
            None
        }
    };
    match path {
        "direct" => {
            let addr = (!peer.public_addr.is_empty()).then(|| peer.public_addr.clone());
            (addr, "direct".to_string())
        }
        "relay" => (relay_addr(), "relay".to_string()),
        _ => {
            if !peer.public_addr.is_empty() {
                (Some(peer.public_addr.clone()), "direct".to_string())
            } else if let Some(addr) = relay_addr() {
                (Some(addr), "relay".to_string())
            } else {
                (None, path.to_string())
            }
        }
    }
}

fn select_probe_addr_by_name(
    name: &str,
    candidates: &[PeerCandidate],
    path: &str,
) -> (Option<String>, String, String) {
    for cand in candidates {
        if cand.id == name || cand.name == name {
            let (addr, path_label) = select_probe_addr(cand, path);
            return (addr, cand.id.clone(), path_label);
        }
    }
    (None, String::new(), path.to_string())
}

fn strip_cidr(value: &str) -> &str {
    value.split('/').next().unwrap_or(value)
}

fn filter_peers(candidates: &[PeerCandidate], peer: &str, all: bool) -> Vec<PeerCandidate> {
    if all {
        return candidates.to_vec();
    }
    candidates
        .iter()
        .find(|c| c.id == peer || c.name == peer)
        .cloned()
        .into_iter()
        .collect()
}

fn summarize_ping(
    node_id: &str,
    peer_id: &str,
    path: &str,
    samples: &[f64],
    count: usize,
    mtu: i64,
) -> Metric {
    let mut metric = Metric {
        timestamp: Utc::now(),
        node_id: node_id.to_string(),
        peer_id: peer_id.to_string(),
        path: path.to_string(),
        rtt_ms: 0.0,
        jitter_ms: 0.0,
        loss_pct: 100.0,
        throughput_mbps: 0.0,
        mtu,
        nat_type: String::new(),
        public_addr: String::new(),
        relay_reason: String::new(),
    };
    if samples.is_empty() {
        return metric;
    }

    metric.rtt_ms = samples.iter().sum::<f64>() / samples.len() as f64;
    if samples.len() > 1 {
        let jitter: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        metric.jitter_ms = jitter / (samples.len() - 1) as f64;
    }
    metric.loss_pct = 100.0 * (count - samples.len()) as f64 / count as f64;
    metric
}

fn select_metrics_path(cfg: &Config, path_override: Option<&str>) -> String {
    if let Some(path) = path_override {
        return path.to_string();
    }
    if let Some(node) = &cfg.node {
        if !node.metrics_path.is_empty() {
            return node.metrics_path.clone();
        }
    }
    if let Some(controller) = &cfg.controller {
        return controller.metrics_path.clone();
    }
    String::new()
}

fn write_back_vpn_ip(path: &Option<PathBuf>, cfg: &mut Config, vpn_ip: &str) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    if vpn_ip.is_empty() {
        return Ok(());
    }
    let Some(node) = cfg.node.as_mut() else {
        return Ok(());
    };
    if node.vpn_ip == vpn_ip {
        return Ok(());
    }
    node.vpn_ip = vpn_ip.to_string();
    config::save(path, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> PeerCandidate {
        PeerCandidate {
            id: id.to_string(),
            name: id.to_string(),
            vpn_ip: "10.7.0.3/32".to_string(),
            public_addr: "39.1.2.3:51900".to_string(),
            endpoint: "39.1.2.3:51820".to_string(),
            probe_port: 51900,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_probe_addr_paths() {
        let peer = candidate("b");
        assert_eq!(
            select_probe_addr(&peer, "direct"),
            (Some("39.1.2.3:51900".to_string()), "direct".to_string())
        );
        assert_eq!(
            select_probe_addr(&peer, "relay"),
            (Some("10.7.0.3:51900".to_string()), "relay".to_string())
        );
        assert_eq!(
            select_probe_addr(&peer, "auto"),
            (Some("39.1.2.3:51900".to_string()), "direct".to_string())
        );

        let mut relay_only = peer.clone();
        relay_only.public_addr.clear();
        assert_eq!(
            select_probe_addr(&relay_only, "auto"),
            (Some("10.7.0.3:51900".to_string()), "relay".to_string())
        );
    }

    #[test]
    fn test_summarize_ping() {
        let metric = summarize_ping("a", "b", "direct", &[10.0, 12.0, 14.0], 5, 1280);
        assert!((metric.rtt_ms - 12.0).abs() < 1e-9);
        assert!((metric.jitter_ms - 2.0).abs() < 1e-9);
        assert!((metric.loss_pct - 40.0).abs() < 1e-9);

        let empty = summarize_ping("a", "b", "direct", &[], 5, 1280);
        assert_eq!(empty.loss_pct, 100.0);
        assert_eq!(empty.rtt_ms, 0.0);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("stun.a:3478, stun.b:3478,,"),
            vec!["stun.a:3478".to_string(), "stun.b:3478".to_string()]
        );
    }

    #[test]
    fn test_filter_peers() {
        let peers = vec![candidate("a"), candidate("b")];
        assert_eq!(filter_peers(&peers, "", true).len(), 2);
        assert_eq!(filter_peers(&peers, "b", false).len(), 1);
        assert!(filter_peers(&peers, "zzz", false).is_empty());
    }
}
