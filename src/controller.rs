//! The controller HTTP API: registration, candidate enrichment, probe
//! evidence collection, metrics intake, and bootstrap configuration.

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;

use crate::addr::normalize_host_cidr;
use crate::api::{
    CandidatesResponse, DirectResultRequest, ErrorResponse, MetricsRequest, NatProbeRequest,
    PeerCandidate, RegisterRequest, RegisterResponse, WgConfigResponse,
};
use crate::config::ControllerConfig;
use crate::metrics;
use crate::readiness::{DirectReadiness, ReadyPolicy, DEFAULT_TTL};
use crate::registry::{allocate_vpn_ip, NodeEntry, Registry};
use crate::wg::{Manager, Peer, ServerConfig};

struct State {
    reg: Registry,
    readiness: DirectReadiness,
}

/// Controller server. Registry and probe evidence share one mutex; the
/// guard is never held across subprocess execution, response writes, or any
/// await point. Metrics appends are serialized separately so slow CSV I/O
/// cannot stall registration.
pub struct Server {
    cfg: ControllerConfig,
    reg_path: PathBuf,
    state: Mutex<State>,
    metrics_lock: Mutex<()>,
    wg: Manager,
}

impl Server {
    pub fn new(cfg: ControllerConfig) -> Result<Server> {
        Server::with_manager(cfg, Manager::default())
    }

    pub fn with_manager(cfg: ControllerConfig, wg: Manager) -> Result<Server> {
        let reg_path = Path::new(&cfg.data_dir).join("registry.yaml");
        let reg = Registry::load(&reg_path)?;
        let policy = ReadyPolicy::parse(&cfg.p2p_ready_mode);
        Ok(Server {
            cfg,
            reg_path,
            state: Mutex::new(State {
                reg,
                readiness: DirectReadiness::new(DEFAULT_TTL, policy),
            }),
            metrics_lock: Mutex::new(()),
            wg,
        })
    }

    /// Binds the configured listen address and serves until the process
    /// exits.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("bind {}", self.cfg.listen))?;
        info!("controller listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(server.route(req).await)
                    }
                });
                let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                if let Err(e) = conn.await {
                    error!("connection error: {e}");
                }
            });
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (method, path.as_str()) {
            (Method::POST, "/register") => self.handle_register(req).await,
            (Method::GET, "/candidates") => self.handle_candidates(&req),
            (Method::POST, "/nat-probe") => self.handle_nat_probe(req).await,
            (Method::POST, "/direct-result") => self.handle_direct_result(req).await,
            (Method::POST, "/metrics") => self.handle_metrics(req).await,
            (Method::GET, "/wg-config") => self.handle_wg_config(),
            (_, "/register" | "/candidates" | "/nat-probe" | "/direct-result" | "/metrics"
            | "/wg-config") => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn handle_register(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: RegisterRequest = match decode_json(req).await {
            Ok(body) => body,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if body.name.is_empty() || body.pub_key.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "name and pub_key are required");
        }

        let now = chrono::Utc::now();
        // Everything touching the registry happens in this block; the guard
        // is dropped before any endpoint observation, wg apply, or response
        // write. An allocation failure must not leave the registry locked.
        let (resp, wg_peers) = {
            let mut state = self.state.lock().unwrap();

            let assigned_vpn_ip = if body.vpn_ip.is_empty() {
                match allocate_vpn_ip(&self.cfg.vpn_cidr, &state.reg) {
                    Ok(ip) => ip,
                    Err(e) => {
                        return error_response(StatusCode::BAD_REQUEST, &e.to_string());
                    }
                }
            } else {
                body.vpn_ip.clone()
            };

            let node_id = match state.reg.find_by_name(&body.name) {
                Some(node) => {
                    if node.id.is_empty() {
                        node.id = body.name.clone();
                    }
                    node.pub_key = body.pub_key.clone();
                    node.vpn_ip = assigned_vpn_ip.clone();
                    node.endpoint = body.endpoint.clone();
                    node.probe_port = body.probe_port;
                    node.public_addr = body.public_addr.clone();
                    node.nat_type = body.nat_type.clone();
                    node.last_seen_at = Some(now);
                    node.status = "online".to_string();
                    node.id.clone()
                }
                None => {
                    state.reg.nodes.push(NodeEntry {
                        id: body.name.clone(),
                        name: body.name.clone(),
                        pub_key: body.pub_key.clone(),
                        vpn_ip: assigned_vpn_ip.clone(),
                        endpoint: body.endpoint.clone(),
                        probe_port: body.probe_port,
                        public_addr: body.public_addr.clone(),
                        nat_type: body.nat_type.clone(),
                        last_seen_at: Some(now),
                        status: "online".to_string(),
                    });
                    body.name.clone()
                }
            };

            if let Err(e) = state.reg.save(&self.reg_path) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }

            let peers = peers_for(&state, &node_id);
            let wg_peers = if self.cfg.wg_apply {
                Some(peers_for_wg(&state.reg))
            } else {
                None
            };
            (
                RegisterResponse {
                    node_id,
                    peers,
                    vpn_ip: assigned_vpn_ip,
                },
                wg_peers,
            )
        };

        let mut resp = resp;
        self.fill_observed_endpoints(&mut resp.peers);

        if let Some(peers) = wg_peers {
            if let Err(e) = self.apply_wg(&peers) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        }
        json_response(StatusCode::OK, &resp)
    }

    fn handle_candidates(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(node_id) = query_param(req, "node_id") else {
            return error_response(StatusCode::BAD_REQUEST, "node_id required");
        };

        let mut peers = {
            let state = self.state.lock().unwrap();
            peers_for(&state, &node_id)
        };
        self.fill_observed_endpoints(&mut peers);

        json_response(StatusCode::OK, &CandidatesResponse { peers })
    }

    async fn handle_nat_probe(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: NatProbeRequest = match decode_json(req).await {
            Ok(body) => body,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if body.node_id.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "node_id required");
        }

        {
            let mut state = self.state.lock().unwrap();
            if let Some(node) = state.reg.find_by_id(&body.node_id) {
                node.nat_type = body.nat_type.clone();
                node.public_addr = body.public_addr.clone();
                node.last_seen_at = Some(chrono::Utc::now());
            }
            if let Err(e) = state.reg.save(&self.reg_path) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        }

        no_content()
    }

    async fn handle_direct_result(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: DirectResultRequest = match decode_json(req).await {
            Ok(body) => body,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        if !body.node_id.is_empty() && !body.peer_id.is_empty() && body.success {
            let mut state = self.state.lock().unwrap();
            state
                .readiness
                .record_success(&body.node_id, &body.peer_id, Instant::now());
        }

        info!(
            "direct result node={} peer={} success={} rtt_ms={:.2} reason={}",
            body.node_id, body.peer_id, body.success, body.rtt_ms, body.reason
        );
        no_content()
    }

    async fn handle_metrics(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: MetricsRequest = match decode_json(req).await {
            Ok(body) => body,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if body.samples.is_empty() {
            return no_content();
        }

        let path = if self.cfg.metrics_path.is_empty() {
            Path::new(&self.cfg.data_dir).join("metrics.csv")
        } else {
            PathBuf::from(&self.cfg.metrics_path)
        };
        if let Some(dir) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        }

        // CSV appends from concurrent submitters would interleave rows.
        let _guard = self.metrics_lock.lock().unwrap();
        if let Err(e) = metrics::append_csv(&path, &body.samples) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }

        no_content()
    }

    fn handle_wg_config(&self) -> Response<Full<Bytes>> {
        if self.cfg.server_public_key.is_empty()
            || self.cfg.server_endpoint.is_empty()
            || self.cfg.server_allowed_ips.is_empty()
        {
            warn!(
                "wg-config error: server config not set (public_key={} endpoint={} allowed_ips={})",
                !self.cfg.server_public_key.is_empty(),
                !self.cfg.server_endpoint.is_empty(),
                self.cfg.server_allowed_ips.len()
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "server config not set");
        }

        json_response(
            StatusCode::OK,
            &WgConfigResponse {
                server_public_key: self.cfg.server_public_key.clone(),
                server_endpoint: self.cfg.server_endpoint.clone(),
                server_allowed_ips: self.cfg.server_allowed_ips.clone(),
                server_keepalive_sec: self.cfg.server_keepalive_sec,
            },
        )
    }

    /// Overwrites candidate endpoints with the ones the relay interface
    /// currently observes. Best-effort: a failed dump never fails the
    /// request, and STUN-derived addresses never land in `endpoint`.
    fn fill_observed_endpoints(&self, peers: &mut [PeerCandidate]) {
        if self.cfg.wg_interface.is_empty() {
            return;
        }
        let observed = match self.wg.peer_endpoints(&self.cfg.wg_interface) {
            Ok(m) if !m.is_empty() => m,
            _ => return,
        };
        for peer in peers.iter_mut() {
            if peer.pub_key.is_empty() {
                continue;
            }
            if let Some(ep) = observed.get(&peer.pub_key) {
                peer.endpoint = ep.clone();
            }
        }
    }

    fn apply_wg(&self, peers: &[Peer]) -> Result<()> {
        let server_cfg = ServerConfig {
            interface: self.cfg.wg_interface.clone(),
            private_key: self.cfg.wg_private_key.clone(),
            address: self.cfg.wg_address.clone(),
            listen_port: self.cfg.wg_port,
            mtu: self.cfg.mtu,
        };
        self.wg.apply_server(&server_cfg, peers)
    }
}

fn peers_for(state: &State, node_id: &str) -> Vec<PeerCandidate> {
    let now = Instant::now();
    state
        .reg
        .nodes
        .iter()
        .filter(|n| n.id != node_id)
        .map(|n| PeerCandidate {
            id: n.id.clone(),
            name: n.name.clone(),
            pub_key: n.pub_key.clone(),
            vpn_ip: n.vpn_ip.clone(),
            endpoint: n.endpoint.clone(),
            public_addr: n.public_addr.clone(),
            nat_type: n.nat_type.clone(),
            probe_port: n.probe_port,
            p2p_ready: state.readiness.ready(node_id, &n.id, now),
        })
        .collect()
}

fn peers_for_wg(reg: &Registry) -> Vec<Peer> {
    reg.nodes
        .iter()
        .filter(|n| !n.pub_key.is_empty() && !n.vpn_ip.is_empty())
        .filter_map(|n| {
            let allowed = normalize_host_cidr(&n.vpn_ip);
            if allowed.is_empty() {
                return None;
            }
            Some(Peer {
                public_key: n.pub_key.clone(),
                endpoint: String::new(),
                allowed_ips: vec![allowed],
                keepalive_sec: 0,
            })
        })
        .collect()
}

async fn decode_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .context("read request body")?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| anyhow::anyhow!("invalid request body: {e}"))
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == name && !v.is_empty() {
            return Some(percent_decode(v));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(b) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

fn no_content() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
