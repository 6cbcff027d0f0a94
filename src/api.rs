//! Controller API wire types and the agent-side HTTP client.
//!
//! Request shapes reject unknown fields so a version-skewed agent fails
//! loudly instead of silently dropping data.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::metrics::Metric;

/// Sent by a node when joining the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub pub_key: String,
    pub vpn_ip: String,
    pub endpoint: String,
    pub public_addr: String,
    pub nat_type: String,
    pub direct_mode: String,
    pub probe_port: u16,
}

/// A peer as seen by one observer, for direct/relay selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerCandidate {
    pub id: String,
    pub name: String,
    pub pub_key: String,
    pub vpn_ip: String,
    pub endpoint: String,
    pub public_addr: String,
    pub nat_type: String,
    pub probe_port: u16,
    pub p2p_ready: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterResponse {
    pub node_id: String,
    pub peers: Vec<PeerCandidate>,
    pub vpn_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidatesResponse {
    pub peers: Vec<PeerCandidate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatProbeRequest {
    pub node_id: String,
    pub nat_type: String,
    pub public_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectResultRequest {
    pub node_id: String,
    pub peer_id: String,
    pub success: bool,
    pub rtt_ms: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsRequest {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub samples: Vec<Metric>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WgConfigResponse {
    pub server_public_key: String,
    pub server_endpoint: String,
    pub server_allowed_ips: Vec<String>,
    pub server_keepalive_sec: u64,
}

/// Error payload shared by all endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Prefixes a bare `host:port` with the http scheme.
pub fn normalize_base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Thin HTTP client for the controller API.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Creates a client for the given base URL (e.g. `http://host:port`).
    pub fn new(base_url: &str) -> ApiClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        ApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        self.post_json("/register", req)
            .await
            .context("register request failed")
    }

    pub async fn candidates(&self, node_id: &str) -> Result<CandidatesResponse> {
        self.get_json(&format!("/candidates?node_id={}", urlencode(node_id)))
            .await
            .context("candidates request failed")
    }

    pub async fn submit_metrics(&self, req: &MetricsRequest) -> Result<()> {
        self.post_no_content("/metrics", req)
            .await
            .context("metrics submit failed")
    }

    pub async fn submit_nat_probe(&self, req: &NatProbeRequest) -> Result<()> {
        self.post_no_content("/nat-probe", req)
            .await
            .context("nat-probe submit failed")
    }

    pub async fn submit_direct_result(&self, req: &DirectResultRequest) -> Result<()> {
        self.post_no_content("/direct-result", req)
            .await
            .context("direct-result submit failed")
    }

    pub async fn wg_config(&self, node_id: &str) -> Result<WgConfigResponse> {
        self.get_json(&format!("/wg-config?node_id={}", urlencode(node_id)))
            .await
            .context("wg-config request failed")
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn post_no_content<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let msg = body.trim();
    if msg.is_empty() {
        Err(anyhow!("request failed: {status}"))
    } else {
        Err(anyhow!("request failed: {status}: {msg}"))
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
