//! Direct-path probing over UDP and the shared probe socket.
//!
//! One UDP socket per node serves three jobs: answering inbound probe and
//! echo frames from peers, carrying our outbound STUN transactions, and
//! anchoring a stable NAT mapping for the probe port. A read loop splits
//! traffic by wire format: STUN messages go to the single in-flight STUN
//! transaction, everything else to the frame handler.
//!
//! Outbound probes use their own short-lived socket connected to the peer so
//! the kernel filters packets from other sources; only an ack carrying the
//! request nonce completes a probe.

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::stun;

pub const PROBE_PREFIX: &str = "wgfleet-direct-probe:";
pub const ACK_PREFIX: &str = "wgfleet-direct-ack:";
pub const ECHO_PREFIX: &str = "wgfleet-echo:";

const MAX_FRAME: usize = 2048;

async fn handle_frame(socket: &UdpSocket, src: SocketAddr, data: &[u8]) {
    let Ok(msg) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(nonce) = msg.strip_prefix(PROBE_PREFIX) {
        let payload = format!("{ACK_PREFIX}{nonce}");
        let _ = socket.send_to(payload.as_bytes(), src).await;
        return;
    }
    if msg.starts_with(ECHO_PREFIX) {
        let _ = socket.send_to(data, src).await;
    }
}

/// Answers inbound probe frames with acks and reflects echo frames.
pub struct Responder {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Responder {
    /// Binds `addr` (e.g. `":0"` or `"0.0.0.0:51900"`) and starts serving.
    pub async fn start(addr: &str) -> Result<Responder> {
        let socket = bind_udp(addr).await?;
        let socket = Arc::new(socket);
        let task = tokio::spawn(serve(socket.clone()));
        Ok(Responder { socket, task })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: Arc<UdpSocket>) {
    let mut buf = [0u8; MAX_FRAME];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, src)) => handle_frame(&socket, src, &buf[..n]).await,
            Err(e) => {
                debug!("probe responder socket closed: {e}");
                return;
            }
        }
    }
}

/// The node's shared probe socket: responder duties plus STUN transactions
/// over one NAT mapping.
pub struct SharedSocket {
    socket: Arc<UdpSocket>,
    stun_slot: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    task: JoinHandle<()>,
}

impl SharedSocket {
    /// Binds the shared socket and starts its read loop.
    pub async fn listen(addr: &str) -> Result<SharedSocket> {
        let socket = Arc::new(bind_udp(addr).await?);
        let stun_slot: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>> =
            Arc::new(Mutex::new(None));

        let task = {
            let socket = socket.clone();
            let stun_slot = stun_slot.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_FRAME];
                loop {
                    let (n, src) = match socket.recv_from(&mut buf).await {
                        Ok(res) => res,
                        Err(e) => {
                            debug!("shared probe socket closed: {e}");
                            return;
                        }
                    };
                    let data = &buf[..n];
                    if stun::is_message(data) {
                        let sender = stun_slot.lock().unwrap().clone();
                        if let Some(tx) = sender {
                            let _ = tx.send(data.to_vec());
                        }
                        continue;
                    }
                    handle_frame(&socket, src, data).await;
                }
            })
        };

        Ok(SharedSocket {
            socket,
            stun_slot,
            task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs one STUN binding transaction over the shared socket and returns
    /// the mapped address. At most one transaction may be in flight; a
    /// concurrent attempt fails immediately rather than queueing.
    pub async fn probe_stun(&self, server: &str, timeout_dur: Duration) -> Result<String> {
        let server = server.trim().trim_start_matches("stun:");
        if server.is_empty() {
            bail!("empty STUN server");
        }
        let server_addr = resolve(server).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.stun_slot.lock().unwrap();
            if slot.is_some() {
                bail!("stun probe already in progress");
            }
            *slot = Some(tx);
        }
        let _release = SlotGuard(self.stun_slot.clone());

        let mut tx_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut tx_id);
        let request = stun::build_binding_request(&tx_id);
        self.socket
            .send_to(&request, server_addr)
            .await
            .context("send stun request")?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow!("stun probe timed out"))?;
            let msg = timeout(remaining, rx.recv())
                .await
                .map_err(|_| anyhow!("stun probe timed out"))?
                .ok_or_else(|| anyhow!("shared socket closed"))?;
            if let Some(addr) = stun::parse_binding_response(&msg, &tx_id) {
                return Ok(addr.to_string());
            }
            // Response for an older transaction; keep waiting.
        }
    }
}

impl Drop for SharedSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SlotGuard(Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.0.lock().unwrap() = None;
    }
}

/// Queries STUN reflectors sequentially over the shared socket and
/// classifies the NAT from the mapped addresses. Returns the first mapped
/// address with the classification.
pub async fn probe_nat(
    shared: &SharedSocket,
    servers: &[String],
    timeout_dur: Duration,
) -> Result<(String, stun::NatClass)> {
    if servers.is_empty() {
        bail!("no STUN servers provided");
    }

    let mut results = Vec::with_capacity(servers.len());
    let mut last_err = None;
    for server in servers {
        match shared.probe_stun(server, timeout_dur).await {
            Ok(addr) => results.push(addr),
            Err(e) => {
                debug!("stun query {server} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    if results.is_empty() {
        return Err(last_err.unwrap_or_else(|| anyhow!("stun probe failed")));
    }
    let class = stun::classify(&results);
    Ok((results[0].clone(), class))
}

/// Sends a direct probe to a peer and waits for the matching ack. Returns
/// the round-trip time.
pub async fn probe_peer(peer_addr: &str, timeout_dur: Duration) -> Result<Duration> {
    let peer = resolve(peer_addr).await?;
    let socket = ephemeral_for(peer).await?;
    socket.connect(peer).await.context("connect probe socket")?;

    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    let nonce = hex::encode(raw);
    let payload = format!("{PROBE_PREFIX}{nonce}");
    let want = format!("{ACK_PREFIX}{nonce}");

    let start = Instant::now();
    socket.send(payload.as_bytes()).await.context("send probe")?;

    let deadline = start + timeout_dur;
    let mut buf = [0u8; MAX_FRAME];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("probe timed out"))?;
        let n = timeout(remaining, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow!("probe timed out"))?
            .context("probe recv")?;
        if buf[..n] == *want.as_bytes() {
            return Ok(start.elapsed());
        }
    }
}

/// Sends `count` echo packets of `packet_size` bytes and reads reflections
/// until `count` or timeout. Returns (throughput Mbps, loss %).
pub async fn perf_probe(
    peer_addr: &str,
    packet_size: usize,
    count: usize,
    timeout_dur: Duration,
) -> Result<(f64, f64)> {
    if count == 0 {
        bail!("count must be > 0");
    }
    let packet_size = packet_size.max(ECHO_PREFIX.len() + 8);

    let peer = resolve(peer_addr).await?;
    let socket = ephemeral_for(peer).await?;
    socket.connect(peer).await.context("connect perf socket")?;

    let mut payload = vec![0u8; packet_size];
    payload[..ECHO_PREFIX.len()].copy_from_slice(ECHO_PREFIX.as_bytes());

    let start = Instant::now();
    for i in 0..count {
        let seq = format!("{i:08}");
        payload[ECHO_PREFIX.len()..ECHO_PREFIX.len() + 8].copy_from_slice(seq.as_bytes());
        socket.send(&payload).await.context("send echo")?;
    }

    let deadline = start + timeout_dur;
    let mut received = 0usize;
    let mut received_bytes = 0usize;
    let mut buf = vec![0u8; packet_size + 64];
    while received < count {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        let n = match timeout(remaining, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 || !buf[..n].starts_with(ECHO_PREFIX.as_bytes()) {
            continue;
        }
        received += 1;
        received_bytes += n;
    }

    let elapsed = start.elapsed().max(Duration::from_millis(1));
    let loss_pct = 100.0 * (count - received) as f64 / count as f64;
    let throughput_mbps =
        (received_bytes as f64 * 8.0 / elapsed.as_secs_f64()) / 1_000_000.0;
    Ok((throughput_mbps, loss_pct))
}

async fn bind_udp(addr: &str) -> Result<UdpSocket> {
    // Accept the ":port" shorthand for all-interfaces binds.
    let addr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    UdpSocket::bind(&addr)
        .await
        .with_context(|| format!("bind udp {addr}"))
}

async fn ephemeral_for(peer: SocketAddr) -> Result<UdpSocket> {
    let bind = if peer.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    UdpSocket::bind(bind).await.context("bind probe socket")
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .with_context(|| format!("resolve {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("{addr} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_peer_round_trip() {
        let resp = Responder::start(":0").await.unwrap();
        let addr = resp.local_addr().unwrap();

        let rtt = probe_peer(&format!("127.0.0.1:{}", addr.port()), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(rtt > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_probe_peer_timeout() {
        // Nothing listens here; the probe must fail within its timeout.
        let err = probe_peer("127.0.0.1:19999", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_perf_probe_round_trip() {
        let resp = Responder::start(":0").await.unwrap();
        let addr = resp.local_addr().unwrap();

        let (throughput, loss) = perf_probe(
            &format!("127.0.0.1:{}", addr.port()),
            200,
            50,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(loss, 0.0);
        assert!(throughput > 0.0);
    }

    #[tokio::test]
    async fn test_shared_socket_answers_probes() {
        let shared = SharedSocket::listen(":0").await.unwrap();
        let addr = shared.local_addr().unwrap();

        let rtt = probe_peer(&format!("127.0.0.1:{}", addr.port()), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(rtt > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shared_socket_single_stun_in_flight() {
        let shared = Arc::new(SharedSocket::listen(":0").await.unwrap());

        // A blackhole target: a bound socket that never answers.
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = blackhole.local_addr().unwrap().to_string();

        let first = {
            let shared = shared.clone();
            let target = target.clone();
            tokio::spawn(async move {
                shared.probe_stun(&target, Duration::from_millis(500)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = shared.probe_stun(&target, Duration::from_millis(500)).await;
        let err = second.unwrap_err();
        assert!(err.to_string().contains("already in progress"));

        // The first transaction times out and releases the slot.
        assert!(first.await.unwrap().is_err());
        let third = shared.probe_stun(&target, Duration::from_millis(100)).await;
        assert!(third.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_probe_nat_requires_servers() {
        let shared = SharedSocket::listen(":0").await.unwrap();
        assert!(probe_nat(&shared, &[], Duration::from_millis(100))
            .await
            .is_err());
    }
}
