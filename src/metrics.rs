//! Path measurement samples and their durable CSV form.
//!
//! The CSV column order is fixed and load-bearing: external tooling consumes
//! these files. Appends must be serialized by the caller when multiple
//! writers share a file; the controller holds a dedicated mutex for this.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// A single measurement sample for a node pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub peer_id: String,
    /// "direct" or "relay".
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub rtt_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default)]
    pub loss_pct: f64,
    #[serde(default)]
    pub throughput_mbps: f64,
    #[serde(default)]
    pub mtu: i64,
    #[serde(default)]
    pub nat_type: String,
    #[serde(default)]
    pub public_addr: String,
    #[serde(default)]
    pub relay_reason: String,
}

const HEADER: &[&str] = &[
    "timestamp",
    "node_id",
    "peer_id",
    "path",
    "rtt_ms",
    "jitter_ms",
    "loss_pct",
    "throughput_mbps",
    "mtu",
    "nat_type",
    "public_addr",
    "relay_reason",
];

/// Appends samples to a CSV file, creating it with a header if needed.
pub fn append_csv(path: &Path, items: &[Metric]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open metrics csv {}", path.display()))?;

    if file.metadata()?.len() == 0 {
        writeln!(file, "{}", HEADER.join(","))?;
    }
    for m in items {
        writeln!(file, "{}", record_row(m))?;
    }
    Ok(())
}

/// Loads samples from a CSV file. A leading header row is skipped.
pub fn read_csv(path: &Path) -> Result<Vec<Metric>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read metrics csv {}", path.display()))?;

    let mut items = Vec::new();
    for (i, line) in data.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let fields = split_row(line);
        if i == 0 && fields.first().map(String::as_str) == Some("timestamp") {
            continue;
        }
        if fields.len() < HEADER.len() {
            return Err(anyhow!("invalid record at line {}", i + 1));
        }
        let timestamp = DateTime::parse_from_rfc3339(&fields[0])
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("invalid timestamp at line {}", i + 1))?;
        items.push(Metric {
            timestamp,
            node_id: fields[1].clone(),
            peer_id: fields[2].clone(),
            path: fields[3].clone(),
            rtt_ms: fields[4].parse().unwrap_or(0.0),
            jitter_ms: fields[5].parse().unwrap_or(0.0),
            loss_pct: fields[6].parse().unwrap_or(0.0),
            throughput_mbps: fields[7].parse().unwrap_or(0.0),
            mtu: fields[8].parse().unwrap_or(0),
            nat_type: fields[9].clone(),
            public_addr: fields[10].clone(),
            relay_reason: fields[11].clone(),
        });
    }
    Ok(items)
}

fn record_row(m: &Metric) -> String {
    let fields = [
        m.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        m.node_id.clone(),
        m.peer_id.clone(),
        m.path.clone(),
        format!("{:.3}", m.rtt_ms),
        format!("{:.3}", m.jitter_ms),
        format!("{:.3}", m.loss_pct),
        format!("{:.3}", m.throughput_mbps),
        m.mtu.to_string(),
        m.nat_type.clone(),
        m.public_addr.clone(),
        m.relay_reason.clone(),
    ];
    fields
        .iter()
        .map(|f| quote_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn quote_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if current.is_empty() => quoted = true,
            ',' if !quoted => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// A basic statistics snapshot over a window of samples.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub count: usize,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub avg_rtt_ms: f64,
    pub p95_rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub avg_jitter_ms: f64,
    pub avg_loss_pct: f64,
    pub avg_throughput_mbps: f64,
}

/// Computes summary statistics for samples at or after `since`.
pub fn summarize(items: &[Metric], since: DateTime<Utc>) -> Summary {
    let filtered: Vec<&Metric> = items.iter().filter(|m| m.timestamp >= since).collect();
    if filtered.is_empty() {
        return Summary::default();
    }

    let mut values: Vec<f64> = Vec::with_capacity(filtered.len());
    let mut sum_rtt = 0.0;
    let mut sum_jitter = 0.0;
    let mut sum_loss = 0.0;
    let mut sum_throughput = 0.0;
    let mut min_rtt = f64::MAX;
    let mut max_rtt = 0.0f64;
    let mut from = filtered[0].timestamp;
    let mut to = filtered[0].timestamp;

    for m in &filtered {
        values.push(m.rtt_ms);
        sum_rtt += m.rtt_ms;
        sum_jitter += m.jitter_ms;
        sum_loss += m.loss_pct;
        sum_throughput += m.throughput_mbps;
        min_rtt = min_rtt.min(m.rtt_ms);
        max_rtt = max_rtt.max(m.rtt_ms);
        from = from.min(m.timestamp);
        to = to.max(m.timestamp);
    }

    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = filtered.len() as f64;

    Summary {
        count: filtered.len(),
        from: Some(from),
        to: Some(to),
        avg_rtt_ms: sum_rtt / count,
        p95_rtt_ms: percentile(&values, 0.95),
        min_rtt_ms: min_rtt,
        max_rtt_ms: max_rtt,
        avg_jitter_ms: sum_jitter / count,
        avg_loss_pct: sum_loss / count,
        avg_throughput_mbps: sum_throughput / count,
    }
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return values[0];
    }
    if p >= 1.0 {
        return values[values.len() - 1];
    }
    let idx = ((p * values.len() as f64).ceil() as usize).saturating_sub(1);
    values[idx.min(values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(node: &str, rtt: f64, ts: DateTime<Utc>) -> Metric {
        Metric {
            timestamp: ts,
            node_id: node.to_string(),
            peer_id: "peer".to_string(),
            path: "direct".to_string(),
            rtt_ms: rtt,
            jitter_ms: 1.0,
            loss_pct: 0.0,
            throughput_mbps: 10.0,
            mtu: 1280,
            nat_type: "cone_or_restricted".to_string(),
            public_addr: "1.2.3.4:5000".to_string(),
            relay_reason: String::new(),
        }
    }

    #[test]
    fn test_append_csv_single_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics.csv");
        let now = Utc::now();

        append_csv(&path, &[sample("a", 1.0, now)]).unwrap();
        append_csv(&path, &[sample("a", 2.0, now), sample("a", 3.0, now)]).unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        let headers = data.lines().filter(|l| l.starts_with("timestamp")).count();
        assert_eq!(headers, 1);
        assert_eq!(data.lines().count(), 4);
    }

    #[test]
    fn test_csv_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics.csv");
        let now = Utc::now();

        let mut m = sample("node-a", 12.345, now);
        m.relay_reason = "timeout, peer \"b\"".to_string();
        append_csv(&path, &[m]).unwrap();

        let items = read_csv(&path).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].node_id, "node-a");
        assert_eq!(items[0].rtt_ms, 12.345);
        assert_eq!(items[0].relay_reason, "timeout, peer \"b\"");
        assert_eq!(items[0].timestamp, now);
    }

    #[test]
    fn test_read_csv_rejects_short_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics.csv");
        std::fs::write(&path, "2024-01-01T00:00:00Z,a,b\n").unwrap();
        assert!(read_csv(&path).is_err());
    }

    #[test]
    fn test_summarize_window_and_percentile() {
        let now = Utc::now();
        let items: Vec<Metric> = (1..=100)
            .map(|i| sample("a", i as f64, now))
            .chain(std::iter::once(sample("a", 999.0, now - Duration::hours(1))))
            .collect();

        let summary = summarize(&items, now - Duration::minutes(5));
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_rtt_ms, 1.0);
        assert_eq!(summary.max_rtt_ms, 100.0);
        assert_eq!(summary.p95_rtt_ms, 95.0);
        assert!((summary.avg_rtt_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_empty_window() {
        let now = Utc::now();
        let items = vec![sample("a", 5.0, now - Duration::hours(2))];
        let summary = summarize(&items, now);
        assert_eq!(summary.count, 0);
    }
}
