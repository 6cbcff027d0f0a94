//! Address helpers for probe targeting and overlay CIDR handling.

use std::net::Ipv4Addr;

/// Builds a stable direct-probe address for a peer.
///
/// Direct probing uses a dedicated UDP probe port which is not the WireGuard
/// transport port. A STUN-derived `public_addr` often carries an ephemeral
/// NAT-mapped port that is wrong when the probe port is fixed (e.g. behind
/// port-forwarding). Take the host from `public_addr` (preferred) or from
/// `endpoint`, and always join it with `probe_port`.
pub fn probe_addr(public_addr: &str, endpoint: &str, probe_port: u16) -> Option<String> {
    if probe_port == 0 {
        return None;
    }

    let mut host = host_from_addr(public_addr);
    if host.is_empty() {
        host = host_from_addr(endpoint);
    }
    if host.is_empty() {
        return None;
    }

    Some(join_host_port(&host, probe_port))
}

/// Formats `host:port`, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Extracts the host from `host`, `host:port`, `[v6]:port`, or unbracketed
/// `v6:port` forms.
pub fn host_from_addr(addr: &str) -> String {
    let a = addr.trim();
    if a.is_empty() {
        return String::new();
    }

    // Bracketed IPv6, with or without a port suffix.
    if let Some(rest) = a.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
        return String::new();
    }

    match a.matches(':').count() {
        0 => a.to_string(),
        1 => {
            let (host, port) = a.split_once(':').unwrap();
            if port.parse::<u16>().is_ok() {
                host.to_string()
            } else {
                String::new()
            }
        }
        _ => {
            // Unbracketed IPv6: peel off a trailing ":port" when the suffix is
            // numeric, otherwise treat the whole string as a raw address.
            if let Some(last) = a.rfind(':') {
                if last > 0 && last < a.len() - 1 && a[last + 1..].parse::<u16>().is_ok() {
                    return a[..last].to_string();
                }
            }
            a.to_string()
        }
    }
}

/// Appends `/32` to a bare host address; values that already carry a prefix
/// length pass through unchanged.
pub fn normalize_host_cidr(value: &str) -> String {
    if value.is_empty() || value.contains('/') {
        return value.to_string();
    }
    format!("{value}/32")
}

/// First allowed-ips entry that is narrower than a default route.
pub fn first_scoped_cidr(values: &[String]) -> String {
    for value in values {
        if value.is_empty() || value == "0.0.0.0/0" || value == "::/0" {
            continue;
        }
        return value.clone();
    }
    String::new()
}

/// Parses `a.b.c.d/nn` into the base address and prefix length.
pub fn parse_ipv4_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, bits) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let bits: u8 = bits.trim().parse().ok()?;
    if bits > 32 {
        return None;
    }
    Some((addr, bits))
}

/// Masks an address down to its network base.
pub fn mask_ipv4(addr: Ipv4Addr, bits: u8) -> Ipv4Addr {
    let raw = u32::from(addr);
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - u32::from(bits)) };
    Ipv4Addr::from(raw & mask)
}

/// Adds an offset to an IPv4 address.
pub fn add_ipv4(addr: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_addr_public_addr_overrides_port() {
        let addr = probe_addr("39.119.108.243:33134", "39.119.108.243:51820", 51900);
        assert_eq!(addr.as_deref(), Some("39.119.108.243:51900"));
    }

    #[test]
    fn test_probe_addr_endpoint_used_when_public_addr_missing() {
        let addr = probe_addr("", "39.119.108.243:51820", 51900);
        assert_eq!(addr.as_deref(), Some("39.119.108.243:51900"));
    }

    #[test]
    fn test_probe_addr_unbracketed_ipv6_host_port() {
        let addr = probe_addr("", "2001:db8::1:51820", 51900);
        assert_eq!(addr.as_deref(), Some("[2001:db8::1]:51900"));
    }

    #[test]
    fn test_probe_addr_requires_port_and_host() {
        assert!(probe_addr("1.2.3.4:1", "", 0).is_none());
        assert!(probe_addr("", "", 51900).is_none());
    }

    #[test]
    fn test_host_from_addr_forms() {
        assert_eq!(host_from_addr("1.2.3.4:51820"), "1.2.3.4");
        assert_eq!(host_from_addr("1.2.3.4"), "1.2.3.4");
        assert_eq!(host_from_addr("[2001:db8::1]:51820"), "2001:db8::1");
        assert_eq!(host_from_addr("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(host_from_addr("  "), "");
    }

    #[test]
    fn test_normalize_host_cidr() {
        assert_eq!(normalize_host_cidr("10.7.0.2"), "10.7.0.2/32");
        assert_eq!(normalize_host_cidr("10.7.0.2/32"), "10.7.0.2/32");
        assert_eq!(normalize_host_cidr(""), "");
    }

    #[test]
    fn test_first_scoped_cidr_skips_default_routes() {
        let values = vec![
            "".to_string(),
            "0.0.0.0/0".to_string(),
            "10.7.0.0/24".to_string(),
        ];
        assert_eq!(first_scoped_cidr(&values), "10.7.0.0/24");
        assert_eq!(first_scoped_cidr(&[]), "");
    }

    #[test]
    fn test_ipv4_cidr_math() {
        let (addr, bits) = parse_ipv4_cidr("10.7.0.9/24").unwrap();
        assert_eq!(mask_ipv4(addr, bits), Ipv4Addr::new(10, 7, 0, 0));
        assert_eq!(
            add_ipv4(Ipv4Addr::new(10, 7, 0, 0), 2),
            Ipv4Addr::new(10, 7, 0, 2)
        );
        assert!(parse_ipv4_cidr("10.7.0.0/33").is_none());
        assert!(parse_ipv4_cidr("not-a-cidr").is_none());
    }
}
