//! STUN binding requests and NAT classification.
//!
//! The fleet only needs one question answered: does this socket's public
//! mapping stay stable across destinations? Querying two or more reflectors
//! from the same local socket and comparing the mapped addresses answers it:
//! differing mappings mean a symmetric NAT, identical mappings mean some cone
//! or restricted variant. A single observation proves nothing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// NAT classification derived from multi-reflector probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatClass {
    /// Mapping varies by destination; direct paths rarely survive.
    Symmetric,
    /// Mapping is stable across destinations.
    ConeOrRestricted,
    /// Not enough evidence to classify.
    Unknown,
}

impl NatClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatClass::Symmetric => "symmetric",
            NatClass::ConeOrRestricted => "cone_or_restricted",
            NatClass::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> NatClass {
        match value {
            "symmetric" => NatClass::Symmetric,
            "cone_or_restricted" => NatClass::ConeOrRestricted,
            _ => NatClass::Unknown,
        }
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infers the NAT class from mapped addresses reported by multiple servers.
pub fn classify(addrs: &[String]) -> NatClass {
    if addrs.len() < 2 {
        return NatClass::Unknown;
    }
    let first = &addrs[0];
    if addrs[1..].iter().any(|a| a != first) {
        NatClass::Symmetric
    } else {
        NatClass::ConeOrRestricted
    }
}

/// Builds a STUN Binding Request (RFC 5389) with the given transaction id.
pub fn build_binding_request(tx_id: &[u8; 12]) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(tx_id);
    buf
}

/// Reports whether a datagram looks like a STUN message. Used by the shared
/// probe socket to split STUN traffic from direct-probe frames.
pub fn is_message(buf: &[u8]) -> bool {
    buf.len() >= 20
        && buf[0] & 0xC0 == 0
        && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Parses a Binding Success response, returning the mapped address.
/// XOR-MAPPED-ADDRESS is preferred; plain MAPPED-ADDRESS is the fallback.
pub fn parse_binding_response(buf: &[u8], tx_id: &[u8; 12]) -> Option<SocketAddr> {
    if buf.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return None;
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 20 + msg_len || buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return None;
    }
    if buf[8..20] != tx_id[..] {
        return None;
    }

    let mut fallback = None;
    let mut offset = 20;
    let end = 20 + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let attr = &buf[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_xor_mapped(attr, tx_id) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if fallback.is_none() {
                    fallback = parse_mapped(attr);
                }
            }
            _ => {}
        }
        // Attributes are padded to 32-bit boundaries.
        offset += (attr_len + 3) & !3;
    }

    fallback
}

fn parse_mapped(attr: &[u8]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let family = attr[1];
    let port = u16::from_be_bytes([attr[2], attr[3]]);
    match family {
        0x01 if attr.len() >= 8 => {
            let ip = Ipv4Addr::new(attr[4], attr[5], attr[6], attr[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if attr.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&attr[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn parse_xor_mapped(attr: &[u8], tx_id: &[u8; 12]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let family = attr[1];
    let port = u16::from_be_bytes([attr[2], attr[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 if attr.len() >= 8 => {
            let raw = u32::from_be_bytes([attr[4], attr[5], attr[6], attr[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 if attr.len() >= 20 => {
            let mut xor = [0u8; 16];
            xor[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor[4..16].copy_from_slice(tx_id);
            let mut octets = [0u8; 16];
            for (i, b) in octets.iter_mut().enumerate() {
                *b = attr[4 + i] ^ xor[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_success(tx_id: &[u8; 12], attrs: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(tx_id);
        msg.extend_from_slice(attrs);
        msg
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[]), NatClass::Unknown);
        assert_eq!(classify(&["1.2.3.4:5000".into()]), NatClass::Unknown);
        assert_eq!(
            classify(&["1.2.3.4:5000".into(), "1.2.3.4:5000".into()]),
            NatClass::ConeOrRestricted
        );
        assert_eq!(
            classify(&["1.2.3.4:5000".into(), "1.2.3.4:5001".into()]),
            NatClass::Symmetric
        );
        assert_eq!(
            classify(&["1.2.3.4:5000".into(), "1.2.3.4:5000".into(), "5.6.7.8:5000".into()]),
            NatClass::Symmetric
        );
    }

    #[test]
    fn test_nat_class_strings() {
        assert_eq!(NatClass::Symmetric.to_string(), "symmetric");
        assert_eq!(NatClass::parse("cone_or_restricted"), NatClass::ConeOrRestricted);
        assert_eq!(NatClass::parse(""), NatClass::Unknown);
    }

    #[test]
    fn test_build_binding_request_shape() {
        let tx_id = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let request = build_binding_request(&tx_id);
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], &tx_id);
        assert!(is_message(&request));
    }

    #[test]
    fn test_is_message_rejects_probe_frames() {
        assert!(!is_message(b"wgfleet-direct-probe:deadbeef"));
        assert!(!is_message(&[0x00, 0x01]));
    }

    #[test]
    fn test_parse_xor_mapped_v4() {
        let tx_id = [9u8; 12];
        // XOR-MAPPED-ADDRESS for 203.0.113.7:33134
        let port = 33134u16 ^ ((MAGIC_COOKIE >> 16) as u16);
        let ip = u32::from(Ipv4Addr::new(203, 0, 113, 7)) ^ MAGIC_COOKIE;
        let mut attr = vec![0x00, 0x20, 0x00, 0x08, 0x00, 0x01];
        attr.extend_from_slice(&port.to_be_bytes());
        attr.extend_from_slice(&ip.to_be_bytes());

        let msg = binding_success(&tx_id, &attr);
        let addr = parse_binding_response(&msg, &tx_id).unwrap();
        assert_eq!(addr, "203.0.113.7:33134".parse().unwrap());
    }

    #[test]
    fn test_parse_mapped_fallback() {
        let tx_id = [7u8; 12];
        let mut attr = vec![0x00, 0x01, 0x00, 0x08, 0x00, 0x01];
        attr.extend_from_slice(&51900u16.to_be_bytes());
        attr.extend_from_slice(&[198, 51, 100, 2]);

        let msg = binding_success(&tx_id, &attr);
        let addr = parse_binding_response(&msg, &tx_id).unwrap();
        assert_eq!(addr, "198.51.100.2:51900".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_tx_id_mismatch() {
        let tx_id = [7u8; 12];
        let msg = binding_success(&tx_id, &[]);
        assert!(parse_binding_response(&msg, &[8u8; 12]).is_none());
    }
}
