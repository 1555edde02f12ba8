//! IPv4 parsing, formatting, and CIDR expansion.
//!
//! The blocklist pipeline works on raw `u32` addresses; this module is the
//! only place that converts between text and numeric form.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Parses a dotted-quad IPv4 address into its 32-bit value.
///
/// Octet range validation is delegated to the standard parser; anything it
/// rejects surfaces as [`Error::InvalidAddress`].
pub fn parse_ipv4(text: &str) -> Result<u32> {
    text.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::InvalidAddress(text.to_string()))
}

/// Formats a 32-bit value back to dotted-quad form.
pub fn format_ipv4(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

/// Expands CIDR notation `a.b.c.d/n` into the inclusive range
/// `[network, broadcast]`.
///
/// `network = ip & mask`, `broadcast = network | !mask`, where a prefix
/// length of 0 yields the full address space.
pub fn cidr_range(text: &str) -> Result<(u32, u32)> {
    let (addr, prefix) = text
        .split_once('/')
        .ok_or_else(|| Error::InvalidAddress(text.to_string()))?;
    let bits: u32 = prefix
        .parse()
        .map_err(|_| Error::InvalidAddress(text.to_string()))?;
    if bits > 32 {
        return Err(Error::InvalidAddress(text.to_string()));
    }

    let ip = parse_ipv4(addr)?;
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    let network = ip & mask;
    let broadcast = network | !mask;
    Ok((network, broadcast))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let ip = parse_ipv4("203.0.113.7").unwrap();
        assert_eq!(ip, 0xCB00_7107);
        assert_eq!(format_ipv4(ip), "203.0.113.7");
    }

    #[test]
    fn test_parse_rejects_bad_octets() {
        assert!(parse_ipv4("256.0.0.1").is_err());
        assert!(parse_ipv4("1.2.3").is_err());
        assert!(parse_ipv4("1.2.3.4.5").is_err());
        assert!(parse_ipv4("not an ip").is_err());
        assert!(parse_ipv4("").is_err());
    }

    #[test]
    fn test_cidr_basic() {
        let (first, last) = cidr_range("192.168.1.0/24").unwrap();
        assert_eq!(format_ipv4(first), "192.168.1.0");
        assert_eq!(format_ipv4(last), "192.168.1.255");
    }

    #[test]
    fn test_cidr_normalizes_host_bits() {
        let (first, last) = cidr_range("10.1.2.3/8").unwrap();
        assert_eq!(format_ipv4(first), "10.0.0.0");
        assert_eq!(format_ipv4(last), "10.255.255.255");
    }

    #[test]
    fn test_cidr_single_host() {
        let (first, last) = cidr_range("203.0.113.7/32").unwrap();
        assert_eq!(first, last);
        assert_eq!(format_ipv4(first), "203.0.113.7");
    }

    #[test]
    fn test_cidr_zero_prefix_is_everything() {
        let (first, last) = cidr_range("1.2.3.4/0").unwrap();
        assert_eq!(first, 0);
        assert_eq!(last, u32::MAX);
    }

    #[test]
    fn test_cidr_rejects_bad_input() {
        assert!(cidr_range("10.0.0.0").is_err());
        assert!(cidr_range("10.0.0.0/33").is_err());
        assert!(cidr_range("10.0.0.0/x").is_err());
        assert!(cidr_range("300.0.0.0/8").is_err());
    }
}
