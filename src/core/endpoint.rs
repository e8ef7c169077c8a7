//! Network endpoint addressing.
//!
//! An [`Endpoint`] is a 16-byte IPv6 (or IPv4-mapped) address plus port,
//! carrying the advertised service bits and an optional "last seen"
//! timestamp. Identity, hashing and ordering use only address and port.
//!
//! ## Wire Format
//! ```text
//! [Timestamp(4, LE, optional)] [Services(8, LE)] [Address(16)] [Port(2, BE)]
//! ```
//! The timestamp is present only for protocol versions >= 31402 outside the
//! version handshake.

use crate::core::primitives::ensure_remaining;
use crate::error::Result;
use bytes::{Buf, BufMut};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// First protocol version whose address records carry a timestamp
pub const TIMESTAMP_VERSION: u32 = 31402;

/// Encoded size without the timestamp prefix
pub const ENDPOINT_LEN: usize = 26;

/// Encoded size with the timestamp prefix
pub const TIMESTAMPED_ENDPOINT_LEN: usize = 30;

/// Where an endpoint is being encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrContext {
    /// Inside a `version` message: never timestamped
    Handshake,
    /// Address gossip: timestamped from [`TIMESTAMP_VERSION`] on
    Network,
}

impl AddrContext {
    fn timestamped(self, version: u32) -> bool {
        self == AddrContext::Network && version >= TIMESTAMP_VERSION
    }
}

/// Remote host address as exchanged on the wire
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    address: [u8; 16],
    port: u16,
    services: u64,
    timestamp: Option<u32>,
}

impl Endpoint {
    pub fn new(address: [u8; 16], port: u16, services: u64) -> Self {
        Self {
            address,
            port,
            services,
            timestamp: None,
        }
    }

    /// Build from a socket address, mapping IPv4 into `::ffff:a.b.c.d`
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let address = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self::new(address, addr.port(), 0)
    }

    /// Same endpoint with a different claimed timestamp
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_services(mut self, services: u64) -> Self {
        self.services = services;
        self
    }

    pub fn address(&self) -> &[u8; 16] {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.timestamp
    }

    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.address);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    /// True for the unspecified address or port zero
    pub fn is_unroutable(&self) -> bool {
        self.port == 0 || self.ip().is_unspecified()
    }

    pub fn encoded_len(version: u32, context: AddrContext) -> usize {
        if context.timestamped(version) {
            TIMESTAMPED_ENDPOINT_LEN
        } else {
            ENDPOINT_LEN
        }
    }

    pub fn encode<B: BufMut>(&self, version: u32, context: AddrContext, dst: &mut B) {
        if context.timestamped(version) {
            dst.put_u32_le(self.timestamp.unwrap_or(0));
        }
        dst.put_u64_le(self.services);
        dst.put_slice(&self.address);
        dst.put_u16(self.port);
    }

    pub fn decode<B: Buf>(src: &mut B, version: u32, context: AddrContext) -> Result<Self> {
        ensure_remaining(src, Self::encoded_len(version, context))?;
        let timestamp = if context.timestamped(version) {
            Some(src.get_u32_le())
        } else {
            None
        };
        let services = src.get_u64_le();
        let mut address = [0u8; 16];
        src.copy_to_slice(&mut address);
        let port = src.get_u16();
        Ok(Self {
            address,
            port,
            services,
            timestamp,
        })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.port.cmp(&other.port))
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample() -> Endpoint {
        Endpoint::from_socket_addr("10.0.0.1:8333".parse().unwrap())
            .with_services(1)
            .with_timestamp(1_355_854_353)
    }

    #[test]
    fn test_ipv4_mapping() {
        let ep = sample();
        assert_eq!(&ep.address()[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(ep.socket_addr(), "10.0.0.1:8333".parse::<SocketAddr>().unwrap());
        assert_eq!(ep.to_string(), "10.0.0.1:8333");
    }

    #[test]
    fn test_identity_ignores_metadata() {
        let a = sample();
        let b = Endpoint::from_socket_addr(a.socket_addr());
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_ordering_address_then_port() {
        let a = Endpoint::from_socket_addr("10.0.0.1:9000".parse().unwrap());
        let b = Endpoint::from_socket_addr("10.0.0.2:1".parse().unwrap());
        let c = Endpoint::from_socket_addr("10.0.0.2:2".parse().unwrap());
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_handshake_encoding_has_no_timestamp() {
        let mut buf = BytesMut::new();
        sample().encode(60002, AddrContext::Handshake, &mut buf);
        assert_eq!(buf.len(), ENDPOINT_LEN);
        assert_eq!(&buf[..8], &1u64.to_le_bytes());
        // Port is big-endian
        assert_eq!(&buf[24..], &[0x20, 0x8d]);
    }

    #[test]
    fn test_network_encoding_version_gate() {
        let mut old = BytesMut::new();
        sample().encode(31401, AddrContext::Network, &mut old);
        assert_eq!(old.len(), ENDPOINT_LEN);

        let mut new = BytesMut::new();
        sample().encode(31402, AddrContext::Network, &mut new);
        assert_eq!(new.len(), TIMESTAMPED_ENDPOINT_LEN);
        assert_eq!(&new[..4], &1_355_854_353u32.to_le_bytes());

        let decoded = Endpoint::decode(&mut &new[..], 31402, AddrContext::Network).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.timestamp(), Some(1_355_854_353));
        assert_eq!(decoded.services(), 1);
    }

    #[test]
    fn test_unroutable() {
        assert!(Endpoint::from_socket_addr("0.0.0.0:8333".parse().unwrap()).is_unroutable());
        assert!(Endpoint::from_socket_addr("[::]:8333".parse().unwrap()).is_unroutable());
        assert!(Endpoint::from_socket_addr("10.0.0.1:0".parse().unwrap()).is_unroutable());
        assert!(!sample().is_unroutable());
    }

    #[test]
    fn test_truncated_decode() {
        let bytes = [0u8; 20];
        assert!(Endpoint::decode(&mut &bytes[..], 0, AddrContext::Network).is_err());
    }
}
