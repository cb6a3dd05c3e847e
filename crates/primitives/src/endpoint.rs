//! Canonical peer endpoints.
//!
//! An [`Endpoint`] is an address plus TCP port. The address is always stored
//! as 16 bytes: IPv4 as a v4-mapped IPv6 address, IPv6 natively, and onion
//! services as OnionCat pseudo-addresses in `fd87:d87e:eb43::/48`. Ordering
//! and equality follow that canonical byte form, then the port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Prefix of the OnionCat range carrying Tor v2-style onion identifiers.
pub const ONIONCAT_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug)]
pub struct EndpointParseError {
    value: String,
}

impl EndpointParseError {
    fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint '{}'", self.value)
    }
}

impl std::error::Error for EndpointParseError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Endpoint {
    addr: [u8; 16],
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let addr = match ip {
            IpAddr::V4(v4) => {
                let mut out = [0u8; 16];
                out[..12].copy_from_slice(&V4_MAPPED_PREFIX);
                out[12..].copy_from_slice(&v4.octets());
                out
            }
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { addr, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// Builds an endpoint from the 16-byte address of an `addr` message.
    pub fn from_wire(addr: [u8; 16], port: u16) -> Self {
        Self { addr, port }
    }

    /// Parses `a.b.c.d[:port]`, `[v6]:port`, bare v6, or `<b32>.onion[:port]`.
    pub fn parse(value: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(EndpointParseError::new(value));
        }
        if let Some(endpoint) = parse_onion(value, default_port) {
            return Ok(endpoint);
        }
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Ok(Self::new(ip, default_port));
        }
        Err(EndpointParseError::new(value))
    }

    pub fn wire_addr(&self) -> [u8; 16] {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr[..12] == V4_MAPPED_PREFIX
    }

    pub fn is_onion(&self) -> bool {
        self.addr[..6] == ONIONCAT_PREFIX
    }

    pub fn is_ipv6(&self) -> bool {
        !self.is_ipv4() && !self.is_onion()
    }

    /// The IP form, if this is not an onion pseudo-address.
    pub fn ip(&self) -> Option<IpAddr> {
        if self.is_onion() {
            return None;
        }
        let v6 = Ipv6Addr::from(self.addr);
        Some(match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        })
    }

    pub fn ipv4_octets(&self) -> Option<[u8; 4]> {
        if !self.is_ipv4() {
            return None;
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.addr[12..]);
        Some(out)
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The `<b32>.onion` hostname for onion endpoints.
    pub fn onion_host(&self) -> Option<String> {
        if !self.is_onion() {
            return None;
        }
        let mut host = base32_encode(&self.addr[6..]);
        host.push_str(".onion");
        Some(host)
    }

    /// Whether this address is worth gossiping and probing at all. Onion
    /// endpoints count as routable; they are reachable through a proxy only.
    pub fn is_routable(&self) -> bool {
        if self.is_onion() {
            return true;
        }
        match self.ip() {
            Some(IpAddr::V4(v4)) => {
                !(v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_multicast())
            }
            Some(IpAddr::V6(v6)) => {
                let unique_local = self.addr[0] & 0xfe == 0xfc;
                let link_local = self.addr[0] == 0xfe && self.addr[1] & 0xc0 == 0x80;
                !(v6.is_unspecified()
                    || v6.is_loopback()
                    || v6.is_multicast()
                    || unique_local
                    || link_local)
            }
            None => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = self.onion_host() {
            return write!(f, "{}:{}", host, self.port);
        }
        match self.ip() {
            Some(IpAddr::V4(v4)) => write!(f, "{}:{}", v4, self.port),
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            None => write!(f, "?:{}", self.port),
        }
    }
}

fn parse_onion(value: &str, default_port: u16) -> Option<Endpoint> {
    let (host, port) = match value.rsplit_once(':') {
        Some((host, port_str)) if host.ends_with(".onion") => {
            (host, port_str.parse::<u16>().ok()?)
        }
        _ if value.ends_with(".onion") => (value, default_port),
        _ => return None,
    };
    let label = host.strip_suffix(".onion")?;
    let ident = base32_decode(label)?;
    if ident.len() != 10 {
        return None;
    }
    let mut addr = [0u8; 16];
    addr[..6].copy_from_slice(&ONIONCAT_PREFIX);
    addr[6..].copy_from_slice(&ident);
    Some(Endpoint { addr, port })
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for byte in data {
        acc = (acc << 8) | *byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[(acc >> bits) as usize & 0x1f] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[(acc << (5 - bits)) as usize & 0x1f] as char);
    }
    out
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for ch in text.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|c| *c == ch.to_ascii_lowercase())?;
        acc = (acc << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}
