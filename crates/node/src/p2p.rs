//! The peer prober: one short-lived wire session per probe.
//!
//! Messages are 24-byte framed (message start, command, length, double-SHA256
//! checksum). A probe connects, completes the version/verack handshake while
//! answering pings, and optionally asks for the peer list. Protocol-level
//! misbehavior (wrong message start, ancient protocol version) earns a timed
//! ban; everything else is just a failed attempt.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fluxseed_primitives::{sha256d, Decoder, Encoder, Endpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::crawler::{Probe, ProbeOutcome};
use crate::params::SeedParams;

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_ADDR_RESULTS: usize = 1000;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const HANDSHAKE_TIMEOUT_SECS: u64 = 8;
const HARVEST_TIMEOUT_SECS: u64 = 6;

/// Timed exclusion for peers on the wrong network or below the floor.
pub const BAN_SECS_PROTOCOL: u64 = 100_000;

#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyConfig {
    pub onion: Option<SocketAddr>,
    pub ipv4: Option<SocketAddr>,
    pub ipv6: Option<SocketAddr>,
}

pub struct WireProber {
    magic: [u8; 4],
    protocol_version: i32,
    min_version: i32,
    default_port: u16,
    user_agent: &'static str,
    proxies: ProxyConfig,
}

enum SessionError {
    Io(String),
    Protocol(String),
    VersionTooLow(i32),
}

struct VersionInfo {
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
}

impl WireProber {
    pub fn new(params: &SeedParams, proxies: ProxyConfig) -> Self {
        Self {
            magic: params.message_start,
            protocol_version: params.protocol_version,
            min_version: params.min_seed_version,
            default_port: params.default_port,
            user_agent: params.user_agent,
            proxies,
        }
    }

    async fn probe_inner(
        &self,
        endpoint: &Endpoint,
        want_addrs: bool,
    ) -> Result<ProbeOutcome, SessionError> {
        let stream = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            self.connect(endpoint),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(SessionError::Io("connect timed out".to_string())),
        };
        let mut session = Session {
            stream,
            magic: self.magic,
        };

        let info = match timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            session.handshake(self.protocol_version, self.user_agent),
        )
        .await
        {
            Ok(info) => info?,
            Err(_) => return Err(SessionError::Io("handshake timed out".to_string())),
        };
        if info.version < self.min_version {
            return Err(SessionError::VersionTooLow(info.version));
        }

        let harvested = if want_addrs {
            session.harvest(self.default_port).await
        } else {
            Vec::new()
        };

        Ok(ProbeOutcome {
            good: true,
            ban_secs: 0,
            client_version: info.version,
            client_subversion: info.user_agent,
            blocks: info.start_height,
            services: info.services,
            harvested,
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, SessionError> {
        if endpoint.is_onion() {
            let Some(proxy) = self.proxies.onion else {
                return Err(SessionError::Io("no onion proxy configured".to_string()));
            };
            let Some(host) = endpoint.onion_host() else {
                return Err(SessionError::Io("not an onion endpoint".to_string()));
            };
            return socks5_connect(proxy, SocksTarget::Domain(host, endpoint.port())).await;
        }
        let Some(addr) = endpoint.to_socket_addr() else {
            return Err(SessionError::Io("unreachable address".to_string()));
        };
        let proxy = if endpoint.is_ipv4() {
            self.proxies.ipv4
        } else {
            self.proxies.ipv6
        };
        match proxy {
            Some(proxy) => socks5_connect(proxy, SocksTarget::Addr(addr)).await,
            None => TcpStream::connect(addr)
                .await
                .map_err(|err| SessionError::Io(err.to_string())),
        }
    }
}

#[async_trait]
impl Probe for WireProber {
    async fn probe(&self, endpoint: &Endpoint, want_addrs: bool) -> ProbeOutcome {
        match self.probe_inner(endpoint, want_addrs).await {
            Ok(outcome) => outcome,
            Err(SessionError::VersionTooLow(version)) => {
                log_debug!("{endpoint} speaks obsolete version {version}");
                ProbeOutcome {
                    ban_secs: BAN_SECS_PROTOCOL,
                    client_version: version,
                    ..ProbeOutcome::default()
                }
            }
            Err(SessionError::Protocol(reason)) => {
                log_debug!("{endpoint} violated the protocol: {reason}");
                ProbeOutcome {
                    ban_secs: BAN_SECS_PROTOCOL,
                    ..ProbeOutcome::default()
                }
            }
            Err(SessionError::Io(reason)) => {
                log_debug!("{endpoint} unreachable: {reason}");
                ProbeOutcome::default()
            }
        }
    }
}

struct Session {
    stream: TcpStream,
    magic: [u8; 4],
}

impl Session {
    async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), SessionError> {
        let mut message = Encoder::with_capacity(24 + payload.len());
        message.write_bytes(&self.magic);
        let mut command_bytes = [0u8; 12];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        message.write_bytes(&command_bytes);
        message.write_u32_le(payload.len() as u32);
        let checksum = sha256d(payload);
        message.write_bytes(&checksum[..4]);
        message.write_bytes(payload);
        self.stream
            .write_all(message.as_slice())
            .await
            .map_err(|err| SessionError::Io(err.to_string()))
    }

    async fn read_message(&mut self) -> Result<(String, Vec<u8>), SessionError> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| SessionError::Io(err.to_string()))?;
        if header[..4] != self.magic {
            return Err(SessionError::Protocol("invalid message start".to_string()));
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(SessionError::Protocol("payload too large".to_string()));
        }
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| SessionError::Io(err.to_string()))?;
        let checksum = sha256d(&payload);
        if header[20..24] != checksum[..4] {
            return Err(SessionError::Protocol(
                "invalid payload checksum".to_string(),
            ));
        }
        Ok((command, payload))
    }

    async fn handshake(
        &mut self,
        protocol_version: i32,
        user_agent: &str,
    ) -> Result<VersionInfo, SessionError> {
        let payload = build_version_payload(protocol_version, user_agent);
        self.send_message("version", &payload).await?;

        let mut info = None;
        let mut got_verack = false;
        while !(got_verack && info.is_some()) {
            let (command, payload) = self.read_message().await?;
            match command.as_str() {
                "version" => {
                    self.send_message("verack", &[]).await?;
                    info = Some(parse_version(&payload)?);
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        match info {
            Some(info) => Ok(info),
            None => Err(SessionError::Protocol(
                "handshake ended without version".to_string(),
            )),
        }
    }

    /// Asks for the peer list and drains `addr` replies until the deadline.
    /// A partial harvest is fine; errors just end it early.
    async fn harvest(&mut self, default_port: u16) -> Vec<Endpoint> {
        let mut out = Vec::new();
        if self.send_message("getaddr", &[]).await.is_err() {
            return out;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(HARVEST_TIMEOUT_SECS);
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match timeout(deadline - now, self.read_message()).await {
                Ok(Ok((command, payload))) => match command.as_str() {
                    "addr" => {
                        if let Ok(addrs) = parse_addr(&payload, default_port) {
                            out.extend(addrs);
                        }
                        if !out.is_empty() {
                            break;
                        }
                    }
                    "ping" => {
                        if self.send_message("pong", &payload).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                },
                _ => break,
            }
        }
        out
    }
}

fn build_version_payload(protocol_version: i32, user_agent: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(protocol_version);
    encoder.write_u64_le(0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, 0, [0u8; 16], 0);
    write_net_addr(&mut encoder, 0, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(user_agent);
    encoder.write_i32_le(0);
    encoder.write_u8(0);
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_u16_be(port);
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, SessionError> {
    let mut decoder = Decoder::new(payload);
    let mut read = || -> Result<VersionInfo, fluxseed_primitives::DecodeError> {
        let version = decoder.read_i32_le()?;
        let services = decoder.read_u64_le()?;
        let _timestamp = decoder.read_i64_le()?;
        let _addr_recv = decoder.read_bytes(26)?;
        let _addr_from = decoder.read_bytes(26)?;
        let _nonce = decoder.read_u64_le()?;
        let user_agent = decoder.read_var_str()?;
        let start_height = decoder.read_i32_le()?;
        Ok(VersionInfo {
            version,
            services,
            user_agent,
            start_height,
        })
    };
    read().map_err(|err| SessionError::Protocol(format!("bad version payload: {err}")))
}

fn parse_addr(payload: &[u8], default_port: u16) -> Result<Vec<Endpoint>, SessionError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|err| SessionError::Protocol(format!("bad addr payload: {err}")))?;
    if count > MAX_ADDR_RESULTS as u64 {
        return Err(SessionError::Protocol("addr count too large".to_string()));
    }
    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut read = || -> Result<Endpoint, fluxseed_primitives::DecodeError> {
            let _time = decoder.read_u32_le()?;
            let _services = decoder.read_u64_le()?;
            let ip = decoder.read_fixed::<16>()?;
            let port = decoder.read_u16_be()?;
            Ok(Endpoint::from_wire(ip, port))
        };
        let endpoint =
            read().map_err(|err| SessionError::Protocol(format!("bad addr payload: {err}")))?;
        if endpoint.port() != default_port || !endpoint.is_routable() {
            continue;
        }
        addrs.push(endpoint);
    }
    Ok(addrs)
}

enum SocksTarget {
    Addr(SocketAddr),
    Domain(String, u16),
}

/// Minimal SOCKS5 CONNECT, no authentication.
async fn socks5_connect(
    proxy: SocketAddr,
    target: SocksTarget,
) -> Result<TcpStream, SessionError> {
    let io_err = |err: std::io::Error| SessionError::Io(err.to_string());
    let mut stream = TcpStream::connect(proxy).await.map_err(io_err)?;
    stream.write_all(&[0x05, 0x01, 0x00]).await.map_err(io_err)?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.map_err(io_err)?;
    if greeting != [0x05, 0x00] {
        return Err(SessionError::Io("socks5 auth rejected".to_string()));
    }

    let mut request = Encoder::new();
    request.write_bytes(&[0x05, 0x01, 0x00]);
    let port = match &target {
        SocksTarget::Addr(SocketAddr::V4(v4)) => {
            request.write_u8(0x01);
            request.write_bytes(&v4.ip().octets());
            v4.port()
        }
        SocksTarget::Addr(SocketAddr::V6(v6)) => {
            request.write_u8(0x04);
            request.write_bytes(&v6.ip().octets());
            v6.port()
        }
        SocksTarget::Domain(host, port) => {
            request.write_u8(0x03);
            request.write_u8(host.len() as u8);
            request.write_bytes(host.as_bytes());
            *port
        }
    };
    request.write_u16_be(port);
    stream
        .write_all(request.as_slice())
        .await
        .map_err(io_err)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io_err)?;
    if reply[0] != 0x05 || reply[1] != 0x00 {
        return Err(SessionError::Io(format!(
            "socks5 connect failed (code {})",
            reply[1]
        )));
    }
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err)?;
            len[0] as usize
        }
        _ => return Err(SessionError::Io("socks5 malformed reply".to_string())),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await.map_err(io_err)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_payload_parses_back() {
        let payload = build_version_payload(170_020, "/fluxseed:0.1.0/");
        let info = match parse_version(&payload) {
            Ok(info) => info,
            Err(_) => panic!("own version payload must parse"),
        };
        assert_eq!(info.version, 170_020);
        assert_eq!(info.user_agent, "/fluxseed:0.1.0/");
        assert_eq!(info.start_height, 0);
    }

    #[test]
    fn addr_payload_filters_ports_and_routability() {
        let good = Endpoint::parse("198.51.100.7:16125", 16125).unwrap();
        let wrong_port = Endpoint::parse("198.51.100.8:9999", 16125).unwrap();
        let unroutable = Endpoint::parse("10.0.0.1:16125", 16125).unwrap();

        let mut encoder = Encoder::new();
        encoder.write_varint(3);
        for endpoint in [good, wrong_port, unroutable] {
            encoder.write_u32_le(0);
            encoder.write_u64_le(1);
            encoder.write_bytes(&endpoint.wire_addr());
            encoder.write_u16_be(endpoint.port());
        }

        let addrs = match parse_addr(&encoder.into_inner(), 16125) {
            Ok(addrs) => addrs,
            Err(_) => panic!("well-formed addr payload must parse"),
        };
        assert_eq!(addrs, vec![good]);
    }

    #[test]
    fn oversized_addr_count_is_a_protocol_error() {
        let mut encoder = Encoder::new();
        encoder.write_varint(100_000);
        assert!(parse_addr(&encoder.into_inner(), 16125).is_err());
    }
}
