// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server configuration (spec §6, "Server configuration (recognized
//! options)"). A typed, builder-style struct rather than a stringly-typed
//! config map, following the ambient-stack guidance in SPEC_FULL.md §1.1.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// TLS material for RTSPS. Left generic over whatever the caller's TLS
/// stack produces; `rtsp-core` never depends on a TLS crate directly (see
/// SPEC_FULL.md §6) so this only records that RTSPS is enabled, not how.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Opaque identifier the caller can use to look up the acceptor it
    /// installs out-of-band (e.g. a key in its own `HashMap<String,
    /// TlsAcceptor>`). `rtsp-core` never constructs or holds the acceptor
    /// itself.
    pub label: String,
}

/// A contiguous, even-starting UDP port pair, as spec §3 requires for both
/// the server-wide RTP/RTCP listener pair and any SETUP's `client_port`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl PortPair {
    /// Builds a pair from a starting (even) port, failing if it isn't even
    /// or would overflow (spec §8: "UDP RTP/RTCP ports outside even/odd
    /// consecutive are rejected at server startup").
    pub fn new(rtp: u16) -> Result<Self, ConfigError> {
        if rtp % 2 != 0 {
            return Err(ConfigError::new(
                "UDP port pairs must start on an even (RTP) port",
            ));
        }
        let rtcp = rtp
            .checked_add(1)
            .ok_or_else(|| ConfigError::new("UDP RTP port has no following RTCP port"))?;
        Ok(PortPair { rtp, rtcp })
    }

    pub fn from_pair(rtp: u16, rtcp: u16) -> Result<Self, ConfigError> {
        if rtcp != rtp + 1 || rtp % 2 != 0 {
            return Err(ConfigError::new(
                "UDP RTP/RTCP ports must be even/odd and consecutive",
            ));
        }
        Ok(PortPair { rtp, rtcp })
    }
}

/// Error constructing a [`ServerOptions`]; returned rather than panicking,
/// per SPEC_FULL.md §1.1.
#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid server configuration: {0}")]
pub struct ConfigError(String);

impl ConfigError {
    fn new(msg: impl Into<String>) -> Self {
        ConfigError(msg.into())
    }
}

/// Multicast allocation range plus the fixed RTP/RTCP port pair every
/// multicast group uses (spec §3: "Multicast IP addresses are allocated
/// from a configured CIDR range by increment").
#[derive(Clone, Debug)]
pub struct MulticastConfig {
    pub range_start: IpAddr,
    pub range_end: IpAddr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    /// TTL stamped on every group this server allocates (spec §3's
    /// multicast scenario; RFC 2326 doesn't mandate a default so this
    /// mirrors the common `ttl=16` session-directory convention).
    pub ttl: u8,
}

/// Hands out multicast group addresses from a [`MulticastConfig`]'s range by
/// simple increment (spec §3: "allocated from a configured CIDR range by
/// increment"). IPv4-only: the ranges this core targets are classic SDP/RTSP
/// multicast groups, not IPv6 ASM/SSM.
///
/// Allocated addresses are never released; a long-lived server that
/// exhausts its range needs a larger one or a restart. Tracking
/// per-group refcounts to support reuse is future work, not implemented
/// here.
pub struct MulticastAllocator {
    start: u32,
    end: u32,
    next: AtomicU32,
    config: MulticastConfig,
}

impl MulticastAllocator {
    pub fn new(config: MulticastConfig) -> Result<Self, ConfigError> {
        let (start, end) = match (config.range_start, config.range_end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s), u32::from(e)),
            _ => {
                return Err(ConfigError::new(
                    "multicast address allocation only supports IPv4 ranges",
                ))
            }
        };
        if end < start {
            return Err(ConfigError::new(
                "multicast range_end must not precede range_start",
            ));
        }
        Ok(MulticastAllocator {
            start,
            end,
            next: AtomicU32::new(start),
            config,
        })
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    /// Returns the next group address in the range, or `None` once the
    /// range is exhausted.
    pub fn allocate(&self) -> Option<IpAddr> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            if current > self.end {
                return None;
            }
            if self
                .next
                .compare_exchange(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(IpAddr::V4(Ipv4Addr::from(current)));
            }
        }
    }
}

/// Server-wide configuration (spec §6). Constructed via [`ServerOptions::new`]
/// then customized with the `with_*` builder methods, mirroring the builder
/// idiom the wider pack (e.g. `moonshine`) uses for its server config.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub rtsp_address: SocketAddr,
    pub udp_ports: Option<PortPair>,
    pub multicast: Option<MulticastConfig>,
    pub tls_config: Option<TlsConfig>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_count: usize,
    pub write_buffer_count: usize,
    pub session_timeout: Duration,
    pub check_stream_period: Duration,
    pub send_firewall_openers: bool,
    pub server_header: String,
    /// Address an optional RTSP-over-HTTP tunnel listens on; `None` (the
    /// default) leaves the feature unused even when compiled in (see
    /// `src/server/http_tunnel.rs`).
    pub http_tunnel_address: Option<SocketAddr>,
}

impl ServerOptions {
    pub fn new(rtsp_address: SocketAddr) -> Self {
        ServerOptions {
            rtsp_address,
            udp_ports: None,
            multicast: None,
            tls_config: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            read_buffer_count: 256,
            write_buffer_count: 256,
            session_timeout: Duration::from_secs(60),
            check_stream_period: Duration::from_secs(1),
            send_firewall_openers: true,
            server_header: concat!("rtsp-core/", env!("CARGO_PKG_VERSION")).to_string(),
            http_tunnel_address: None,
        }
    }

    pub fn with_udp(mut self, ports: PortPair) -> Self {
        self.udp_ports = Some(ports);
        self
    }

    pub fn with_multicast(mut self, multicast: MulticastConfig) -> Self {
        self.multicast = Some(multicast);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = Some(tls);
        self
    }

    pub fn with_read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn with_write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn with_session_timeout(mut self, d: Duration) -> Self {
        self.session_timeout = d;
        self
    }

    pub fn with_http_tunnel_address(mut self, addr: SocketAddr) -> Self {
        self.http_tunnel_address = Some(addr);
        self
    }

    pub fn with_write_buffer_count(mut self, count: usize) -> Result<Self, ConfigError> {
        if count == 0 || count & (count - 1) != 0 {
            return Err(ConfigError::new("write_buffer_count must be a power of two"));
        }
        self.write_buffer_count = count;
        Ok(self)
    }

    /// Validates cross-field constraints spec §6 implies (TLS is
    /// "incompatible with UDP and multicast").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_config.is_some() && (self.udp_ports.is_some() || self.multicast.is_some()) {
            return Err(ConfigError::new(
                "tls_config is incompatible with udp_ports/multicast",
            ));
        }
        if self.write_buffer_count == 0 || self.write_buffer_count & (self.write_buffer_count - 1) != 0
        {
            return Err(ConfigError::new("write_buffer_count must be a power of two"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_pair_rejects_odd_start() {
        assert!(PortPair::new(35467).is_err());
    }

    #[test]
    fn port_pair_accepts_even_start() {
        let p = PortPair::new(35466).unwrap();
        assert_eq!(p.rtcp, 35467);
    }

    #[test]
    fn write_buffer_count_must_be_power_of_two() {
        let opts = ServerOptions::new("127.0.0.1:554".parse().unwrap());
        assert!(opts.with_write_buffer_count(100).is_err());
        let opts = ServerOptions::new("127.0.0.1:554".parse().unwrap());
        assert!(opts.with_write_buffer_count(512).is_ok());
    }

    #[test]
    fn validate_rejects_tls_with_udp() {
        let opts = ServerOptions::new("127.0.0.1:554".parse().unwrap())
            .with_udp(PortPair::new(6000).unwrap())
            .with_tls(TlsConfig {
                label: "default".into(),
            });
        assert!(opts.validate().is_err());
    }

    #[test]
    fn multicast_allocator_increments_then_exhausts() {
        let alloc = MulticastAllocator::new(MulticastConfig {
            range_start: "239.1.1.0".parse().unwrap(),
            range_end: "239.1.1.1".parse().unwrap(),
            rtp_port: 6000,
            rtcp_port: 6001,
            ttl: 16,
        })
        .unwrap();
        assert_eq!(alloc.allocate(), Some("239.1.1.0".parse().unwrap()));
        assert_eq!(alloc.allocate(), Some("239.1.1.1".parse().unwrap()));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn multicast_allocator_rejects_ipv6() {
        let result = MulticastAllocator::new(MulticastConfig {
            range_start: "ff02::1".parse().unwrap(),
            range_end: "ff02::2".parse().unwrap(),
            rtp_port: 6000,
            rtcp_port: 6001,
            ttl: 16,
        });
        assert!(result.is_err());
    }
}
