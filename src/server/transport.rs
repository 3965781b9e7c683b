// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP unicast transport: process-wide RTP/RTCP listener pair, peer
//! keying, any-port discovery, and per-track liveness (spec §4.2).
//!
//! TCP-interleaved transport lives in [`crate::wire`] and
//! [`crate::server::connection`]; multicast writers are plain
//! [`crate::ring::RingSender`]s registered directly with
//! [`crate::server::stream::ServerStream`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::error::{bail, wrap, Error, ErrorInt};
use crate::multibuf::BufPool;
use crate::ring::{self, RingReceiver, RingSender};
use crate::server::config::{MulticastAllocator, MulticastConfig, PortPair};
use crate::ConnectionContext;

/// Keys a unicast UDP peer to the session+track that owns it. The server's
/// RTP and RTCP listeners share one map each, keyed by the *RTP* source
/// `(ip, port)` for RTP and the RTCP source for RTCP — spec §4.2: "Incoming
/// packets are keyed by (ip, port) to find the owning session+track".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerKey {
    pub ip: IpAddr,
    pub port: u16,
}

/// Per-track liveness and peer-pinning state, shared between the UDP
/// receive loop and the session's liveness ticker.
pub struct TrackTransport {
    /// Milliseconds since `UNIX_EPOCH` of the last RTP or RTCP packet seen
    /// for this track, updated atomically from the receive loop (spec
    /// §4.2: "a last-frame-received timestamp updated atomically").
    last_frame_at_ms: AtomicU64,
    /// Set once the peer's actual port is learned, when any-port discovery
    /// is enabled and the configured `client_port` isn't used as-is.
    pinned_peer: RwLock<Option<SocketAddr>>,
    allow_any_port: AtomicBool,
}

impl TrackTransport {
    pub fn new(allow_any_port: bool) -> Self {
        TrackTransport {
            last_frame_at_ms: AtomicU64::new(0),
            pinned_peer: RwLock::new(None),
            allow_any_port: AtomicBool::new(allow_any_port),
        }
    }

    fn touch(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_frame_at_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Seconds since the last RTP/RTCP packet, or `None` if none has
    /// arrived yet.
    pub fn idle_for(&self) -> Option<Duration> {
        let last = self.last_frame_at_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Some(Duration::from_millis(now_ms.saturating_sub(last)))
    }

    pub fn pinned_peer(&self) -> Option<SocketAddr> {
        *self.pinned_peer.read()
    }

    fn accept_from(&self, configured: SocketAddr, observed: SocketAddr) -> bool {
        if observed == configured {
            self.touch();
            return true;
        }
        if !self.allow_any_port.load(Ordering::Relaxed) {
            return false;
        }
        let mut pinned = self.pinned_peer.write();
        match *pinned {
            Some(addr) if addr == observed => {
                drop(pinned);
                self.touch();
                true
            }
            Some(_) => false,
            None if observed.ip() == configured.ip() => {
                *pinned = Some(observed);
                drop(pinned);
                self.touch();
                true
            }
            None => false,
        }
    }
}

/// One entry the dispatch table resolves a `PeerKey` to.
struct Registration {
    configured_peer: SocketAddr,
    track: Arc<TrackTransport>,
    /// Where validated payload bytes are handed off, e.g. to a
    /// `StrictSequenceChecker` running in the owning session's task.
    deliver: RingSender,
}

/// The server's process-wide UDP unicast RTP (or RTCP) listener. One
/// instance exists per direction (`kind` is just for logging); sessions
/// register/unregister as they SETUP and TEARDOWN.
pub struct UnicastListener {
    socket: Arc<UdpSocket>,
    registrations: RwLock<HashMap<PeerKey, Registration>>,
    local_addr: SocketAddr,
}

impl UnicastListener {
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_addr = socket.local_addr()?;
        Ok(UnicastListener {
            socket: Arc::new(socket),
            registrations: RwLock::new(HashMap::new()),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the TTL stamped on datagrams sent to an IPv4 multicast group
    /// (spec §3's multicast `ttl` parameter). A no-op for ordinary unicast
    /// listeners.
    pub fn set_multicast_ttl_v4(&self, ttl: u32) -> std::io::Result<()> {
        self.socket.set_multicast_ttl_v4(ttl)
    }

    /// Registers a (session, track) to receive packets from `configured_peer`.
    /// Returns a deregistration guard; dropping it alone does *not*
    /// deregister (see [`Self::deregister`]) since registration needs to
    /// survive task cancellation deliberately.
    pub fn register(
        &self,
        configured_peer: SocketAddr,
        track: Arc<TrackTransport>,
    ) -> RingReceiver {
        let (tx, rx) = ring::channel(64);
        self.registrations.write().insert(
            PeerKey {
                ip: configured_peer.ip(),
                port: configured_peer.port(),
            },
            Registration {
                configured_peer,
                track,
                deliver: tx,
            },
        );
        rx
    }

    pub fn deregister(&self, configured_peer: SocketAddr) {
        self.registrations.write().remove(&PeerKey {
            ip: configured_peer.ip(),
            port: configured_peer.port(),
        });
    }

    /// Sends a zero-length datagram to `peer` (spec §9's "firewall-opener"
    /// packet, implemented per `ServerOptions::send_firewall_openers`).
    pub async fn send_firewall_opener(&self, peer: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(&[], peer).await?;
        Ok(())
    }

    /// Drains `rx` (a track's outbound ring, as returned by
    /// `ServerStream::add_reader`) to `peer` until the ring closes. Runs as
    /// its own task per registered peer (spec §4.2/§4.5: "Outgoing writes
    /// go through a bounded ring buffer drained by a writer routine").
    pub async fn drain_writes(self: Arc<Self>, peer: SocketAddr, mut rx: RingReceiver) {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = self.socket.send_to(&packet, peer).await {
                log::debug!("udp write to {peer} failed: {e}");
            }
        }
    }

    /// Drives the receive loop until the socket errors. Runs as its own
    /// task (spec §5: "one per UDP listener for reads").
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let mut pool = BufPool::new(crate::multibuf::MAX_UDP_PAYLOAD);
        loop {
            let mut buf = pool.take();
            buf.resize(crate::multibuf::MAX_UDP_PAYLOAD, 0);
            let (len, peer) = self.socket.recv_from(&mut buf).await.map_err(|source| {
                wrap!(ErrorInt::Io {
                    conn_ctx: ConnectionContext {
                        local_addr: self.local_addr,
                        peer_addr: self.local_addr,
                        established: SystemTime::now(),
                    },
                    source,
                })
            })?;
            let data = pool.recycle(buf, len);

            let key = PeerKey {
                ip: peer.ip(),
                port: peer.port(),
            };
            let registrations = self.registrations.read();
            let reg = registrations
                .get(&key)
                .filter(|r| r.track.accept_from(r.configured_peer, peer))
                .or_else(|| {
                    registrations
                        .values()
                        .find(|r| r.track.accept_from(r.configured_peer, peer))
                });
            if let Some(reg) = reg {
                let _ = reg.deliver.try_push(data);
            } else {
                log::debug!("dropping UDP packet from unregistered peer {peer}");
            }
        }
    }
}

/// The server's two process-wide UDP unicast listeners (spec §3: "Two
/// process-wide listeners (RTP on even port, RTCP on the next odd port)").
/// Every track's negotiated `server_port` is this same pair's bound local
/// ports, regardless of which track or session it belongs to.
#[derive(Clone)]
pub struct UdpTransport {
    pub rtp: Arc<UnicastListener>,
    pub rtcp: Arc<UnicastListener>,
}

impl UdpTransport {
    /// Binds both listeners from a [`PortPair`] and spawns their receive
    /// loops (spec §5: "one per UDP listener for reads").
    pub async fn bind(ports: PortPair) -> Result<Self, std::io::Error> {
        let rtp = Arc::new(UnicastListener::bind(ports.rtp).await?);
        let rtcp = Arc::new(UnicastListener::bind(ports.rtcp).await?);
        tokio::spawn({
            let rtp = rtp.clone();
            async move {
                if let Err(e) = rtp.run().await {
                    log::warn!("UDP RTP listener stopped: {e}");
                }
            }
        });
        tokio::spawn({
            let rtcp = rtcp.clone();
            async move {
                if let Err(e) = rtcp.run().await {
                    log::warn!("UDP RTCP listener stopped: {e}");
                }
            }
        });
        Ok(UdpTransport { rtp, rtcp })
    }

    pub fn server_port_pair(&self) -> (u16, u16) {
        (self.rtp.local_addr().port(), self.rtcp.local_addr().port())
    }
}

/// Multicast send/allocate bundle: the fixed RTP/RTCP send sockets every
/// group shares (spec §3: "the same fixed rtp_port/rtcp_port is reused for
/// every multicast group") plus the address allocator. Unlike
/// [`UdpTransport`], these sockets are push-only — no session ever
/// registers with them for incoming dispatch, since multicast receivers
/// don't send RTP/RTCP back to the group.
#[derive(Clone)]
pub struct McastTransport {
    pub rtp: Arc<UnicastListener>,
    pub rtcp: Arc<UnicastListener>,
    pub allocator: Arc<MulticastAllocator>,
}

impl McastTransport {
    pub async fn bind(config: MulticastConfig) -> Result<Self, std::io::Error> {
        let rtp_port = config.rtp_port;
        let rtcp_port = config.rtcp_port;
        let allocator = Arc::new(MulticastAllocator::new(config).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        })?);
        let rtp = Arc::new(UnicastListener::bind(rtp_port).await?);
        let rtcp = Arc::new(UnicastListener::bind(rtcp_port).await?);
        rtp.set_multicast_ttl_v4(u32::from(allocator.config().ttl))?;
        rtcp.set_multicast_ttl_v4(u32::from(allocator.config().ttl))?;
        Ok(McastTransport { rtp, rtcp, allocator })
    }

    pub fn ttl(&self) -> u8 {
        self.allocator.config().ttl
    }
}

/// Parses `client_port=a-b` / `server_port=a-b` / `interleaved=c-d` range
/// syntax shared by the Transport header (spec §6).
pub fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| format!("expected a-b port range, got {s:?}"))?;
    let a: u16 = a.parse().map_err(|_| format!("invalid port {a:?}"))?;
    let b: u16 = b.parse().map_err(|_| format!("invalid port {b:?}"))?;
    Ok((a, b))
}

pub fn validate_udp_port_pair(pair: PortPair) -> Result<(), Error> {
    if pair.rtcp != pair.rtp + 1 || pair.rtp % 2 != 0 {
        bail!(ErrorInt::Fatal {
            description: format!(
                "UDP port pair {}-{} is not an even/odd consecutive pair",
                pair.rtp, pair.rtcp
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_range() {
        assert_eq!(parse_port_range("35466-35467").unwrap(), (35466, 35467));
        assert!(parse_port_range("35466").is_err());
    }

    #[test]
    fn track_transport_pins_first_observed_port_when_allowed() {
        let t = TrackTransport::new(true);
        let configured: SocketAddr = "192.0.2.1:9000".parse().unwrap();
        let observed: SocketAddr = "192.0.2.1:41000".parse().unwrap();
        assert!(t.accept_from(configured, observed));
        assert_eq!(t.pinned_peer(), Some(observed));
        // A second, different port is then rejected.
        let other: SocketAddr = "192.0.2.1:41001".parse().unwrap();
        assert!(!t.accept_from(configured, other));
    }

    #[test]
    fn track_transport_rejects_any_port_when_disabled() {
        let t = TrackTransport::new(false);
        let configured: SocketAddr = "192.0.2.1:9000".parse().unwrap();
        let observed: SocketAddr = "192.0.2.1:41000".parse().unwrap();
        assert!(!t.accept_from(configured, observed));
    }

    #[test]
    fn idle_for_is_none_before_first_packet() {
        let t = TrackTransport::new(false);
        assert!(t.idle_for().is_none());
    }
}
