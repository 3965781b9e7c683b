// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core of an RTSP 1.0 client and server library.
//!
//! This crate implements the parts of an RTSP stack that encode real
//! protocol design: session lifecycle state machines (client and server),
//! the transport layer that multiplexes RTP/RTCP across TCP-interleaved,
//! UDP-unicast and UDP-multicast, and the [`server::stream::ServerStream`]
//! fanout object that lets one publisher feed many readers.
//!
//! Deliberately **not** reimplemented here: SDP parsing/emission ([`sdp`]),
//! RTP/RTCP packet marshaling ([`rtp_rs`], [`rtcp`]), codec-specific
//! depacketization, URL parsing ([`url`]), Digest/Basic auth helpers
//! ([`digest_auth`]), and the RTSP wire encoder/decoder itself
//! ([`rtsp_types`]). Those crates are consumed through narrow interfaces;
//! see `DESIGN.md` for the full mapping.

pub(crate) mod bytecounter;
pub mod client;
pub(crate) mod error;
pub mod format;
pub(crate) mod multibuf;
pub(crate) mod ring;
pub mod rtcp;
pub mod rtp;
pub mod rtsp_url;
pub mod server;
pub(crate) mod timeline;
pub mod wire;

pub use error::{Error, ErrorKind};
pub use timeline::{NtpTimestamp, Timeline, Timestamp};

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Credentials for Basic or Digest authentication, shared by client and
/// server (the server needs them to challenge-and-verify; the client needs
/// them to answer a challenge).
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifies one TCP connection for the lifetime of a process, independent
/// of whatever `established` wall-clock time the OS can tell us. Used in
/// error messages and as a key into the server's connection set.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub established: SystemTime,
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.peer_addr, self.local_addr)
    }
}

/// Identifies one message (request, response, or interleaved frame) within
/// a [`ConnectionContext`], for error messages that need to point at
/// "the 3rd message we read on this connection, at byte offset N".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RtspMessageContext {
    pub conn: ConnectionContext,
    /// Byte offset within the connection's read stream where this message started.
    pub msg_pos: u64,
}

impl fmt::Display for RtspMessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.conn, self.msg_pos)
    }
}

/// Returns the range of `subslice` within `slice`, or `None` if `subslice`
/// doesn't point within `slice`. Used to convert a borrow returned by a
/// zero-copy parser (e.g. `rtp_rs::RtpReader::payload()`) back into offsets
/// that survive truncating/advancing the owning `Bytes`.
pub(crate) fn as_range(slice: &[u8], subslice: &[u8]) -> Option<std::ops::Range<usize>> {
    let slice_start = slice.as_ptr() as usize;
    let subslice_start = subslice.as_ptr() as usize;
    if subslice_start < slice_start {
        return None;
    }
    let start = subslice_start - slice_start;
    let end = start + subslice.len();
    if end > slice.len() {
        return None;
    }
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_range_finds_subslice() {
        let buf = vec![1u8, 2, 3, 4, 5];
        let sub = &buf[1..3];
        assert_eq!(as_range(&buf, sub), Some(1..3));
    }

    #[test]
    fn as_range_rejects_foreign_slice() {
        let buf = vec![1u8, 2, 3];
        let other = vec![1u8, 2, 3];
        assert_eq!(as_range(&buf, &other[..]), None);
    }
}
