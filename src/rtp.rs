// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet intake, shared by the client's `PLAY` path and the server's
//! `RECORD` path; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! Adapted from `retina`'s `client::rtp` module (originally client-only)
//! and generalized so a [`StrictSequenceChecker`] can sit on either side of
//! a session.

use std::num::NonZeroU32;

use bytes::{Buf, Bytes};
use pretty_hex::PrettyHex;

use crate::error::{bail, wrap, ErrorInt};
use crate::{as_range, ConnectionContext, Error, RtspMessageContext, Timeline, Timestamp};

/// A received, validated RTP packet.
pub struct Packet {
    pub ctx: RtspMessageContext,
    pub channel_id: Option<u8>,
    pub stream_id: usize,
    pub timestamp: Timestamp,
    pub ssrc: u32,
    pub sequence_number: u16,

    /// Number of skipped sequence numbers since the last packet on this
    /// stream.
    pub loss: u16,

    pub marker: bool,

    /// Guaranteed to be less than `u16::MAX` bytes (spec §4.1's TCP
    /// interleaved / UDP size limits are enforced upstream in
    /// [`crate::wire`] and [`crate::server::transport`]).
    pub payload: Bytes,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ctx", &self.ctx)
            .field("channel_id", &self.channel_id)
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.ssrc)
            .field("sequence_number", &self.sequence_number)
            .field("loss", &self.loss)
            .field("marker", &self.marker)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

/// RTP demarshaller which ensures packets have a consistent SSRC and
/// monotonically increasing sequence number.
///
/// This reports packet loss (via [`Packet::loss`]) but doesn't prohibit
/// it, except for losses of more than `i16::MAX` which would be
/// indistinguishable from non-monotonic sequence numbers — the same
/// tolerance `retina` documents, since some servers/cameras drop packets
/// internally even over TCP.
#[derive(Debug)]
pub struct StrictSequenceChecker {
    ssrc: Option<u32>,
    next_seq: Option<u16>,
    ignore_spurious_data: bool,
}

impl StrictSequenceChecker {
    pub fn new(ssrc: Option<u32>, next_seq: Option<u16>, ignore_spurious_data: bool) -> Self {
        Self {
            ssrc,
            next_seq,
            ignore_spurious_data,
        }
    }

    /// Validates and unmarshals one RTP packet, placing it on `timeline`.
    ///
    /// `data` is the raw RTP packet bytes (header + payload); the header
    /// itself is read via `rtp_rs`, the external RTP codec contract named
    /// in spec §6 — this function never hand-rolls header parsing.
    pub fn rtp(
        &mut self,
        conn_ctx: &ConnectionContext,
        msg_ctx: &RtspMessageContext,
        timeline: &mut Timeline,
        channel_id: Option<u8>,
        stream_id: usize,
        mut data: Bytes,
    ) -> Result<Option<Packet>, Error> {
        let reader = rtp_rs::RtpReader::new(&data[..]).map_err(|e| {
            wrap!(ErrorInt::DecodeError {
                msg_ctx: *msg_ctx,
                channel_id,
                description: format!(
                    "corrupt RTP header while expecting seq={:04x?}: {:?}\n{:#?}",
                    &self.next_seq,
                    e,
                    data.hex_dump(),
                ),
            })
        })?;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let ssrc = reader.ssrc();
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));
        if matches!(self.ssrc, Some(s) if s != ssrc) {
            if self.ignore_spurious_data {
                log::debug!(
                    "[{conn_ctx}] ignoring spurious RTP data with ssrc={ssrc:08x} seq={sequence_number:04x} \
                     while expecting ssrc={:08x?} seq={:04x?}",
                    self.ssrc,
                    self.next_seq
                );
                return Ok(None);
            }
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: *conn_ctx,
                description: format!(
                    "wrong ssrc on stream {stream_id}; expecting ssrc={:08x?} seq={:04x?}, got ssrc={ssrc:08x} seq={sequence_number:04x}",
                    self.ssrc, self.next_seq
                ),
            });
        }
        if loss > 0x8000 {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: *conn_ctx,
                description: format!(
                    "out-of-order packet or large loss on stream {stream_id}; expecting seq={:04x?}, got seq={sequence_number:04x}",
                    self.next_seq
                ),
            });
        }
        let timestamp = timeline.advance_to(reader.timestamp()).map_err(|description| {
            wrap!(ErrorInt::ProtocolViolation {
                conn_ctx: *conn_ctx,
                description,
            })
        })?;
        self.ssrc = Some(ssrc);
        let marker = reader.mark();
        let payload_range = as_range(&data, reader.payload()).ok_or_else(|| {
            wrap!(ErrorInt::DecodeError {
                msg_ctx: *msg_ctx,
                channel_id,
                description: "empty RTP payload".into(),
            })
        })?;
        data.truncate(payload_range.end);
        data.advance(payload_range.start);
        self.next_seq = Some(sequence_number.wrapping_add(1));
        Ok(Some(Packet {
            ctx: *msg_ctx,
            channel_id,
            stream_id,
            timestamp,
            ssrc,
            sequence_number,
            loss,
            marker,
            payload: data,
        }))
    }
}

/// Reads just the fields the RTCP report generators need
/// ([`crate::rtcp::SenderReportGenerator`]) without going through the full
/// [`StrictSequenceChecker`] state machine — used on the publishing side
/// where the packet has already been validated by its originator.
pub fn peek_header(data: &[u8]) -> Result<(u32 /* ssrc */, u32 /* rtp ts */, bool /* marker */), String> {
    let reader = rtp_rs::RtpReader::new(data).map_err(|e| format!("corrupt RTP header: {e:?}"))?;
    Ok((reader.ssrc(), reader.timestamp(), reader.mark()))
}

pub(crate) fn clock_rate_nonzero(clock_rate: u32) -> Result<NonZeroU32, String> {
    NonZeroU32::new(clock_rate).ok_or_else(|| "clock rate must be nonzero".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::num::NonZeroU32;
    use std::time::SystemTime;

    fn ctx() -> (ConnectionContext, RtspMessageContext) {
        let conn = ConnectionContext {
            local_addr: "127.0.0.1:554".parse::<SocketAddr>().unwrap(),
            peer_addr: "127.0.0.1:5000".parse::<SocketAddr>().unwrap(),
            established: SystemTime::now(),
        };
        (
            conn,
            RtspMessageContext {
                conn,
                msg_pos: 0,
            },
        )
    }

    fn rtp_packet(seq: u16, ts: u32, ssrc: u32, marker: bool, payload: &[u8]) -> Bytes {
        let mut buf = vec![0x80u8, if marker { 0x80 } else { 0x00 }, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn accepts_in_order_packets() {
        let (conn, msg) = ctx();
        let mut checker = StrictSequenceChecker::new(None, None, false);
        let mut timeline = Timeline::new(None, NonZeroU32::new(90_000).unwrap());
        let pkt = checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(1, 1000, 0xdead_beef, true, &[1, 2, 3, 4]))
            .unwrap()
            .unwrap();
        assert_eq!(pkt.sequence_number, 1);
        assert_eq!(pkt.loss, 0);
        assert_eq!(&pkt.payload[..], &[1, 2, 3, 4]);
        assert!(pkt.marker);
    }

    #[test]
    fn reports_loss_without_rejecting() {
        let (conn, msg) = ctx();
        let mut checker = StrictSequenceChecker::new(None, None, false);
        let mut timeline = Timeline::new(None, NonZeroU32::new(90_000).unwrap());
        checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(1, 1000, 1, false, &[0]))
            .unwrap();
        let pkt = checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(5, 1400, 1, false, &[0]))
            .unwrap()
            .unwrap();
        assert_eq!(pkt.loss, 4);
    }

    #[test]
    fn rejects_ssrc_change_by_default() {
        let (conn, msg) = ctx();
        let mut checker = StrictSequenceChecker::new(None, None, false);
        let mut timeline = Timeline::new(None, NonZeroU32::new(90_000).unwrap());
        checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(1, 1000, 1, false, &[0]))
            .unwrap();
        let err = checker.rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(2, 1400, 2, false, &[0]));
        assert!(err.is_err());
    }

    #[test]
    fn ignores_spurious_ssrc_when_configured() {
        let (conn, msg) = ctx();
        let mut checker = StrictSequenceChecker::new(None, None, true);
        let mut timeline = Timeline::new(None, NonZeroU32::new(90_000).unwrap());
        checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(1, 1000, 1, false, &[0]))
            .unwrap();
        let res = checker
            .rtp(&conn, &msg, &mut timeline, Some(0), 0, rtp_packet(2, 1400, 2, false, &[0]))
            .unwrap();
        assert!(res.is_none());
    }
}
