// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP sender/receiver report generation (spec §2, §4.5: "Sender reports
//! are produced on a timer... for each format currently being published;
//! receiver reports are produced on a timer... for each format currently
//! being consumed").
//!
//! Packet (un)marshaling is the `rtcp` crate's job (the external RTP/RTCP
//! codec contract from spec §6); this module only decides *when* to emit a
//! report and *what* numbers go in it.

use std::time::{Instant, SystemTime};

use bytes::Bytes;
use rtcp::header::Header as RtcpHeader;
use rtcp::packet::Packet as RtcpPacket;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;

use crate::timeline::NtpTimestamp;

/// Produces RTCP sender reports for one format being published.
///
/// Tracks the wall-clock/RTP-time correspondence from the most recently
/// pushed packet, and extrapolates it forward by elapsed wall-clock time
/// when the ticker fires — the standard SR construction (RFC 3550 §6.4.1).
pub struct SenderReportGenerator {
    ssrc: u32,
    clock_rate: u32,
    packet_count: u32,
    octet_count: u64,
    last_rtp_timestamp: Option<u32>,
    last_sent_at: Option<Instant>,
}

impl SenderReportGenerator {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            packet_count: 0,
            octet_count: 0,
            last_rtp_timestamp: None,
            last_sent_at: None,
        }
    }

    /// Call once for every RTP packet the publisher writes for this
    /// format, *after* marshaling (so `payload_len` is the on-wire RTP
    /// packet size, matching RFC 3550's "octet count" definition).
    pub fn on_rtp_packet(&mut self, rtp_timestamp: u32, packet_len: usize) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(packet_len as u64);
        self.last_rtp_timestamp = Some(rtp_timestamp);
        self.last_sent_at = Some(Instant::now());
    }

    /// Builds a sender report as of `now`, or `None` if no RTP packet has
    /// been observed yet (spec §3: "Sequence numbers and timestamps...
    /// reflect the last packet observed (or zero when none)" applies to
    /// RTP-Info; the same "nothing to report yet" logic applies here).
    pub fn generate(&self, now: SystemTime) -> Option<Bytes> {
        let last_rtp_timestamp = self.last_rtp_timestamp?;
        let last_sent_at = self.last_sent_at?;
        let elapsed = last_sent_at.elapsed();
        let extrapolated_ticks =
            (elapsed.as_secs_f64() * f64::from(self.clock_rate)).round() as i64;
        let rtp_time = last_rtp_timestamp.wrapping_add(extrapolated_ticks as u32);

        let sr = SenderReport {
            ssrc: self.ssrc,
            ntp_time: NtpTimestamp::from_system_time(now).0,
            rtp_time,
            packet_count: self.packet_count,
            octet_count: self.octet_count as u32,
            reports: Vec::new(),
            profile_extensions: Bytes::new(),
        };
        sr.marshal().ok()
    }
}

/// Produces RTCP receiver reports for one format being consumed.
///
/// Tracks the statistics RFC 3550 §6.4.1 requires in a `ReceptionReport`:
/// highest sequence number seen, cumulative loss, interarrival jitter, and
/// the point in time of the last sender report received (so the other end
/// can compute round-trip delay).
pub struct ReceiverReportGenerator {
    receiver_ssrc: u32,
    sender_ssrc: u32,
    clock_rate: u32,
    base_seq: Option<u16>,
    highest_seq: u32,
    cycles: u32,
    expected_prior: u32,
    received_prior: u32,
    received: u32,
    jitter: f64,
    last_transit: Option<i64>,
    last_sr_ntp: Option<u64>,
    last_sr_received_at: Option<Instant>,
}

impl ReceiverReportGenerator {
    pub fn new(receiver_ssrc: u32, sender_ssrc: u32, clock_rate: u32) -> Self {
        Self {
            receiver_ssrc,
            sender_ssrc,
            clock_rate,
            base_seq: None,
            highest_seq: 0,
            cycles: 0,
            expected_prior: 0,
            received_prior: 0,
            received: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr_ntp: None,
            last_sr_received_at: None,
        }
    }

    /// Call for every RTP packet received on this format.
    pub fn on_rtp_packet(&mut self, sequence_number: u16, rtp_timestamp: u32, arrival: Instant) {
        self.received += 1;
        match self.base_seq {
            None => {
                self.base_seq = Some(sequence_number);
                self.highest_seq = u32::from(sequence_number);
            }
            Some(_base) => {
                self.highest_seq = extend_seq(self.highest_seq, &mut self.cycles, sequence_number);
            }
        }

        // RFC 3550 appendix A.8 interarrival jitter.
        let arrival_ticks = instant_to_rtp_ticks(arrival, self.clock_rate);
        let transit = arrival_ticks.wrapping_sub(i64::from(rtp_timestamp));
        if let Some(last_transit) = self.last_transit {
            let d = (transit - last_transit).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Call whenever a sender report arrives on this format, so the next
    /// receiver report's last-SR/delay-since-last-SR fields are populated.
    pub fn on_sender_report(&mut self, ntp_time: u64, received_at: Instant) {
        self.last_sr_ntp = Some(ntp_time);
        self.last_sr_received_at = Some(received_at);
    }

    pub fn generate(&mut self, now: Instant) -> Option<Bytes> {
        self.base_seq?;
        let expected = self.highest_seq - u32::from(self.base_seq.unwrap()) + 1;
        let lost_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        let lost_fraction = if lost_interval == 0 || lost_interval < received_interval {
            0
        } else {
            (((lost_interval - received_interval) as u64 * 256) / lost_interval as u64) as u8
        };
        self.expected_prior = expected;
        self.received_prior = self.received;

        let (lsr, dlsr) = match (self.last_sr_ntp, self.last_sr_received_at) {
            (Some(ntp), Some(at)) => {
                let middle_32 = ((ntp >> 16) & 0xFFFF_FFFF) as u32;
                let delay_secs = at.elapsed().as_secs_f64();
                (middle_32, (delay_secs * 65_536.0) as u32)
            }
            _ => (0, 0),
        };

        let total_lost = expected.saturating_sub(self.received).min(0x7F_FFFF);

        let rr = ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![ReceptionReport {
                ssrc: self.sender_ssrc,
                fraction_lost: lost_fraction,
                total_lost,
                last_sequence_number: self.highest_seq,
                jitter: self.jitter as u32,
                last_sender_report: lsr,
                delay: dlsr,
            }],
            profile_extensions: Bytes::new(),
        };
        rr.marshal().ok()
    }
}

/// Extends a raw 16-bit sequence number into a monotonic 32-bit one,
/// bumping `cycles` on wraparound (RFC 3550 appendix A.1's `update_seq`,
/// minus the initial-probation bookkeeping `on_rtp_packet`'s `base_seq`
/// already covers).
fn extend_seq(highest: u32, cycles: &mut u32, seq: u16) -> u32 {
    const MAX_DROPOUT: u16 = 3000;

    let max_seq = (highest & 0xFFFF) as u16;
    let udelta = seq.wrapping_sub(max_seq);
    if udelta < MAX_DROPOUT {
        if seq < max_seq {
            // The 16-bit field wrapped around since the last packet.
            *cycles = cycles.wrapping_add(1);
        }
        (*cycles << 16) | u32::from(seq)
    } else {
        // Too far backward to be the next in-order packet: a duplicate or
        // a reordered packet arriving late. Leave the extended sequence
        // number where it is.
        highest
    }
}

fn instant_to_rtp_ticks(instant: Instant, clock_rate: u32) -> i64 {
    // Relative, monotonic stand-in: only differences between two calls of
    // this function are meaningful, which is all `on_rtp_packet` needs.
    let nanos = instant.elapsed().as_nanos() as i64;
    -(nanos * i64::from(clock_rate) / 1_000_000_000)
}

/// Parses an incoming RTCP compound packet, returning each contained
/// packet. Per spec §4.2, multicast RTCP has no sender authentication;
/// unicast RTCP is associated with its track by the caller via the
/// `(ip, port)` the datagram arrived on.
pub fn parse_compound(mut data: &[u8]) -> Result<Vec<Box<dyn RtcpPacket + Send + Sync>>, String> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let header = RtcpHeader::unmarshal(&mut data).map_err(|e| e.to_string())?;
        let _ = header;
        let pkt = rtcp::packet::unmarshal(&mut data).map_err(|e| e.to_string())?;
        out.push(pkt);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_generator_reports_none_before_first_packet() {
        let gen = SenderReportGenerator::new(1, 90_000);
        assert!(gen.generate(SystemTime::now()).is_none());
    }

    #[test]
    fn sender_report_generator_accumulates_counts() {
        let mut gen = SenderReportGenerator::new(1, 90_000);
        gen.on_rtp_packet(1000, 200);
        gen.on_rtp_packet(1300, 180);
        assert_eq!(gen.packet_count, 2);
        assert_eq!(gen.octet_count, 380);
        assert!(gen.generate(SystemTime::now()).is_some());
    }

    #[test]
    fn receiver_report_generator_reports_none_before_first_packet() {
        let mut gen = ReceiverReportGenerator::new(1, 2, 90_000);
        assert!(gen.generate(Instant::now()).is_none());
    }

    #[test]
    fn receiver_report_generator_tracks_sequence_progress() {
        let mut gen = ReceiverReportGenerator::new(1, 2, 90_000);
        let now = Instant::now();
        gen.on_rtp_packet(100, 1000, now);
        gen.on_rtp_packet(101, 1300, now);
        gen.on_rtp_packet(102, 1600, now);
        assert!(gen.generate(now).is_some());
        assert_eq!(gen.highest_seq, 102);
    }

    #[test]
    fn receiver_report_generator_bumps_cycles_on_wraparound() {
        let mut gen = ReceiverReportGenerator::new(1, 2, 90_000);
        let now = Instant::now();
        gen.on_rtp_packet(65534, 1000, now);
        gen.on_rtp_packet(65535, 1300, now);
        gen.on_rtp_packet(0, 1600, now);
        gen.on_rtp_packet(1, 1900, now);
        assert_eq!(gen.highest_seq, 0x1_0001);
    }

    #[test]
    fn receiver_report_generator_ignores_stale_reordered_packet() {
        let mut gen = ReceiverReportGenerator::new(1, 2, 90_000);
        let now = Instant::now();
        gen.on_rtp_packet(100, 1000, now);
        gen.on_rtp_packet(200, 1300, now);
        // A wildly out-of-range sequence number (a duplicate from long
        // before the stream started, or line noise) must not rewind the
        // extended sequence number.
        gen.on_rtp_packet(150, 1400, now);
        assert_eq!(gen.highest_seq, 200);
    }
}
