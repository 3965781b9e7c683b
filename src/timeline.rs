// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timestamp bookkeeping shared by the client's RTP intake
//! ([`crate::rtp::StrictSequenceChecker`]) and the server's RTCP sender
//! report generator ([`crate::rtcp::SenderReportGenerator`]).
//!
//! RTP carries a 32-bit timestamp that wraps roughly every 13 hours at a
//! 90 kHz clock rate (less often at lower rates, more often at higher
//! ones). [`Timeline`] turns that wrapping counter into a monotonically
//! increasing `i64` so downstream code can compute durations without
//! special-casing the wraparound.

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};

/// A point on an RTP stream's timeline, in units of the stream's clock
/// rate, unwrapped so it only increases (absent deliberate seeks, which
/// this crate's callers don't do).
#[derive(Copy, Clone)]
pub struct Timestamp {
    timestamp: i64,
    clock_rate: NonZeroU32,
}

impl Timestamp {
    pub(crate) fn new(timestamp: i64, clock_rate: NonZeroU32) -> Self {
        Self {
            timestamp,
            clock_rate,
        }
    }

    /// The unwrapped timestamp, in units of [`Self::clock_rate`].
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate.get()
    }

    /// Elapsed time since timestamp `0`, as a `Duration`. Saturates at zero
    /// for (the RTSP-illegal but not worth panicking over) negative values.
    pub fn elapsed(&self) -> Duration {
        if self.timestamp <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.timestamp as f64 / f64::from(self.clock_rate.get()))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}Hz ({:?})",
            self.timestamp,
            self.clock_rate.get(),
            self.elapsed()
        )
    }
}

/// An NTP timestamp as carried in an RTCP sender report: seconds since the
/// NTP epoch (1900-01-01) in the upper 32 bits, fractional seconds in the
/// lower 32, per RFC 3550 §4.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NtpTimestamp(pub u64);

const NTP_TO_UNIX_EPOCH_SECS: u64 = 2_208_988_800;

impl NtpTimestamp {
    /// Converts a wall-clock time to its NTP representation. Saturates to
    /// the NTP epoch for times before 1900, which in practice never
    /// happens for `SystemTime::now()`.
    pub fn from_system_time(t: SystemTime) -> Self {
        let since_unix = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let secs = since_unix.as_secs() + NTP_TO_UNIX_EPOCH_SECS;
        let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTimestamp((secs << 32) | frac)
    }

    pub fn to_system_time(self) -> SystemTime {
        let secs = (self.0 >> 32).saturating_sub(NTP_TO_UNIX_EPOCH_SECS);
        let frac = self.0 & 0xFFFF_FFFF;
        let nanos = (frac * 1_000_000_000) >> 32;
        SystemTime::UNIX_EPOCH + Duration::new(secs, u32::try_from(nanos).unwrap_or(0))
    }
}

/// Tracks one RTP stream's timestamp, turning the wrapping 32-bit RTP
/// timestamp into a monotonic [`Timestamp`].
///
/// Two entry points mirror how the value shows up on the wire:
/// [`Self::advance_to`] for RTP packets (which must arrive in non-decreasing
/// order, mod wraparound) and [`Self::place`] for RTCP sender reports
/// (which may reference any point on the timeline, so it doesn't force
/// monotonicity).
#[derive(Debug)]
pub struct Timeline {
    /// The last raw (wire) RTP timestamp observed, if any.
    last_raw: Option<u32>,
    /// The unwrapped timestamp corresponding to `last_raw`.
    unwrapped: i64,
    clock_rate: NonZeroU32,
}

impl Timeline {
    pub fn new(initial_timestamp: Option<u32>, clock_rate: NonZeroU32) -> Self {
        match initial_timestamp {
            Some(t) => Self {
                last_raw: Some(t),
                unwrapped: i64::from(t),
                clock_rate,
            },
            None => Self {
                last_raw: None,
                unwrapped: 0,
                clock_rate,
            },
        }
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Advances the timeline to `raw`, treating it as the next RTP packet's
    /// timestamp. `raw` must not be more than `i32::MAX` ticks before the
    /// last-seen value (RFC 3550 doesn't bound this, but a jump that large
    /// is indistinguishable from wraparound and is almost certainly a bug
    /// upstream, as `retina` notes for sequence numbers).
    pub fn advance_to(&mut self, raw: u32) -> Result<Timestamp, String> {
        let unwrapped = self.unwrap(raw)?;
        self.last_raw = Some(raw);
        self.unwrapped = unwrapped;
        Ok(Timestamp::new(unwrapped, self.clock_rate))
    }

    /// Places `raw` on the timeline without advancing it. Used for RTCP
    /// sender reports, which reference the stream's timeline but aren't
    /// part of its packet sequence.
    pub fn place(&self, raw: u32) -> Result<Timestamp, String> {
        let unwrapped = self.unwrap(raw)?;
        Ok(Timestamp::new(unwrapped, self.clock_rate))
    }

    fn unwrap(&self, raw: u32) -> Result<i64, String> {
        let Some(last_raw) = self.last_raw else {
            return Ok(i64::from(raw));
        };
        let delta = raw.wrapping_sub(last_raw) as i32;
        if delta == i32::MIN {
            return Err(format!(
                "timestamp delta of exactly i32::MIN ({raw} vs {last_raw}) is ambiguous"
            ));
        }
        Ok(self.unwrapped + i64::from(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(hz: u32) -> NonZeroU32 {
        NonZeroU32::new(hz).unwrap()
    }

    #[test]
    fn advances_without_wraparound() {
        let mut t = Timeline::new(Some(1000), rate(90_000));
        let ts = t.advance_to(1000 + 3000).unwrap();
        assert_eq!(ts.timestamp(), 1000 + 3000);
    }

    #[test]
    fn handles_wraparound() {
        let mut t = Timeline::new(Some(u32::MAX - 10), rate(90_000));
        let ts = t.advance_to(10).unwrap();
        // wrapped forward by 21 ticks
        assert_eq!(ts.timestamp(), i64::from(u32::MAX - 10) + 21);
    }

    #[test]
    fn handles_backwards_jitter() {
        let mut t = Timeline::new(Some(5_000), rate(90_000));
        t.advance_to(5_900).unwrap();
        // RTCP SR can reference a point slightly behind the latest RTP packet.
        let placed = t.place(5_450).unwrap();
        assert_eq!(placed.timestamp(), 5_450);
    }

    #[test]
    fn ntp_round_trips_through_system_time() {
        let now = SystemTime::now();
        let ntp = NtpTimestamp::from_system_time(now);
        let back = ntp.to_system_time();
        let delta = now
            .duration_since(back)
            .or_else(|_| back.duration_since(now))
            .unwrap();
        assert!(delta < Duration::from_millis(1));
    }

    #[test]
    fn first_advance_with_no_prior_state_is_identity() {
        let mut t = Timeline::new(None, rate(8_000));
        let ts = t.advance_to(42).unwrap();
        assert_eq!(ts.timestamp(), 42);
    }
}
