// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixed-capacity single-producer/single-consumer ring of already-encoded
//! packets (spec §4.2, §4.5: "bounded ring buffer drained by a writer
//! routine"; "enqueue never blocks the caller").
//!
//! This backs both the UDP socket write drain and each `ServerStream`
//! reader's outbound queue. The producer (publisher fanout, or a UDP
//! recv loop) calls [`Ring::try_push`], which never blocks and reports
//! `Full` instead of waiting; the dedicated writer task
//! ([`crate::server::stream`], [`crate::server::transport`]) drains it
//! with [`Ring::recv`].

use bytes::Bytes;
use tokio::sync::mpsc;

/// Producer half of a [`Ring`].
#[derive(Clone)]
pub struct RingSender {
    tx: mpsc::Sender<Bytes>,
}

/// Consumer half of a [`Ring`].
pub struct RingReceiver {
    rx: mpsc::Receiver<Bytes>,
}

/// Error returned by [`RingSender::try_push`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
pub enum PushError {
    #[error("ring buffer full; packet dropped")]
    Full,
    #[error("writer task has exited; stream closed")]
    Closed,
}

/// Creates a ring of the given capacity. `capacity` should be a power of
/// two (spec §6: `write_buffer_count` "must be a power of two"); this is
/// enforced by [`crate::server::config::ServerOptions`], not here, since
/// the ring itself works fine with any positive capacity.
pub fn channel(capacity: usize) -> (RingSender, RingReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RingSender { tx }, RingReceiver { rx })
}

impl RingSender {
    /// Enqueues `packet` without blocking. Per spec §4.5, a full ring on a
    /// live reader means the reader is too slow: the packet is dropped and
    /// the caller is expected to record a "write error" against that
    /// reader, not retry.
    pub fn try_push(&self, packet: Bytes) -> Result<(), PushError> {
        use mpsc::error::TrySendError;
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Full),
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

impl RingReceiver {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for callers (and tests) outside an async
    /// context. Returns `None` both when the ring is momentarily empty and
    /// when it's closed; use [`Self::recv`] to distinguish the two.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_recv_preserves_order() {
        let (tx, mut rx) = channel(4);
        tx.try_push(Bytes::from_static(b"a")).unwrap();
        tx.try_push(Bytes::from_static(b"b")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn full_ring_drops_instead_of_blocking() {
        let (tx, mut rx) = channel(1);
        tx.try_push(Bytes::from_static(b"a")).unwrap();
        assert_eq!(tx.try_push(Bytes::from_static(b"b")), Err(PushError::Full));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn push_after_receiver_dropped_reports_closed() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert_eq!(
            tx.try_push(Bytes::from_static(b"a")),
            Err(PushError::Closed)
        );
    }
}
