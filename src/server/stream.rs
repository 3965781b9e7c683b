// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ServerStream`: the multi-reader fanout object (spec §3, §4.5).
//!
//! One `ServerStream` is created by the application per published session
//! description and is shared by every `ServerSession` that reads from or
//! writes to it. Registration/deregistration take the stream-wide write
//! lock; per-packet fanout takes only the read lock, per spec §5's
//! "packet fanout takes the read lock, (de)registration takes the write
//! lock".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::format::Media;
use crate::rtcp::SenderReportGenerator;
use crate::ring::{self, RingSender};

/// Identifies one reader within a [`ServerStream`]; handed out by
/// [`ServerStream::add_reader`] and used to unregister or mark playing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReaderId(u64);

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

impl ReaderId {
    fn next() -> Self {
        ReaderId(NEXT_READER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Error produced when a packet can't be enqueued to a reader (spec §4.5's
/// "write error" slot). The coordinator surfaces this the next time it
/// inspects the reader; the fanout path itself never blocks on it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
pub enum WriteQueueError {
    #[error("reader's write queue is full")]
    Full,
    #[error("reader's write queue is closed")]
    Closed,
}

struct ReaderSlot {
    id: ReaderId,
    tx: RingSender,
    in_play: AtomicBool,
    write_error: AtomicBool,
}

/// Per-media fanout state: the reports generator for every format in the
/// media, an optional multicast writer, and the readers that have set up
/// this media.
struct StreamMedia {
    senders: Vec<(u8, Mutex<SenderReportGenerator>)>,
    multicast: Option<RingSender>,
    readers: Vec<ReaderSlot>,
}

impl StreamMedia {
    fn new(media: &Media) -> Self {
        StreamMedia {
            senders: media
                .formats()
                .iter()
                .map(|f| {
                    (
                        f.payload_type(),
                        Mutex::new(SenderReportGenerator::new(0, f.clock_rate().get())),
                    )
                })
                .collect(),
            multicast: None,
            readers: Vec::new(),
        }
    }
}

struct ServerStreamState {
    medias: Vec<StreamMedia>,
    closed: bool,
}

/// The fanout object itself (spec §3 "ServerStream"). Cheap to clone
/// (`Arc`-backed) so both the publishing `ServerSession` and every reading
/// `ServerSession` can hold a handle.
#[derive(Clone)]
pub struct ServerStream {
    inner: Arc<ServerStreamInner>,
}

struct ServerStreamInner {
    medias: Vec<Media>,
    state: RwLock<ServerStreamState>,
}

/// Error returned by [`ServerStream::close`] when readers are still
/// attached (spec §3 invariant: "once a reader is attached, closing the
/// stream fails until the reader detaches").
#[derive(Debug, thiserror::Error)]
#[error("cannot close stream: {0} reader(s) still attached")]
pub struct StreamBusyError(usize);

impl ServerStream {
    pub fn new(medias: Vec<Media>) -> Self {
        let stream_medias = medias.iter().map(StreamMedia::new).collect();
        ServerStream {
            inner: Arc::new(ServerStreamInner {
                medias,
                state: RwLock::new(ServerStreamState {
                    medias: stream_medias,
                    closed: false,
                }),
            }),
        }
    }

    pub fn medias(&self) -> &[Media] {
        &self.inner.medias
    }

    /// Registers a new reader for `media_idx`, giving it a ring of
    /// `capacity` outbound slots. The reader starts out not-in-Play; call
    /// [`Self::mark_playing`] once the session transitions to Play.
    pub fn add_reader(&self, media_idx: usize, capacity: usize) -> (ReaderId, ring::RingReceiver) {
        let (tx, rx) = ring::channel(capacity);
        let id = ReaderId::next();
        let mut state = self.inner.state.write();
        state.medias[media_idx].readers.push(ReaderSlot {
            id,
            tx,
            in_play: AtomicBool::new(false),
            write_error: AtomicBool::new(false),
        });
        (id, rx)
    }

    pub fn remove_reader(&self, media_idx: usize, id: ReaderId) {
        let mut state = self.inner.state.write();
        state.medias[media_idx].readers.retain(|r| r.id != id);
    }

    pub fn mark_playing(&self, media_idx: usize, id: ReaderId) {
        let state = self.inner.state.read();
        if let Some(slot) = state.medias[media_idx].readers.iter().find(|r| r.id == id) {
            slot.in_play.store(true, Ordering::Relaxed);
        }
    }

    /// Writes one already-encoded RTP packet for `media_idx`/`payload_type`
    /// to every active unicast reader and the multicast writer, if any
    /// (spec §4.5 steps 2–3). Feeds the sender-report generator first
    /// (step 1).
    pub fn write_rtp(
        &self,
        media_idx: usize,
        payload_type: u8,
        rtp_timestamp: u32,
        packet: Bytes,
    ) {
        let state = self.inner.state.read();
        let sm = &state.medias[media_idx];
        if let Some((_, gen)) = sm.senders.iter().find(|(pt, _)| *pt == payload_type) {
            gen.lock().on_rtp_packet(rtp_timestamp, packet.len());
        }
        for reader in &sm.readers {
            if !reader.in_play.load(Ordering::Relaxed) {
                continue;
            }
            match reader.tx.try_push(packet.clone()) {
                Ok(()) => {}
                Err(_) => reader.write_error.store(true, Ordering::Relaxed),
            }
        }
        if let Some(mc) = &sm.multicast {
            let _ = mc.try_push(packet);
        }
    }

    /// Returns reader ids whose write queue has faulted since the last
    /// call, for the coordinator to evict (spec §4.5: "a reader with a
    /// write error is removed from the active set").
    pub fn drain_write_errors(&self, media_idx: usize) -> Vec<ReaderId> {
        let state = self.inner.state.read();
        state.medias[media_idx]
            .readers
            .iter()
            .filter(|r| r.write_error.swap(false, Ordering::Relaxed))
            .map(|r| r.id)
            .collect()
    }

    pub fn set_multicast_writer(&self, media_idx: usize, tx: RingSender) {
        let mut state = self.inner.state.write();
        state.medias[media_idx].multicast = Some(tx);
    }

    /// Generates a sender report for `media_idx`/`payload_type`, if any RTP
    /// has been observed yet for it (spec §4.5: "on a timer (default 10s)
    /// for each format currently being published").
    pub fn generate_sender_report(
        &self,
        media_idx: usize,
        payload_type: u8,
        now: std::time::SystemTime,
    ) -> Option<Bytes> {
        let state = self.inner.state.read();
        let sm = &state.medias[media_idx];
        sm.senders
            .iter()
            .find(|(pt, _)| *pt == payload_type)
            .and_then(|(_, gen)| gen.lock().generate(now))
    }

    pub fn reader_count(&self) -> usize {
        let state = self.inner.state.read();
        state.medias.iter().map(|m| m.readers.len()).sum()
    }

    /// Closes the stream, failing if any reader is still attached (spec §3
    /// invariant).
    pub fn close(&self) -> Result<(), StreamBusyError> {
        let mut state = self.inner.state.write();
        let attached = state.medias.iter().map(|m| m.readers.len()).sum();
        if attached > 0 {
            return Err(StreamBusyError(attached));
        }
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use std::num::NonZeroU32;

    fn one_media_stream() -> ServerStream {
        let fmt = Format::new(96, NonZeroU32::new(90_000).unwrap(), "H264".into(), None, None).unwrap();
        let mut media = Media::new("video".into(), "trackID=0".into());
        media.add_format(fmt).unwrap();
        ServerStream::new(vec![media])
    }

    #[test]
    fn fanout_delivers_to_playing_readers_only() {
        let stream = one_media_stream();
        let (id_a, mut rx_a) = stream.add_reader(0, 4);
        let (_id_b, mut rx_b) = stream.add_reader(0, 4);
        stream.mark_playing(0, id_a);

        stream.write_rtp(0, 96, 1000, Bytes::from_static(b"pkt"));

        assert!(rx_a.try_recv().is_some());
        assert!(rx_b.try_recv().is_none());
    }

    #[test]
    fn full_queue_sets_write_error() {
        let stream = one_media_stream();
        let (id, _rx) = stream.add_reader(0, 1);
        stream.mark_playing(0, id);
        stream.write_rtp(0, 96, 1, Bytes::from_static(b"a"));
        stream.write_rtp(0, 96, 2, Bytes::from_static(b"b"));
        assert_eq!(stream.drain_write_errors(0), vec![id]);
    }

    #[test]
    fn close_fails_while_reader_attached() {
        let stream = one_media_stream();
        let (id, _rx) = stream.add_reader(0, 4);
        assert!(stream.close().is_err());
        stream.remove_reader(0, id);
        assert!(stream.close().is_ok());
    }
}
