// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A thin `AsyncWrite` wrapper that tallies bytes written (spec.md §2's
//! "Shared utilities (byte counter, ring buffer, multi-buffer)"), used by
//! [`crate::wire::WireWriter`] so a connection can report how much it's
//! shipped without every writer callsite doing its own bookkeeping.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// Shared, cheaply-clonable counter a [`ByteCountWriter`] updates as it
/// writes; clone it before handing the writer away to read the running
/// total from elsewhere (e.g. a connection's logging on close).
#[derive(Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        ByteCounter(Arc::new(AtomicU64::new(0)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Wraps `W`, counting every byte that successfully passes through
/// `poll_write` into a shared [`ByteCounter`].
pub struct ByteCountWriter<W> {
    inner: W,
    counter: ByteCounter,
}

impl<W: AsyncWrite + Unpin> ByteCountWriter<W> {
    pub fn new(inner: W, counter: ByteCounter) -> Self {
        ByteCountWriter { inner, counter }
    }

    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ByteCountWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.counter.add(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn counts_bytes_written() {
        let buf = Vec::new();
        let counter = ByteCounter::new();
        let mut writer = ByteCountWriter::new(buf, counter.clone());
        writer.write_all(b"hello").await.unwrap();
        writer.write_all(b" world").await.unwrap();
        assert_eq!(counter.get(), 11);
    }

    #[tokio::test]
    async fn counter_clone_shares_the_same_total() {
        let buf = Vec::new();
        let counter = ByteCounter::new();
        let mut writer = ByteCountWriter::new(buf, counter.clone());
        writer.write_all(b"abc").await.unwrap();
        let other_handle = writer.counter();
        assert_eq!(other_handle.get(), 3);
    }
}
