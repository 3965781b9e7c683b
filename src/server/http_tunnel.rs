// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP-over-HTTP tunnel adapter (SPEC_FULL.md §6 supplement, feature
//! `http-tunnel`).
//!
//! Some deployments tunnel RTSP through two HTTP connections for firewall
//! traversal: a `GET` that carries the server→client direction
//! base64-encoded in the response body, and a `POST` that carries the
//! client→server direction the same way, the two correlated by an
//! `x-sessioncookie` header. This adapter terminates both HTTP connections
//! and exposes the pair as a single `AsyncRead + AsyncWrite` byte stream so
//! the rest of the server (`crate::server::connection::serve`) is unaware
//! of the difference — no pack file implements this, so the wire format
//! follows the well-known scheme directly.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// One tunneled session's GET/POST correlation, keyed by the
/// `x-sessioncookie` header value both HTTP requests carry.
struct TunnelSession {
    to_client: mpsc::Sender<Vec<u8>>,
    from_client: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Registry matching a POST connection to the GET connection opened
/// earlier for the same cookie.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<TunnelSession>>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the `GET` half arrives; creates the session entry and
    /// returns the `AsyncRead + AsyncWrite` stream to hand to
    /// `server::connection::serve`.
    pub fn open(&self, cookie: String) -> HttpTunnelStream {
        let (to_client_tx, to_client_rx) = mpsc::channel(64);
        let (from_client_tx, from_client_rx) = mpsc::channel(64);
        let session = Arc::new(TunnelSession {
            to_client: to_client_tx,
            from_client: Mutex::new(from_client_rx),
        });
        self.sessions.lock().insert(cookie, session);
        HttpTunnelStream {
            to_client_rx: Mutex::new(to_client_rx),
            from_client_tx,
            read_buf: Mutex::new(Vec::new()),
        }
    }

    /// Called when the `POST` half arrives with a base64 chunk of
    /// client→server bytes; decodes and forwards it to the matching GET's
    /// reader.
    pub async fn post_chunk(&self, cookie: &str, base64_body: &[u8]) -> Result<(), TunnelError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(base64_body)
            .map_err(|_| TunnelError::BadEncoding)?;
        let session = self
            .sessions
            .lock()
            .get(cookie)
            .cloned()
            .ok_or(TunnelError::UnknownCookie)?;
        session
            .to_client
            .send(decoded)
            .await
            .map_err(|_| TunnelError::Closed)?;
        Ok(())
    }

    pub fn close(&self, cookie: &str) {
        self.sessions.lock().remove(cookie);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("unknown tunnel session cookie")]
    UnknownCookie,
    #[error("invalid base64 encoding in POST body")]
    BadEncoding,
    #[error("tunnel session closed")]
    Closed,
}

/// The byte stream `server::connection::serve` reads/writes, backed by the
/// two correlated HTTP connections.
pub struct HttpTunnelStream {
    to_client_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    from_client_tx: mpsc::Sender<Vec<u8>>,
    read_buf: Mutex<Vec<u8>>,
}

impl AsyncRead for HttpTunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut read_buf = self.read_buf.lock();
        if read_buf.is_empty() {
            let mut rx = self.to_client_rx.lock();
            match rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => *read_buf = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = read_buf.len().min(buf.remaining());
        buf.put_slice(&read_buf[..n]);
        read_buf.drain(..n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for HttpTunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.from_client_tx.try_reserve() {
            Ok(permit) => {
                permit.send(buf.to_vec());
                Poll::Ready(Ok(buf.len()))
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tunnel closed")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Base64-encodes one server→client chunk for the `GET` response body, per
/// the tunnel's on-wire scheme.
pub fn encode_chunk(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_chunk_rejects_unknown_cookie() {
        let registry = TunnelRegistry::new();
        let err = registry.post_chunk("nope", b"aGVsbG8=").await.unwrap_err();
        assert!(matches!(err, TunnelError::UnknownCookie));
    }

    #[test]
    fn encode_chunk_round_trips_with_standard_base64() {
        let encoded = encode_chunk(b"hello");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, b"hello");
    }
}
