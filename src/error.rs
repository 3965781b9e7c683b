// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The crate's error type.
//!
//! Errors are cheap to clone (`Arc`-backed) so the same `Error` can be
//! handed to a coordinator message, logged, and returned to a caller
//! without re-allocating.

use std::fmt;
use std::sync::Arc;

use crate::{ConnectionContext, RtspMessageContext};

/// An error produced by this crate.
///
/// Cloning is cheap; `Error` is just a pointer to an [`ErrorInt`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the taxonomy kind from spec §7, for callers that want to
    /// branch on it (e.g. retry UDP→TCP only on [`ErrorKind::UnsupportedTransport`]).
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorInt> for Error {
    fn from(e: ErrorInt) -> Self {
        Error(Arc::new(e))
    }
}

/// The taxonomy from spec §7. Kept separate from [`ErrorInt`] so matching on
/// it doesn't require exposing the (private, detail-heavy) variants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    ProtocolViolation,
    TransportMismatch,
    AuthRequired,
    AuthFailed,
    SessionNotFound,
    UnsupportedTransport,
    Timeout,
    DecodeError,
    Fatal,
}

/// The private, detailed error representation. Never exposed directly;
/// reached only through [`Error`] and its `Display`/`kind` methods.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorInt {
    #[error("[{conn_ctx}] protocol violation: {description}")]
    ProtocolViolation {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{conn_ctx}] {description}")]
    TransportMismatch {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("authentication required: {description}")]
    AuthRequired { description: String },

    #[error("authentication failed: {description}")]
    AuthFailed { description: String },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("transport {requested} not supported: {description}")]
    UnsupportedTransport {
        requested: String,
        description: String,
    },

    #[error("[{conn_ctx}] timeout: {description}")]
    Timeout {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{msg_ctx}] decode error on channel {channel_id:?}: {description}")]
    DecodeError {
        msg_ctx: RtspMessageContext,
        channel_id: Option<u8>,
        description: String,
    },

    #[error("fatal: {description}")]
    Fatal { description: String },

    #[error("[{conn_ctx}] i/o error: {source}")]
    Io {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },
}

impl ErrorInt {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            ErrorInt::TransportMismatch { .. } => ErrorKind::TransportMismatch,
            ErrorInt::AuthRequired { .. } => ErrorKind::AuthRequired,
            ErrorInt::AuthFailed { .. } => ErrorKind::AuthFailed,
            ErrorInt::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            ErrorInt::UnsupportedTransport { .. } => ErrorKind::UnsupportedTransport,
            ErrorInt::Timeout { .. } => ErrorKind::Timeout,
            ErrorInt::DecodeError { .. } => ErrorKind::DecodeError,
            ErrorInt::Fatal { .. } | ErrorInt::Io { .. } => ErrorKind::Fatal,
        }
    }
}

/// Builds an [`Error`] from an [`ErrorInt`] variant, as a terser alternative
/// to `Error::from(ErrorInt::Foo { ... })` at call sites. Named after
/// `retina`'s internal macro of the same purpose.
macro_rules! wrap {
    ($e:expr) => {
        $crate::Error::from($e)
    };
}

/// Returns early with an [`Error`] built from an [`ErrorInt`] variant.
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::error::wrap!($e))
    };
}

pub(crate) use bail;
pub(crate) use wrap;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::SystemTime;

    fn conn_ctx() -> ConnectionContext {
        ConnectionContext {
            local_addr: "127.0.0.1:554".parse::<SocketAddr>().unwrap(),
            peer_addr: "127.0.0.1:5000".parse::<SocketAddr>().unwrap(),
            established: SystemTime::now(),
        }
    }

    #[test]
    fn kind_maps_variants() {
        let e: Error = wrap!(ErrorInt::SessionNotFound {
            session_id: "1234".into()
        });
        assert_eq!(e.kind(), ErrorKind::SessionNotFound);

        let e: Error = wrap!(ErrorInt::ProtocolViolation {
            conn_ctx: conn_ctx(),
            description: "missing CSeq".into(),
        });
        assert_eq!(e.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn error_is_cheap_to_clone() {
        let e: Error = wrap!(ErrorInt::Fatal {
            description: "listener died".into()
        });
        let e2 = e.clone();
        assert_eq!(e.kind(), e2.kind());
    }
}
