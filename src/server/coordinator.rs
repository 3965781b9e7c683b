// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator: the single task owning the session registry, the
//! connection set, and (eventually) the multicast allocator (spec §5:
//! "single coordinator task that receives messages on bounded channels;
//! all state-changing operations are serialized through it").
//!
//! The mpsc-actor shape follows
//! `other_examples/…hgaiser-moonshine…rtsp/mod.rs`'s
//! `RtspServerCommand`/`mpsc::channel` pattern, generalized so one command
//! variant (`Apply`) carries an arbitrary session-state-machine transition
//! as a boxed closure rather than enumerating every method by hand.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::server::session::{ConnectionId, ServerSession, SessionState, TransitionError, TrackTransportKind};

/// Error a coordinator command can fail with, beyond the transition itself
/// failing (spec §7 `SessionNotFound` maps to 454 one layer up).
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum CoordinatorError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// A boxed unit of session mutation that delivers its own, already-typed
/// reply: `Apply`'s caller picks the return type `T` it needs (a plain
/// `()` for the session-lifecycle verbs, a richer struct for `SETUP`,
/// which must hand back a freshly-allocated reader id and negotiated
/// transport atomically with the state transition), and this closure
/// captures the matching `oneshot::Sender<Result<T, CoordinatorError>>`
/// internally so `Command::Apply` itself stays generic-free.
type ApplyOp = Box<dyn FnOnce(Result<&mut ServerSession, CoordinatorError>) + Send>;

enum Command {
    Insert {
        conn: ConnectionId,
        session: ServerSession,
    },
    Apply {
        id: String,
        conn: ConnectionId,
        op: ApplyOp,
    },
    Teardown {
        id: String,
        reply: oneshot::Sender<()>,
    },
    ConnectionClosed {
        conn: ConnectionId,
    },
    Tick,
}

/// A cheaply-clonable handle to the running coordinator task.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::Sender<Command>,
}

struct Entry {
    session: ServerSession,
    /// Connections other than the author that have linked to this session
    /// (by issuing a request carrying its id) — tracked so
    /// `ConnectionClosed` only tears down sessions the *author* dropped.
    linked: HashSet<ConnectionId>,
}

struct CoordinatorTask {
    sessions: HashMap<String, Entry>,
    rx: mpsc::Receiver<Command>,
}

impl Coordinator {
    /// Spawns the coordinator task and returns a handle plus a ticker
    /// handle the caller should drive every `check_stream_period` (spec §6)
    /// by sending [`Coordinator::tick`].
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        let mut task = CoordinatorTask {
            sessions: HashMap::new(),
            rx,
        };
        tokio::spawn(async move { task.run().await });
        Coordinator { tx }
    }

    pub async fn insert(&self, conn: ConnectionId, session: ServerSession) {
        let _ = self.tx.send(Command::Insert { conn, session }).await;
    }

    /// Applies `op` to the session named `id`, returning whatever `op`
    /// itself returns, or [`CoordinatorError::SessionNotFound`] if the
    /// session doesn't exist. `conn` is recorded as having touched the
    /// session (so a later connection close knows to check it), but
    /// author enforcement itself lives in `op` (via [`ServerSession`]'s own
    /// `check_author`-backed methods).
    ///
    /// Generic over `T` so a transition that needs to hand back more than
    /// success/failure — `SETUP` needs a freshly-registered reader id and
    /// the negotiated transport, computed from inside the same coordinator
    /// turn that performs the state transition — can do so without a
    /// second round trip through the coordinator.
    pub async fn apply_with<T: Send + 'static>(
        &self,
        id: String,
        conn: ConnectionId,
        op: impl FnOnce(&mut ServerSession) -> Result<T, TransitionError> + Send + 'static,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel::<Result<T, CoordinatorError>>();
        let boxed: ApplyOp = Box::new(move |session| {
            let result = match session {
                Ok(session) => op(session).map_err(CoordinatorError::from),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        });
        let _ = self
            .tx
            .send(Command::Apply {
                id,
                conn,
                op: boxed,
            })
            .await;
        rx.await
            .unwrap_or(Err(CoordinatorError::SessionNotFound(String::new())))
    }

    /// Convenience wrapper over [`Self::apply_with`] for the common case of
    /// a transition that returns nothing beyond success/failure (`PLAY`,
    /// `PAUSE`, `RECORD`, ...).
    pub async fn apply(
        &self,
        id: String,
        conn: ConnectionId,
        op: impl FnOnce(&mut ServerSession) -> Result<(), TransitionError> + Send + 'static,
    ) -> Result<(), CoordinatorError> {
        self.apply_with(id, conn, op).await
    }

    pub async fn teardown(&self, id: String) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Teardown { id, reply }).await;
        let _ = rx.await;
    }

    pub async fn connection_closed(&self, conn: ConnectionId) {
        let _ = self.tx.send(Command::ConnectionClosed { conn }).await;
    }

    pub async fn tick(&self) {
        let _ = self.tx.send(Command::Tick).await;
    }
}

impl CoordinatorTask {
    async fn run(&mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Insert { conn, session } => {
                    let id = session.id().to_string();
                    self.sessions.insert(
                        id,
                        Entry {
                            session,
                            linked: HashSet::from([conn]),
                        },
                    );
                }
                Command::Apply { id, conn, op } => match self.sessions.get_mut(&id) {
                    Some(entry) => {
                        entry.linked.insert(conn);
                        entry.session.renew_deadline();
                        op(Ok(&mut entry.session));
                    }
                    None => op(Err(CoordinatorError::SessionNotFound(id))),
                },
                Command::Teardown { id, reply } => {
                    if let Some(mut entry) = self.sessions.remove(&id) {
                        entry.session.teardown();
                    }
                    let _ = reply.send(());
                }
                Command::ConnectionClosed { conn } => {
                    self.on_connection_closed(conn);
                }
                Command::Tick => {
                    self.sessions.retain(|_, entry| {
                        if entry.session.is_expired() {
                            log::info!(
                                "session {} expired after {:?} idle",
                                entry.session.id(),
                                entry.session.timeout()
                            );
                            entry.session.teardown();
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
    }

    /// Spec §8: closing the author connection while in Play/Record over
    /// TCP-interleaved closes the session immediately (the RTP data itself
    /// went over that connection); over UDP it doesn't, and the session
    /// survives until its idle timeout or an explicit TEARDOWN.
    fn on_connection_closed(&mut self, conn: ConnectionId) {
        let mut to_remove = Vec::new();
        for (id, entry) in self.sessions.iter_mut() {
            if entry.session.author() != Some(conn) {
                entry.linked.remove(&conn);
                continue;
            }
            let is_active = matches!(
                entry.session.state(),
                SessionState::Play | SessionState::Record
            );
            let is_tcp = entry
                .session
                .tracks()
                .iter()
                .any(|t| matches!(t.transport, TrackTransportKind::Tcp { .. }));
            if !is_active || is_tcp {
                to_remove.push(id.clone());
            }
        }
        for id in to_remove {
            if let Some(mut entry) = self.sessions.remove(&id) {
                entry.session.teardown();
            }
        }
    }
}

/// Drives [`Coordinator::tick`] every `period` until the coordinator is
/// dropped (spec §6 `check_stream_period`). Runs as its own task (spec §5:
/// "one each for the RTCP report tickers" covers the sibling timers; this
/// is the session-liveness equivalent).
pub async fn run_liveness_ticker(coordinator: Coordinator, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        coordinator.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, Media};
    use std::num::NonZeroU32;

    fn stream() -> crate::server::stream::ServerStream {
        let fmt = Format::new(96, NonZeroU32::new(90_000).unwrap(), "H264", None, None).unwrap();
        let mut media = Media::new("video", "trackID=0");
        media.add_format(fmt).unwrap();
        crate::server::stream::ServerStream::new(vec![media])
    }

    #[tokio::test]
    async fn apply_against_unknown_session_reports_not_found() {
        let coordinator = Coordinator::spawn();
        let conn = ConnectionId::next();
        let result = coordinator
            .apply("missing".into(), conn, |session| session.play(conn))
            .await;
        assert_eq!(
            result,
            Err(CoordinatorError::SessionNotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn insert_then_apply_transitions_session() {
        let coordinator = Coordinator::spawn();
        let conn = ConnectionId::next();
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        session
            .setup_play(
                conn,
                "/movie",
                0,
                TrackTransportKind::Tcp {
                    channel_rtp: 0,
                    channel_rtcp: 1,
                },
                None,
            )
            .unwrap();
        let id = session.id().to_string();
        coordinator.insert(conn, session).await;

        let result = coordinator
            .apply(id.clone(), conn, move |session| session.play(conn))
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn connection_close_tears_down_tcp_play_session() {
        let coordinator = Coordinator::spawn();
        let conn = ConnectionId::next();
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        session
            .setup_play(
                conn,
                "/movie",
                0,
                TrackTransportKind::Tcp {
                    channel_rtp: 0,
                    channel_rtcp: 1,
                },
                None,
            )
            .unwrap();
        session.play(conn).unwrap();
        let id = session.id().to_string();
        coordinator.insert(conn, session).await;

        coordinator.connection_closed(conn).await;
        // Give the task a chance to process the message.
        tokio::task::yield_now().await;
        let result = coordinator
            .apply(id, conn, move |session| session.pause(conn))
            .await;
        assert!(matches!(result, Err(CoordinatorError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn apply_with_returns_a_computed_value_alongside_the_transition() {
        let coordinator = Coordinator::spawn();
        let conn = ConnectionId::next();
        let session = ServerSession::new(stream(), Duration::from_secs(60));
        let id = session.id().to_string();
        coordinator.insert(conn, session).await;

        let result = coordinator
            .apply_with(id, conn, move |session| {
                session.setup_play(
                    conn,
                    "/movie",
                    0,
                    TrackTransportKind::Tcp {
                        channel_rtp: 0,
                        channel_rtcp: 1,
                    },
                    None,
                )?;
                let (reader_id, _rx) = session.stream().add_reader(0, 4);
                session.set_reader_id(0, reader_id);
                Ok(reader_id)
            })
            .await;
        assert!(result.is_ok());
    }
}
