// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ServerSession`: the server-side session state machine (spec §3, §4.3).
//!
//! Generalized from `marmikshah-rtsp-rs`'s `Session`/`SessionManager`
//! (`RwLock`-guarded mutable fields, atomic id generation) from its single
//! `PlaybackState` enum to the five-state machine spec §4.3 requires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::server::stream::{ReaderId, ServerStream};

/// Opaque connection identity, a generational index rather than a raw
/// socket handle (SPEC_FULL.md §4.3: "so a closed-then-reused connection
/// slot can't be mistaken for the author").
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The five server session states (spec §4.3).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionState {
    Initial,
    PrePlay,
    PreRecord,
    Play,
    Record,
}

/// Error returned by a state transition attempt (spec §4.3: "unmatched
/// method in a state ⇒ 455 Method Not Valid In This State", plus the more
/// specific 400s the table calls out).
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum TransitionError {
    #[error("method not valid in state {0:?}")]
    MethodNotValidInState(SessionState),
    #[error("can't setup tracks with different paths")]
    MixedPaths,
    #[error("track {0} has already been setup")]
    AlreadySetup(usize),
    #[error("request from non-author connection")]
    NotAuthor,
}

/// Transport chosen for one setup track.
#[derive(Clone, Debug)]
pub enum TrackTransportKind {
    Tcp { channel_rtp: u8, channel_rtcp: u8 },
    UdpUnicast { client_rtp: u16, client_rtcp: u16 },
    UdpMulticast { address: std::net::IpAddr, rtp: u16, rtcp: u16, ttl: u8 },
}

/// One track's setup state within a [`ServerSession`].
#[derive(Clone, Debug)]
pub struct SetupTrack {
    pub media_idx: usize,
    pub transport: TrackTransportKind,
    pub ssrc: Option<u32>,
    pub reader_id: Option<ReaderId>,
}

/// The server-side session state machine itself.
pub struct ServerSession {
    /// Random 4-byte secret id, rendered as decimal per spec §3.
    id: String,
    state: SessionState,
    base_path: Option<String>,
    tracks: Vec<SetupTrack>,
    author: Option<ConnectionId>,
    deadline: Instant,
    timeout: Duration,
    stream: ServerStream,
}

impl ServerSession {
    pub fn new(stream: ServerStream, timeout: Duration) -> Self {
        let mut raw = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut raw);
        let id = u32::from_be_bytes(raw).to_string();
        ServerSession {
            id,
            state: SessionState::Initial,
            base_path: None,
            tracks: Vec::new(),
            author: None,
            deadline: Instant::now() + timeout,
            timeout,
            stream,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stream(&self) -> &ServerStream {
        &self.stream
    }

    pub fn tracks(&self) -> &[SetupTrack] {
        &self.tracks
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Re-arms the idle deadline; called on any request accepted for this
    /// session (keep-alive or otherwise).
    pub fn renew_deadline(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Checks that `conn` may drive a state-changing request on this
    /// session: either it's the first such request (binding `conn` as
    /// author) or it already is the author (spec §4.3, §8: "A connection
    /// linked to session A that sends a request with session id B receives
    /// 400" is enforced one layer up, at the connection; this only enforces
    /// the author check).
    fn check_author(&mut self, conn: ConnectionId) -> Result<(), TransitionError> {
        match self.author {
            None => {
                self.author = Some(conn);
                Ok(())
            }
            Some(a) if a == conn => Ok(()),
            Some(_) => Err(TransitionError::NotAuthor),
        }
    }

    pub fn author(&self) -> Option<ConnectionId> {
        self.author
    }

    /// `ANNOUNCE`: Initial -> PreRecord.
    pub fn announce(&mut self, conn: ConnectionId, path: &str) -> Result<(), TransitionError> {
        if self.state != SessionState::Initial {
            return Err(TransitionError::MethodNotValidInState(self.state));
        }
        self.check_author(conn)?;
        self.base_path = Some(path.to_string());
        self.state = SessionState::PreRecord;
        Ok(())
    }

    /// `SETUP` in play mode: Initial|PrePlay -> PrePlay.
    pub fn setup_play(
        &mut self,
        conn: ConnectionId,
        path: &str,
        media_idx: usize,
        transport: TrackTransportKind,
        ssrc: Option<u32>,
    ) -> Result<(), TransitionError> {
        if !matches!(self.state, SessionState::Initial | SessionState::PrePlay) {
            return Err(TransitionError::MethodNotValidInState(self.state));
        }
        self.check_author(conn)?;
        self.check_path_and_track(path, media_idx)?;
        self.tracks.push(SetupTrack {
            media_idx,
            transport,
            ssrc,
            reader_id: None,
        });
        self.state = SessionState::PrePlay;
        Ok(())
    }

    /// `SETUP` in record mode: PreRecord -> PreRecord.
    pub fn setup_record(
        &mut self,
        conn: ConnectionId,
        path: &str,
        media_idx: usize,
        transport: TrackTransportKind,
        ssrc: Option<u32>,
    ) -> Result<(), TransitionError> {
        if self.state != SessionState::PreRecord {
            return Err(TransitionError::MethodNotValidInState(self.state));
        }
        self.check_author(conn)?;
        self.check_path_and_track(path, media_idx)?;
        self.tracks.push(SetupTrack {
            media_idx,
            transport,
            ssrc,
            reader_id: None,
        });
        Ok(())
    }

    fn check_path_and_track(&mut self, path: &str, media_idx: usize) -> Result<(), TransitionError> {
        match &self.base_path {
            Some(existing) if existing != path => return Err(TransitionError::MixedPaths),
            Some(_) => {}
            None => self.base_path = Some(path.to_string()),
        }
        if self.tracks.iter().any(|t| t.media_idx == media_idx) {
            return Err(TransitionError::AlreadySetup(media_idx));
        }
        Ok(())
    }

    pub fn set_reader_id(&mut self, media_idx: usize, reader_id: ReaderId) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.media_idx == media_idx) {
            t.reader_id = Some(reader_id);
        }
    }

    /// `PLAY`: PrePlay -> Play. Idempotent per spec §8 ("PLAY issued twice
    /// ... does not restart fanout"): calling this while already in Play
    /// succeeds without re-registering readers.
    pub fn play(&mut self, conn: ConnectionId) -> Result<(), TransitionError> {
        if self.state == SessionState::Play {
            self.check_author(conn)?;
            return Ok(());
        }
        if self.state != SessionState::PrePlay {
            return Err(TransitionError::MethodNotValidInState(self.state));
        }
        self.check_author(conn)?;
        for track in &self.tracks {
            if let Some(id) = track.reader_id {
                self.stream.mark_playing(track.media_idx, id);
            }
        }
        self.state = SessionState::Play;
        Ok(())
    }

    /// `RECORD`: PreRecord -> Record.
    pub fn record(&mut self, conn: ConnectionId) -> Result<(), TransitionError> {
        if self.state != SessionState::PreRecord {
            return Err(TransitionError::MethodNotValidInState(self.state));
        }
        self.check_author(conn)?;
        self.state = SessionState::Record;
        Ok(())
    }

    /// `PAUSE`: Play -> PrePlay, or Record -> PreRecord. Idempotent per
    /// spec §8.
    pub fn pause(&mut self, conn: ConnectionId) -> Result<(), TransitionError> {
        match self.state {
            SessionState::Play => {
                self.check_author(conn)?;
                self.state = SessionState::PrePlay;
                Ok(())
            }
            SessionState::Record => {
                self.check_author(conn)?;
                self.state = SessionState::PreRecord;
                Ok(())
            }
            SessionState::PrePlay | SessionState::PreRecord => {
                self.check_author(conn)?;
                Ok(())
            }
            SessionState::Initial => Err(TransitionError::MethodNotValidInState(self.state)),
        }
    }

    /// `TEARDOWN`: any -> terminal. Always succeeds; the caller drops the
    /// session afterward.
    pub fn teardown(&mut self) {
        for track in &self.tracks {
            if let Some(id) = track.reader_id {
                self.stream.remove_reader(track.media_idx, id);
            }
        }
    }

    /// `OPTIONS`/`GET_PARAMETER`: keep-alive, valid in any state, doesn't
    /// change it — spec §4.3's "any | OPTIONS / GET_PARAMETER | unchanged".
    /// A non-author connection may still issue these (spec §4.3: "other
    /// connections may issue GET_PARAMETER/OPTIONS only").
    pub fn keepalive(&mut self) {
        self.renew_deadline();
    }
}

/// Used by connections that have linked to a session but are not its
/// author, to reject state-changing requests with 400 (spec §8: "A
/// connection linked to session A that sends a request with session id B
/// receives 400" generalizes to: any non-author state-changing request is
/// a 400).
pub fn require_author(
    author: Option<ConnectionId>,
    conn: ConnectionId,
) -> Result<(), TransitionError> {
    match author {
        Some(a) if a != conn => Err(TransitionError::NotAuthor),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, Media};
    use std::num::NonZeroU32;

    fn stream() -> ServerStream {
        let fmt = Format::new(96, NonZeroU32::new(90_000).unwrap(), "H264", None, None).unwrap();
        let mut media = Media::new("video", "trackID=0");
        media.add_format(fmt).unwrap();
        ServerStream::new(vec![media])
    }

    fn transport() -> TrackTransportKind {
        TrackTransportKind::Tcp {
            channel_rtp: 0,
            channel_rtcp: 1,
        }
    }

    #[test]
    fn full_play_lifecycle() {
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        let conn = ConnectionId::next();
        session
            .setup_play(conn, "/movie", 0, transport(), None)
            .unwrap();
        assert_eq!(session.state(), SessionState::PrePlay);
        session.play(conn).unwrap();
        assert_eq!(session.state(), SessionState::Play);
        // Idempotent.
        session.play(conn).unwrap();
        assert_eq!(session.state(), SessionState::Play);
        session.pause(conn).unwrap();
        assert_eq!(session.state(), SessionState::PrePlay);
    }

    #[test]
    fn rejects_mixed_paths() {
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        let conn = ConnectionId::next();
        session
            .setup_play(conn, "/movie", 0, transport(), None)
            .unwrap();
        let err = session.setup_play(conn, "/other", 1, transport(), None);
        assert_eq!(err, Err(TransitionError::MixedPaths));
    }

    #[test]
    fn rejects_double_setup_of_same_track() {
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        let conn = ConnectionId::next();
        session
            .setup_play(conn, "/movie", 0, transport(), None)
            .unwrap();
        let err = session.setup_play(conn, "/movie", 0, transport(), None);
        assert_eq!(err, Err(TransitionError::AlreadySetup(0)));
    }

    #[test]
    fn rejects_non_author_state_change() {
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        let author = ConnectionId::next();
        let other = ConnectionId::next();
        session
            .setup_play(author, "/movie", 0, transport(), None)
            .unwrap();
        let err = session.play(other);
        assert_eq!(err, Err(TransitionError::NotAuthor));
    }

    #[test]
    fn rejects_play_before_setup_in_initial_state() {
        let mut session = ServerSession::new(stream(), Duration::from_secs(60));
        let conn = ConnectionId::next();
        let err = session.play(conn);
        assert_eq!(err, Err(TransitionError::MethodNotValidInState(SessionState::Initial)));
    }
}
