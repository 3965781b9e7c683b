// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ClientSession`: the client-side session state machine (spec §4.4),
//! mirroring [`crate::server::session::ServerSession`] plus the
//! auto-negotiation/redirect/auth extras spec §4.4 calls out.
//!
//! Generalized from `retina`'s own client, which this pack's retrieval
//! only surfaced in small fragments (`examples/jlpoolen-retina/src/client/rtp.rs`,
//! `examples/jlpoolen-retina/examples/client/main.rs`); the session
//! sequencing itself (`join_control`/`parse_describe`/`parse_setup`/
//! `parse_play`, one TCP connection driving DESCRIBE → SETUP* → PLAY) is
//! grounded directly on
//! `other_examples/…scottlamb-moonfire-playground…client-parse.rs`, the
//! prototype this crate's client descends from.

pub mod parse;

use std::time::Duration;

use bytes::Bytes;
use rtsp_types::{headers, Method, Request, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::client::parse::{parse_describe, parse_play, parse_setup, render_sdp, Presentation};
use crate::error::{bail, wrap, ErrorInt};
use crate::format::Media;
use crate::rtsp_url::RtspUrl;
use crate::wire::{CSeqGenerator, InterleavedFrame, WireItem, WireReader, WireWriter};
use crate::{ConnectionContext, Credentials, Error};

/// The five client session states, mirroring
/// [`crate::server::session::SessionState`] (spec §4.4: "mirrors §4.3").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ClientSessionState {
    Initial,
    PrePlay,
    PreRecord,
    Play,
    Record,
}

/// How a track's transport was negotiated (spec §4.4's auto-negotiation).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NegotiatedTransport {
    Tcp { channel_rtp: u8, channel_rtcp: u8 },
    UdpUnicast { server_rtp: u16, server_rtcp: u16 },
}

/// Options governing a [`ClientSession`]'s connection/retry behavior (spec
/// §4.4, §6's client-side counterparts to `ServerOptions`).
#[derive(Clone)]
pub struct ClientSessionOptions {
    /// If `false`, SETUP always requests TCP interleaved and auto-negotiation
    /// is skipped.
    pub prefer_udp: bool,
    /// How long to wait for the first RTP/RTCP packet after a UDP SETUP+PLAY
    /// before falling back to TCP (spec §4.4).
    pub initial_udp_read_timeout: Duration,
    /// Maximum number of 301 redirects to follow during DESCRIBE before
    /// giving up (spec §4.4: "A redirect count cap prevents loops").
    pub max_redirects: u32,
    /// If `true` (default), an RTP stream whose `RTP-Info` carries no `seq`
    /// is accepted without gap-tracking from a known starting point;
    /// matches `retina`'s `PlayPolicy::ignore_zero_seq`.
    pub ignore_zero_seq: bool,
    pub credentials: Option<Credentials>,
}

impl Default for ClientSessionOptions {
    fn default() -> Self {
        ClientSessionOptions {
            prefer_udp: true,
            initial_udp_read_timeout: Duration::from_secs(5),
            max_redirects: 5,
            ignore_zero_seq: false,
            credentials: None,
        }
    }
}

/// Digest nonce state retained across requests on one connection (spec
/// §4.4: "Reuse the nonce across subsequent requests on the same
/// connection until the server rejects it").
struct AuthState {
    realm: String,
    nonce: String,
}

/// One RTSP client session: a single control connection plus the
/// DESCRIBE/SETUP/PLAY/TEARDOWN sequence driven over it.
pub struct ClientSession<S> {
    conn: S,
    conn_ctx: ConnectionContext,
    cseq: CSeqGenerator,
    options: ClientSessionOptions,
    state: ClientSessionState,
    session_id: Option<String>,
    auth: Option<AuthState>,
    redirects_followed: u32,
}

/// One media this session has set up, paired with its negotiated
/// transport and RTP-Info-derived starting state.
pub struct SetupMedia {
    pub media: Media,
    pub transport: NegotiatedTransport,
    pub ssrc: Option<u32>,
    pub initial_seq: Option<u16>,
    pub initial_rtptime: Option<u32>,
}

impl ClientSession<TcpStream> {
    /// Connects to `url`'s host:port and returns a session ready for
    /// [`Self::describe`].
    pub async fn connect(url: &RtspUrl, options: ClientSessionOptions) -> Result<Self, Error> {
        let port = url.as_url().port().unwrap_or(554);
        let addr = format!("{}:{port}", url.host());
        let conn = TcpStream::connect(&addr).await.map_err(|source| {
            wrap!(ErrorInt::Io {
                conn_ctx: ConnectionContext {
                    local_addr: "0.0.0.0:0".parse().unwrap(),
                    peer_addr: "0.0.0.0:0".parse().unwrap(),
                    established: std::time::SystemTime::now(),
                },
                source,
            })
        })?;
        let local_addr = conn.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let peer_addr = conn.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let conn_ctx = ConnectionContext {
            local_addr,
            peer_addr,
            established: std::time::SystemTime::now(),
        };
        Ok(ClientSession::new(conn, conn_ctx, options))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    pub fn new(conn: S, conn_ctx: ConnectionContext, options: ClientSessionOptions) -> Self {
        ClientSession {
            conn,
            conn_ctx,
            cseq: CSeqGenerator::new(),
            options,
            state: ClientSessionState::Initial,
            session_id: None,
            auth: None,
            redirects_followed: 0,
        }
    }

    pub fn state(&self) -> ClientSessionState {
        self.state
    }

    /// Sends one request and reads back the matching response, retrying
    /// once with a computed `Authorization` header if the server challenges
    /// with 401 (spec §4.4's authentication extra). If a prior request on
    /// this connection already established a nonce, it's attached
    /// preemptively ("reuse the nonce ... until the server rejects it");
    /// a fresh 401 always triggers a recompute against the new challenge.
    /// Non-response `WireItem`s (stray interleaved frames before PLAY) are
    /// discarded.
    async fn roundtrip(
        &mut self,
        method: Method,
        uri: &str,
        extra_headers: &[(headers::HeaderName, String)],
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        self.roundtrip_with_body(method, uri, extra_headers, Bytes::new())
            .await
    }

    /// As [`Self::roundtrip`], but with a request body (spec §4.4's
    /// record-mode `ANNOUNCE` is the only caller that needs one).
    async fn roundtrip_with_body(
        &mut self,
        method: Method,
        uri: &str,
        extra_headers: &[(headers::HeaderName, String)],
        body: Bytes,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let mut headers_to_send = extra_headers.to_vec();
        if let (Some(auth), Some(creds)) = (&self.auth, &self.options.credentials) {
            headers_to_send.push((
                headers::AUTHORIZATION,
                self.build_authorization(creds, &auth.realm, &auth.nonce, method, uri),
            ));
        }
        let response = self
            .send_and_read(method, uri, &headers_to_send, body.clone())
            .await?;
        if response.status() != rtsp_types::StatusCode::Unauthorized {
            return Ok(response);
        }
        let Some(creds) = self.options.credentials.clone() else {
            bail!(ErrorInt::AuthRequired {
                description: format!("{uri} requires authentication and no credentials were configured"),
            });
        };
        let challenge = response
            .header(&headers::WWW_AUTHENTICATE)
            .ok_or_else(|| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx: self.conn_ctx,
                    description: "401 response has no WWW-Authenticate header".into(),
                })
            })?;
        let prompt = digest_auth::parse(challenge.as_str()).map_err(|e| {
            wrap!(ErrorInt::AuthFailed {
                description: format!("unparsable WWW-Authenticate header: {e}"),
            })
        })?;
        let realm = prompt.realm.clone();
        let nonce = prompt.nonce.clone();
        let auth_header = self.build_authorization(&creds, &realm, &nonce, method, uri);
        self.auth = Some(AuthState { realm, nonce });

        let mut headers_with_auth = extra_headers.to_vec();
        headers_with_auth.push((headers::AUTHORIZATION, auth_header));
        let retried = self
            .send_and_read(method, uri, &headers_with_auth, body)
            .await?;
        if retried.status() == rtsp_types::StatusCode::Unauthorized {
            bail!(ErrorInt::AuthFailed {
                description: format!("{uri} rejected digest response"),
            });
        }
        Ok(retried)
    }

    /// Builds a `Digest` `Authorization` header value per spec §4.4's
    /// literal formula, shared with the server-side verifier in
    /// `server::digest` so both sides agree on HA1/HA2/response.
    fn build_authorization(
        &self,
        creds: &Credentials,
        realm: &str,
        nonce: &str,
        method: Method,
        uri: &str,
    ) -> String {
        let h1 = crate::server::digest::ha1(creds, realm);
        let h2 = crate::server::digest::ha2(method_name(method), uri);
        let response = crate::server::digest::expected_response(&h1, nonce, &h2);
        format!(
            "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\"",
            creds.username,
        )
    }

    async fn send_and_read(
        &mut self,
        method: Method,
        uri: &str,
        extra_headers: &[(headers::HeaderName, String)],
        body: Bytes,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let cseq = self.cseq.next();
        let request_uri = url::Url::parse(uri).map_err(|_| {
            wrap!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("invalid request-uri {uri:?}"),
            })
        })?;
        let mut builder = Request::builder(method, Version::V1_0)
            .request_uri(request_uri)
            .header(headers::CSEQ, cseq.to_string());
        if let Some(id) = &self.session_id {
            builder = builder.header(headers::SESSION, id.clone());
        }
        for (name, value) in extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        let request = builder.build(body);

        let mut writer = WireWriter::new(&mut self.conn);
        writer.write_message(&request).await.map_err(|source| {
            wrap!(ErrorInt::Io {
                conn_ctx: self.conn_ctx,
                source,
            })
        })?;
        writer.flush().await.map_err(|source| {
            wrap!(ErrorInt::Io {
                conn_ctx: self.conn_ctx,
                source,
            })
        })?;

        let mut reader = WireReader::new(&mut self.conn, self.conn_ctx);
        loop {
            match reader.read_item().await? {
                WireItem::Message(rtsp_types::Message::Response(response)) => {
                    let got_cseq = parse::get_cseq(&response);
                    if got_cseq != Some(cseq) {
                        bail!(ErrorInt::ProtocolViolation {
                            conn_ctx: self.conn_ctx,
                            description: format!(
                                "expected response to CSeq={cseq}, got {got_cseq:?}"
                            ),
                        });
                    }
                    return Ok(response);
                }
                WireItem::Message(rtsp_types::Message::Request(_)) => {
                    log::debug!("[{}] ignoring stray request on control connection", self.conn_ctx);
                }
                WireItem::Frame(_) => {
                    log::debug!("[{}] ignoring stray interleaved frame before PLAY", self.conn_ctx);
                }
            }
        }
    }

    /// `DESCRIBE`. On a 301 redirect, the caller must re-[`Self::connect`]
    /// to the new URL and call `describe` again; this method only reports
    /// the redirect (spec §4.4: "re-dial the new URL and restart the
    /// sequence"), since re-dialing changes the connection type `S`.
    pub async fn describe(&mut self, url: &RtspUrl) -> Result<Presentation, Error> {
        let response = self
            .roundtrip(Method::Describe, url.as_url().as_str(), &[(
                headers::ACCEPT,
                "application/sdp".to_string(),
            )])
            .await?;

        if response.status() == rtsp_types::StatusCode::MovedPermanently {
            if self.redirects_followed >= self.options.max_redirects {
                bail!(ErrorInt::ProtocolViolation {
                    conn_ctx: self.conn_ctx,
                    description: "exceeded maximum redirect count".into(),
                });
            }
            self.redirects_followed += 1;
            let location = response.header(&headers::LOCATION).ok_or_else(|| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx: self.conn_ctx,
                    description: "301 response has no Location header".into(),
                })
            })?;
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("redirected to {location}; re-dial and retry"),
            });
        }
        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("DESCRIBE failed with {:?}", response.status()),
            });
        }
        parse_describe(self.conn_ctx, url.clone(), &response)
    }

    /// `ANNOUNCE`, the record-mode counterpart to [`Self::describe`] (spec
    /// §4.4: "Mirror of `ServerSession`", which accepts ANNOUNCE from
    /// `Initial`). Sends `medias` as an SDP body and moves
    /// `Initial` -> `PreRecord`, mirroring the server's own
    /// `Initial --ANNOUNCE--> PreRecord` row.
    pub async fn announce(
        &mut self,
        url: &RtspUrl,
        session_name: &str,
        medias: &[Media],
    ) -> Result<(), Error> {
        if self.state != ClientSessionState::Initial {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: "ANNOUNCE issued outside the Initial state".into(),
            });
        }
        let body = Bytes::from(render_sdp(session_name, medias));
        let response = self
            .roundtrip_with_body(
                Method::Announce,
                url.as_url().as_str(),
                &[(headers::CONTENT_TYPE, "application/sdp".to_string())],
                body,
            )
            .await?;
        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("ANNOUNCE failed with {:?}", response.status()),
            });
        }
        if let Some(session) = response.header(&headers::SESSION) {
            let id = match session.as_str().find(';') {
                None => session.as_str(),
                Some(i) => &session.as_str()[..i],
            };
            self.session_id = Some(id.to_string());
        }
        self.state = ClientSessionState::PreRecord;
        Ok(())
    }

    /// `SETUP` for one media, with UDP→TCP auto-negotiation on a 461
    /// response (spec §4.4). Interleaved channels are chosen as
    /// `2 * media_idx` / `2 * media_idx + 1` when falling back to TCP.
    /// Valid from `Initial`/`PrePlay` (play mode, spec §4.3's
    /// `Initial, PrePlay | SETUP(play mode) | PrePlay` row) or from
    /// `PreRecord` (record mode, `PreRecord | SETUP(record mode) |
    /// PreRecord`).
    pub async fn setup(
        &mut self,
        base_url: &RtspUrl,
        media_idx: usize,
        media: &Media,
    ) -> Result<SetupMedia, Error> {
        if !matches!(
            self.state,
            ClientSessionState::Initial | ClientSessionState::PrePlay | ClientSessionState::PreRecord
        ) {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: "SETUP issued after PLAY/RECORD".into(),
            });
        }
        let track_url = base_url.resolve_media_control(&media.control).map_err(|e| {
            wrap!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("unresolvable control attribute: {e}"),
            })
        })?;

        let try_udp = self.options.prefer_udp;
        let transport_header = if try_udp {
            let client_rtp = 10_000u16 + 2 * media_idx as u16;
            format!(
                "RTP/AVP/UDP;unicast;client_port={client_rtp}-{}",
                client_rtp + 1
            )
        } else {
            let channel_rtp = 2 * media_idx as u8;
            format!("RTP/AVP/TCP;unicast;interleaved={channel_rtp}-{}", channel_rtp + 1)
        };

        let mut response = self
            .roundtrip(
                Method::Setup,
                track_url.as_url().as_str(),
                &[(headers::TRANSPORT, transport_header)],
            )
            .await?;

        // Spec §4.4: UDP SETUP returning 461 retries the SAME setup over
        // TCP interleaved, once.
        if try_udp && response.status() == rtsp_types::StatusCode::UnsupportedTransport {
            let channel_rtp = 2 * media_idx as u8;
            response = self
                .roundtrip(
                    Method::Setup,
                    track_url.as_url().as_str(),
                    &[(
                        headers::TRANSPORT,
                        format!("RTP/AVP/TCP;unicast;interleaved={channel_rtp}-{}", channel_rtp + 1),
                    )],
                )
                .await?;
        }

        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::UnsupportedTransport {
                requested: "RTP/AVP".into(),
                description: format!("SETUP failed with {:?}", response.status()),
            });
        }

        let setup = parse_setup(self.conn_ctx, &response)?;
        if self.session_id.is_none() {
            self.session_id = Some(setup.session_id);
        }
        let transport = match setup.channel_id {
            Some(channel_rtp) => NegotiatedTransport::Tcp {
                channel_rtp,
                channel_rtcp: channel_rtp + 1,
            },
            None => {
                let client_rtp = 10_000u16 + 2 * media_idx as u16;
                NegotiatedTransport::UdpUnicast {
                    server_rtp: client_rtp,
                    server_rtcp: client_rtp + 1,
                }
            }
        };

        self.state = match self.state {
            ClientSessionState::PreRecord => ClientSessionState::PreRecord,
            _ => ClientSessionState::PrePlay,
        };
        Ok(SetupMedia {
            media: media.clone(),
            transport,
            ssrc: setup.ssrc,
            initial_seq: None,
            initial_rtptime: None,
        })
    }

    /// `PLAY`, filling in each setup media's `initial_seq`/`initial_rtptime`
    /// from the `RTP-Info` header (spec §6).
    pub async fn play(
        &mut self,
        base_url: &RtspUrl,
        medias: &[Media],
        setup: &mut [SetupMedia],
    ) -> Result<(), Error> {
        if self.state != ClientSessionState::PrePlay {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: "PLAY issued before any SETUP".into(),
            });
        }
        let response = self
            .roundtrip(Method::Play, base_url.as_url().as_str(), &[])
            .await?;
        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("PLAY failed with {:?}", response.status()),
            });
        }
        let entries = parse_play(self.conn_ctx, base_url, medias, &response)?;
        for (media_idx, info) in entries {
            if let Some(s) = setup.get_mut(media_idx) {
                s.initial_seq = info.initial_seq;
                s.initial_rtptime = info.initial_rtptime;
                if info.ssrc.is_some() {
                    s.ssrc = info.ssrc;
                }
            }
        }
        self.state = ClientSessionState::Play;
        Ok(())
    }

    /// `RECORD`, the record-mode counterpart to [`Self::play`] (spec §4.3's
    /// `PreRecord | RECORD | Record` row).
    pub async fn record(&mut self, base_url: &RtspUrl) -> Result<(), Error> {
        if self.state != ClientSessionState::PreRecord {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: "RECORD issued before any SETUP(record mode)".into(),
            });
        }
        let response = self
            .roundtrip(Method::Record, base_url.as_url().as_str(), &[])
            .await?;
        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("RECORD failed with {:?}", response.status()),
            });
        }
        self.state = ClientSessionState::Record;
        Ok(())
    }

    /// `PAUSE`. Valid from `Play` (-> `PrePlay`) or `Record` (-> `PreRecord`),
    /// per spec §4.3's two `PAUSE` rows; the session survives.
    pub async fn pause(&mut self, base_url: &RtspUrl) -> Result<(), Error> {
        let next = match self.state {
            ClientSessionState::Play => ClientSessionState::PrePlay,
            ClientSessionState::Record => ClientSessionState::PreRecord,
            _ => bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: "PAUSE issued outside Play/Record".into(),
            }),
        };
        let response = self
            .roundtrip(Method::Pause, base_url.as_url().as_str(), &[])
            .await?;
        if response.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::ProtocolViolation {
                conn_ctx: self.conn_ctx,
                description: format!("PAUSE failed with {:?}", response.status()),
            });
        }
        self.state = next;
        Ok(())
    }

    /// `TEARDOWN`. Always attempted even on a prior error path; the
    /// connection is left for the caller to drop.
    pub async fn teardown(&mut self, base_url: &RtspUrl) -> Result<(), Error> {
        let _ = self
            .roundtrip(Method::Teardown, base_url.as_url().as_str(), &[])
            .await?;
        self.state = ClientSessionState::Initial;
        Ok(())
    }

    /// Reads the next interleaved RTP/RTCP frame on the control connection
    /// (only meaningful for TCP-transported tracks after PLAY).
    pub async fn read_frame(&mut self) -> Result<InterleavedFrame, Error> {
        let mut reader = WireReader::new(&mut self.conn, self.conn_ctx);
        match reader.read_item().await? {
            WireItem::Frame(f) => Ok(f),
            WireItem::Message(_) => {
                bail!(ErrorInt::ProtocolViolation {
                    conn_ctx: self.conn_ctx,
                    description: "expected interleaved frame, got RTSP message".into(),
                })
            }
        }
    }
}

/// Renders a [`Method`] the way it appears on the wire, for HA2's
/// `method:uri` (spec §4.4); `rtsp_types::Method` doesn't implement
/// `Display` in request-line form.
fn method_name(method: Method) -> &'static str {
    match method {
        Method::Describe => "DESCRIBE",
        Method::Announce => "ANNOUNCE",
        Method::Setup => "SETUP",
        Method::Play => "PLAY",
        Method::Pause => "PAUSE",
        Method::Record => "RECORD",
        Method::Teardown => "TEARDOWN",
        Method::Options => "OPTIONS",
        Method::GetParameter => "GET_PARAMETER",
        Method::SetParameter => "SET_PARAMETER",
        _ => "OPTIONS",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::SystemTime;
    use tokio::io::{duplex, AsyncWriteExt};

    fn conn_ctx() -> ConnectionContext {
        ConnectionContext {
            local_addr: "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
            peer_addr: "127.0.0.1:554".parse::<SocketAddr>().unwrap(),
            established: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn describe_parses_sdp_and_tracks_session_state() {
        let (mut server, client) = duplex(8192);
        let mut session = ClientSession::new(client, conn_ctx(), ClientSessionOptions::default());

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
            assert!(n > 0);
            let body = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=0\r\n";
            let response = format!(
                "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Base: rtsp://example.com/cam/\r\n\
Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            server.write_all(response.as_bytes()).await.unwrap();
            server.write_all(body).await.unwrap();
        });

        let url = RtspUrl::parse("rtsp://example.com/cam").unwrap();
        let presentation = session.describe(&url).await.unwrap();
        responder.await.unwrap();

        assert_eq!(presentation.medias.len(), 1);
        assert_eq!(presentation.medias[0].media_type, "video");
        assert_eq!(session.state(), ClientSessionState::Initial);
    }

    #[tokio::test]
    async fn announce_setup_record_pause_drive_the_record_mode_states() {
        let (mut server, client) = duplex(8192);
        let mut session = ClientSession::new(client, conn_ctx(), ClientSessionOptions::default());

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];

            // ANNOUNCE
            let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
            assert!(n > 0);
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("ANNOUNCE"));
            server
                .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nSession: deadbeef\r\n\r\n")
                .await
                .unwrap();

            // SETUP
            let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
            assert!(n > 0);
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("SETUP"));
            server
                .write_all(
                    b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: deadbeef\r\n\
Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
                )
                .await
                .unwrap();

            // RECORD
            let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
            assert!(n > 0);
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("RECORD"));
            server
                .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: deadbeef\r\n\r\n")
                .await
                .unwrap();

            // PAUSE
            let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
            assert!(n > 0);
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("PAUSE"));
            server
                .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 4\r\nSession: deadbeef\r\n\r\n")
                .await
                .unwrap();
        });

        let url = RtspUrl::parse("rtsp://example.com/cam").unwrap();
        let fmt = crate::format::Format::new(
            96,
            std::num::NonZeroU32::new(90_000).unwrap(),
            "H264",
            None,
            None,
        )
        .unwrap();
        let mut media = Media::new("video", "trackID=0");
        media.add_format(fmt).unwrap();

        session.announce(&url, "my session", &[media.clone()]).await.unwrap();
        assert_eq!(session.state(), ClientSessionState::PreRecord);

        let mut setup = vec![session.setup(&url, 0, &media).await.unwrap()];
        assert_eq!(session.state(), ClientSessionState::PreRecord);

        session.record(&url).await.unwrap();
        assert_eq!(session.state(), ClientSessionState::Record);

        session.pause(&url).await.unwrap();
        assert_eq!(session.state(), ClientSessionState::PreRecord);

        drop(setup.pop());
        responder.await.unwrap();
    }
}
