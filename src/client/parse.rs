// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parses `DESCRIBE`/`SETUP`/`PLAY` responses into this crate's data
//! model. Closely grounded on
//! `other_examples/…scottlamb-moonfire-playground…client-parse.rs`: same
//! function names and the same RTP-Info/Transport parsing approach,
//! translated from that prototype's `failure`-based errors to this crate's
//! `thiserror`-based [`crate::Error`].

use std::num::NonZeroU32;

use bytes::{Buf, Bytes};
use sdp::media_description::MediaDescription;
use sdp::session_description::SessionDescription;

use crate::error::{bail, wrap, ErrorInt};
use crate::format::{Format, Media};
use crate::rtsp_url::RtspUrl;
use crate::{ConnectionContext, Error};

/// Returns the `CSeq` from an RTSP response, or `None` if missing/unparseable
/// (callers treat a missing CSeq as a protocol violation themselves, since
/// the expected value differs by call site).
pub fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|v| v.as_str().parse().ok())
}

/// Splits on the first occurrence of `delimiter`, mirroring `str::split_once`
/// (kept as a free function, as in the grounding source, for the RTP-Info
/// and Transport mini-grammars below).
fn split_once(s: &str, delimiter: char) -> Option<(&str, &str)> {
    s.find(delimiter).map(|p| (&s[..p], &s[p + 1..]))
}

pub(crate) fn parse_media(base_url: &RtspUrl, md: &MediaDescription) -> Result<Media, String> {
    if !md.media_name.protos.iter().any(|p| p == "RTP") {
        return Err("expected RTP-based proto".into());
    }
    let payload_type_str = md
        .media_name
        .formats
        .first()
        .ok_or("missing RTP payload type")?;
    let payload_type: u8 = payload_type_str
        .parse()
        .map_err(|_| "invalid RTP payload type".to_string())?;

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &md.attributes {
        match a.key.as_str() {
            "rtpmap" => {
                let v = a.value.as_ref().ok_or("rtpmap attribute with no value")?;
                let (pt, v) = split_once(v, ' ').ok_or("invalid rtpmap attribute")?;
                if pt == payload_type_str {
                    rtpmap = Some(v.to_string());
                }
            }
            "fmtp" => {
                let v = a.value.as_ref().ok_or("fmtp attribute with no value")?;
                let (pt, v) = split_once(v, ' ').ok_or("invalid fmtp attribute")?;
                if pt == payload_type_str {
                    fmtp = Some(v.to_string());
                }
            }
            "control" => {
                control = a.value.clone();
            }
            _ => {}
        }
    }
    // Absolute/relative/star resolution happens once at the session level
    // against `base_url`; here we only keep the raw control attribute, per
    // spec §3's `Media::control` (resolved lazily by callers via
    // `RtspUrl::resolve_media_control`).
    let _ = base_url;
    let control = control.unwrap_or_default();

    let rtpmap = rtpmap.ok_or("expected rtpmap for primary payload type")?;
    let (encoding_name, rest) = split_once(&rtpmap, '/').ok_or("invalid rtpmap attribute")?;
    let (clock_rate_str, channels_str) = match rest.find('/') {
        None => (rest, None),
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
    };
    let clock_rate: u32 = clock_rate_str
        .parse()
        .map_err(|_| "bad clock rate in rtpmap".to_string())?;
    let clock_rate = NonZeroU32::new(clock_rate).ok_or("clock rate must be nonzero")?;
    let channels = channels_str
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(std::num::NonZeroU16::new);

    let format = Format::new(payload_type, clock_rate, encoding_name, channels, fmtp)?;
    let mut media = Media::new(md.media_name.media.clone(), control);
    media.add_format(format)?;
    Ok(media)
}

/// Renders `medias` as a minimal SDP body suitable for an `ANNOUNCE`
/// request body (spec §4.4's "Mirror of `ServerSession`" extends to the
/// record-mode path, which needs a session description to announce).
/// No pack file demonstrates the `sdp` crate's write side, so this is a
/// direct, hand-built rendering of the same `v=`/`o=`/`s=`/`t=`/`m=`/
/// `a=rtpmap`/`a=control` lines [`parse_media`] above already knows how to
/// read back.
pub fn render_sdp(session_name: &str, medias: &[Media]) -> String {
    let mut out = format!("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns={session_name}\r\nt=0 0\r\n");
    for media in medias {
        let formats = media.formats();
        let Some(primary) = formats.first() else {
            continue;
        };
        out.push_str(&format!(
            "m={} 0 RTP/AVP {}\r\n",
            media.media_type,
            primary.payload_type()
        ));
        for format in formats {
            let mut rtpmap = format!(
                "a=rtpmap:{} {}/{}",
                format.payload_type(),
                format.encoding_name(),
                format.clock_rate()
            );
            if let Some(channels) = format.channels() {
                rtpmap.push_str(&format!("/{channels}"));
            }
            out.push_str(&rtpmap);
            out.push_str("\r\n");
            if let Some(fmtp) = format.raw_format_specific_params() {
                out.push_str(&format!(
                    "a=fmtp:{} {fmtp}\r\n",
                    format.payload_type()
                ));
            }
        }
        if !media.control.is_empty() {
            out.push_str(&format!("a=control:{}\r\n", media.control));
        }
    }
    out
}

/// A parsed `DESCRIBE` response: the session's medias plus the base URL
/// every media's control attribute resolves against.
pub struct Presentation {
    pub base_url: RtspUrl,
    pub medias: Vec<Media>,
}

/// Parses a successful `DESCRIBE` response (spec §6: "The core consumes a
/// parsed session description"; SDP parsing itself is `sdp`'s job).
pub fn parse_describe(
    conn_ctx: ConnectionContext,
    request_url: RtspUrl,
    response: &rtsp_types::Response<Bytes>,
) -> Result<Presentation, Error> {
    let content_type = response.header(&rtsp_types::headers::CONTENT_TYPE);
    if !matches!(content_type, Some(v) if v.as_str() == "application/sdp") {
        bail!(ErrorInt::ProtocolViolation {
            conn_ctx,
            description: "DESCRIBE response not of expected application/sdp content type".into(),
        });
    }

    let mut cursor = std::io::Cursor::new(&response.body()[..]);
    let sdp = SessionDescription::unmarshal(&mut cursor).map_err(|e| {
        wrap!(ErrorInt::ProtocolViolation {
            conn_ctx,
            description: format!("unparsable SDP body: {e}"),
        })
    })?;
    if cursor.has_remaining() {
        bail!(ErrorInt::ProtocolViolation {
            conn_ctx,
            description: "garbage after SDP body".into(),
        });
    }

    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .or_else(|| response.header(&rtsp_types::headers::CONTENT_LOCATION))
        .map(|v| RtspUrl::parse(v.as_str()))
        .transpose()
        .map_err(|e| {
            wrap!(ErrorInt::ProtocolViolation {
                conn_ctx,
                description: format!("invalid Content-Base/-Location: {e}"),
            })
        })?
        .unwrap_or(request_url);

    let medias = sdp
        .media_descriptions
        .iter()
        .enumerate()
        .map(|(i, md)| {
            parse_media(&base_url, md).map_err(|e| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx,
                    description: format!("unable to parse media {i}: {e}"),
                })
            })
        })
        .collect::<Result<Vec<Media>, Error>>()?;

    Ok(Presentation { base_url, medias })
}

/// A parsed `SETUP` response.
pub struct SetupResponse {
    pub session_id: String,
    pub ssrc: Option<u32>,
    pub channel_id: Option<u8>,
}

/// Parses a `SETUP` response (spec §4.3: "SETUP response must echo the
/// Transport line with server_port / interleaved / destination filled
/// in").
pub fn parse_setup(
    conn_ctx: ConnectionContext,
    response: &rtsp_types::Response<Bytes>,
) -> Result<SetupResponse, Error> {
    let session = response.header(&rtsp_types::headers::SESSION).ok_or_else(|| {
        wrap!(ErrorInt::ProtocolViolation {
            conn_ctx,
            description: "SETUP response has no Session header".into(),
        })
    })?;
    let session_id = match session.as_str().find(';') {
        None => session.as_str(),
        Some(i) => &session.as_str()[..i],
    }
    .to_string();

    let transport = response.header(&rtsp_types::headers::TRANSPORT).ok_or_else(|| {
        wrap!(ErrorInt::ProtocolViolation {
            conn_ctx,
            description: "SETUP response has no Transport header".into(),
        })
    })?;

    let mut channel_id = None;
    let mut ssrc = None;
    for part in transport.as_str().split(';') {
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx,
                    description: format!("unparsable ssrc {v:?}"),
                })
            })?);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n: u8 = channels
                .next()
                .unwrap()
                .parse()
                .map_err(|_| wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx,
                    description: "bad interleaved channel number".into(),
                }))?;
            if let Some(m) = channels.next() {
                let m: u8 = m.parse().map_err(|_| {
                    wrap!(ErrorInt::ProtocolViolation {
                        conn_ctx,
                        description: "bad second interleaved channel number".into(),
                    })
                })?;
                if n.checked_add(1) != Some(m) {
                    bail!(ErrorInt::TransportMismatch {
                        conn_ctx,
                        description: format!("expected adjacent channels; got {n}-{m}"),
                    });
                }
            }
            channel_id = Some(n);
        }
    }
    Ok(SetupResponse {
        session_id,
        ssrc,
        channel_id,
    })
}

/// One track's initial RTP-Info state, as filled in by [`parse_play`].
#[derive(Copy, Clone, Default, Debug)]
pub struct RtpInfoEntry {
    pub initial_seq: Option<u16>,
    pub initial_rtptime: Option<u32>,
    pub ssrc: Option<u32>,
}

/// Parses the `RTP-Info` header of a `PLAY` response (spec §6: "Comma-
/// separated list of `url=<track-url>;seq=<n>;rtptime=<n>`"), matching
/// each entry's URL against `medias` by resolving each media's control
/// attribute against `base_url`.
pub fn parse_play(
    conn_ctx: ConnectionContext,
    base_url: &RtspUrl,
    medias: &[Media],
    response: &rtsp_types::Response<Bytes>,
) -> Result<Vec<(usize, RtpInfoEntry)>, Error> {
    let Some(rtp_info) = response.header(&rtsp_types::headers::RTP_INFO) else {
        // Entries are present only for tracks the server has seen RTP for
        // (spec §6); an empty/absent header on the very first PLAY is not
        // an error.
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for entry in rtp_info.as_str().split(',') {
        let entry = entry.trim();
        let mut parts = entry.split(';');
        let url = parts
            .next()
            .and_then(|p| p.strip_prefix("url="))
            .ok_or_else(|| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx,
                    description: "RTP-Info entry missing url=".into(),
                })
            })?;

        let media_idx = medias.iter().position(|m| {
            base_url
                .resolve_media_control(&m.control)
                .map(|resolved| resolved.as_url().as_str() == url)
                .unwrap_or(false)
        });
        let Some(media_idx) = media_idx else {
            log::debug!("[{conn_ctx}] RTP-Info entry for unknown track {url}, ignoring");
            continue;
        };

        let mut info = RtpInfoEntry::default();
        for part in parts {
            let (key, value) = split_once(part, '=').ok_or_else(|| {
                wrap!(ErrorInt::ProtocolViolation {
                    conn_ctx,
                    description: "RTP-Info param has no '='".into(),
                })
            })?;
            match key {
                "seq" => info.initial_seq = value.parse().ok(),
                "rtptime" => info.initial_rtptime = value.parse().ok(),
                "ssrc" => info.ssrc = u32::from_str_radix(value, 16).ok(),
                _ => {}
            }
        }
        out.push((media_idx, info));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::SystemTime;

    fn conn_ctx() -> ConnectionContext {
        ConnectionContext {
            local_addr: "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
            peer_addr: "127.0.0.1:554".parse::<SocketAddr>().unwrap(),
            established: SystemTime::now(),
        }
    }

    fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
        let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
        assert_eq!(len, raw.len());
        match msg {
            rtsp_types::Message::Response(r) => r.map_body(Bytes::from_static),
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn parse_setup_reads_interleaved_channel_and_session() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Session: 12345678;timeout=60\r\n\
Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\
\r\n";
        let setup = parse_setup(conn_ctx(), &response(raw)).unwrap();
        assert_eq!(setup.session_id, "12345678");
        assert_eq!(setup.channel_id, Some(0));
    }

    #[test]
    fn parse_setup_rejects_nonadjacent_channels() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Session: 1\r\n\
Transport: RTP/AVP/TCP;unicast;interleaved=0-5\r\n\
\r\n";
        let err = parse_setup(conn_ctx(), &response(raw)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransportMismatch);
    }

    #[test]
    fn parse_play_missing_rtp_info_is_not_an_error() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n";
        let base = RtspUrl::parse("rtsp://example.com/movie").unwrap();
        let entries = parse_play(conn_ctx(), &base, &[], &response(raw)).unwrap();
        assert!(entries.is_empty());
    }
}
