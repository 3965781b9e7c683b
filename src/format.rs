// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The payload-format model shared by client and server (spec §3 "Track/
//! Media/Format").
//!
//! `rtsp-core` treats a format opaquely except for `clock_rate` and
//! `payload_type`, which the RTCP report generators and the RTP-Info
//! header need. Everything codec-specific (H264 `fmtp` parsing, AAC
//! `config`, ...) is a caller concern; see `DESIGN.md` for why that's
//! narrower than `retina`'s own `codec` module.

use std::num::NonZeroU32;

/// One payload format within a [`Media`]. RTP payload type 0-127 per
/// spec §3; invariant (checked by [`Media::add_format`]) is that payload
/// types are unique within a media.
#[derive(Clone, Debug)]
pub struct Format {
    payload_type: u8,
    clock_rate: NonZeroU32,
    encoding_name: String,
    channels: Option<std::num::NonZeroU16>,
    /// Raw `a=fmtp:<payload-type> <params>` value, unparsed.
    format_specific_params: Option<String>,
}

impl Format {
    pub fn new(
        payload_type: u8,
        clock_rate: NonZeroU32,
        encoding_name: impl Into<String>,
        channels: Option<std::num::NonZeroU16>,
        format_specific_params: Option<String>,
    ) -> Result<Self, String> {
        if payload_type & 0x80 != 0 {
            return Err(format!("invalid RTP payload type {payload_type}"));
        }
        Ok(Self {
            payload_type,
            clock_rate,
            encoding_name: encoding_name.into(),
            channels,
            format_specific_params,
        })
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate.get()
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn channels(&self) -> Option<std::num::NonZeroU16> {
        self.channels
    }

    /// The raw, uninterpreted `fmtp` value, for callers that do understand
    /// this encoding.
    pub fn raw_format_specific_params(&self) -> Option<&str> {
        self.format_specific_params.as_deref()
    }
}

/// One logical media (e.g. one video or one audio) within a session
/// description (spec §3 "Track/Media").
#[derive(Clone, Debug)]
pub struct Media {
    /// SDP `m=` media type, e.g. `"video"`, `"audio"`, `"application"`.
    pub media_type: String,
    /// Control attribute as written in SDP: absolute URL, relative path,
    /// `*`, or empty. Resolved against the session base URL by
    /// [`crate::rtsp_url::resolve_media_url`].
    pub control: String,
    formats: Vec<Format>,
}

impl Media {
    pub fn new(media_type: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            control: control.into(),
            formats: Vec::new(),
        }
    }

    /// Adds `format`, enforcing the per-media payload-type-uniqueness
    /// invariant from spec §3.
    pub fn add_format(&mut self, format: Format) -> Result<(), String> {
        if self
            .formats
            .iter()
            .any(|f| f.payload_type() == format.payload_type())
        {
            return Err(format!(
                "duplicate payload type {} within one media",
                format.payload_type()
            ));
        }
        self.formats.push(format);
        Ok(())
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    pub fn format_by_payload_type(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type() == payload_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(pt: u8) -> Format {
        Format::new(pt, NonZeroU32::new(90_000).unwrap(), "H264", None, None).unwrap()
    }

    #[test]
    fn rejects_high_bit_payload_type() {
        assert!(Format::new(200, NonZeroU32::new(8_000).unwrap(), "x", None, None).is_err());
    }

    #[test]
    fn media_rejects_duplicate_payload_type() {
        let mut m = Media::new("video", "trackID=0");
        m.add_format(fmt(96)).unwrap();
        assert!(m.add_format(fmt(96)).is_err());
    }

    #[test]
    fn media_looks_up_format_by_payload_type() {
        let mut m = Media::new("video", "trackID=0");
        m.add_format(fmt(96)).unwrap();
        assert!(m.format_by_payload_type(96).is_some());
        assert!(m.format_by_payload_type(97).is_none());
    }
}
