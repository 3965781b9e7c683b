// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/RTSPS URL handling (spec §3 "URL").
//!
//! Parsing and joining is `url::Url`'s job; this module adds the
//! RTSP-specific pieces `url` doesn't know about: splitting path+query
//! into a base and control attribute, and resolving a media's control URL
//! against a session base URL.

use url::Url;

/// An absolute RTSP or RTSPS URL, wrapping [`url::Url`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RtspUrl(Url);

/// Errors constructing or resolving an [`RtspUrl`].
#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("unsupported scheme {0:?}; expected rtsp or rtsps")]
    UnsupportedScheme(String),

    #[error("failed to parse url: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unable to join base url {base} with control {control:?}: {source}")]
    Join {
        base: String,
        control: String,
        #[source]
        source: url::ParseError,
    },
}

impl RtspUrl {
    /// Parses an absolute `rtsp://` or `rtsps://` URL.
    pub fn parse(s: &str) -> Result<Self, UrlError> {
        let url = Url::parse(s)?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self, UrlError> {
        match url.scheme() {
            "rtsp" | "rtsps" => Ok(Self(url)),
            other => Err(UrlError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "rtsps"
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or("")
    }

    pub fn username(&self) -> Option<&str> {
        if self.0.username().is_empty() {
            None
        } else {
            Some(self.0.username())
        }
    }

    pub fn password(&self) -> Option<&str> {
        self.0.password()
    }

    /// `path + "?" + query`, or just `path` if there's no query. This is
    /// the form most RTSP request lines and `Content-Base`/`control`
    /// headers deal in.
    pub fn path_and_query(&self) -> String {
        match self.0.query() {
            Some(q) => format!("{}?{}", self.0.path(), q),
            None => self.0.path().to_string(),
        }
    }

    /// Splits [`Self::path_and_query`] into `(path, query)`, with `query`
    /// being `None` when absent.
    pub fn path_split_query(&self) -> (&str, Option<&str>) {
        (self.0.path(), self.0.query())
    }

    /// Returns a clone of this URL with `/` appended to the path if it
    /// doesn't already end in one, so it can serve as a media base per
    /// spec §3 ("append \"/\" + control ... if the base does not already
    /// end with a slash").
    fn ensure_trailing_slash(&self) -> Url {
        let mut url = self.0.clone();
        if !url.path().ends_with('/') {
            let mut path = url.path().to_string();
            path.push('/');
            url.set_path(&path);
        }
        url
    }

    /// Resolves one media's control attribute against this session's base
    /// URL, per spec §3:
    ///
    /// - `control == "*"` or empty: the media URL is the session URL itself.
    /// - `control` is itself an absolute URL: used as-is.
    /// - otherwise: `base + "/" + control` (with the "already ends in
    ///   slash" dedup spec §3 describes).
    pub fn resolve_media_control(&self, control: &str) -> Result<RtspUrl, UrlError> {
        if control.is_empty() || control == "*" {
            return Ok(self.clone());
        }
        if let Ok(absolute) = Url::parse(control) {
            if absolute.scheme() == "rtsp" || absolute.scheme() == "rtsps" {
                return RtspUrl::from_url(absolute);
            }
        }
        let base = self.ensure_trailing_slash();
        let joined = base.join(control).map_err(|source| UrlError::Join {
            base: base.to_string(),
            control: control.to_string(),
            source,
        })?;
        RtspUrl::from_url(joined)
    }
}

impl std::fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RtspUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_rtsp_scheme() {
        assert!(RtspUrl::parse("http://example.com/").is_err());
    }

    #[test]
    fn accepts_rtsps() {
        let u = RtspUrl::parse("rtsps://example.com/cam").unwrap();
        assert!(u.is_secure());
    }

    #[test]
    fn star_control_is_session_url() {
        let base = RtspUrl::parse("rtsp://example.com/cam").unwrap();
        let media = base.resolve_media_control("*").unwrap();
        assert_eq!(media, base);
    }

    #[test]
    fn relative_control_is_appended_with_slash() {
        let base = RtspUrl::parse("rtsp://example.com/cam").unwrap();
        let media = base.resolve_media_control("trackID=0").unwrap();
        assert_eq!(media.as_url().as_str(), "rtsp://example.com/cam/trackID=0");
    }

    #[test]
    fn relative_control_against_base_with_trailing_slash() {
        let base = RtspUrl::parse("rtsp://example.com/cam/").unwrap();
        let media = base.resolve_media_control("trackID=0").unwrap();
        assert_eq!(media.as_url().as_str(), "rtsp://example.com/cam/trackID=0");
    }

    #[test]
    fn absolute_control_used_as_is() {
        let base = RtspUrl::parse("rtsp://example.com/cam").unwrap();
        let media = base
            .resolve_media_control("rtsp://other.example.com/x")
            .unwrap();
        assert_eq!(media.as_url().as_str(), "rtsp://other.example.com/x");
    }

    #[test]
    fn path_and_query_round_trips() {
        let u = RtspUrl::parse("rtsp://example.com/cam?channel=1&sub=0").unwrap();
        assert_eq!(u.path_and_query(), "/cam?channel=1&sub=0");
        assert_eq!(u.path_split_query(), ("/cam", Some("channel=1&sub=0")));
    }
}
