// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Application-supplied capability callbacks and the `Public` header they
//! produce (spec §6, §9: "Dynamic dispatch over handler implements
//! OnDescribe/OnSetup/... is a capability set queried at registration; the
//! core decides what methods to advertise in Public by which capabilities
//! are present").
//!
//! Generalized from `marmikshah-rtsp-rs`'s `RequestHandler::handle`
//! match-on-method dispatch to a capability-trait shape, since this core
//! (unlike that example) needs to support both play-side and record-side
//! applications that register only the callbacks they use.

use std::sync::Arc;

use crate::format::Media;
use crate::server::stream::ServerStream;
use crate::Error;

/// Outcome of a `DESCRIBE` request (spec §4.3: "application returns stream
/// or 404").
pub enum DescribeOutcome {
    Found(ServerStream),
    NotFound,
}

/// Outcome of an `ANNOUNCE` request: the application parses the SDP body
/// (an external collaborator concern, see spec §6) and either accepts the
/// publish by returning a fresh `ServerStream` to record into, or rejects
/// it.
pub enum AnnounceOutcome {
    Accepted(ServerStream),
    Rejected(Error),
}

/// Outcome of a `SETUP` request. `SETUP`'s request URI names one track
/// within a presentation (e.g. `.../trackID=0`), not the presentation
/// itself, so — unlike `DESCRIBE` — the core can't assume the request path
/// doubles as the session's base path: the application resolves the track
/// URI to `(stream, media_idx)` and also hands back the base path every
/// sibling track's `SETUP` shares, so the session state machine can enforce
/// spec §4.3's "can't mix tracks from different presentations" rule.
pub enum SetupOutcome {
    Found {
        stream: ServerStream,
        media_idx: usize,
        base_path: String,
    },
    NotFound,
}

type DescribeFn = dyn Fn(&str) -> DescribeOutcome + Send + Sync;
type AnnounceFn = dyn Fn(&str, &[Media]) -> AnnounceOutcome + Send + Sync;
type SetupFn = dyn Fn(&str) -> SetupOutcome + Send + Sync;
type SetParameterFn = dyn Fn(&str, &[u8]) -> Result<(), Error> + Send + Sync;
type GetParameterFn = dyn Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync;

/// The capability set an application registers with [`crate::server::Server`].
/// Every field is optional; the core advertises exactly the methods whose
/// handler is present (plus the always-supported session-lifecycle verbs).
#[derive(Clone, Default)]
pub struct Handlers {
    on_describe: Option<Arc<DescribeFn>>,
    on_announce: Option<Arc<AnnounceFn>>,
    on_setup: Option<Arc<SetupFn>>,
    on_set_parameter: Option<Arc<SetParameterFn>>,
    on_get_parameter: Option<Arc<GetParameterFn>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_describe(
        mut self,
        f: impl Fn(&str) -> DescribeOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_describe = Some(Arc::new(f));
        self
    }

    pub fn with_on_announce(
        mut self,
        f: impl Fn(&str, &[Media]) -> AnnounceOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_announce = Some(Arc::new(f));
        self
    }

    pub fn with_on_setup(
        mut self,
        f: impl Fn(&str) -> SetupOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_setup = Some(Arc::new(f));
        self
    }

    pub fn with_on_set_parameter(
        mut self,
        f: impl Fn(&str, &[u8]) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.on_set_parameter = Some(Arc::new(f));
        self
    }

    pub fn with_on_get_parameter(
        mut self,
        f: impl Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync + 'static,
    ) -> Self {
        self.on_get_parameter = Some(Arc::new(f));
        self
    }

    pub fn describe(&self, path: &str) -> Option<DescribeOutcome> {
        self.on_describe.as_ref().map(|f| f(path))
    }

    pub fn announce(&self, path: &str, medias: &[Media]) -> Option<AnnounceOutcome> {
        self.on_announce.as_ref().map(|f| f(path, medias))
    }

    pub fn setup(&self, path: &str) -> Option<SetupOutcome> {
        self.on_setup.as_ref().map(|f| f(path))
    }

    pub fn set_parameter(&self, path: &str, body: &[u8]) -> Option<Result<(), Error>> {
        self.on_set_parameter.as_ref().map(|f| f(path, body))
    }

    pub fn get_parameter(&self, path: &str) -> Option<Result<Vec<u8>, Error>> {
        self.on_get_parameter.as_ref().map(|f| f(path))
    }

    /// Builds the `Public` header value: the session-lifecycle verbs are
    /// always present (a session can't exist without them), plus
    /// `DESCRIBE`/`ANNOUNCE`/`GET_PARAMETER`/`SET_PARAMETER` exactly when
    /// their handler is registered.
    pub fn public_header(&self) -> String {
        let mut methods = vec!["OPTIONS", "SETUP", "PLAY", "PAUSE", "TEARDOWN"];
        if self.on_describe.is_some() {
            methods.push("DESCRIBE");
        }
        if self.on_announce.is_some() {
            methods.push("ANNOUNCE");
            methods.push("RECORD");
        }
        if self.on_get_parameter.is_some() {
            methods.push("GET_PARAMETER");
        }
        if self.on_set_parameter.is_some() {
            methods.push("SET_PARAMETER");
        }
        methods.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_header_lists_only_registered_capabilities() {
        let handlers = Handlers::new();
        assert_eq!(handlers.public_header(), "OPTIONS, SETUP, PLAY, PAUSE, TEARDOWN");

        let handlers = Handlers::new().with_on_describe(|_| DescribeOutcome::NotFound);
        assert!(handlers.public_header().contains("DESCRIBE"));
        assert!(!handlers.public_header().contains("ANNOUNCE"));
    }

    #[test]
    fn setup_capability_dispatches_to_registered_handler() {
        let handlers = Handlers::new().with_on_setup(|path| {
            if path == "/movie/trackID=0" {
                SetupOutcome::Found {
                    stream: crate::server::stream::ServerStream::new(Vec::new()),
                    media_idx: 0,
                    base_path: "/movie".to_string(),
                }
            } else {
                SetupOutcome::NotFound
            }
        });
        assert!(matches!(
            handlers.setup("/movie/trackID=0"),
            Some(SetupOutcome::Found { .. })
        ));
        assert!(matches!(
            handlers.setup("/other"),
            Some(SetupOutcome::NotFound)
        ));
    }

    #[test]
    fn setup_with_no_handler_registered_is_none() {
        let handlers = Handlers::new();
        assert!(handlers.setup("/movie/trackID=0").is_none());
    }

    #[test]
    fn announce_capability_also_advertises_record() {
        use crate::error::{wrap, ErrorInt};
        let handlers = Handlers::new().with_on_announce(|path, _medias| {
            AnnounceOutcome::Rejected(wrap!(ErrorInt::Fatal {
                description: format!("rejecting {path}"),
            }))
        });
        let header = handlers.public_header();
        assert!(header.contains("ANNOUNCE"));
        assert!(header.contains("RECORD"));
    }
}
