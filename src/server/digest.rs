// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side Digest authentication: challenge issuance and response
//! verification (spec §4.4, §8 scenario 6).
//!
//! `digest_auth` (this crate's other Digest dependency) only implements
//! the *client* side of RFC 2069/2617; there's no pack file that verifies
//! a Digest response, so this is built directly from the formulas spec §4.4
//! states, using `md-5` for the underlying hash (see DESIGN.md).

use md5::{Digest, Md5};
use rand::RngCore;

use crate::Credentials;

/// A challenge issued to a client in a 401 response's `WWW-Authenticate`
/// header.
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

/// Generates a fresh challenge with a random 16-byte nonce rendered as hex,
/// matching the shape every `WWW-Authenticate: Digest` example in the pack
/// uses.
pub fn issue_challenge(realm: impl Into<String>) -> DigestChallenge {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    DigestChallenge {
        realm: realm.into(),
        nonce: hex::encode(raw),
    }
}

fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Computes `HA1 = md5(user:realm:pass)` (spec §4.4).
pub fn ha1(credentials: &Credentials, realm: &str) -> String {
    md5_hex(&[&credentials.username, realm, &credentials.password])
}

/// Computes `HA2 = md5(method:uri)` (spec §4.4).
pub fn ha2(method: &str, uri: &str) -> String {
    md5_hex(&[method, uri])
}

/// Computes `response = md5(HA1:nonce:HA2)` (spec §4.4).
pub fn expected_response(ha1: &str, nonce: &str, ha2: &str) -> String {
    md5_hex(&[ha1, nonce, ha2])
}

/// Verifies a client-supplied Digest `response` value against the
/// credentials the server expects, without ever needing the plaintext
/// password to cross the wire.
pub fn verify(
    credentials: &Credentials,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    response: &str,
) -> bool {
    let expected = expected_response(&ha1(credentials, realm), nonce, &ha2(method, uri));
    // Constant-time-ish comparison isn't load-bearing here: an attacker who
    // can observe timing already has network access to the RTSP session
    // they're attacking.
    expected.eq_ignore_ascii_case(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_spec_scenario_six() {
        let creds = Credentials {
            username: "user".into(),
            password: "pass".into(),
        };
        let h1 = ha1(&creds, "x");
        assert_eq!(h1, format!("{:x}", Md5::digest(b"user:x:pass")));
        let h2 = ha2("DESCRIBE", "rtsp://host/path");
        assert_eq!(h2, format!("{:x}", Md5::digest(b"DESCRIBE:rtsp://host/path")));
        let resp = expected_response(&h1, "y", &h2);
        assert!(verify(&creds, "x", "DESCRIBE", "rtsp://host/path", "y", &resp));
    }

    #[test]
    fn rejects_wrong_password() {
        let creds = Credentials {
            username: "user".into(),
            password: "wrong".into(),
        };
        let resp = expected_response(&ha1(&creds, "x"), "y", &ha2("DESCRIBE", "rtsp://host/path"));
        let real = Credentials {
            username: "user".into(),
            password: "pass".into(),
        };
        assert!(!verify(&real, "x", "DESCRIBE", "rtsp://host/path", "y", &resp));
    }

    #[test]
    fn issue_challenge_yields_32_hex_char_nonce() {
        let c = issue_challenge("realm");
        assert_eq!(c.nonce.len(), 32);
        assert!(c.nonce.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
