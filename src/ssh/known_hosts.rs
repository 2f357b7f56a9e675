//! Host key verification policy.
//!
//! The default policy auto-accepts and remembers keys for the lifetime of
//! the process (documented weak policy; see the design notes). Hardened
//! embedders can supply their own [`HostKeyVerifier`] — the hook signature
//! is exactly `(hostname, fingerprint) -> accept|reject`, deliberately
//! narrower than the on-disk `~/.ssh/known_hosts` store the teacher carries,
//! since persistence across runs is out of scope for this core.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Outcome of checking a server key against whatever this session has seen
/// so far.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Matches the key already recorded for this host in this session.
    Verified,
    /// First time this session has seen a key for this host.
    Unknown { fingerprint: String },
    /// The key differs from the one previously recorded in this session —
    /// always rejected, since it could indicate a man-in-the-middle attack.
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// A pluggable host key policy. `accept(hostname, fingerprint)` returning
/// `true` trusts the key for the remainder of the session.
pub trait HostKeyVerifier: Send + Sync {
    fn accept(&self, hostname: &str, fingerprint: &str) -> bool;
}

/// Default policy: accept every previously-unseen key. This matches the
/// source's stated policy and is documented in the design notes as a
/// deliberate, weak default meant to be overridden by hardened deployments.
pub struct AutoAcceptVerifier;

impl HostKeyVerifier for AutoAcceptVerifier {
    fn accept(&self, _hostname: &str, _fingerprint: &str) -> bool {
        true
    }
}

/// In-memory, session-scoped cache of host keys seen so far, keyed by
/// `host:port`. Not persisted — the core does not touch
/// `~/.ssh/known_hosts` or any other on-disk store.
pub struct SessionKnownHosts {
    seen: RwLock<HashMap<String, String>>,
}

impl Default for SessionKnownHosts {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKnownHosts {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let fingerprint = compute_fingerprint(key);
        let id = format!("{host}:{port}");

        let existing = self.seen.read().get(&id).cloned();
        match existing {
            None => HostKeyVerification::Unknown { fingerprint },
            Some(expected) if expected == fingerprint => HostKeyVerification::Verified,
            Some(expected) => HostKeyVerification::Changed {
                expected_fingerprint: expected,
                actual_fingerprint: fingerprint,
            },
        }
    }

    pub fn remember(&self, host: &str, port: u16, key: &PublicKey) {
        let fingerprint = compute_fingerprint(key);
        self.seen
            .write()
            .insert(format!("{host}:{port}"), fingerprint);
    }
}

/// SHA256 fingerprint in the `SHA256:base64` form OpenSSH prints.
pub fn compute_fingerprint(key: &PublicKey) -> String {
    let encoded = key.public_key_bytes();
    let digest = Sha256::digest(encoded);
    format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_accept_accepts_anything() {
        let verifier = AutoAcceptVerifier;
        assert!(verifier.accept("example.com", "SHA256:anything"));
    }

    #[test]
    fn session_known_hosts_starts_unknown() {
        let store = SessionKnownHosts::new();
        assert!(store.seen.read().get("host:22").is_none());
    }
}
