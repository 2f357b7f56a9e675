//! Client-side `Handler` plus the connect/authenticate sequence.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::forwarding::IncomingForward;
use crate::ssh::known_hosts::{HostKeyVerification, HostKeyVerifier, SessionKnownHosts};

/// Candidate key families tried, in the order the design calls for. Kept
/// purely for diagnostics: `russh::keys::load_secret_key` sniffs the format
/// from the file itself rather than being handed an explicit family to try,
/// so this enum exists to name, in logs, which family a loaded key turned
/// out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    Rsa,
    Ecdsa,
    Dsa,
    Other,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Rsa => "rsa",
            KeyAlgorithm::Ecdsa => "ecdsa",
            KeyAlgorithm::Dsa => "dsa",
            KeyAlgorithm::Other => "other",
        };
        f.write_str(name)
    }
}

fn classify_algorithm(name: &str) -> KeyAlgorithm {
    let name = name.to_ascii_lowercase();
    if name.contains("ed25519") {
        KeyAlgorithm::Ed25519
    } else if name.contains("rsa") {
        KeyAlgorithm::Rsa
    } else if name.contains("ecdsa") {
        KeyAlgorithm::Ecdsa
    } else if name.contains("dss") || name.contains("dsa") {
        KeyAlgorithm::Dsa
    } else {
        KeyAlgorithm::Other
    }
}

/// Load and classify the private key at `path`. A missing passphrase on an
/// encrypted key is surfaced as `AuthError { needs_passphrase: true }`
/// rather than `KeyError`, so the caller can retry with one instead of
/// treating the key file itself as unusable.
pub fn load_key(
    path: &str,
    passphrase: Option<&str>,
) -> Result<(russh::keys::PrivateKey, KeyAlgorithm), CoreError> {
    match russh::keys::load_secret_key(path, passphrase) {
        Ok(key) => {
            let algorithm = classify_algorithm(&key.algorithm().to_string());
            Ok((key, algorithm))
        }
        Err(e) => {
            let message = e.to_string();
            if passphrase.is_none() && message.to_ascii_lowercase().contains("encrypt") {
                Err(CoreError::needs_passphrase(message))
            } else {
                Err(CoreError::KeyError(message))
            }
        }
    }
}

/// Connect and authenticate. Authentication is publickey-only — no agent,
/// password, or keyboard-interactive fallback.
#[allow(clippy::too_many_arguments)]
pub async fn connect(
    hostname: &str,
    port: u16,
    username: &str,
    key_path: &str,
    passphrase: Option<&str>,
    timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
    known_hosts: Arc<SessionKnownHosts>,
    verifier: Arc<dyn HostKeyVerifier>,
    forward_tx: mpsc::UnboundedSender<IncomingForward>,
) -> Result<Handle<ClientHandler>, CoreError> {
    let addr = format!("{hostname}:{port}");
    info!(%addr, "connecting to ssh server");

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| CoreError::NetError(format!("failed to resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| CoreError::NetError(format!("no address found for {addr}")))?;

    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(keepalive_interval),
        keepalive_max,
        ..Default::default()
    };

    let handler = ClientHandler::new(
        hostname.to_string(),
        port,
        known_hosts,
        verifier,
        forward_tx,
    );

    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| CoreError::NetError(format!("connection to {addr} timed out")))?
    .map_err(CoreError::from)?;

    debug!(%addr, "ssh handshake complete");

    let (key, algorithm) = load_key(key_path, passphrase)?;
    debug!(%algorithm, "loaded private key");

    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let authenticated = handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(CoreError::from)?;

    if !authenticated.success() {
        return Err(CoreError::auth("authentication rejected by server"));
    }

    info!(%addr, username, "ssh authentication successful");
    Ok(handle)
}

/// Handles server-initiated callbacks for one connection: host key
/// verification and delivery of `forwarded-tcpip` channels.
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<SessionKnownHosts>,
    verifier: Arc<dyn HostKeyVerifier>,
    forward_tx: mpsc::UnboundedSender<IncomingForward>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        known_hosts: Arc<SessionKnownHosts>,
        verifier: Arc<dyn HostKeyVerifier>,
        forward_tx: mpsc::UnboundedSender<IncomingForward>,
    ) -> Self {
        Self {
            host,
            port,
            known_hosts,
            verifier,
            forward_tx,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = CoreError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                let accept = self.verifier.accept(&self.host, &fingerprint);
                if accept {
                    info!(host = %self.host, port = self.port, %fingerprint, "accepting new host key");
                    self.known_hosts.remember(&self.host, self.port, server_public_key);
                } else {
                    warn!(host = %self.host, port = self.port, %fingerprint, "host key rejected by verifier");
                }
                Ok(accept)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    host = %self.host, port = self.port,
                    %expected_fingerprint, %actual_fingerprint,
                    "host key changed, refusing connection"
                );
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected_address,
            connected_port, originator_address, originator_port, "forwarded-tcpip channel opened"
        );

        let incoming = IncomingForward {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };

        if self.forward_tx.send(incoming).is_err() {
            warn!("no forward dispatcher attached; dropping incoming channel");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_algorithm_names() {
        assert_eq!(classify_algorithm("ssh-ed25519"), KeyAlgorithm::Ed25519);
        assert_eq!(classify_algorithm("rsa-sha2-256"), KeyAlgorithm::Rsa);
        assert_eq!(classify_algorithm("ecdsa-sha2-nistp256"), KeyAlgorithm::Ecdsa);
        assert_eq!(classify_algorithm("ssh-dss"), KeyAlgorithm::Dsa);
        assert_eq!(classify_algorithm("something-else"), KeyAlgorithm::Other);
    }

    #[test]
    fn load_key_reports_key_error_for_missing_file() {
        let err = load_key("/nonexistent/path/to/key", None).unwrap_err();
        assert!(matches!(err, CoreError::KeyError(_)));
    }
}
