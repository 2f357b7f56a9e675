//! Owns the single authenticated SSH connection: connect/disconnect,
//! liveness probing, and the state machine that the Supervisor and event
//! subscribers observe.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::error::CoreError;
use crate::event::{EventBus, Subscription};
use crate::forwarding::IncomingForward;
use crate::ssh::{self, HandleController, HostKeyVerifier, PingResult, SessionKnownHosts};

/// `Disconnected -> Connecting -> (Connected | Error)`;
/// `Connected -> Disconnecting -> Disconnected`; any state can move to
/// `Error` on a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Published on every state transition.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub state: SessionState,
    pub error_message: Option<String>,
}

struct ConnectParams {
    hostname: String,
    port: u16,
    username: String,
    key_path: String,
    timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
}

impl ConnectParams {
    fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            port: config.server.port,
            username: config.server.username.clone(),
            key_path: config.ssh_key.path.clone(),
            timeout: Duration::from_secs(config.connection.timeout_seconds),
            keepalive_interval: Duration::from_secs(config.connection.keepalive_interval_seconds),
            keepalive_max: config.connection.keepalive_max_missed as usize,
        }
    }
}

/// One authenticated SSH connection. `Session` exclusively owns the
/// transport handle; `ForwardRegistry` only ever borrows it via
/// [`Session::take_incoming_forwards`] and [`Session::transport`].
pub struct Session {
    params: ConnectParams,
    known_hosts: Arc<SessionKnownHosts>,
    verifier: Arc<dyn HostKeyVerifier>,
    state: Mutex<SessionState>,
    error_message: Mutex<Option<String>>,
    handle_controller: Mutex<Option<HandleController>>,
    pending_incoming: Mutex<Option<mpsc::UnboundedReceiver<IncomingForward>>>,
    events: EventBus<SessionEvent>,
}

impl Session {
    pub fn new(config: &Config, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            params: ConnectParams::from_config(config),
            known_hosts: Arc::new(SessionKnownHosts::new()),
            verifier,
            state: Mutex::new(SessionState::Disconnected),
            error_message: Mutex::new(None),
            handle_controller: Mutex::new(None),
            pending_incoming: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone()
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe(None)
    }

    /// Idempotent on Connected/Connecting. Blocks until the handshake
    /// completes or the configured timeout elapses.
    pub async fn connect(&self, passphrase: Option<&str>) -> Result<(), CoreError> {
        {
            let state = *self.state.lock();
            if matches!(state, SessionState::Connected | SessionState::Connecting) {
                return Ok(());
            }
        }

        self.set_state(SessionState::Connecting, None);

        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let result = ssh::connect(
            &self.params.hostname,
            self.params.port,
            &self.params.username,
            &self.params.key_path,
            passphrase,
            self.params.timeout,
            self.params.keepalive_interval,
            self.params.keepalive_max,
            Arc::clone(&self.known_hosts),
            Arc::clone(&self.verifier),
            forward_tx,
        )
        .await;

        match result {
            Ok(handle) => {
                let controller = ssh::spawn_handle_owner_task(handle, self.params.hostname.clone());
                *self.handle_controller.lock() = Some(controller);
                *self.pending_incoming.lock() = Some(forward_rx);
                self.set_state(SessionState::Connected, None);
                info!(hostname = %self.params.hostname, "session connected");
                Ok(())
            }
            Err(e) => {
                *self.handle_controller.lock() = None;
                *self.pending_incoming.lock() = None;
                self.set_state(SessionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Safe from any state; idempotent; never fails.
    pub fn disconnect(&self) {
        let controller = {
            let state = *self.state.lock();
            if state == SessionState::Disconnected {
                return;
            }
            self.set_state(SessionState::Disconnecting, None);
            self.handle_controller.lock().take()
        };

        if let Some(controller) = controller {
            controller.disconnect();
        }
        *self.pending_incoming.lock() = None;
        self.set_state(SessionState::Disconnected, None);
    }

    /// A usable handle only while Connected and the owner task is alive.
    pub fn transport(&self) -> Option<HandleController> {
        if self.state() != SessionState::Connected {
            return None;
        }
        self.handle_controller
            .lock()
            .clone()
            .filter(HandleController::is_connected)
    }

    /// Sends a protocol-level no-op and reports whether it was written
    /// without error. Used by the Supervisor for liveness.
    pub async fn probe(&self) -> bool {
        let Some(controller) = self.transport() else {
            return false;
        };
        matches!(controller.ping().await, PingResult::Ok)
    }

    /// Hands over the receiver half of this connection's incoming-forward
    /// channel. Only set once per successful `connect`; `None` after the
    /// first call or before any connection has succeeded.
    pub fn take_incoming_forwards(&self) -> Option<mpsc::UnboundedReceiver<IncomingForward>> {
        self.pending_incoming.lock().take()
    }

    fn set_state(&self, state: SessionState, error_message: Option<String>) {
        *self.state.lock() = state;
        *self.error_message.lock() = error_message.clone();
        self.events.send(SessionEvent { state, error_message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, PortForwardingConfig, ReconnectConfig, ServerConfig, SshKeyConfig};
    use crate::ssh::AutoAcceptVerifier;

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                hostname: "example.com".to_string(),
                port: 22,
                username: "deploy".to_string(),
            },
            ssh_key: SshKeyConfig {
                path: "/nonexistent/key".to_string(),
                passphrase_in_keyring: false,
            },
            port_forwarding: PortForwardingConfig::default(),
            reconnect: ReconnectConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    #[test]
    fn starts_disconnected() {
        let session = Session::new(&test_config(), Arc::new(AutoAcceptVerifier));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.transport().is_none());
    }

    #[test]
    fn disconnect_on_disconnected_session_is_a_noop() {
        let session = Session::new(&test_config(), Arc::new(AutoAcceptVerifier));
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn probe_without_transport_is_false() {
        let session = Session::new(&test_config(), Arc::new(AutoAcceptVerifier));
        assert!(!session.probe().await);
    }
}
