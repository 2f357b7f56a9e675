//! Observes session liveness; on loss, stops all forwards, reconnects with
//! exponential backoff, and restarts enabled forwards.
//!
//! The backoff formula and the stop-forwards-before-reconnect ordering are
//! grounded directly in the original `connection_monitor.py`'s
//! `_handle_disconnect`/`_calculate_backoff_delay`: stop tunnels first, then
//! back off, then reconnect, then restart tunnels. `AuthError`/`KeyError`
//! are abandoned after exactly one attempt regardless of `max_attempts`, to
//! avoid hammering a server with rejected credentials.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, ForwardRule, ReconnectConfig};
use crate::event::{EventBus, Subscription};
use crate::forwarding::ForwardRegistry;
use crate::session::{Session, SessionState};
use crate::ssh::HostKeyVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub state: SupervisorState,
    pub reconnect_attempt: u32,
}

pub struct Supervisor {
    rules: Vec<ForwardRule>,
    reconnect_config: ReconnectConfig,
    keepalive_interval: Duration,
    session: Arc<Session>,
    registry: Arc<ForwardRegistry>,
    state: Mutex<SupervisorState>,
    reconnect_attempt: AtomicU32,
    abandoned: AtomicBool,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    passphrase: Mutex<Option<String>>,
    events: EventBus<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(config: Config, verifier: Arc<dyn HostKeyVerifier>) -> Arc<Self> {
        let rules = config.forwards().to_vec();
        let reconnect_config = config.reconnect.clone();
        let keepalive_interval = Duration::from_secs(config.connection.keepalive_interval_seconds);
        let session = Arc::new(Session::new(&config, verifier));

        Arc::new(Self {
            rules,
            reconnect_config,
            keepalive_interval,
            session,
            registry: Arc::new(ForwardRegistry::new()),
            state: Mutex::new(SupervisorState::Stopped),
            reconnect_attempt: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
            stop_flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            monitor_task: Mutex::new(None),
            passphrase: Mutex::new(None),
            events: EventBus::new(),
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ForwardRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> Subscription<SupervisorEvent> {
        self.events.subscribe(None)
    }

    /// Performs an initial connect attempt, then launches the monitor
    /// worker. A failed initial attempt does not stop the monitor loop —
    /// the next wakeup observes the session in `Error` and starts
    /// reconnecting, same as a mid-session loss.
    pub async fn start(self: &Arc<Self>, passphrase: Option<String>) {
        *self.passphrase.lock() = passphrase.clone();
        self.stop_flag.store(false, Ordering::SeqCst);
        self.abandoned.store(false, Ordering::SeqCst);
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Running);

        match self.session.connect(passphrase.as_deref()).await {
            Ok(()) => self.bind_and_start_forwards().await,
            Err(e) => warn!(error = %e, "initial connect failed, monitor will retry"),
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.monitor_loop().await });
        *self.monitor_task.lock() = Some(task);
    }

    /// Stops the monitor, stops every forward, disconnects the session,
    /// and joins the monitor worker (bounded to 5s).
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        self.registry.stop_all().await;
        self.session.disconnect();
        self.registry.bind_transport(None);

        if let Some(task) = self.monitor_task.lock().take() {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("monitor worker did not exit within the shutdown budget");
            }
        }

        *self.passphrase.lock() = None;
        self.set_state(SupervisorState::Stopped);
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            if self.wait_or_stop(self.keepalive_interval).await {
                break;
            }

            let lost = self.session_looks_lost().await;
            if lost {
                self.set_state(SupervisorState::Reconnecting);
                self.registry.stop_all().await;

                let recovered = self.backoff_loop().await;
                if self.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                if recovered {
                    info!("session reconnected");
                } else if self.abandoned.load(Ordering::SeqCst) {
                    warn!("reconnect abandoned; session left in Error");
                }
                self.set_state(SupervisorState::Running);
            }

            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn session_looks_lost(&self) -> bool {
        if self.abandoned.load(Ordering::SeqCst) {
            return false;
        }
        match self.session.state() {
            SessionState::Connected => !self.session.probe().await,
            SessionState::Disconnected | SessionState::Error => self.reconnect_config.enabled,
            _ => false,
        }
    }

    async fn backoff_loop(self: &Arc<Self>) -> bool {
        let mut attempt: u32 = 1;
        loop {
            let delay = self.delay_for(attempt.saturating_sub(1));
            if self.wait_or_stop(delay).await {
                return false;
            }

            self.reconnect_attempt.store(attempt, Ordering::SeqCst);
            self.publish();

            if self.reconnect_config.max_attempts > 0
                && attempt > self.reconnect_config.max_attempts
            {
                warn!(attempt, "max reconnect attempts exhausted, abandoning");
                self.abandoned.store(true, Ordering::SeqCst);
                return false;
            }

            self.session.disconnect();
            let passphrase = self.passphrase.lock().clone();
            match self.session.connect(passphrase.as_deref()).await {
                Ok(()) => {
                    self.bind_and_start_forwards().await;
                    self.reconnect_attempt.store(0, Ordering::SeqCst);
                    return true;
                }
                Err(e) => {
                    if e.is_credential_fatal() {
                        warn!(error = %e, "credential error, abandoning after one attempt");
                        self.abandoned.store(true, Ordering::SeqCst);
                        return false;
                    }
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    async fn bind_and_start_forwards(&self) {
        let Some(controller) = self.session.transport() else {
            return;
        };
        let Some(incoming) = self.session.take_incoming_forwards() else {
            return;
        };
        self.registry.bind_transport(Some((controller, incoming)));
        let _ = self.registry.start_all(&self.rules).await;
    }

    fn delay_for(&self, previous_attempts: u32) -> Duration {
        let rc = &self.reconnect_config;
        let computed = rc.initial_delay_seconds * rc.backoff_multiplier.powi(previous_attempts as i32);
        Duration::from_secs_f64(computed.min(rc.max_delay_seconds).max(0.0))
    }

    /// Returns `true` if woken by a stop signal rather than the timer.
    async fn wait_or_stop(&self, duration: Duration) -> bool {
        if self.stop_flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.stop_flag.load(Ordering::SeqCst),
            _ = self.notify.notified() => true,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
        self.publish();
    }

    fn publish(&self) {
        self.events.send(SupervisorEvent {
            state: self.state(),
            reconnect_attempt: self.reconnect_attempt(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, PortForwardingConfig, ServerConfig, SshKeyConfig};
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
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: 3,
                initial_delay_seconds: 1.0,
                max_delay_seconds: 10.0,
                backoff_multiplier: 2.0,
            },
            connection: ConnectionConfig::default(),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let sup = Supervisor::new(test_config(), Arc::new(AutoAcceptVerifier));
        assert_eq!(sup.delay_for(0), Duration::from_secs_f64(1.0));
        assert_eq!(sup.delay_for(1), Duration::from_secs_f64(2.0));
        assert_eq!(sup.delay_for(2), Duration::from_secs_f64(4.0));
        assert_eq!(sup.delay_for(10), Duration::from_secs_f64(10.0));
    }

    #[test]
    fn starts_stopped() {
        let sup = Supervisor::new(test_config(), Arc::new(AutoAcceptVerifier));
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sup.reconnect_attempt(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let sup = Supervisor::new(test_config(), Arc::new(AutoAcceptVerifier));
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }
}
