//! Tracks every remote-port forward, requests and cancels the server-side
//! listeners, and dispatches incoming `forwarded-tcpip` channels to the
//! right splice task.
//!
//! One transport-wide dispatcher task pulls every [`super::IncomingForward`]
//! off the channel [`crate::ssh::client::ClientHandler`] feeds and routes
//! each by its `connected_port` to the matching [`ForwardEntry`] — the
//! "preferred" design from the accept-dispatch design note, grounded in the
//! teacher's `REMOTE_FORWARD_REGISTRY` lookup-by-port idiom in
//! `forwarding/remote.rs`, but without the `static`/`Lazy` global: the
//! lookup table here is owned by this `ForwardRegistry` instance and wired
//! in at `bind_transport` time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ForwardRule;
use crate::error::CoreError;
use crate::event::{EventBus, Subscription};
use crate::ssh::handle_owner::HandleController;

use super::splice::{self, ForwardStats, ForwardStatsSnapshot};
use super::{ForwardEvent, ForwardState, IncomingForward};

/// Outcome of a successful or no-op `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

/// A point-in-time view of one forward, returned by `status`/`status_all`.
#[derive(Debug, Clone)]
pub struct ForwardStatus {
    pub rule: ForwardRule,
    pub state: ForwardState,
    pub error_message: Option<String>,
    pub stats: ForwardStatsSnapshot,
}

struct ForwardEntry {
    rule: ForwardRule,
    state: ForwardState,
    error_message: Option<String>,
    stats: Arc<ForwardStats>,
    bound_port: Option<u32>,
    connections: Vec<JoinHandle<()>>,
}

impl ForwardEntry {
    fn starting(rule: ForwardRule) -> Self {
        Self {
            rule,
            state: ForwardState::Starting,
            error_message: None,
            stats: Arc::new(ForwardStats::new()),
            bound_port: None,
            connections: Vec::new(),
        }
    }

    fn to_status(&self) -> ForwardStatus {
        ForwardStatus {
            rule: self.rule.clone(),
            state: self.state,
            error_message: self.error_message.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Per-remote-port forward tracking, bound to at most one transport at a
/// time. Shared between the Supervisor and whatever drives `start`/`stop`
/// calls; cheap to clone (everything behind `Arc`).
#[derive(Clone)]
pub struct ForwardRegistry {
    transport: Arc<RwLock<Option<HandleController>>>,
    forwards: Arc<Mutex<HashMap<u16, ForwardEntry>>>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    events: EventBus<ForwardEvent>,
}

impl Default for ForwardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(RwLock::new(None)),
            forwards: Arc::new(Mutex::new(HashMap::new())),
            dispatcher: Arc::new(Mutex::new(None)),
            events: EventBus::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<ForwardEvent> {
        self.events.subscribe(None)
    }

    /// Set (or clear) the transport used by subsequent `start` calls.
    ///
    /// Passing `Some` also takes ownership of the receiver half of the
    /// incoming-forward channel and spawns the dispatcher task that will
    /// route `forwarded-tcpip` channels to active forwards for as long as
    /// this transport is bound. Passing `None` stops that dispatcher and
    /// invalidates the transport reference; it does not stop any forward —
    /// per the contract, that is the Supervisor's job.
    pub fn bind_transport(
        &self,
        transport: Option<(HandleController, mpsc::UnboundedReceiver<IncomingForward>)>,
    ) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }

        match transport {
            Some((handle_controller, incoming_rx)) => {
                *self.transport.write() = Some(handle_controller);
                let forwards = Arc::clone(&self.forwards);
                let task = tokio::spawn(dispatch_loop(forwards, incoming_rx));
                *self.dispatcher.lock() = Some(task);
            }
            None => {
                *self.transport.write() = None;
            }
        }
    }

    /// Request a server-side listener for `rule` and start routing
    /// connections to it. Returns `AlreadyActive` without touching the
    /// transport if this `remote_port` is already Starting or Active.
    pub async fn start(&self, rule: ForwardRule) -> Result<StartOutcome, CoreError> {
        {
            let forwards = self.forwards.lock();
            if let Some(entry) = forwards.get(&rule.remote_port) {
                if matches!(entry.state, ForwardState::Starting | ForwardState::Active) {
                    return Ok(StartOutcome::AlreadyActive);
                }
            }
        }

        let handle_controller = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| CoreError::ProtocolError("no transport bound".to_string()))?;

        {
            let mut forwards = self.forwards.lock();
            forwards.insert(rule.remote_port, ForwardEntry::starting(rule.clone()));
        }
        self.publish(rule.remote_port);

        let result = handle_controller
            .tcpip_forward(&rule.remote_bind_address, rule.remote_port as u32)
            .await;

        match result {
            Ok(bound_port) => {
                {
                    let mut forwards = self.forwards.lock();
                    if let Some(entry) = forwards.get_mut(&rule.remote_port) {
                        entry.state = ForwardState::Active;
                        entry.bound_port = Some(bound_port);
                    }
                }
                info!(
                    remote_port = rule.remote_port,
                    bound_port, "remote forward active"
                );
                self.publish(rule.remote_port);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut forwards = self.forwards.lock();
                    if let Some(entry) = forwards.get_mut(&rule.remote_port) {
                        entry.state = ForwardState::Error;
                        entry.error_message = Some(message.clone());
                    }
                }
                warn!(remote_port = rule.remote_port, error = %message, "tcpip-forward request refused");
                self.publish(rule.remote_port);
                Err(CoreError::ProtocolError(message))
            }
        }
    }

    /// Stop a forward: cancel the server-side listener, abort every
    /// in-flight splice task for this port, and transition to Inactive.
    /// Idempotent — calling it on an Inactive or unknown port is a no-op.
    pub async fn stop(&self, remote_port: u16) {
        let (handle_controller, bind_address, bound_port, connections) = {
            let mut forwards = self.forwards.lock();
            let Some(entry) = forwards.get_mut(&remote_port) else {
                return;
            };
            if entry.state == ForwardState::Inactive {
                return;
            }
            entry.state = ForwardState::Inactive;
            entry.error_message = None;
            let connections = std::mem::take(&mut entry.connections);
            let bound_port = entry.bound_port.take();
            let bind_address = entry.rule.remote_bind_address.clone();
            (self.transport.read().clone(), bind_address, bound_port, connections)
        };

        for conn in connections {
            conn.abort();
        }

        if let (Some(handle_controller), Some(bound_port)) = (handle_controller, bound_port) {
            if let Err(e) = handle_controller
                .cancel_tcpip_forward(&bind_address, bound_port)
                .await
            {
                debug!(remote_port, error = %e, "cancel-tcpip-forward failed (transport likely already gone)");
            }
        }

        info!(remote_port, "remote forward stopped");
        self.publish(remote_port);
    }

    /// Start every enabled rule; returns the per-port outcome so the caller
    /// can tell which ones actually came up.
    pub async fn start_all(
        &self,
        rules: &[ForwardRule],
    ) -> HashMap<u16, Result<StartOutcome, CoreError>> {
        let mut results = HashMap::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            let outcome = self.start(rule.clone()).await;
            results.insert(rule.remote_port, outcome);
        }
        results
    }

    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.forwards.lock().keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }

    pub fn status(&self, remote_port: u16) -> Option<ForwardStatus> {
        self.forwards.lock().get(&remote_port).map(|e| e.to_status())
    }

    pub fn status_all(&self) -> Vec<ForwardStatus> {
        self.forwards.lock().values().map(|e| e.to_status()).collect()
    }

    fn publish(&self, remote_port: u16) {
        let Some(status) = self.status(remote_port) else {
            return;
        };
        self.events.send(ForwardEvent {
            rule: status.rule,
            state: status.state,
            error_message: status.error_message,
        });
    }
}

/// Routes every incoming forwarded channel to the splice task for its
/// destination port, for as long as the transport stays bound. Exits when
/// the channel's sender (owned by the `ClientHandler`) is dropped, i.e. on
/// session teardown.
async fn dispatch_loop(
    forwards: Arc<Mutex<HashMap<u16, ForwardEntry>>>,
    mut incoming_rx: mpsc::UnboundedReceiver<IncomingForward>,
) {
    while let Some(incoming) = incoming_rx.recv().await {
        let port = incoming.connected_port as u16;
        let target = {
            let forwards = forwards.lock();
            forwards.get(&port).and_then(|entry| {
                if entry.state == ForwardState::Active {
                    Some((entry.rule.local_port, Arc::clone(&entry.stats)))
                } else {
                    None
                }
            })
        };

        let Some((local_port, stats)) = target else {
            debug!(port, "no active forward for incoming connection; dropping channel");
            continue;
        };

        let channel = incoming.channel;
        let handle = tokio::spawn(async move {
            if let Err(e) = splice::splice(channel, local_port, stats).await {
                debug!(local_port, error = %e, "splice task ended with an error");
            }
        });

        let mut forwards = forwards.lock();
        if let Some(entry) = forwards.get_mut(&port) {
            entry.connections.retain(|h| !h.is_finished());
            entry.connections.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(remote_port: u16, local_port: u16) -> ForwardRule {
        ForwardRule::new(local_port, remote_port)
    }

    #[tokio::test]
    async fn start_without_transport_is_protocol_error() {
        let registry = ForwardRegistry::new();
        let err = registry.start(rule(12345, 8080)).await.unwrap_err();
        assert!(matches!(err, CoreError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn stop_on_unknown_port_is_a_noop() {
        let registry = ForwardRegistry::new();
        registry.stop(9999).await;
        assert!(registry.status(9999).is_none());
    }

    #[tokio::test]
    async fn status_all_starts_empty() {
        let registry = ForwardRegistry::new();
        assert!(registry.status_all().is_empty());
    }
}
