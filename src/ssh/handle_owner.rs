//! Single-owner task for the `russh` client `Handle`.
//!
//! `russh::client::Handle<H>` is not meant to be shared behind a lock from
//! many call sites — the idiomatic shape is one task that owns it for its
//! entire lifetime, with every other part of the crate talking to that task
//! over a command channel. `HandleController` is the cheaply cloneable front
//! end for that channel; `spawn_handle_owner_task` starts the task and
//! returns the controller.

use russh::client::Handle;
use russh::Disconnect as RusshDisconnect;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::error::CoreError;
use crate::ssh::client::ClientHandler;

/// Result of a liveness probe. `Timeout` and `IoError` are both treated as
/// session loss by the Supervisor, but are logged differently: a timeout
/// may be transient congestion, an I/O error means the socket is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    Timeout,
    IoError,
}

enum HandleCommand {
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },
    Disconnect,
}

/// Cloneable front for the handle-owner task. Every clone shares the same
/// underlying `Handle`; cloning is cheap (an `mpsc::Sender` clone).
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| CoreError::NetError("session owner task is gone".to_string()))?;

        reply_rx
            .await
            .map_err(|_| CoreError::NetError("session owner task dropped the reply".to_string()))?
            .map_err(CoreError::from)
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| CoreError::NetError("session owner task is gone".to_string()))?;

        reply_rx
            .await
            .map_err(|_| CoreError::NetError("session owner task dropped the reply".to_string()))?
            .map_err(CoreError::from)
    }

    /// The liveness probe behind `Session::probe`.
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.try_send(HandleCommand::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the owner task for `handle` and return a controller for it. The
/// task runs until every `HandleController` clone (and the `cmd_tx` inside
/// it) is dropped, or a `Disconnect` command is received.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, host: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
    let (disconnect_tx, _) = broadcast::channel(1);
    let controller = HandleController {
        cmd_tx,
        disconnect_tx: disconnect_tx.clone(),
    };

    tokio::spawn(async move {
        let mut handle = handle;
        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.tcpip_forward(&address, port).await;
                    let bound_port = result.as_ref().ok().copied();
                    if reply_tx.send(result).is_err() {
                        // Caller disappeared but the forward is live on the
                        // wire; cancel it so it doesn't leak an orphaned
                        // server-side listener with no local consumer.
                        if let Some(bound_port) = bound_port {
                            let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                        }
                    }
                }
                Some(HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }
                Some(HandleCommand::Ping { reply_tx }) => {
                    let result = match tokio::time::timeout(
                        Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(_)) => PingResult::IoError,
                        Err(_) => PingResult::Timeout,
                    };
                    let _ = reply_tx.send(result);
                }
                Some(HandleCommand::Disconnect) | None => break,
            }
        }

        info!(%host, "session owner task shutting down");
        let _ = disconnect_tx.send(());
        let _ = handle
            .disconnect(RusshDisconnect::ByApplication, "session closed", "en")
            .await;
    });

    controller
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_result_equality() {
        assert_eq!(PingResult::Ok, PingResult::Ok);
        assert_ne!(PingResult::Ok, PingResult::Timeout);
    }
}
