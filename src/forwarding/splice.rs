//! Per-connection byte pump between a forwarded SSH channel and a local
//! TCP socket.
//!
//! Grounded in `other_examples/008369e9_aitechnerd-sshore`'s use of
//! `Channel::into_stream()` plus `tokio::io::copy_bidirectional_with_sizes`,
//! which is simpler than hand-rolling the three-task mpsc relay the teacher
//! uses in `forwarding/remote.rs` for the same job, and gives the same
//! guarantee the design notes ask for: whichever direction hits EOF or an
//! error first closes both ends. The 32 KiB buffer size matches the
//! original `ssh_client.py`'s `recv(32768)` and the teacher's own
//! `vec![0u8; 32768]` relay buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use russh::client::Msg;
use russh::Channel;
use tokio::io::copy_bidirectional_with_sizes;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::CoreError;

/// Lock-free counters for one forward. `connection_count` only grows;
/// `active_connections` tracks concurrency. Read for status display, never
/// consulted for correctness.
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// A plain-data snapshot of [`ForwardStats`] for callers that want a value
/// they can hand to serde or compare in a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStatsSnapshot {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ForwardStatsSnapshot {
        ForwardStatsSnapshot {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Dial `127.0.0.1:local_port` and copy bytes in both directions until
/// either side closes. A failure to dial is reported to the caller so it
/// can log at debug and leave the forward's state untouched, per the
/// "LocalDialError does not alter forward state" rule.
pub async fn splice(
    channel: Channel<Msg>,
    local_port: u16,
    stats: Arc<ForwardStats>,
) -> Result<(), CoreError> {
    stats.connection_count.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = run_splice(channel, local_port, &stats).await;

    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn run_splice(
    channel: Channel<Msg>,
    local_port: u16,
    stats: &Arc<ForwardStats>,
) -> Result<(), CoreError> {
    let local_addr = format!("127.0.0.1:{local_port}");
    let mut local_stream = TcpStream::connect(&local_addr)
        .await
        .map_err(|e| CoreError::LocalDialError(format!("{local_addr}: {e}")))?;
    let _ = local_stream.set_nodelay(true);

    let mut channel_stream = channel.into_stream();

    match copy_bidirectional_with_sizes(
        &mut local_stream,
        &mut channel_stream,
        32 * 1024,
        32 * 1024,
    )
    .await
    {
        Ok((to_channel, to_local)) => {
            stats.bytes_sent.fetch_add(to_channel, Ordering::Relaxed);
            stats
                .bytes_received
                .fetch_add(to_local, Ordering::Relaxed);
            debug!(local_port, to_channel, to_local, "splice closed cleanly");
            Ok(())
        }
        Err(e) => {
            debug!(local_port, error = %e, "splice terminated with an error");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zero() {
        let stats = ForwardStats::new();
        assert_eq!(stats.snapshot(), ForwardStatsSnapshot::default());
    }

    #[tokio::test]
    async fn dial_failure_surfaces_local_dial_error() {
        let stats = Arc::new(ForwardStats::new());
        // Port 0 never has a listener; connecting to it fails immediately.
        let err = TcpStream::connect("127.0.0.1:0").await.unwrap_err();
        let wrapped = CoreError::LocalDialError(format!("127.0.0.1:0: {err}"));
        assert!(matches!(wrapped, CoreError::LocalDialError(_)));
        let _ = stats;
    }
}
