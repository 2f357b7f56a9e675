//! Reverse port forwarding.
//!
//! Requests a listener on the server for each enabled [`crate::config::ForwardRule`],
//! accepts the `forwarded-tcpip` channels the server opens against it, and
//! splices each one to a local TCP socket.

mod events;
pub mod registry;
pub mod splice;

pub use events::ForwardEvent;
pub use registry::ForwardRegistry;
pub use splice::ForwardStats;

use russh::client::Msg;
use russh::Channel;

/// Current lifecycle state of one forward, keyed by `remote_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Inactive,
    Starting,
    Active,
    Error,
}

/// One `forwarded-tcpip` channel the server opened, handed from the
/// [`crate::ssh::client::ClientHandler`] callback to whichever task is
/// dispatching incoming forwards — there is no global registry; the
/// channel's `Sender` half is handed to the handler at `bind_transport`
/// time by [`ForwardRegistry`].
pub struct IncomingForward {
    pub channel: Channel<Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}
