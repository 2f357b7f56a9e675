//! SSH transport: connect/authenticate, the single-owner `Handle` task, and
//! host key verification.

pub mod client;
pub mod handle_owner;
pub mod known_hosts;

pub use client::{connect, ClientHandler, KeyAlgorithm};
pub use handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
pub use known_hosts::{
    compute_fingerprint, AutoAcceptVerifier, HostKeyVerification, HostKeyVerifier,
    SessionKnownHosts,
};
