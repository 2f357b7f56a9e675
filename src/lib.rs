//! Reverse SSH tunnel client core.
//!
//! Establishes an authenticated SSH session to a configured server,
//! requests the server to listen on one or more remote ports, and splices
//! every connection accepted there back to a local TCP socket. The
//! [`supervisor::Supervisor`] drives reconnection with exponential backoff
//! whenever the session is lost.
//!
//! This crate owns the connection engine only; configuration persistence,
//! keyring access, and any UI are the embedder's job (see [`config`]).

pub mod config;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod session;
pub mod ssh;
pub mod supervisor;
