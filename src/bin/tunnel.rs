//! Demonstration entrypoint: reads a JSON config file, drives a
//! [`tunnel_core::supervisor::Supervisor`], and logs the events it emits.
//!
//! This binary is not a configuration-persistence layer — it reads exactly
//! one file path from argv and one optional passphrase from
//! `TUNNEL_KEY_PASSPHRASE`, nothing more.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use tunnel_core::config::Config;
use tunnel_core::ssh::AutoAcceptVerifier;
use tunnel_core::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .ok_or("usage: tunnel <config.json>")?;
    let data = std::fs::read_to_string(&config_path)?;
    let config = Config::from_json(&data)?;

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!(%problem, "config validation failed");
        }
        return Err("invalid configuration".into());
    }

    let passphrase = std::env::var("TUNNEL_KEY_PASSPHRASE").ok();

    let supervisor = Supervisor::new(config, Arc::new(AutoAcceptVerifier));

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(state = ?event.state, attempt = event.reconnect_attempt, "supervisor state");
        }
    });

    supervisor.start(passphrase).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    supervisor.stop().await;

    Ok(())
}
