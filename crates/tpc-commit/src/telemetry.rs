//! Tracing setup
//!
//! `RUST_LOG` wins over the configured filter when it is set.

use crate::error::{CommitError, Result};
use tracing_subscriber::EnvFilter;

fn env_filter(default_filter: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| CommitError::config(format!("invalid log filter {default_filter:?}: {e}"))),
    }
}

/// Install the global fmt subscriber
///
/// # Errors
/// Returns [`CommitError::Config`] for an invalid filter or when a global
/// subscriber is already installed.
pub fn try_init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter)?)
        .with_target(true)
        .try_init()
        .map_err(|e| CommitError::config(e.to_string()))
}

/// Install the global fmt subscriber, ignoring a second installation
pub fn init_tracing(default_filter: &str) {
    if let Err(err) = try_init_tracing(default_filter) {
        tracing::debug!("Tracing not initialized: {}", err);
    }
}
