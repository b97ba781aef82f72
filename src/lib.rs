//! saber -- reliability benchmark for Galaxy servers and their compute endpoints.
//!
//! A run submits one canned workflow per (server, endpoint) pair, follows it
//! through upload and execution, and tallies where each job ended up.

pub mod config;
pub mod engine;
pub mod fsio;
pub mod galaxy;
pub mod logging;
pub mod report;
pub mod secrets;

use std::path::Path;

use anyhow::{Context, Result};

/// Read (and decrypt if needed) the settings file, then resolve it.
pub fn load_configuration(path: &Path, password: Option<&str>) -> Result<config::Configuration> {
    let text = secrets::load_settings(path, password)
        .with_context(|| format!("could not load settings from {}", path.display()))?;
    let settings = config::Settings::parse(&text)?;
    let configuration = config::resolve(&settings, Some(path))?;
    tracing::info!(
        path = %path.display(),
        servers = configuration.servers.len(),
        "settings loaded"
    );
    Ok(configuration)
}
