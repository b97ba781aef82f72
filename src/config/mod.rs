//! Settings file model for the benchmark.
//!
//! The file is layered: global keys act as defaults for every server, server
//! tables override them, and endpoint tables override the timing keys of their
//! server. [`resolve`] flattens the layers into the immutable [`Configuration`]
//! the engine runs from.

pub mod example;
pub mod resolve;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use resolve::{
    resolve, CleanPolicy, Configuration, Credentials, DataInput, Endpoint, Server, Timing,
};

/// Name under which the server's local compute resource is tested.
pub const DEFAULT_ENDPOINT: &str = "Default";

/// Alias accepted in endpoint lists for [`DEFAULT_ENDPOINT`].
pub const NONE_ENDPOINT: &str = "None";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing parameter `{parameter}` (searched {chain})")]
    MissingParameter {
        parameter: &'static str,
        chain: String,
    },

    #[error("server `{server}` has no workflow reference (ga_path)")]
    MissingWorkflow { server: String },

    #[error("server `{server}` declares no endpoints and no default_compute_id")]
    NoEndpoints { server: String },

    #[error("server `{server}` needs an API key or an email/password pair")]
    MissingCredentials { server: String },

    #[error("server name `{server}` is used more than once")]
    DuplicateServer { server: String },

    #[error("no servers configured")]
    NoServers,

    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub servers: Vec<ServerSettings>,
    /// Date label for report headers.
    #[serde(default)]
    pub date_string: Option<DateString>,
    #[serde(flatten)]
    pub shared: SharedSettings,
}

impl Settings {
    /// Parse a settings file. Unknown keys are ignored with a warning.
    pub fn parse(content: &str) -> Result<Self, ConfigurationError> {
        let settings = toml::from_str(content)?;
        for key in unknown_keys(content) {
            warn!(key = %key, "unknown settings key ignored");
        }
        Ok(settings)
    }
}

const ROOT_KEYS: &[&str] = &["servers", "date_string"];
const SHARED_KEYS: &[&str] = &[
    "ga_path",
    "data_inputs",
    "default_compute_id",
    "clean_history",
    "history_name",
    "delete_after",
    "maxwait",
    "interval",
    "timeout",
    "sleep_time",
];
const SERVER_KEYS: &[&str] = &["name", "url", "api", "email", "password", "endpoints"];
const ENDPOINT_KEYS: &[&str] = &["name", "maxwait", "interval", "timeout", "sleep_time"];
const DATA_INPUT_KEYS: &[&str] = &["url", "file_type"];

fn collect_unknown(table: &toml::Table, allowed: &[&[&str]], prefix: &str, out: &mut Vec<String>) {
    for key in table.keys() {
        if !allowed.iter().any(|keys| keys.contains(&key.as_str())) {
            out.push(format!("{prefix}{key}"));
        }
    }
    if let Some(inputs) = table.get("data_inputs").and_then(toml::Value::as_table) {
        for (label, input) in inputs {
            if let Some(input) = input.as_table() {
                collect_unknown(input, &[DATA_INPUT_KEYS], &format!("{prefix}data_inputs.{label}."), out);
            }
        }
    }
}

/// Dotted paths of keys the settings model does not read, e.g.
/// `servers[0].endpoints[1].timout`. Unparseable content yields nothing.
pub fn unknown_keys(content: &str) -> Vec<String> {
    let Ok(root) = content.parse::<toml::Table>() else {
        return Vec::new();
    };
    let mut unknown = Vec::new();
    collect_unknown(&root, &[ROOT_KEYS, SHARED_KEYS], "", &mut unknown);

    let servers = root.get("servers").and_then(toml::Value::as_array);
    for (i, server) in servers.into_iter().flatten().enumerate() {
        let Some(server) = server.as_table() else {
            continue;
        };
        let prefix = format!("servers[{i}].");
        collect_unknown(server, &[SERVER_KEYS, SHARED_KEYS], &prefix, &mut unknown);

        let endpoints = server.get("endpoints").and_then(toml::Value::as_array);
        for (j, endpoint) in endpoints.into_iter().flatten().enumerate() {
            if let Some(endpoint) = endpoint.as_table() {
                collect_unknown(
                    endpoint,
                    &[ENDPOINT_KEYS],
                    &format!("{prefix}endpoints[{j}]."),
                    &mut unknown,
                );
            }
        }
    }
    unknown
}

/// `true` stamps reports with the run date, a string replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateString {
    Flag(bool),
    Text(String),
}

/// Keys that may appear globally and be overridden per server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedSettings {
    pub ga_path: Option<PathBuf>,
    pub data_inputs: Option<BTreeMap<String, DataInputSettings>>,
    pub default_compute_id: Option<String>,
    pub clean_history: Option<String>,
    pub history_name: Option<String>,
    /// Age in days after which leftover test histories are purged.
    pub delete_after: Option<u64>,
    #[serde(flatten)]
    pub timing: TimingSettings,
}

/// Polling parameters, in seconds. Any scope may leave any of them unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    pub maxwait: Option<u64>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub sleep_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInputSettings {
    pub url: String,
    pub file_type: String,
}

/// One `[[servers]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
    #[serde(flatten)]
    pub overrides: SharedSettings,
}

/// An endpoint is either a bare name or a table with timing overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointEntry {
    Name(String),
    Detailed(EndpointSettings),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub name: String,
    #[serde(flatten)]
    pub timing: TimingSettings,
}

impl EndpointEntry {
    pub fn name(&self) -> &str {
        match self {
            EndpointEntry::Name(name) => name,
            EndpointEntry::Detailed(endpoint) => &endpoint.name,
        }
    }

    pub fn timing(&self) -> TimingSettings {
        match self {
            EndpointEntry::Name(_) => TimingSettings::default(),
            EndpointEntry::Detailed(endpoint) => endpoint.timing,
        }
    }
}

/// `$HOME/.config/saber/settings.toml`
pub fn default_settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("saber")
        .join("settings.toml")
}
