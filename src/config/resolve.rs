//! Flattening of layered settings into per-endpoint effective parameters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::{
    ConfigurationError, DateString, EndpointEntry, ServerSettings, Settings, TimingSettings,
    DEFAULT_ENDPOINT, NONE_ENDPOINT,
};

const DEFAULT_HISTORY_NAME: &str = "SABER";
const DEFAULT_DELETE_AFTER_DAYS: u64 = 5;

/// Immutable view of everything a run needs.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub servers: Vec<Server>,
    pub date_string: Option<DateString>,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
}

impl Configuration {
    /// Server name to base URL, for reporting.
    pub fn urls(&self) -> BTreeMap<String, String> {
        self.servers
            .iter()
            .map(|s| (s.name.clone(), s.url.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub url: String,
    pub credentials: Credentials,
    pub workflow: PathBuf,
    pub data_inputs: BTreeMap<String, DataInput>,
    /// Compute id selected for the `Default` endpoint.
    pub default_compute_id: String,
    pub clean_history: CleanPolicy,
    pub history_name: String,
    pub delete_after_days: u64,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone)]
pub enum Credentials {
    ApiKey(String),
    Basic { email: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => write!(f, "ApiKey(***)"),
            Credentials::Basic { email, .. } => write!(f, "Basic({email}, ***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInput {
    pub url: String,
    pub file_type: String,
}

/// A compute target of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    /// Value written into the user's remote-resource preference.
    pub compute_id: String,
    pub timing: Timing,
}

impl Endpoint {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_ENDPOINT
    }
}

/// Fully resolved polling parameters for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timing {
    /// Upload phase budget.
    pub maxwait: Duration,
    /// Upload phase poll cadence.
    pub interval: Duration,
    /// Execution phase budget.
    pub timeout: Duration,
    /// Execution phase poll cadence.
    pub sleep_time: Duration,
}

/// What to do with test histories once a server has been benchmarked.
///
/// `SuccessfulOnly` keeps the histories but purges the outputs of every
/// successful job as soon as it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CleanPolicy {
    Never,
    Always,
    OnSuccess,
    SuccessfulOnly,
}

impl CleanPolicy {
    /// Unknown values fall back to [`CleanPolicy::OnSuccess`].
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "never" => CleanPolicy::Never,
            "always" => CleanPolicy::Always,
            "onsuccess" => CleanPolicy::OnSuccess,
            "successful_only" => CleanPolicy::SuccessfulOnly,
            other => {
                warn!(value = %other, "unknown clean_history value, using onsuccess");
                CleanPolicy::OnSuccess
            }
        }
    }

    /// Whether histories should be purged given the server's results.
    pub fn should_purge(self, had_failures: bool) -> bool {
        match self {
            CleanPolicy::Never | CleanPolicy::SuccessfulOnly => false,
            CleanPolicy::Always => true,
            CleanPolicy::OnSuccess => !had_failures,
        }
    }

    /// Whether outputs of successful jobs are purged instead of tagged.
    pub fn purges_successful_outputs(self) -> bool {
        self == CleanPolicy::SuccessfulOnly
    }
}

/// Resolve layered settings into the run configuration.
///
/// `source` is the settings file path; relative workflow references are
/// looked up next to it before falling back to the working directory.
pub fn resolve(settings: &Settings, source: Option<&Path>) -> Result<Configuration, ConfigurationError> {
    if settings.servers.is_empty() {
        return Err(ConfigurationError::NoServers);
    }
    let mut names = std::collections::BTreeSet::new();
    for server in &settings.servers {
        if !names.insert(server.name.as_str()) {
            return Err(ConfigurationError::DuplicateServer {
                server: server.name.clone(),
            });
        }
    }

    let servers = settings
        .servers
        .iter()
        .map(|server| resolve_server(settings, server, source))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Configuration {
        servers,
        date_string: settings.date_string.clone(),
        source: source.map(Path::to_path_buf),
    })
}

fn resolve_server(
    settings: &Settings,
    server: &ServerSettings,
    source: Option<&Path>,
) -> Result<Server, ConfigurationError> {
    let global = &settings.shared;
    let local = &server.overrides;

    let credentials = match (&server.api, &server.email, &server.password) {
        (Some(key), _, _) => Credentials::ApiKey(key.clone()),
        (None, Some(email), Some(password)) => Credentials::Basic {
            email: email.clone(),
            password: password.clone(),
        },
        _ => {
            return Err(ConfigurationError::MissingCredentials {
                server: server.name.clone(),
            })
        }
    };

    let ga_path = local
        .ga_path
        .as_ref()
        .or(global.ga_path.as_ref())
        .ok_or_else(|| ConfigurationError::MissingWorkflow {
            server: server.name.clone(),
        })?;

    let data_inputs: BTreeMap<String, DataInput> = local
        .data_inputs
        .as_ref()
        .or(global.data_inputs.as_ref())
        .map(|inputs| {
            inputs
                .iter()
                .map(|(label, input)| {
                    (
                        label.clone(),
                        DataInput {
                            url: input.url.clone(),
                            file_type: input.file_type.clone(),
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    if data_inputs.is_empty() {
        warn!(server = %server.name, "no data_inputs configured, the workflow runs without inputs");
    }

    let explicit_default = local
        .default_compute_id
        .as_ref()
        .or(global.default_compute_id.as_ref());
    if server.endpoints.is_empty() && explicit_default.is_none() {
        return Err(ConfigurationError::NoEndpoints {
            server: server.name.clone(),
        });
    }
    let default_compute_id = explicit_default
        .cloned()
        .unwrap_or_else(|| NONE_ENDPOINT.to_string());

    let endpoints = resolve_endpoints(
        &server.name,
        &server.endpoints,
        &default_compute_id,
        &local.timing,
        &global.timing,
    )?;

    let clean_history = local
        .clean_history
        .as_deref()
        .or(global.clean_history.as_deref())
        .map(CleanPolicy::from_setting)
        .unwrap_or(CleanPolicy::OnSuccess);

    let resolved = Server {
        name: server.name.clone(),
        url: server.url.trim_end_matches('/').to_string(),
        credentials,
        workflow: locate_workflow(ga_path, source),
        data_inputs,
        default_compute_id,
        clean_history,
        history_name: local
            .history_name
            .clone()
            .or_else(|| global.history_name.clone())
            .unwrap_or_else(|| DEFAULT_HISTORY_NAME.to_string()),
        delete_after_days: local
            .delete_after
            .or(global.delete_after)
            .unwrap_or(DEFAULT_DELETE_AFTER_DAYS),
        endpoints,
    };
    debug!(server = %resolved.name, endpoints = resolved.endpoints.len(), "resolved server");
    Ok(resolved)
}

/// The `Default` endpoint is always present exactly once; `None` is its alias.
/// When it is not listed it is tested first.
fn resolve_endpoints(
    server: &str,
    entries: &[EndpointEntry],
    default_compute_id: &str,
    server_timing: &TimingSettings,
    global_timing: &TimingSettings,
) -> Result<Vec<Endpoint>, ConfigurationError> {
    let mut endpoints: Vec<Endpoint> = Vec::with_capacity(entries.len() + 1);

    for entry in entries {
        let name = canonical_name(entry.name());
        if endpoints.iter().any(|e| e.name == name) {
            warn!(server = %server, endpoint = %name, "endpoint listed twice, keeping the first entry");
            continue;
        }
        let compute_id = if name == DEFAULT_ENDPOINT {
            default_compute_id.to_string()
        } else {
            name.clone()
        };
        let timing = resolve_timing(server, &name, &entry.timing(), server_timing, global_timing)?;
        endpoints.push(Endpoint {
            name,
            compute_id,
            timing,
        });
    }

    if !endpoints.iter().any(Endpoint::is_default) {
        let timing = resolve_timing(
            server,
            DEFAULT_ENDPOINT,
            &TimingSettings::default(),
            server_timing,
            global_timing,
        )?;
        endpoints.insert(
            0,
            Endpoint {
                name: DEFAULT_ENDPOINT.to_string(),
                compute_id: default_compute_id.to_string(),
                timing,
            },
        );
    }

    Ok(endpoints)
}

fn canonical_name(name: &str) -> String {
    if name == NONE_ENDPOINT {
        DEFAULT_ENDPOINT.to_string()
    } else {
        name.to_string()
    }
}

fn resolve_timing(
    server: &str,
    endpoint: &str,
    local: &TimingSettings,
    server_timing: &TimingSettings,
    global: &TimingSettings,
) -> Result<Timing, ConfigurationError> {
    let pick = |parameter: &'static str,
                get: fn(&TimingSettings) -> Option<u64>|
     -> Result<Duration, ConfigurationError> {
        get(local)
            .or_else(|| get(server_timing))
            .or_else(|| get(global))
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigurationError::MissingParameter {
                parameter,
                chain: format!("endpoint `{endpoint}` -> server `{server}` -> global"),
            })
    };

    Ok(Timing {
        maxwait: pick("maxwait", |t| t.maxwait)?,
        interval: pick("interval", |t| t.interval)?,
        timeout: pick("timeout", |t| t.timeout)?,
        sleep_time: pick("sleep_time", |t| t.sleep_time)?,
    })
}

/// Expand `~` and anchor relative paths at the settings directory, then the
/// working directory. A path that exists nowhere is returned as given and
/// reported at submission time.
fn locate_workflow(ga_path: &Path, source: Option<&Path>) -> PathBuf {
    let expanded = match ga_path.strip_prefix("~") {
        Ok(rest) => match std::env::var("HOME") {
            Ok(home) => Path::new(&home).join(rest),
            Err(_) => ga_path.to_path_buf(),
        },
        Err(_) => ga_path.to_path_buf(),
    };
    if expanded.is_absolute() {
        return expanded;
    }

    let beside_settings = source
        .and_then(Path::parent)
        .map(|dir| dir.join(&expanded));
    if let Some(candidate) = beside_settings.filter(|p| p.exists()) {
        return candidate;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(&expanded);
        if candidate.exists() {
            return candidate;
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings(extra: &str) -> Settings {
        let toml_str = format!(
            r#"
ga_path = "/tmp/wf.ga"
maxwait = 100
interval = 5
timeout = 600
sleep_time = 5

{extra}
"#
        );
        Settings::parse(&toml_str).unwrap()
    }

    #[test]
    fn test_server_overrides_global_timeout() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example/"
api = "key"
timeout = 300
endpoints = ["cluster-A"]
"#,
        );
        let config = resolve(&settings, None).unwrap();
        let server = &config.servers[0];
        let cluster = server.endpoints.iter().find(|e| e.name == "cluster-A").unwrap();

        assert_eq!(cluster.timing.timeout, Duration::from_secs(300));
        assert_eq!(cluster.timing.maxwait, Duration::from_secs(100));
        assert_eq!(server.url, "https://usegalaxy.example");
    }

    #[test]
    fn test_endpoint_overrides_server_and_global() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
timeout = 300
endpoints = [{ name = "cluster-A", timeout = 30, interval = 1 }]
"#,
        );
        let config = resolve(&settings, None).unwrap();
        let cluster = &config.servers[0].endpoints[1];

        assert_eq!(cluster.name, "cluster-A");
        assert_eq!(cluster.timing.timeout, Duration::from_secs(30));
        assert_eq!(cluster.timing.interval, Duration::from_secs(1));
        assert_eq!(cluster.timing.sleep_time, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_parameter_names_scope_chain() {
        let settings = Settings::parse(
            r#"
ga_path = "/tmp/wf.ga"
maxwait = 100
interval = 5
sleep_time = 5

[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
endpoints = ["cluster-A"]
"#,
        )
        .unwrap();

        let err = resolve(&settings, None).unwrap_err();
        match err {
            ConfigurationError::MissingParameter { parameter, chain } => {
                assert_eq!(parameter, "timeout");
                assert!(chain.contains("server `Main`"));
                assert!(chain.contains("global"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_default_endpoint_is_implicit_and_first() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
default_compute_id = "local"
endpoints = ["cluster-A"]
"#,
        );
        let config = resolve(&settings, None).unwrap();
        let names: Vec<_> = config.servers[0].endpoints.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["Default", "cluster-A"]);
        assert_eq!(config.servers[0].endpoints[0].compute_id, "local");
    }

    #[test]
    fn test_explicit_default_and_none_alias_unified() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
endpoints = ["cluster-A", "Default", "None"]
"#,
        );
        let config = resolve(&settings, None).unwrap();
        let names: Vec<_> = config.servers[0].endpoints.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["cluster-A", "Default"]);
        assert_eq!(config.servers[0].endpoints[1].compute_id, "None");
    }

    #[test]
    fn test_missing_workflow_rejected() {
        let settings = Settings::parse(
            r#"
maxwait = 1
interval = 1
timeout = 1
sleep_time = 1

[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
endpoints = ["cluster-A"]
"#,
        )
        .unwrap();

        assert!(matches!(
            resolve(&settings, None),
            Err(ConfigurationError::MissingWorkflow { .. })
        ));
    }

    #[test]
    fn test_no_endpoints_without_default_compute_rejected() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
"#,
        );
        assert!(matches!(
            resolve(&settings, None),
            Err(ConfigurationError::NoEndpoints { .. })
        ));
    }

    #[test]
    fn test_no_endpoints_with_default_compute_tests_default_only() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "key"
default_compute_id = "None"
"#,
        );
        let config = resolve(&settings, None).unwrap();
        assert_eq!(config.servers[0].endpoints.len(), 1);
        assert!(config.servers[0].endpoints[0].is_default());
    }

    #[test]
    fn test_credentials_required() {
        let settings = base_settings(
            r#"
[[servers]]
name = "Main"
url = "https://usegalaxy.example"
email = "someone@example.org"
endpoints = ["cluster-A"]
"#,
        );
        assert!(matches!(
            resolve(&settings, None),
            Err(ConfigurationError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn test_no_servers_rejected() {
        let settings = base_settings("");
        assert!(matches!(
            resolve(&settings, None),
            Err(ConfigurationError::NoServers)
        ));
    }

    #[test]
    fn test_relative_workflow_found_beside_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("test.ga"), "{}").unwrap();
        let settings_path = dir.path().join("settings.toml");

        let found = locate_workflow(Path::new("test.ga"), Some(&settings_path));
        assert_eq!(found, dir.path().join("test.ga"));

        let missing = locate_workflow(Path::new("absent.ga"), Some(&settings_path));
        assert_eq!(missing, PathBuf::from("absent.ga"));
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let settings = Settings::parse(
            r#"
ga_path = "wf.ga"

[[servers]]
name = "Main"
url = "https://one.example"
api = "a"

[[servers]]
name = "Main"
url = "https://two.example"
api = "b"
"#,
        )
        .unwrap();
        let err = resolve(&settings, None).unwrap_err();
        assert!(
            matches!(&err, ConfigurationError::DuplicateServer { server } if server == "Main"),
            "{err}"
        );
    }

    #[test]
    fn test_clean_policy_parsing() {
        assert_eq!(CleanPolicy::from_setting("never"), CleanPolicy::Never);
        assert_eq!(CleanPolicy::from_setting("Always"), CleanPolicy::Always);
        assert_eq!(
            CleanPolicy::from_setting("successful_only"),
            CleanPolicy::SuccessfulOnly
        );
        assert_eq!(CleanPolicy::from_setting("bogus"), CleanPolicy::OnSuccess);

        assert!(CleanPolicy::OnSuccess.should_purge(false));
        assert!(!CleanPolicy::OnSuccess.should_purge(true));
        assert!(CleanPolicy::Always.should_purge(true));
        assert!(!CleanPolicy::Never.should_purge(false));
        assert!(!CleanPolicy::SuccessfulOnly.should_purge(false));
        assert!(CleanPolicy::SuccessfulOnly.purges_successful_outputs());
        assert!(!CleanPolicy::OnSuccess.purges_successful_outputs());
    }
}
