use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub swap: SwapConfig,
}

/// Default settings for upstream traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Time allowed for the backend to start answering a request, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    /// Connection timeout in seconds (default: 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
}

/// Front-door listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Primary HTTP endpoint (host:port).
    #[serde(default = "default_proxy_bind_addr")]
    pub bind_addr: String,
    /// Sideband tunnel endpoint (host:port). An empty string disables the
    /// tunnel.
    #[serde(default = "default_tunnel_bind_addr")]
    pub tunnel_bind_addr: Option<String>,
    /// Path prefix for the status and manual swap routes, e.g. "/__swapgate".
    #[serde(default)]
    pub admin_prefix: Option<String>,
}

/// How to run the backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable to run for each generation.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variable receiving the HTTP port (default: "PORT").
    #[serde(default = "default_port_env")]
    pub port_env: String,
    /// Variable receiving the sideband port. Unset means no sideband.
    #[serde(default)]
    pub sideband_port_env: Option<String>,
    /// How long a new process may take to accept connections.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u32,
    /// How long a killed process may take to exit.
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_seconds: u32,
    /// Path fetched to load the build artifact (default: "/").
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
}

/// Which trigger policies are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Start a swap when no generation is active.
    ColdStart,
    /// Start a swap on every Nth request.
    NthRequest,
    /// Start a swap when the request path contains `path_contains`.
    Path,
    /// Start a swap on the first request after a watched file changed.
    StaleSource,
}

/// Swap behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyKind>,
    /// N for the `nth_request` policy.
    #[serde(default)]
    pub nth_request: Option<u64>,
    /// Substring for the `path` policy.
    #[serde(default)]
    pub path_contains: Option<String>,
    /// Longest a request or connection is held before falling back to the
    /// current generation. Zero holds until a swap succeeds.
    #[serde(default = "default_hold_timeout_ms")]
    pub hold_timeout_ms: Option<u64>,
    /// Release held work to the old generation as soon as a swap fails.
    #[serde(default)]
    pub fallback_on_failure: bool,
    /// Longest retirement waits for in-flight work on the old generation.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Source paths watched for the `stale_source` policy.
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    /// Start a swap as soon as a watched file changes.
    #[serde(default)]
    pub eager_on_change: bool,
}

fn default_timeout() -> u32 {
    30
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_proxy_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_tunnel_bind_addr() -> Option<String> {
    Some("127.0.0.1:3001".to_string())
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_ready_timeout() -> u32 {
    30
}

fn default_teardown_timeout() -> u32 {
    5
}

fn default_artifact_path() -> String {
    "/".to_string()
}

fn default_policies() -> Vec<PolicyKind> {
    vec![PolicyKind::ColdStart]
}

fn default_hold_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_watch_debounce_ms() -> u64 {
    200
}

impl Defaults {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_seconds))
    }
}

impl ProxyConfig {
    /// The tunnel bind address, if the tunnel is enabled.
    pub fn tunnel_addr(&self) -> Option<&str> {
        self.tunnel_bind_addr
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
    }
}

impl BackendConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.ready_timeout_seconds))
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.teardown_timeout_seconds))
    }
}

impl SwapConfig {
    pub fn hold_timeout(&self) -> Option<Duration> {
        self.hold_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_proxy_bind_addr(),
            tunnel_bind_addr: default_tunnel_bind_addr(),
            admin_prefix: None,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            port_env: default_port_env(),
            sideband_port_env: None,
            ready_timeout_seconds: default_ready_timeout(),
            teardown_timeout_seconds: default_teardown_timeout(),
            artifact_path: default_artifact_path(),
        }
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            nth_request: None,
            path_contains: None,
            hold_timeout_ms: default_hold_timeout_ms(),
            fallback_on_failure: false,
            drain_timeout_ms: default_drain_timeout_ms(),
            watch_paths: Vec::new(),
            watch_debounce_ms: default_watch_debounce_ms(),
            eager_on_change: false,
        }
    }
}
