//! Backend collaborator that runs the dev server as a child process.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use super::{Backend, BackendError, Endpoint};
use crate::artifact::Artifact;
use crate::config::BackendConfig;
use crate::generation::GenerationId;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest response body used verbatim as a build id.
const MAX_LITERAL_BUILD_ID: usize = 64;

/// Reserve a free loopback port.
///
/// The port is released before returning, so another process could claim
/// it first; the backend's readiness check surfaces that as a startup
/// failure.
fn free_port() -> std::io::Result<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawns one child process per generation.
///
/// Each child gets fresh loopback ports through the configured environment
/// variables. Children are keyed by their HTTP address so teardown can find
/// them from the endpoint alone.
pub struct ProcessBackend {
    config: BackendConfig,
    client: Client,
    children: Mutex<HashMap<SocketAddr, Child>>,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig, connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            config,
            client,
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Number of child processes currently tracked.
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn provision(&self, generation: GenerationId) -> Result<Endpoint, BackendError> {
        let http = SocketAddr::from(([127, 0, 0, 1], free_port()?));
        let mut endpoint = Endpoint::new(http);

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env(&self.config.port_env, http.port().to_string())
            .env("SWAPGATE_GENERATION", generation.0.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        if let Some(var) = &self.config.sideband_port_env {
            let sideband = SocketAddr::from(([127, 0, 0, 1], free_port()?));
            command.env(var, sideband.port().to_string());
            endpoint = endpoint.with_sideband(sideband);
        }

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        tracing::info!(
            generation = %generation,
            pid = ?child.id(),
            http = %http,
            sideband = ?endpoint.sideband,
            "Backend process spawned"
        );

        if let Err(err) = wait_until_ready(&mut child, http, self.config.ready_timeout()).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        self.children.lock().insert(http, child);
        Ok(endpoint)
    }

    async fn load_artifact(&self, endpoint: &Endpoint) -> Result<Artifact, BackendError> {
        let url = format!("{}{}", endpoint.base_url(), self.config.artifact_path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::ArtifactLoad {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::ArtifactLoad {
                url,
                reason: format!("status {}", status),
            });
        }

        let body = response.text().await.map_err(|e| BackendError::ArtifactLoad {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        Ok(Artifact::new(build_id_from(&body), endpoint.base_url()))
    }

    async fn teardown(&self, endpoint: &Endpoint) -> Result<(), BackendError> {
        let tracked = self.children.lock().remove(&endpoint.http);
        let Some(mut child) = tracked else {
            tracing::debug!(http = %endpoint.http, "No process tracked for endpoint");
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(http = %endpoint.http, %status, "Backend process already exited");
            return Ok(());
        }

        child.start_kill().map_err(|e| BackendError::Teardown {
            reason: e.to_string(),
        })?;

        match tokio::time::timeout(self.config.teardown_timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(http = %endpoint.http, %status, "Backend process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(BackendError::Teardown {
                reason: e.to_string(),
            }),
            Err(_) => Err(BackendError::Teardown {
                reason: format!(
                    "process did not exit within {}s",
                    self.config.teardown_timeout_seconds
                ),
            }),
        }
    }
}

async fn wait_until_ready(
    child: &mut Child,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(), BackendError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(BackendError::Exited {
                status: status.to_string(),
            });
        }
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(BackendError::NotReady {
                addr,
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Derive a build id from the artifact response body.
///
/// Short single-token bodies are used as-is; anything else is hashed.
fn build_id_from(body: &str) -> String {
    let trimmed = body.trim();
    if !trimmed.is_empty()
        && trimmed.len() <= MAX_LITERAL_BUILD_ID
        && !trimmed.contains(char::is_whitespace)
    {
        return trimmed.to_string();
    }

    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
