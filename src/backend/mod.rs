//! Backend process collaborator.
//!
//! The swap coordinator never starts or stops processes itself. It asks a
//! [`Backend`] to provision a fresh instance, load its build artifact, and
//! tear an old instance down.

mod process;

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::generation::GenerationId;

pub use process::ProcessBackend;

/// Where work for a generation is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// Address serving HTTP requests.
    pub http: SocketAddr,
    /// Address accepting sideband tunnel connections, if the backend has one.
    pub sideband: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(http: SocketAddr) -> Self {
        Self {
            http,
            sideband: None,
        }
    }

    pub fn with_sideband(mut self, sideband: SocketAddr) -> Self {
        self.sideband = Some(sideband);
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.http)
    }
}

/// Errors reported by a backend collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend process could not be started.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited before it became ready.
    #[error("Backend exited during startup: {status}")]
    Exited { status: String },

    /// The process never accepted connections.
    #[error("Backend at {addr} not ready after {waited_ms}ms")]
    NotReady { addr: SocketAddr, waited_ms: u64 },

    /// The build artifact could not be fetched.
    #[error("Failed to load artifact from {url}: {reason}")]
    ArtifactLoad { url: String, reason: String },

    /// Tearing the process down failed.
    #[error("Teardown failed: {reason}")]
    Teardown { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Starts, loads, and stops backend instances.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a fresh backend instance for `generation` and report where it
    /// listens.
    async fn provision(&self, generation: GenerationId) -> Result<Endpoint, BackendError>;

    /// Load the compiled build served by the instance at `endpoint`.
    async fn load_artifact(&self, endpoint: &Endpoint) -> Result<Artifact, BackendError>;

    /// Stop the instance at `endpoint`. Best effort: the coordinator logs
    /// failures and treats the instance as closed regardless.
    async fn teardown(&self, endpoint: &Endpoint) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_base_url() {
        let endpoint = Endpoint::new("127.0.0.1:4100".parse().unwrap());
        assert_eq!(endpoint.base_url(), "http://127.0.0.1:4100");
        assert!(endpoint.sideband.is_none());
    }

    #[test]
    fn test_endpoint_with_sideband() {
        let endpoint = Endpoint::new("127.0.0.1:4100".parse().unwrap())
            .with_sideband("127.0.0.1:4101".parse().unwrap());
        assert_eq!(endpoint.sideband, Some("127.0.0.1:4101".parse().unwrap()));
    }
}
