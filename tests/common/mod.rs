//! Shared test utilities and mock infrastructure.

#![allow(dead_code, unused_imports)]

pub mod mock_backend;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swapgate::config::{Config, PolicyKind};
use swapgate::gate::RequestGate;
use swapgate::proxy::ProxyServer;
use swapgate::swap::policy::build_policy;
use swapgate::swap::{StaleFlag, SwapCoordinator, SwapSettings};
use swapgate::tunnel::TunnelProxy;
use tempfile::TempDir;

use mock_backend::ScriptedBackend;

/// Find an available port for testing.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to free port");
    listener.local_addr().unwrap().port()
}

/// Write `content` to a config file in a fresh temp dir.
pub fn temp_config(content: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, content).expect("Failed to write config");
    (temp_dir, config_path)
}

/// Wait for a server to become available.
pub async fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn coordinator(backend: Arc<ScriptedBackend>) -> Arc<SwapCoordinator> {
    coordinator_with(backend, SwapSettings::default())
}

pub fn coordinator_with(
    backend: Arc<ScriptedBackend>,
    settings: SwapSettings,
) -> Arc<SwapCoordinator> {
    Arc::new(SwapCoordinator::new(backend, settings))
}

/// Config for an in-process proxy on free loopback ports.
pub fn test_config(policies: Vec<PolicyKind>) -> Config {
    let mut config = Config::default();
    config.defaults.timeout_seconds = 5;
    config.defaults.connect_timeout_seconds = 2;
    config.proxy.bind_addr = format!("127.0.0.1:{}", free_port());
    config.proxy.tunnel_bind_addr = Some(format!("127.0.0.1:{}", free_port()));
    config.proxy.admin_prefix = Some("/_swapgate".to_string());
    config.backend.command = "unused".to_string();
    config.swap.policies = policies;
    config.swap.drain_timeout_ms = 500;
    config
}

/// A running proxy wired to `backend`.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub tunnel_addr: Option<SocketAddr>,
    pub coordinator: Arc<SwapCoordinator>,
    pub stale: StaleFlag,
    pub handle: swapgate::proxy::ProxyHandle,
}

impl TestProxy {
    pub async fn start(config: &Config, backend: Arc<ScriptedBackend>) -> Self {
        let coordinator = coordinator_with(backend, SwapSettings::from(&config.swap));
        let stale = StaleFlag::new();
        let gate = Arc::new(RequestGate::new(
            coordinator.clone(),
            build_policy(&config.swap, &stale),
            config.swap.hold_timeout(),
        ));
        let tunnel = Arc::new(TunnelProxy::new(
            coordinator.clone(),
            config.defaults.connect_timeout(),
            config.swap.hold_timeout(),
        ));

        let mut server = ProxyServer::new(config, gate, tunnel).unwrap();
        let addr = server.try_bind().await.unwrap();
        let tunnel_addr = server.tunnel_addr;
        let handle = server.handle();

        tokio::spawn(async move {
            let _ = server.run().await;
        });
        assert!(wait_for_server(addr, Duration::from_secs(2)).await);

        Self {
            addr,
            tunnel_addr,
            coordinator,
            stale,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
