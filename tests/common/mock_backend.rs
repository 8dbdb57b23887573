//! Scripted backend collaborator and mock generation servers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use swapgate::artifact::Artifact;
use swapgate::backend::{Backend, BackendError, Endpoint};
use swapgate::generation::GenerationId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

/// A captured request for assertions.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct ServerState {
    generation: GenerationId,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

/// HTTP server standing in for one generation.
///
/// Answers every request with `{"generation": N, "path": ...}`. A
/// `x-delay-ms` request header delays the response.
pub struct GenerationServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    shutdown: watch::Sender<bool>,
}

impl GenerationServer {
    pub async fn start(generation: GenerationId) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState {
            generation,
            requests: requests.clone(),
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let app = Router::new().fallback(handle_request).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            requests,
            shutdown: shutdown_tx,
        }
    }

    pub fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for GenerationServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_request(State(state): State<ServerState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let delay_ms = req
        .headers()
        .get("x-delay-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let body = axum::body::to_bytes(req.into_body(), 1024 * 1024)
        .await
        .unwrap_or_default()
        .to_vec();

    state.requests.lock().push(CapturedRequest {
        method,
        path: path.clone(),
        body,
    });

    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let body = serde_json::json!({
        "generation": state.generation.0,
        "path": path,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Raw TCP sideband for one generation.
///
/// Reads the upgrade handshake, answers `101 Switching Protocols`, writes
/// `gen-N\n`, then echoes everything it receives.
pub struct SidebandServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

pub const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

impl SidebandServer {
    pub async fn start(generation: GenerationId) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind sideband server");
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let split = head.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;

                    if stream.write_all(SWITCHING_PROTOCOLS).await.is_err() {
                        return;
                    }
                    let greeting = format!("gen-{}\n", generation.0);
                    if stream.write_all(greeting.as_bytes()).await.is_err() {
                        return;
                    }
                    if stream.write_all(&head[split..]).await.is_err() {
                        return;
                    }

                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            task,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for SidebandServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Instance {
    generation: GenerationId,
    http: GenerationServer,
    sideband: Option<SidebandServer>,
}

/// Backend collaborator with scriptable provisioning.
///
/// Each provisioned generation gets its own `GenerationServer` (and
/// `SidebandServer` when enabled). Provisioning can be paused with
/// `gated()` and let through one at a time with `release_provision()`.
pub struct ScriptedBackend {
    gate: Option<Semaphore>,
    with_sideband: bool,
    fail_provisions: AtomicUsize,
    fail_artifacts: AtomicUsize,
    fail_teardown: AtomicBool,
    provisions: AtomicUsize,
    teardowns: Mutex<Vec<GenerationId>>,
    instances: Mutex<HashMap<SocketAddr, Instance>>,
    sideband_accepts: Mutex<HashMap<GenerationId, Arc<AtomicUsize>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            gate: None,
            with_sideband: false,
            fail_provisions: AtomicUsize::new(0),
            fail_artifacts: AtomicUsize::new(0),
            fail_teardown: AtomicBool::new(false),
            provisions: AtomicUsize::new(0),
            teardowns: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            sideband_accepts: Mutex::new(HashMap::new()),
        }
    }

    /// Block every provision until `release_provision()` is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Give each generation a sideband server.
    pub fn with_sideband(mut self) -> Self {
        self.with_sideband = true;
        self
    }

    pub fn release_provision(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn fail_next_provisions(&self, count: usize) {
        self.fail_provisions.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_artifacts(&self, count: usize) {
        self.fail_artifacts.store(count, Ordering::SeqCst);
    }

    pub fn fail_teardowns(&self) {
        self.fail_teardown.store(true, Ordering::SeqCst);
    }

    /// Number of provision calls that reached the backend.
    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> Vec<GenerationId> {
        self.teardowns.lock().clone()
    }

    pub fn running(&self) -> usize {
        self.instances.lock().len()
    }

    /// Sideband connections accepted by `generation`, including after it
    /// was torn down.
    pub fn sideband_accepts(&self, generation: GenerationId) -> usize {
        self.sideband_accepts
            .lock()
            .get(&generation)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Requests served by the running instance for `generation`.
    pub fn requests_for(&self, generation: GenerationId) -> Vec<CapturedRequest> {
        self.instances
            .lock()
            .values()
            .find(|instance| instance.generation == generation)
            .map(|instance| instance.http.captured_requests())
            .unwrap_or_default()
    }

    /// Shut down the sideband server of a running generation, leaving its
    /// endpoint pointing at a closed port. Returns the old address.
    pub fn stop_sideband(&self, generation: GenerationId) -> Option<SocketAddr> {
        let sideband = self
            .instances
            .lock()
            .values_mut()
            .find(|instance| instance.generation == generation)
            .and_then(|instance| instance.sideband.take());
        sideband.map(|sideband| sideband.addr)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn provision(&self, generation: GenerationId) -> Result<Endpoint, BackendError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        if Self::take_failure(&self.fail_provisions) {
            return Err(BackendError::Exited {
                status: "exit status: 1".to_string(),
            });
        }

        let http = GenerationServer::start(generation).await;
        let mut endpoint = Endpoint::new(http.addr);

        let sideband = if self.with_sideband {
            let sideband = SidebandServer::start(generation).await;
            endpoint = endpoint.with_sideband(sideband.addr);
            self.sideband_accepts
                .lock()
                .insert(generation, sideband.accepted.clone());
            Some(sideband)
        } else {
            None
        };

        self.instances.lock().insert(
            http.addr,
            Instance {
                generation,
                http,
                sideband,
            },
        );
        Ok(endpoint)
    }

    async fn load_artifact(&self, endpoint: &Endpoint) -> Result<Artifact, BackendError> {
        if Self::take_failure(&self.fail_artifacts) {
            return Err(BackendError::ArtifactLoad {
                url: endpoint.base_url(),
                reason: "compile error".to_string(),
            });
        }

        let generation = self
            .instances
            .lock()
            .get(&endpoint.http)
            .map(|instance| instance.generation)
            .ok_or_else(|| BackendError::ArtifactLoad {
                url: endpoint.base_url(),
                reason: "unknown instance".to_string(),
            })?;

        Ok(Artifact::new(
            format!("build-{}", generation.0),
            endpoint.base_url(),
        ))
    }

    async fn teardown(&self, endpoint: &Endpoint) -> Result<(), BackendError> {
        let instance = self.instances.lock().remove(&endpoint.http);
        if let Some(instance) = instance {
            self.teardowns.lock().push(instance.generation);
        }

        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(BackendError::Teardown {
                reason: "process did not exit".to_string(),
            });
        }
        Ok(())
    }
}
