//! Sideband tunnel proxy.
//!
//! Accepts upgrade handshakes on a stable endpoint and pipes the socket to
//! the active generation's sideband port. Connections that arrive while a
//! swap is preparing are held, and dropped without a proxy attempt if the
//! client goes away first.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::generation::GenerationId;
use crate::proxy::shutdown::ShutdownManager;
use crate::swap::{HoldError, HoldTicket, SwapCoordinator};

const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;
const MAX_HELD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;
const PIPE_CHUNK: usize = 8 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

const UPGRADE_REQUIRED_RESPONSE: &[u8] = b"HTTP/1.1 426 Upgrade Required\r\n\
Connection: close\r\n\
Content-Type: text/plain\r\n\
Content-Length: 16\r\n\
\r\n\
Upgrade Required";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Client closed the connection during the handshake")]
    ClosedDuringHandshake,

    #[error("Handshake exceeds {MAX_HANDSHAKE_BYTES} bytes")]
    HandshakeTooLarge,

    #[error("Client sent more than {MAX_HELD_BYTES} bytes while held")]
    HeldBufferFull,

    #[error("No backend generation is active")]
    NoActiveGeneration,

    #[error("Generation {0} has no sideband endpoint")]
    NoSideband(GenerationId),

    #[error("Failed to connect to sideband {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to sideband {addr}")]
    ConnectTimeout { addr: SocketAddr },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a tunnel connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// Not an upgrade request; answered with 426.
    Rejected,
    /// Client disconnected while held; no proxy attempt was made.
    Orphaned,
    /// Bytes were piped until one side closed.
    Piped {
        generation: GenerationId,
        to_backend: u64,
        to_client: u64,
    },
}

/// The handshake head read off a client socket.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Request line and headers, including the terminating blank line.
    pub head: Vec<u8>,
    /// Bytes the client sent after the head.
    pub extra: Vec<u8>,
    pub is_upgrade: bool,
}

impl Handshake {
    /// Split `buf` at the end of the head, if the head is complete.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let end = find_head_end(buf)?;
        let head = buf[..end].to_vec();
        let extra = buf[end..].to_vec();
        let is_upgrade = is_upgrade_request(&head);
        Some(Self {
            head,
            extra,
            is_upgrade,
        })
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// An upgrade request names a protocol in `Upgrade` and lists `upgrade` in
/// `Connection`.
fn is_upgrade_request(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let mut has_upgrade = false;
    let mut connection_upgrade = false;

    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") && !value.is_empty() {
            has_upgrade = true;
        } else if name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        }
    }

    has_upgrade && connection_upgrade
}

enum HoldResult {
    Resumed,
    ClientGone,
}

pub struct TunnelProxy {
    coordinator: Arc<SwapCoordinator>,
    connect_timeout: Duration,
    hold_timeout: Option<Duration>,
}

impl TunnelProxy {
    pub fn new(
        coordinator: Arc<SwapCoordinator>,
        connect_timeout: Duration,
        hold_timeout: Option<Duration>,
    ) -> Self {
        Self {
            coordinator,
            connect_timeout,
            hold_timeout,
        }
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: Arc<ShutdownManager>,
    ) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Tunnel listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.notified() => break,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    let Some(backoff) = accept_backoff(&e) else {
                        tracing::debug!(error = %e, "Tunnel accept failed for one connection");
                        continue;
                    };
                    tracing::error!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Tunnel accept failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = shutdown.notified() => break,
                    }
                }
            };

            let proxy = Arc::clone(&self);
            let shutdown = shutdown.clone();
            shutdown.increment_connections();
            tokio::spawn(async move {
                match proxy.handle_connection(stream).await {
                    Ok(outcome) => {
                        tracing::debug!(%peer, ?outcome, "Tunnel connection finished");
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "Tunnel connection failed");
                    }
                }
                shutdown.decrement_connections();
            });
        }

        tracing::info!("Tunnel stopped accepting connections");
        Ok(())
    }

    /// Serve one client connection to completion.
    ///
    /// On any error the client socket is dropped, which closes it.
    pub async fn handle_connection(
        &self,
        mut client: TcpStream,
    ) -> Result<TunnelOutcome, TunnelError> {
        let handshake = read_handshake(&mut client).await?;
        if !handshake.is_upgrade {
            client.write_all(UPGRADE_REQUIRED_RESPONSE).await?;
            let _ = client.shutdown().await;
            return Ok(TunnelOutcome::Rejected);
        }

        let Handshake {
            head, mut extra, ..
        } = handshake;

        match self.coordinator.hold_connection() {
            Ok(ticket) => {
                if let HoldResult::ClientGone = self.wait_held(&mut client, ticket, &mut extra).await? {
                    return Ok(TunnelOutcome::Orphaned);
                }
            }
            Err(HoldError::NotSwapping) | Err(HoldError::Abandoned) => {}
        }

        let lease = self.coordinator.bind().ok_or(TunnelError::NoActiveGeneration)?;
        let generation = lease.generation().id();
        let addr = lease
            .generation()
            .endpoint()
            .sideband
            .ok_or(TunnelError::NoSideband(generation))?;

        let mut backend = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TunnelError::Connect { addr, source }),
            Err(_) => return Err(TunnelError::ConnectTimeout { addr }),
        };

        backend.write_all(&head).await?;
        if !extra.is_empty() {
            backend.write_all(&extra).await?;
        }

        // Tunnels are long-lived; once established they end with the
        // generation instead of delaying its retirement.
        drop(lease);

        tracing::debug!(generation = %generation, %addr, "Tunnel established");
        let (to_backend, to_client) = pipe(client, backend).await;

        Ok(TunnelOutcome::Piped {
            generation,
            to_backend,
            to_client,
        })
    }

    /// Wait for the hold to be released while watching the client socket.
    ///
    /// Bytes the client sends meanwhile are buffered for replay. If the
    /// client closes first the hold is cancelled.
    async fn wait_held(
        &self,
        client: &mut TcpStream,
        mut ticket: HoldTicket,
        buffered: &mut Vec<u8>,
    ) -> Result<HoldResult, TunnelError> {
        let id = ticket.id();
        let deadline = self
            .hold_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                released = &mut ticket => {
                    if let Err(e) = released {
                        tracing::warn!(hold = id.0, error = %e, "Connection hold ended without release");
                    }
                    return Ok(HoldResult::Resumed);
                }
                read = client.read(&mut chunk) => match read {
                    Ok(0) | Err(_) => {
                        self.coordinator.cancel_hold(id);
                        tracing::debug!(hold = id.0, "Client disconnected while held");
                        return Ok(HoldResult::ClientGone);
                    }
                    Ok(n) => {
                        if buffered.len() + n > MAX_HELD_BYTES {
                            self.coordinator.cancel_hold(id);
                            return Err(TunnelError::HeldBufferFull);
                        }
                        buffered.extend_from_slice(&chunk[..n]);
                    }
                },
                _ = expired => {
                    self.coordinator.cancel_hold(id);
                    tracing::warn!(hold = id.0, "Connection hold timed out, falling back to current generation");
                    return Ok(HoldResult::Resumed);
                }
            }
        }
    }
}

/// How long to wait before accepting again after `error`.
///
/// Errors that only concern the connection being accepted retry at once.
/// Anything else, such as running out of file descriptors, backs off so
/// the loop does not spin.
fn accept_backoff(error: &std::io::Error) -> Option<Duration> {
    match error.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
            None
        }
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn read_handshake(client: &mut TcpStream) -> Result<Handshake, TunnelError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::ClosedDuringHandshake);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(handshake) = Handshake::parse(&buf) {
            return Ok(handshake);
        }
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Err(TunnelError::HandshakeTooLarge);
        }
    }
}

/// Copy both directions until either one finishes, then drop both sockets.
///
/// Returns bytes copied (client to backend, backend to client). A half-open
/// tunnel is never left behind.
async fn pipe(client: TcpStream, backend: TcpStream) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let mut to_backend = 0u64;
    let mut to_client = 0u64;

    let result = tokio::select! {
        r = forward(&mut client_read, &mut backend_write, &mut to_backend) => r,
        r = forward(&mut backend_read, &mut client_write, &mut to_client) => r,
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tunnel pipe error");
    }

    (to_backend, to_client)
}

/// Copy `reader` into `writer` until EOF, counting bytes as they land so
/// the total survives cancellation.
async fn forward<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
