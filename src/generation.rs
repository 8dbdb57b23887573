//! Backend generations and the leases that pin them.
//!
//! A generation is one lifecycle instance of the backend process plus its
//! build artifact. Only the swap coordinator moves a generation through its
//! lifecycle; everything else holds an `Arc<Generation>` and reads it.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Notify;

use crate::artifact::Artifact;
use crate::backend::Endpoint;

/// Strictly increasing generation identifier. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum GenerationStatus {
    Starting = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl GenerationStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GenerationStatus::Starting,
            1 => GenerationStatus::Active,
            2 => GenerationStatus::Draining,
            _ => GenerationStatus::Closed,
        }
    }
}

/// One versioned backend instance.
pub struct Generation {
    id: GenerationId,
    endpoint: Endpoint,
    artifact: OnceLock<Arc<Artifact>>,
    status: AtomicU8,
    leases: AtomicUsize,
    lease_released: Notify,
    created_at: SystemTime,
}

impl Generation {
    pub(crate) fn new(id: GenerationId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            artifact: OnceLock::new(),
            status: AtomicU8::new(GenerationStatus::Starting as u8),
            leases: AtomicUsize::new(0),
            lease_released: Notify::new(),
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The build artifact, once loaded.
    pub fn artifact(&self) -> Option<Arc<Artifact>> {
        self.artifact.get().cloned()
    }

    pub fn status(&self) -> GenerationStatus {
        GenerationStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Number of requests and tunnels currently bound to this generation.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    /// Store the artifact. The first value wins and is returned; later calls
    /// never replace it.
    pub(crate) fn set_artifact(&self, artifact: Arc<Artifact>) -> Arc<Artifact> {
        self.artifact.get_or_init(|| artifact).clone()
    }

    pub(crate) fn set_status(&self, status: GenerationStatus) {
        let previous = GenerationStatus::from_u8(self.status.swap(status as u8, Ordering::SeqCst));
        if previous != status {
            tracing::debug!(
                generation = %self.id,
                from = ?previous,
                to = ?status,
                "Generation status changed"
            );
        }
    }

    /// Pin this generation for the lifetime of the returned guard.
    ///
    /// Callers outside the coordinator must obtain leases through
    /// `SwapCoordinator::bind`, which leases under the coordinator lock.
    pub(crate) fn lease(self: &Arc<Self>) -> GenerationLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        GenerationLease {
            generation: Arc::clone(self),
        }
    }

    /// Wait until no leases remain. Returns `false` if `timeout` expired first.
    pub(crate) async fn wait_for_leases(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                // Register before checking so a release between the check
                // and the await is not lost.
                let notified = self.lease_released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_leases() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("leases", &self.active_leases())
            .finish()
    }
}

/// Keeps a generation from being torn down while work is bound to it.
pub struct GenerationLease {
    generation: Arc<Generation>,
}

impl GenerationLease {
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }
}

impl Drop for GenerationLease {
    fn drop(&mut self) {
        if self.generation.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.generation.lease_released.notify_waiters();
        }
    }
}

impl fmt::Debug for GenerationLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GenerationLease")
            .field(&self.generation.id)
            .finish()
    }
}
