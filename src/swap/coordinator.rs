//! Generation swap coordination.
//!
//! The coordinator owns the active generation, runs at most one swap at a
//! time, and parks requests and tunnel connections that arrive while a new
//! generation is being prepared. All mutation goes through one lock that is
//! never held across an await, so every invariant can be checked here.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use super::hold::{HoldError, HoldId, HoldKind, HoldTicket, PendingHold, Release};
use crate::artifact::ArtifactCache;
use crate::backend::{Backend, Endpoint};
use crate::config::SwapConfig;
use crate::generation::{Generation, GenerationId, GenerationLease, GenerationStatus};

const SWAP_LOG_CAPACITY: usize = 64;

/// Why a swap did not produce a new active generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwapError {
    /// The backend failed to start.
    #[error("Failed to provision generation {generation}: {reason}")]
    Provision {
        generation: GenerationId,
        reason: String,
    },

    /// The backend started but its build could not be loaded.
    #[error("Failed to load artifact for generation {generation}: {reason}")]
    ArtifactLoad {
        generation: GenerationId,
        reason: String,
    },

    /// The swap task ended without reporting an outcome.
    #[error("Swap to generation {generation} was abandoned")]
    Abandoned { generation: GenerationId },
}

pub type SwapOutcome = Result<GenerationId, SwapError>;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct SwapSettings {
    /// Longest retirement waits for leases on the old generation.
    pub drain_timeout: Duration,
    /// Release held work to the old generation when a swap fails.
    pub fallback_on_failure: bool,
}

impl Default for SwapSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            fallback_on_failure: false,
        }
    }
}

impl From<&SwapConfig> for SwapSettings {
    fn from(config: &SwapConfig) -> Self {
        Self {
            drain_timeout: config.drain_timeout(),
            fallback_on_failure: config.fallback_on_failure,
        }
    }
}

/// Awaitable completion of one swap. Every concurrent trigger of the same
/// swap gets a handle to the same outcome.
#[derive(Debug, Clone)]
pub struct SwapHandle {
    generation: GenerationId,
    rx: watch::Receiver<Option<SwapOutcome>>,
}

impl SwapHandle {
    /// The generation this swap is bringing up.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Wait for the swap to finish, including retirement of the previous
    /// generation.
    pub async fn wait(mut self) -> SwapOutcome {
        let generation = self.generation;
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or(Err(SwapError::Abandoned { generation })),
            Err(_) => Err(SwapError::Abandoned { generation }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SwapLogOutcome {
    Succeeded,
    Failed { error: String },
}

/// Record of one finished swap.
#[derive(Debug, Clone, Serialize)]
pub struct SwapLogEntry {
    pub timestamp: SystemTime,
    /// Generation that was active when the swap started.
    pub previous: Option<GenerationId>,
    pub generation: GenerationId,
    pub duration_ms: u64,
    pub outcome: SwapLogOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSnapshot {
    pub id: GenerationId,
    pub status: GenerationStatus,
    pub endpoint: Endpoint,
    pub created_at: SystemTime,
    pub build_id: Option<String>,
    pub leases: usize,
}

/// Point-in-time view of the coordinator, served by the admin route.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active: Option<GenerationId>,
    pub swapping: bool,
    pub swap_in_flight: Option<GenerationId>,
    pub follow_up_queued: bool,
    pub pending_request_holds: usize,
    pub pending_connection_holds: usize,
    pub generations_created: u64,
    pub generations: Vec<GenerationSnapshot>,
    pub last_swap: Option<SwapLogEntry>,
}

struct InFlightSwap {
    generation: GenerationId,
    /// True until the new generation is activated. Holds are only accepted
    /// while preparing.
    preparing: bool,
    done: watch::Receiver<Option<SwapOutcome>>,
}

impl InFlightSwap {
    fn handle(&self) -> SwapHandle {
        SwapHandle {
            generation: self.generation,
            rx: self.done.clone(),
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    active: Option<Arc<Generation>>,
    in_flight: Option<InFlightSwap>,
    request_holds: VecDeque<PendingHold>,
    connection_holds: VecDeque<PendingHold>,
    /// Start another swap when the in-flight one finishes.
    follow_up: bool,
    /// Generations that are not closed yet.
    live: Vec<Arc<Generation>>,
    swap_log: VecDeque<SwapLogEntry>,
}

impl CoordinatorState {
    fn queue(&mut self, kind: HoldKind) -> &mut VecDeque<PendingHold> {
        match kind {
            HoldKind::Request => &mut self.request_holds,
            HoldKind::Connection => &mut self.connection_holds,
        }
    }

    fn take_holds(&mut self) -> Vec<PendingHold> {
        let mut holds: Vec<PendingHold> = mem::take(&mut self.request_holds).into();
        holds.extend(mem::take(&mut self.connection_holds));
        holds
    }

    fn push_log(&mut self, entry: SwapLogEntry) {
        if self.swap_log.len() == SWAP_LOG_CAPACITY {
            self.swap_log.pop_front();
        }
        self.swap_log.push_back(entry);
    }
}

/// Owns generation lifecycle. Create one per process and share it via `Arc`.
pub struct SwapCoordinator {
    backend: Arc<dyn Backend>,
    cache: ArtifactCache,
    settings: SwapSettings,
    next_generation: AtomicU64,
    next_hold: AtomicU64,
    state: Mutex<CoordinatorState>,
}

impl SwapCoordinator {
    pub fn new(backend: Arc<dyn Backend>, settings: SwapSettings) -> Self {
        Self {
            cache: ArtifactCache::new(backend.clone()),
            backend,
            settings,
            next_generation: AtomicU64::new(1),
            next_hold: AtomicU64::new(1),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Start a swap, or join the one already in flight.
    ///
    /// The swap runs on its own task; dropping the handle does not cancel
    /// it. Must be called from within a tokio runtime.
    pub fn trigger_swap(self: &Arc<Self>) -> SwapHandle {
        let mut state = self.state.lock();
        if let Some(in_flight) = &state.in_flight {
            tracing::debug!(
                generation = %in_flight.generation,
                "Swap already in flight, joining it"
            );
            return in_flight.handle();
        }
        self.start_swap(&mut state)
    }

    /// Start a swap that provisions after this call.
    ///
    /// An in-flight swap began provisioning earlier and may serve stale
    /// sources, so instead of joining it one follow-up swap is queued to
    /// start when it finishes. Repeated calls while it runs coalesce into
    /// that single follow-up. Returns the handle of the in-flight swap in
    /// that case.
    pub fn trigger_swap_after_current(self: &Arc<Self>) -> SwapHandle {
        let mut state = self.state.lock();
        let Some(handle) = state.in_flight.as_ref().map(InFlightSwap::handle) else {
            return self.start_swap(&mut state);
        };
        if !state.follow_up {
            tracing::info!(
                after = %handle.generation(),
                "Follow-up swap queued behind in-flight swap"
            );
        }
        state.follow_up = true;
        handle
    }

    /// True when a follow-up swap will start once the in-flight one ends.
    pub fn follow_up_queued(&self) -> bool {
        self.state.lock().follow_up
    }

    fn start_swap(self: &Arc<Self>, state: &mut CoordinatorState) -> SwapHandle {
        let generation = GenerationId(self.next_generation.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(InFlightSwap {
            generation,
            preparing: true,
            done: rx.clone(),
        });
        let previous = state.active.as_ref().map(|g| g.id());

        tracing::info!(
            generation = %generation,
            previous = ?previous,
            "Swap started"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = this.run_swap(generation).await;
            this.finish(generation, previous, started.elapsed(), &outcome);
            let _ = tx.send(Some(outcome));
        });

        SwapHandle { generation, rx }
    }

    /// True while a new generation is being prepared and arriving work
    /// must be held.
    pub fn is_swapping(&self) -> bool {
        self.state
            .lock()
            .in_flight
            .as_ref()
            .is_some_and(|swap| swap.preparing)
    }

    /// True from trigger until the swap has fully finished, including
    /// retirement of the previous generation.
    pub fn swap_in_flight(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Park a request until the in-progress swap releases it.
    ///
    /// Returns `HoldError::NotSwapping` when no swap is preparing; the
    /// caller should then proceed against the current generation.
    pub fn hold_until_swapped(&self) -> Result<HoldTicket, HoldError> {
        self.hold(HoldKind::Request)
    }

    /// Park an upgrade connection until the in-progress swap releases it.
    pub fn hold_connection(&self) -> Result<HoldTicket, HoldError> {
        self.hold(HoldKind::Connection)
    }

    fn hold(&self, kind: HoldKind) -> Result<HoldTicket, HoldError> {
        let mut state = self.state.lock();
        let preparing = state.in_flight.as_ref().is_some_and(|swap| swap.preparing);
        if !preparing {
            return Err(HoldError::NotSwapping);
        }

        let id = HoldId(self.next_hold.fetch_add(1, Ordering::SeqCst));
        let (pending, ticket) = PendingHold::new(id, kind);
        let queue = state.queue(kind);
        queue.push_back(pending);
        tracing::debug!(hold = id.0, ?kind, queued = queue.len(), "Holding until swap completes");
        Ok(ticket)
    }

    /// Remove a hold whose owner gave up, e.g. a client that disconnected.
    /// Returns `false` if it was already released.
    pub fn cancel_hold(&self, id: HoldId) -> bool {
        let mut state = self.state.lock();
        for kind in [HoldKind::Request, HoldKind::Connection] {
            let queue = state.queue(kind);
            if let Some(pos) = queue.iter().position(|hold| hold.id() == id) {
                queue.remove(pos);
                tracing::debug!(hold = id.0, ?kind, "Hold cancelled");
                return true;
            }
        }
        false
    }

    pub fn pending_request_holds(&self) -> usize {
        let mut state = self.state.lock();
        state.request_holds.retain(|hold| !hold.is_orphaned());
        state.request_holds.len()
    }

    pub fn pending_connection_holds(&self) -> usize {
        let mut state = self.state.lock();
        state.connection_holds.retain(|hold| !hold.is_orphaned());
        state.connection_holds.len()
    }

    /// The active generation, if any swap has succeeded yet.
    pub fn current_generation(&self) -> Option<Arc<Generation>> {
        self.state.lock().active.clone()
    }

    /// Lease the active generation.
    ///
    /// Leasing happens under the coordinator lock, so once a swap has
    /// demoted a generation no new work can bind to it.
    pub fn bind(&self) -> Option<GenerationLease> {
        self.state.lock().active.as_ref().map(|generation| generation.lease())
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn generations_created(&self) -> u64 {
        self.next_generation.load(Ordering::SeqCst) - 1
    }

    pub fn swap_log(&self) -> Vec<SwapLogEntry> {
        self.state.lock().swap_log.iter().cloned().collect()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let mut state = self.state.lock();
        state.request_holds.retain(|hold| !hold.is_orphaned());
        state.connection_holds.retain(|hold| !hold.is_orphaned());

        CoordinatorStatus {
            active: state.active.as_ref().map(|g| g.id()),
            swapping: state.in_flight.as_ref().is_some_and(|swap| swap.preparing),
            swap_in_flight: state.in_flight.as_ref().map(|swap| swap.generation),
            follow_up_queued: state.follow_up,
            pending_request_holds: state.request_holds.len(),
            pending_connection_holds: state.connection_holds.len(),
            generations_created: self.generations_created(),
            generations: state
                .live
                .iter()
                .map(|g| GenerationSnapshot {
                    id: g.id(),
                    status: g.status(),
                    endpoint: g.endpoint().clone(),
                    created_at: g.created_at(),
                    build_id: g.artifact().map(|a| a.build_id.clone()),
                    leases: g.active_leases(),
                })
                .collect(),
            last_swap: state.swap_log.back().cloned(),
        }
    }

    /// Retire the active generation. Used when the process exits.
    pub async fn shutdown(&self) {
        let active = {
            let mut state = self.state.lock();
            state.follow_up = false;
            state.active.take()
        };
        if let Some(generation) = active {
            tracing::info!(generation = %generation.id(), "Retiring active generation for shutdown");
            generation.set_status(GenerationStatus::Draining);
            self.retire(generation).await;
        }
    }

    async fn run_swap(&self, id: GenerationId) -> SwapOutcome {
        let endpoint = self
            .backend
            .provision(id)
            .await
            .map_err(|e| SwapError::Provision {
                generation: id,
                reason: e.to_string(),
            })?;

        let generation = Arc::new(Generation::new(id, endpoint));
        self.state.lock().live.push(generation.clone());

        let artifact = match self.cache.get(&generation).await {
            Ok(artifact) => artifact,
            Err(e) => {
                // Never activated, so nothing can be bound to it.
                self.teardown(&generation).await;
                return Err(SwapError::ArtifactLoad {
                    generation: id,
                    reason: e.to_string(),
                });
            }
        };

        // Activate and take the hold queues in one step: once `preparing`
        // is cleared no new hold can be queued, so nothing is left behind.
        let (previous, holds) = {
            let mut state = self.state.lock();
            generation.set_status(GenerationStatus::Active);
            let previous = state.active.replace(generation.clone());
            if let Some(previous) = &previous {
                previous.set_status(GenerationStatus::Draining);
            }
            if let Some(in_flight) = state.in_flight.as_mut() {
                in_flight.preparing = false;
            }
            (previous, state.take_holds())
        };

        let (resumed, orphaned, longest) = release_all(holds, Release::Swapped(id));
        tracing::info!(
            generation = %id,
            build_id = %artifact.build_id,
            previous = ?previous.as_ref().map(|g| g.id()),
            resumed,
            orphaned,
            longest_hold_ms = longest.as_millis() as u64,
            "Generation active"
        );

        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        Ok(id)
    }

    fn finish(
        self: &Arc<Self>,
        generation: GenerationId,
        previous: Option<GenerationId>,
        elapsed: Duration,
        outcome: &SwapOutcome,
    ) {
        let fallback = {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.push_log(SwapLogEntry {
                timestamp: SystemTime::now(),
                previous,
                generation,
                duration_ms: elapsed.as_millis() as u64,
                outcome: match outcome {
                    Ok(_) => SwapLogOutcome::Succeeded,
                    Err(e) => SwapLogOutcome::Failed {
                        error: e.to_string(),
                    },
                },
            });
            let fallback = if outcome.is_err() && self.settings.fallback_on_failure {
                state.take_holds()
            } else {
                Vec::new()
            };
            if mem::take(&mut state.follow_up) {
                tracing::info!(after = %generation, "Starting queued follow-up swap");
                self.start_swap(&mut state);
            }
            fallback
        };

        match outcome {
            Ok(_) => tracing::info!(
                generation = %generation,
                elapsed_ms = elapsed.as_millis() as u64,
                "Swap complete"
            ),
            Err(e) => tracing::error!(
                generation = %generation,
                previous = ?previous,
                error = %e,
                "Swap failed, previous generation stays active"
            ),
        }

        if !fallback.is_empty() {
            let (resumed, orphaned, _) = release_all(fallback, Release::Fallback);
            tracing::warn!(
                generation = %generation,
                resumed,
                orphaned,
                "Released held work to the previous generation"
            );
        }
    }

    /// Wait for work on `generation` to finish, then tear it down.
    async fn retire(&self, generation: Arc<Generation>) {
        if !generation.wait_for_leases(self.settings.drain_timeout).await {
            tracing::warn!(
                generation = %generation.id(),
                leases = generation.active_leases(),
                timeout_ms = self.settings.drain_timeout.as_millis() as u64,
                "Drain timed out, tearing down with work still bound"
            );
        }
        self.teardown(&generation).await;
    }

    async fn teardown(&self, generation: &Arc<Generation>) {
        if let Err(e) = self.backend.teardown(generation.endpoint()).await {
            tracing::warn!(
                generation = %generation.id(),
                error = %e,
                "Teardown failed, marking generation closed anyway"
            );
        }

        generation.set_status(GenerationStatus::Closed);
        self.cache.evict(generation.id());
        self.state.lock().live.retain(|g| g.id() != generation.id());
        tracing::info!(generation = %generation.id(), "Generation closed");
    }
}

/// Release every hold. Returns (resumed, orphaned, longest wait).
fn release_all(holds: Vec<PendingHold>, release: Release) -> (usize, usize, Duration) {
    let mut resumed = 0;
    let mut orphaned = 0;
    let mut longest = Duration::ZERO;
    for hold in holds {
        longest = longest.max(hold.held_for());
        let id = hold.id();
        if hold.release(release) {
            resumed += 1;
        } else {
            orphaned += 1;
            tracing::debug!(hold = id.0, "Dropped orphaned hold");
        }
    }
    (resumed, orphaned, longest)
}
