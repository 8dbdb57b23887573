//! Per-request entry hook.
//!
//! The gate evaluates the trigger policy, parks the request while a swap is
//! preparing, and binds it to the active generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::artifact::Artifact;
use crate::generation::{Generation, GenerationId, GenerationLease};
use crate::swap::policy::PolicyContext;
use crate::swap::{
    HoldError, HoldTicket, Release, RequestView, SwapCoordinator, SwapTriggerPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// No swap has succeeded yet and none released this request.
    #[error("No backend generation is active")]
    NoActiveGeneration,

    /// The bound generation has no artifact. Generations only become active
    /// after their artifact loads, so this indicates a coordinator bug.
    #[error("Generation {0} has no artifact")]
    ArtifactMissing(GenerationId),
}

/// A request bound to a generation. Dropping it releases the lease.
#[derive(Debug)]
pub struct Admission {
    lease: GenerationLease,
    artifact: Arc<Artifact>,
    held_for: Option<Duration>,
}

impl Admission {
    pub fn generation(&self) -> &Arc<Generation> {
        self.lease.generation()
    }

    pub fn artifact(&self) -> &Arc<Artifact> {
        &self.artifact
    }

    /// How long the request was held, if it was.
    pub fn held_for(&self) -> Option<Duration> {
        self.held_for
    }

    /// Give up the binding details, keeping only the lease.
    pub fn into_lease(self) -> GenerationLease {
        self.lease
    }
}

pub struct RequestGate {
    coordinator: Arc<SwapCoordinator>,
    policy: Box<dyn SwapTriggerPolicy>,
    hold_timeout: Option<Duration>,
}

impl RequestGate {
    pub fn new(
        coordinator: Arc<SwapCoordinator>,
        policy: Box<dyn SwapTriggerPolicy>,
        hold_timeout: Option<Duration>,
    ) -> Self {
        Self {
            coordinator,
            policy,
            hold_timeout,
        }
    }

    pub fn coordinator(&self) -> &Arc<SwapCoordinator> {
        &self.coordinator
    }

    /// Admit one request: maybe start a swap, wait out any swap in
    /// progress, then bind to the active generation.
    pub async fn admit(&self, req: &RequestView<'_>) -> Result<Admission, GateError> {
        let ctx = PolicyContext {
            has_active: self.coordinator.current_generation().is_some(),
            swap_in_flight: self.coordinator.swap_in_flight(),
        };

        if let Some(reason) = self.policy.evaluate(req, &ctx) {
            // Fire and forget; the swap task logs its own outcome.
            let handle = if reason.needs_fresh_swap() {
                Some(self.coordinator.trigger_swap_after_current())
            } else if !ctx.swap_in_flight {
                Some(self.coordinator.trigger_swap())
            } else {
                None
            };
            if let Some(handle) = handle {
                tracing::info!(
                    generation = %handle.generation(),
                    policy = self.policy.name(),
                    %reason,
                    method = %req.method,
                    path = %req.path(),
                    "Swap triggered by request"
                );
            }
        }

        let held_for = match self.coordinator.hold_until_swapped() {
            Ok(ticket) => Some(self.wait(ticket).await),
            Err(HoldError::NotSwapping) => None,
            Err(HoldError::Abandoned) => None,
        };

        // Read after the hold: the generation to bind is whatever is active
        // at resume time.
        let lease = self.coordinator.bind().ok_or(GateError::NoActiveGeneration)?;
        let artifact = lease
            .generation()
            .artifact()
            .ok_or(GateError::ArtifactMissing(lease.generation().id()))?;

        Ok(Admission {
            lease,
            artifact,
            held_for,
        })
    }

    async fn wait(&self, ticket: HoldTicket) -> Duration {
        let start = Instant::now();
        let id = ticket.id();

        let outcome = match self.hold_timeout {
            Some(limit) => match tokio::time::timeout(limit, ticket).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.coordinator.cancel_hold(id);
                    tracing::warn!(
                        hold = id.0,
                        timeout_ms = limit.as_millis() as u64,
                        "Hold timed out, falling back to current generation"
                    );
                    return start.elapsed();
                }
            },
            None => ticket.await,
        };

        match outcome {
            Ok(Release::Swapped(generation)) => {
                tracing::debug!(hold = id.0, generation = %generation, "Request resumed");
            }
            Ok(Release::Fallback) => {
                tracing::debug!(hold = id.0, "Request resumed on previous generation");
            }
            Err(e) => {
                tracing::warn!(hold = id.0, error = %e, "Hold ended without release");
            }
        }
        start.elapsed()
    }
}
