//! Suspended units of work waiting for a swap to finish.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::generation::GenerationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct HoldId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldKind {
    Request,
    Connection,
}

/// Why a hold was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// A swap activated this generation. Read the active generation again
    /// rather than trusting this id; a later swap may have replaced it.
    Swapped(GenerationId),
    /// The swap failed and held work falls back to the previous generation.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HoldError {
    /// No swap is preparing; the caller should proceed immediately.
    #[error("No swap in progress")]
    NotSwapping,

    /// The coordinator dropped the hold without releasing it.
    #[error("Hold abandoned by coordinator")]
    Abandoned,
}

/// Caller side of a hold. Resolves when the coordinator releases it.
#[derive(Debug)]
pub struct HoldTicket {
    id: HoldId,
    kind: HoldKind,
    rx: oneshot::Receiver<Release>,
}

impl HoldTicket {
    pub fn id(&self) -> HoldId {
        self.id
    }

    pub fn kind(&self) -> HoldKind {
        self.kind
    }
}

impl Future for HoldTicket {
    type Output = Result<Release, HoldError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| HoldError::Abandoned))
    }
}

/// Coordinator side of a hold, queued until the swap drains.
pub(crate) struct PendingHold {
    id: HoldId,
    tx: oneshot::Sender<Release>,
    since: Instant,
}

impl PendingHold {
    pub(crate) fn new(id: HoldId, kind: HoldKind) -> (Self, HoldTicket) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            id,
            tx,
            since: Instant::now(),
        };
        (pending, HoldTicket { id, kind, rx })
    }

    pub(crate) fn id(&self) -> HoldId {
        self.id
    }

    /// The caller stopped waiting, e.g. its client disconnected.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn held_for(&self) -> Duration {
        self.since.elapsed()
    }

    /// Resume the held unit. Returns `false` if nobody was waiting anymore.
    pub(crate) fn release(self, release: Release) -> bool {
        self.tx.send(release).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_resolves_ticket() {
        let (pending, ticket) = PendingHold::new(HoldId(1), HoldKind::Request);
        assert!(pending.release(Release::Swapped(GenerationId(2))));
        assert_eq!(ticket.await, Ok(Release::Swapped(GenerationId(2))));
    }

    #[tokio::test]
    async fn test_dropped_pending_abandons_ticket() {
        let (pending, ticket) = PendingHold::new(HoldId(1), HoldKind::Connection);
        assert_eq!(ticket.kind(), HoldKind::Connection);
        drop(pending);
        assert_eq!(ticket.await, Err(HoldError::Abandoned));
    }

    #[test]
    fn test_dropped_ticket_orphans_pending() {
        let (pending, ticket) = PendingHold::new(HoldId(3), HoldKind::Connection);
        assert!(!pending.is_orphaned());
        drop(ticket);
        assert!(pending.is_orphaned());
        assert!(!pending.release(Release::Fallback));
    }
}
