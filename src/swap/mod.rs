//! Generation swapping: coordinator, holds, trigger policies, and the
//! source watcher that marks the backend stale.

mod coordinator;
mod hold;
pub mod policy;
mod watcher;

pub use coordinator::{
    CoordinatorStatus, GenerationSnapshot, SwapCoordinator, SwapError, SwapHandle, SwapLogEntry,
    SwapLogOutcome, SwapOutcome, SwapSettings,
};
pub use hold::{HoldError, HoldId, HoldKind, HoldTicket, Release};
pub use policy::{RequestView, StaleFlag, SwapTriggerPolicy};
pub use watcher::{ChangeHook, SourceWatcher, WatcherError};
