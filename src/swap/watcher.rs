//! Source tree watching with debouncing.
//!
//! Marks the backend stale when watched files change, and optionally runs
//! a hook (typically an eager swap trigger).

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

use super::policy::StaleFlag;

/// Errors that can occur during source watching.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Failed to create file watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    #[error("No paths to watch")]
    NoPaths,
}

/// Called after each debounced batch of changes.
pub type ChangeHook = Box<dyn Fn() + Send + 'static>;

/// Watches source paths and marks the backend stale on change.
pub struct SourceWatcher {
    // The watcher is kept alive by being stored here.
    // When SourceWatcher is dropped, the debounce thread stops.
    _watcher: RecommendedWatcher,
    _debounce_handle: thread::JoinHandle<()>,
}

impl SourceWatcher {
    /// Start watching `paths` recursively.
    pub fn start(
        paths: &[PathBuf],
        debounce: Duration,
        stale: StaleFlag,
        on_change: Option<ChangeHook>,
    ) -> Result<Self, WatcherError> {
        if paths.is_empty() {
            return Err(WatcherError::NoPaths);
        }

        let (raw_tx, raw_rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        for path in paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
            tracing::info!(path = %path.display(), "Watching sources");
        }

        let debounce_handle = thread::spawn(move || {
            debounce_loop(raw_rx, stale, on_change, debounce);
        });

        Ok(Self {
            _watcher: watcher,
            _debounce_handle: debounce_handle,
        })
    }
}

/// Waits for `debounce` after the last relevant event before reporting.
fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    stale: StaleFlag,
    on_change: Option<ChangeHook>,
    debounce: Duration,
) {
    let mut pending: Option<Instant> = None;
    let mut changed_paths = 0usize;

    loop {
        let timeout = if pending.is_some() {
            debounce
        } else {
            Duration::from_secs(60)
        };

        match rx.recv_timeout(timeout) {
            Ok(event) => {
                if is_source_event(&event) {
                    changed_paths += event.paths.len();
                    pending = Some(Instant::now());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(last) = pending {
                    if last.elapsed() >= debounce {
                        stale.mark();
                        tracing::info!(changed_paths, "Sources changed, backend marked stale");
                        if let Some(hook) = &on_change {
                            hook();
                        }
                        pending = None;
                        changed_paths = 0;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn is_source_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}
