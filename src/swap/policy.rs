//! Pluggable rules deciding when a swap should start.
//!
//! A policy is evaluated once per inbound request by the request gate. It
//! only answers "should a swap start now"; the coordinator decides whether
//! one is already running.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Uri};

use crate::config::{PolicyKind, SwapConfig};

/// The parts of a request a policy may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestView<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    pub fn path(&self) -> &'a str {
        self.uri.path()
    }
}

impl<'a> From<&'a Parts> for RequestView<'a> {
    fn from(parts: &'a Parts) -> Self {
        Self::new(&parts.method, &parts.uri, &parts.headers)
    }
}

/// Coordinator state visible to policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyContext {
    /// A generation is active.
    pub has_active: bool,
    /// A swap is already in flight.
    pub swap_in_flight: bool,
}

/// Why a policy fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReason {
    text: String,
    after_in_flight: bool,
}

impl TriggerReason {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            after_in_flight: false,
        }
    }

    /// A trigger that an already running swap cannot satisfy, because that
    /// swap started provisioning before the cause.
    pub fn after_in_flight(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            after_in_flight: true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn needs_fresh_swap(&self) -> bool {
        self.after_in_flight
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Decides whether a request should start a swap.
pub trait SwapTriggerPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, req: &RequestView<'_>, ctx: &PolicyContext) -> Option<TriggerReason>;
}

/// Fires when nothing is active and nothing is starting.
pub struct ColdStart;

impl SwapTriggerPolicy for ColdStart {
    fn name(&self) -> &'static str {
        "cold_start"
    }

    fn evaluate(&self, _req: &RequestView<'_>, ctx: &PolicyContext) -> Option<TriggerReason> {
        if ctx.has_active || ctx.swap_in_flight {
            return None;
        }
        Some(TriggerReason::new("no active generation"))
    }
}

/// Fires on every `every`th request it sees.
pub struct NthRequest {
    every: u64,
    seen: AtomicU64,
}

impl NthRequest {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }
}

impl SwapTriggerPolicy for NthRequest {
    fn name(&self) -> &'static str {
        "nth_request"
    }

    fn evaluate(&self, _req: &RequestView<'_>, _ctx: &PolicyContext) -> Option<TriggerReason> {
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if n % self.every == 0 {
            Some(TriggerReason::new(format!("request {} (every {})", n, self.every)))
        } else {
            None
        }
    }
}

/// Fires when the request path contains a substring.
pub struct PathContains {
    needle: String,
}

impl PathContains {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
        }
    }
}

impl SwapTriggerPolicy for PathContains {
    fn name(&self) -> &'static str {
        "path"
    }

    fn evaluate(&self, req: &RequestView<'_>, _ctx: &PolicyContext) -> Option<TriggerReason> {
        if req.path().contains(self.needle.as_str()) {
            Some(TriggerReason::new(format!("path {} matched {}", req.path(), self.needle)))
        } else {
            None
        }
    }
}

/// Set by the source watcher when watched files change.
#[derive(Debug, Clone, Default)]
pub struct StaleFlag(Arc<AtomicBool>);

impl StaleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Fires on the first request after the source tree changed.
///
/// The change may land while a swap is already provisioning from the old
/// sources, so the reason asks for a swap after the in-flight one.
pub struct StaleSource {
    flag: StaleFlag,
}

impl StaleSource {
    pub fn new(flag: StaleFlag) -> Self {
        Self { flag }
    }
}

impl SwapTriggerPolicy for StaleSource {
    fn name(&self) -> &'static str {
        "stale_source"
    }

    fn evaluate(&self, _req: &RequestView<'_>, _ctx: &PolicyContext) -> Option<TriggerReason> {
        if self.flag.take() {
            Some(TriggerReason::after_in_flight("source changed"))
        } else {
            None
        }
    }
}

/// Never fires. Swaps then only happen through the admin route or an eager
/// source watcher.
pub struct Never;

impl SwapTriggerPolicy for Never {
    fn name(&self) -> &'static str {
        "never"
    }

    fn evaluate(&self, _req: &RequestView<'_>, _ctx: &PolicyContext) -> Option<TriggerReason> {
        None
    }
}

/// Fires when any inner policy fires.
///
/// Every inner policy is evaluated on every request so counting policies
/// see all traffic. The first one that fired supplies the reason text; a
/// fresh swap is requested if any of them asked for one.
pub struct AnyOf {
    policies: Vec<Box<dyn SwapTriggerPolicy>>,
}

impl AnyOf {
    pub fn new(policies: Vec<Box<dyn SwapTriggerPolicy>>) -> Self {
        Self { policies }
    }
}

impl SwapTriggerPolicy for AnyOf {
    fn name(&self) -> &'static str {
        "any_of"
    }

    fn evaluate(&self, req: &RequestView<'_>, ctx: &PolicyContext) -> Option<TriggerReason> {
        let mut fired: Option<TriggerReason> = None;
        for policy in &self.policies {
            let Some(reason) = policy.evaluate(req, ctx) else {
                continue;
            };
            match &mut fired {
                None => {
                    let text = format!("{}: {}", policy.name(), reason);
                    fired = Some(TriggerReason {
                        text,
                        after_in_flight: reason.after_in_flight,
                    });
                }
                Some(first) => first.after_in_flight |= reason.after_in_flight,
            }
        }
        fired
    }
}

/// Build the configured policy set.
pub fn build_policy(config: &SwapConfig, stale: &StaleFlag) -> Box<dyn SwapTriggerPolicy> {
    let mut policies: Vec<Box<dyn SwapTriggerPolicy>> = Vec::new();
    for kind in &config.policies {
        match kind {
            PolicyKind::ColdStart => policies.push(Box::new(ColdStart)),
            PolicyKind::NthRequest => {
                if let Some(n) = config.nth_request {
                    policies.push(Box::new(NthRequest::new(n)));
                }
            }
            PolicyKind::Path => {
                if let Some(needle) = &config.path_contains {
                    policies.push(Box::new(PathContains::new(needle.clone())));
                }
            }
            PolicyKind::StaleSource => policies.push(Box::new(StaleSource::new(stale.clone()))),
        }
    }

    match policies.len() {
        0 => Box::new(Never),
        1 => policies.remove(0),
        _ => Box::new(AnyOf::new(policies)),
    }
}
