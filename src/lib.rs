//! Zero-downtime generation swapping behind a stable front door.
//!
//! A [`swap::SwapCoordinator`] owns backend generations and swaps them one
//! at a time. Inbound HTTP requests pass through a [`gate::RequestGate`] and
//! sideband connections through a [`tunnel::TunnelProxy`]; both hold work
//! while a swap is preparing and bind it to the active generation afterwards.

pub mod artifact;
pub mod backend;
pub mod config;
pub mod gate;
pub mod generation;
pub mod logging;
pub mod proxy;
pub mod swap;
pub mod tunnel;
