//! Configuration loading and validation.

mod loader;
mod types;

pub use loader::ConfigError;
pub use types::{BackendConfig, Config, Defaults, PolicyKind, ProxyConfig, SwapConfig};
