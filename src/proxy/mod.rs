pub mod admin;
pub mod connection;
pub mod error;
pub mod server;
pub mod shutdown;
pub mod upstream;

pub use server::{build_router, ProxyHandle, ProxyServer, ServerError};
