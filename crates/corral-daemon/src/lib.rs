//! HTTP control daemon for corral.
//!
//! Wraps a [`corral_core::DomainManager`] in a small JSON API.

pub mod config;
pub mod http;

pub use config::{ConfigError, DaemonConfig};
pub use http::{build_router, serve, ApiError, AppState};
