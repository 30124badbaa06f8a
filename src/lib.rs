//! # packrat
//!
//! A local caching forwarder for HTTP payloads.
//!
//! Point a GET or POST at `/<upstream-url-without-scheme>` and packrat
//! fetches the payload, stores it on disk under a human-readable path, and
//! replays it for every later request until the entry outlives its TTL.
//! Concurrent requests for the same entry share a single upstream fetch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use packrat::config::CacheConfig;
//! use packrat::gateway::Gateway;
//! use packrat::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::default();
//!     let gateway = Gateway::new(&config).await?;
//!     let server = Server::bind(format!("0.0.0.0:{}", config.port)).await?;
//!     server.run(move |req| {
//!         let gateway = gateway.clone();
//!         async move { gateway.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod gateway;
pub mod http;
pub mod params;
pub mod server;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::CacheConfig;
pub use gateway::Gateway;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
