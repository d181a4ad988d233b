//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper connection, upgrades enabled, graceful watcher)
//!     → TraceLayer (request span)
//!     → proxy::Dispatcher
//!     → response (or upgrade to a raw tunnel)
//! ```

pub mod server;

pub use server::HttpServer;
