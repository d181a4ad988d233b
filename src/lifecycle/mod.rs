//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting
//!             → DrainController: keep-alive off, wait for in-flight
//!               requests and tunnels → exit status
//! ```
//!
//! # Design Decisions
//! - Shutdown is cooperative: tunnels end when a peer closes
//! - The drain has a deadline; missing it is a shutdown failure

pub mod shutdown;
pub mod signals;

pub use shutdown::{DrainController, Shutdown, ShutdownSignal};
