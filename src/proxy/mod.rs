//! Forward proxy core.
//!
//! # Data Flow
//! ```text
//! Request from the server
//!     → dispatch.rs (admission slot, CONNECT or not)
//!         → forward.rs (plain HTTP: origin round trip, response relayed verbatim)
//!         → tunnel.rs  (CONNECT: dial, 200, hijack)
//!             → relay.rs (one task per direction, both joined)
//! ```
//!
//! # Design Decisions
//! - Failures are answered or logged where they happen; nothing escapes the dispatcher
//! - Timeouts cover dialing and the forwarded round trip, never tunnel data

pub mod dispatch;
pub mod forward;
pub mod relay;
pub mod tunnel;

pub use dispatch::Dispatcher;
pub use forward::Forwarder;
pub use tunnel::{TunnelEstablisher, TunnelState};
