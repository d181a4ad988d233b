//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (http::server)
//!     → connection.rs (id for log correlation)
//!     → admission.rs (one slot per in-flight dispatch)
//!     → dns.rs (nameserver selection for every outbound dial)
//! ```
//!
//! # Design Decisions
//! - Admission bounds dispatches, not accepts: a CONNECT holds its slot
//!   for the whole life of the tunnel
//! - The nameserver set is immutable after startup and read without locks

pub mod admission;
pub mod connection;
pub mod dns;

pub use admission::{AdmissionController, AdmissionSlot};
pub use connection::ConnectionId;
pub use dns::ResolverSelector;
