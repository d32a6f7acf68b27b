//! # keel-session
//!
//! Session state service shared by every transport (HTTP, WebSocket, queue
//! consumers). All session state transitions go through [`SessionService`]:
//!
//! - cache-aside reads of the session projection
//! - lock-guarded, version-checked read-modify-write updates
//! - checkpoints and rewind
//! - idempotent application of agent lifecycle events ([`EventOutcome`])
//! - interrupt signalling to the execution engine ([`InterruptRegistry`])
//!
//! Storage and cache errors are translated into
//! [`keel_core::SessionError`] before they leave this crate.

#![deny(unsafe_code)]

mod cache;
mod checkpoints;
mod errors;
pub mod events;
pub mod interrupts;
pub mod service;

pub use events::EventOutcome;
pub use interrupts::InterruptRegistry;
pub use service::{CacheMode, CreateSession, ForkOptions, HealthReport, SessionFilter, SessionService};
