//! # keel-core
//!
//! Shared vocabulary for the keel session state subsystem:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::MessageId`], [`ids::CheckpointId`], [`ids::OwnerKey`]
//! - **Domain records**: [`session::Session`], [`session::Message`], [`session::Checkpoint`]
//! - **State machine**: [`session::SessionStatus`] and its transition rules
//! - **Errors**: [`errors::SessionError`], the taxonomy surfaced to the transport layer
//! - **Agent events**: [`events::AgentEvent`] reported by the execution engine

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod session;

pub use errors::SessionError;
pub use ids::{CheckpointId, MessageId, OwnerKey, SessionId};
pub use session::{Checkpoint, Message, MessageRole, NewMessage, Session, SessionStatus};
