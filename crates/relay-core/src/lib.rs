//! # relay-core
//!
//! Shared building blocks for the relay workspace.
//!
//! - [`ids`]: `UserId` / `ServerId` newtypes and the presence key scheme
//! - [`event`]: client wire events and the cross-instance delivery payload
//! - [`context`]: deadline + cancellation context for external store calls
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod context;
pub mod event;
pub mod ids;
pub mod logging;

pub use context::{CallContext, Interrupted};
pub use event::{DecodeError, Event, EventKind, RemoteDeliveryPayload};
pub use ids::{ServerId, UserId, presence_key};
