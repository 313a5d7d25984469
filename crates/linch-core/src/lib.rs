//! # linch-core
//!
//! Shared vocabulary for the Linch extension runtime: the strongly-typed
//! [`ExtensionId`], the unified [`LinchError`] with its stable [`ErrorCode`]s,
//! and the [`EventBus`] each component uses to publish its own typed events.

pub mod error;
pub mod event;
pub mod types;

pub use error::{ErrorCode, ErrorRecord, LinchError, Result};
pub use event::EventBus;
pub use types::*;
