//! Shared domain types for the fleetgate control plane: the common error
//! type, typed configuration, the device action algebra, and token usage
//! accounting.

pub mod action;
pub mod config;
pub mod error;
pub mod usage;

pub use error::{ChannelErrorKind, Error, Result};
pub use usage::TokenUsage;
