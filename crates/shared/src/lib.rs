//! HelpMate Shared Types
//!
//! This crate contains the chat domain types and the error taxonomy shared by
//! the realtime engine and anything that renders its read model.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
