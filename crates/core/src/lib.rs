//! `feedback-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the user/message records that the
//! message-persistence jobs write to.

pub mod error;
pub mod id;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use user::{Message, User, Username};
