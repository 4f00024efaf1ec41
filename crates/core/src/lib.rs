//! `marketflow-core`: domain building blocks shared by every service.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{NotificationId, OrderId, ProductId, UserId};
