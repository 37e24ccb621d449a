//! # minicloud-core
//!
//! Core abstractions for the MiniCloud control plane.
//!
//! This crate provides the foundational types used across all MiniCloud
//! components:
//!
//! - **Identifiers**: Strongly-typed ULIDs for every entity kind
//! - **States**: The lifecycle alphabet and transition initiators
//! - **Error Types**: The shared error taxonomy and result alias
//! - **Configuration**: The dynamic option catalogue updated from the
//!   coordination backend
//! - **Retry/Backoff**: Bounded retry of conflicting transactions and
//!   exponential backoff for external connect attempts
//!
//! ## Crate Boundary
//!
//! `minicloud-core` is the only crate allowed to define shared primitives.
//! It knows nothing about the coordination backend, the storage cluster or
//! the hypervisor; those live in the crates that depend on it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod id;
pub mod observability;
pub mod retry;
pub mod state;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use id::{DiskId, EntityKind, FlavorId, ImageId, NotificationId, ProjectId, ServerId};
pub use observability::{init_logging, LogFormat};
pub use retry::{retry, OPT_RETRY_COUNT};
pub use state::{Initiator, InitiatorMask, State};
