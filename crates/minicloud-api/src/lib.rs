//! # minicloud-api
//!
//! The HTTP surface of the MiniCloud control plane: one mount point per
//! entity collection, the image-content upload endpoint, and the error
//! mapping from the shared taxonomy onto status codes and wire bodies.
//!
//! Handlers are thin: parse, call the manager, map the error. All
//! behaviour lives behind the [`minicloud_db::Connection`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod routes;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{router, serve, AppState};
