//! Per-entity CRUD managers.
//!
//! A manager validates fields, maintains back-references on related
//! entities, claims and forfeits uniqueness meta keys, and emits
//! state-machine notifications, all inside one transaction per call.
//! Managers return errors directly; retrying conflicts is the caller's
//! concern (user calls surface 409, system calls go through the retry
//! helper).

mod disk;
mod flavor;
mod image;
mod project;
mod server;

pub use disk::DiskManager;
pub use flavor::FlavorManager;
pub use image::ImageManager;
pub use project::ProjectManager;
pub use server::ServerManager;

use regex::Regex;

use minicloud_core::{EntityKind, Error, Result};

pub(crate) fn check_field_regex(
    kind: EntityKind,
    field: &'static str,
    value: &str,
    regex: &Regex,
) -> Result<()> {
    if regex.is_match(value) {
        Ok(())
    } else {
        Err(Error::field(
            kind,
            field,
            format!("Field must match regexp: {regex}"),
        ))
    }
}

pub(crate) const READ_ONLY: &str = "Field is read-only";
pub(crate) const MUST_BE_EMPTY: &str = "Should be empty";
