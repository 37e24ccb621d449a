//! Lifecycle states and transition initiators.
//!
//! Every entity record carries a [`State`] drawn from the alphabet below;
//! the per-type state machines restrict which subset and which transitions
//! are legal. Each transition edge carries an [`InitiatorMask`] naming who
//! may drive it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state alphabet shared by all entity kinds.
///
/// Each entity type uses a subset; the per-type state machine is the source
/// of truth for which states and transitions are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum State {
    /// Freshly created; side effects may still be pending.
    #[default]
    Created,
    /// Image content is being streamed into the storage cluster.
    Uploading,
    /// A mutation (e.g. resize) was requested and is being applied.
    Updated,
    /// Reconciled and available for use.
    Ready,
    /// Attached to a running server.
    InUse,
    /// A side effect failed; operator attention required.
    Error,
    /// Deletion requested; delete side effects pending.
    Deleting,
    /// Terminal state; the record is removed at this transition.
    Deleted,
}

impl State {
    /// Returns the state name as used in backend notification keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Uploading => "Uploading",
            Self::Updated => "Updated",
            Self::Ready => "Ready",
            Self::InUse => "InUse",
            Self::Error => "Error",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
        }
    }

    /// Parses a state name from a backend notification key segment.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Created" => Some(Self::Created),
            "Uploading" => Some(Self::Uploading),
            "Updated" => Some(Self::Updated),
            "Ready" => Some(Self::Ready),
            "InUse" => Some(Self::InUse),
            "Error" => Some(Self::Error),
            "Deleting" => Some(Self::Deleting),
            "Deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is driving a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// The transition was requested over the HTTP surface.
    User,
    /// The transition is part of reconciliation (hooks, upload flow).
    System,
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::System => f.write_str("system"),
        }
    }
}

/// A set of initiators permitted on a transition edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitiatorMask(u8);

impl InitiatorMask {
    const USER: u8 = 1 << 0;
    const SYSTEM: u8 = 1 << 1;

    /// The empty mask.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// A mask permitting only user-driven transitions.
    #[must_use]
    pub const fn user() -> Self {
        Self(Self::USER)
    }

    /// A mask permitting only system-driven transitions.
    #[must_use]
    pub const fn system() -> Self {
        Self(Self::SYSTEM)
    }

    /// A mask permitting both initiators.
    #[must_use]
    pub const fn both() -> Self {
        Self(Self::USER | Self::SYSTEM)
    }

    /// Returns the union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether the mask permits the given initiator.
    #[must_use]
    pub const fn permits(self, initiator: Initiator) -> bool {
        let bit = match initiator {
            Initiator::User => Self::USER,
            Initiator::System => Self::SYSTEM,
        };
        self.0 & bit != 0
    }
}

impl From<Initiator> for InitiatorMask {
    fn from(initiator: Initiator) -> Self {
        match initiator {
            Initiator::User => Self::user(),
            Initiator::System => Self::system(),
        }
    }
}
