//! Per-entity-type state machines.
//!
//! A machine is a labelled directed multigraph over the state alphabet.
//! Each edge carries an initiator mask; each state may carry one hook. A
//! hook performs external side effects and is responsible for driving the
//! entity out of its state (or into `Error` on unrecoverable failure).
//!
//! Managers call [`StateMachine::notify`] inside their transaction: when a
//! committed transition targets a hooked state, a notification meta key
//! with a fresh notification ID becomes visible to every replica, and the
//! dispatcher (see [`crate::dispatcher`]) runs the hook under a
//! distributed lock. Leaving a hooked state deletes the notification in
//! the same transaction, so a notification key exists iff work is pending.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use minicloud_core::{
    EntityKind, Error, Initiator, InitiatorMask, NotificationId, Result, State,
};

use crate::connection::Connection;
use crate::keys;
use crate::model::{Entity, Record};
use crate::txn::Transaction;

/// A side-effect reducer attached to a state.
///
/// Hooks absorb external errors: failure is expressed by transitioning the
/// entity to `Error` through a retried system update, never by propagating
/// to the dispatcher loop. Hooks must be idempotent; a replica crash can
/// cause a re-run.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Runs the side effect for `record`, which was loaded in this hook's
    /// state.
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record);
}

/// A declarative per-entity-type state machine.
pub struct StateMachine {
    kind: EntityKind,
    initial: Vec<State>,
    transitions: HashMap<State, HashMap<State, InitiatorMask>>,
    hooks: HashMap<State, Arc<dyn Hook>>,
}

impl StateMachine {
    /// Creates an empty machine for the given entity kind.
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            initial: Vec::new(),
            transitions: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    /// Returns the entity kind this machine governs.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Marks `state` as a valid starting state.
    #[must_use]
    pub fn initial_state(mut self, state: State) -> Self {
        if !self.initial.contains(&state) {
            self.initial.push(state);
        }
        self
    }

    fn add_transition(mut self, from: State, to: State, initiator: InitiatorMask) -> Self {
        let mask = self
            .transitions
            .entry(from)
            .or_default()
            .entry(to)
            .or_insert(InitiatorMask::none());
        *mask = mask.union(initiator);
        self
    }

    /// Adds an edge permitting both initiators.
    #[must_use]
    pub fn transition(self, from: State, to: State) -> Self {
        self.add_transition(from, to, InitiatorMask::both())
    }

    /// Adds an edge permitting only user-driven transitions.
    #[must_use]
    pub fn user_transition(self, from: State, to: State) -> Self {
        self.add_transition(from, to, InitiatorMask::user())
    }

    /// Adds an edge permitting only system-driven transitions.
    #[must_use]
    pub fn system_transition(self, from: State, to: State) -> Self {
        self.add_transition(from, to, InitiatorMask::system())
    }

    /// Attaches a hook to a state.
    #[must_use]
    pub fn hook(mut self, state: State, hook: Arc<dyn Hook>) -> Self {
        self.hooks.insert(state, hook);
        self
    }

    /// Validates that `state` is a legal starting state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] otherwise.
    pub fn check_initial_state(&self, state: State) -> Result<()> {
        if self.initial.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { state })
        }
    }

    /// Validates that `(from, to)` is an edge permitting `initiator`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] otherwise.
    pub fn check_transition(&self, from: State, to: State, initiator: Initiator) -> Result<()> {
        let permitted = self
            .transitions
            .get(&from)
            .and_then(|edges| edges.get(&to))
            .is_some_and(|mask| mask.permits(initiator));
        if permitted {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from, to })
        }
    }

    /// Validates and applies a state change to a loaded record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the edge is not permitted.
    pub fn change_state<E: Entity>(
        &self,
        entity: &mut E,
        to: State,
        initiator: Initiator,
    ) -> Result<()> {
        self.check_transition(entity.state(), to, initiator)?;
        entity.header_mut().state = to;
        Ok(())
    }

    /// Returns whether entering `state` requires a notification.
    #[must_use]
    pub fn needs_notify(&self, state: State) -> bool {
        self.hooks.contains_key(&state)
    }

    /// Returns the hook attached to `state`, if any.
    #[must_use]
    pub fn hook_for(&self, state: State) -> Option<Arc<dyn Hook>> {
        self.hooks.get(&state).cloned()
    }

    /// Emits the notification delta for the entity's pending state change.
    ///
    /// Let `from` be the state at load time (`None` at create) and `to`
    /// the current state. Equal states emit nothing. Leaving a hooked
    /// state enqueues deletion of its notification; entering a hooked
    /// state enqueues creation of a notification with a fresh ID.
    pub fn notify<E: Entity>(&self, tx: &mut Transaction, entity: &E) {
        let to = entity.state();
        let from = entity.original_state();
        if from == Some(to) {
            return;
        }
        let id = entity.header().id.to_string();
        if let Some(from) = from {
            if self.needs_notify(from) {
                tx.delete_meta(keys::notify_key(self.kind, &id, from));
            }
        }
        if self.needs_notify(to) {
            let notification_id = NotificationId::generate();
            tracing::debug!(
                entity = %self.kind,
                state = %to,
                notification_id = %notification_id,
                "creating new notification"
            );
            tx.create_meta(keys::notify_key(self.kind, &id, to), notification_id.to_string());
        }
    }

    /// Enqueues deletion of the notification for the entity's current
    /// state, for use by final deletes.
    pub fn delete_notification<E: Entity>(&self, tx: &mut Transaction, entity: &E) {
        let state = entity.state();
        if self.needs_notify(state) {
            let id = entity.header().id.to_string();
            tx.delete_meta(keys::notify_key(self.kind, &id, state));
        }
    }
}

/// The transition graph of the project machine (no hooks).
///
/// Projects have no reconciliation side effects: renames loop on
/// `Created`, deletion is immediate.
#[must_use]
pub fn project_graph() -> StateMachine {
    StateMachine::new(EntityKind::Project)
        .initial_state(State::Created)
        .user_transition(State::Created, State::Created)
        .user_transition(State::Created, State::Deleted)
}

/// The transition graph of the flavor machine (no hooks).
#[must_use]
pub fn flavor_graph() -> StateMachine {
    StateMachine::new(EntityKind::Flavor)
        .initial_state(State::Created)
        .user_transition(State::Created, State::Created)
        .user_transition(State::Created, State::Deleted)
}

/// The transition graph of the image machine.
///
/// Hooks attach to `Deleting` (storage-cluster image removal).
#[must_use]
pub fn image_graph() -> StateMachine {
    StateMachine::new(EntityKind::Image)
        .initial_state(State::Created)
        // Allow updates that keep the state.
        .user_transition(State::Created, State::Created)
        .user_transition(State::Ready, State::Ready)
        .user_transition(State::Created, State::Deleting)
        .user_transition(State::Ready, State::Deleting)
        .user_transition(State::Error, State::Deleting)
        .system_transition(State::Created, State::Uploading)
        .system_transition(State::Uploading, State::Ready)
        .system_transition(State::Created, State::Error)
        .system_transition(State::Uploading, State::Error)
        .system_transition(State::Ready, State::Error)
        .system_transition(State::Deleting, State::Deleted)
        .system_transition(State::Deleting, State::Error)
}

/// The transition graph of the disk machine.
///
/// Hooks attach to `Created` (create/clone), `Updated` (resize) and
/// `Deleting` (removal).
#[must_use]
pub fn disk_graph() -> StateMachine {
    StateMachine::new(EntityKind::Disk)
        .initial_state(State::Created)
        .user_transition(State::Ready, State::Updated)
        .user_transition(State::Ready, State::Deleting)
        .user_transition(State::Error, State::Deleting)
        .system_transition(State::Created, State::Ready)
        .system_transition(State::Updated, State::Ready)
        .system_transition(State::InUse, State::Ready)
        .system_transition(State::Ready, State::InUse)
        .system_transition(State::Created, State::Error)
        .system_transition(State::Ready, State::Error)
        .system_transition(State::Updated, State::Error)
        .system_transition(State::InUse, State::Error)
        .system_transition(State::Deleting, State::Deleted)
        .system_transition(State::Deleting, State::Error)
}

/// The transition graph of the server machine.
///
/// Hooks attach to `Created` (hypervisor start) and `Deleting`
/// (hypervisor teardown).
#[must_use]
pub fn server_graph() -> StateMachine {
    StateMachine::new(EntityKind::Server)
        .initial_state(State::Created)
        // Allow renames without a state change.
        .user_transition(State::Ready, State::Ready)
        .user_transition(State::Ready, State::Deleting)
        .user_transition(State::Error, State::Deleting)
        .system_transition(State::Created, State::Ready)
        .system_transition(State::Created, State::Error)
        .system_transition(State::Deleting, State::Deleted)
        .system_transition(State::Deleting, State::Error)
}

/// The machines for all five entity kinds.
///
/// [`MachineSet::bare`] builds the graphs without hooks, enough for
/// validation and for tests that drive transitions by hand; production
/// wiring attaches hooks before constructing the
/// [`Connection`](crate::connection::Connection).
pub struct MachineSet {
    /// Project machine.
    pub project: StateMachine,
    /// Image machine.
    pub image: StateMachine,
    /// Disk machine.
    pub disk: StateMachine,
    /// Server machine.
    pub server: StateMachine,
    /// Flavor machine.
    pub flavor: StateMachine,
}

impl MachineSet {
    /// Builds all five graphs without hooks.
    #[must_use]
    pub fn bare() -> Self {
        Self {
            project: project_graph(),
            image: image_graph(),
            disk: disk_graph(),
            server: server_graph(),
            flavor: flavor_graph(),
        }
    }

    /// Returns the machine for an entity kind.
    #[must_use]
    pub fn for_kind(&self, kind: EntityKind) -> &StateMachine {
        match kind {
            EntityKind::Project => &self.project,
            EntityKind::Image => &self.image,
            EntityKind::Disk => &self.disk,
            EntityKind::Server => &self.server,
            EntityKind::Flavor => &self.flavor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_states_are_enforced() {
        let disk = disk_graph();
        assert!(disk.check_initial_state(State::Created).is_ok());
        assert!(disk.check_initial_state(State::Ready).is_err());
    }

    #[test]
    fn initiator_masks_are_honoured() {
        let disk = disk_graph();
        assert!(disk
            .check_transition(State::Created, State::Ready, Initiator::System)
            .is_ok());
        assert!(disk
            .check_transition(State::Created, State::Ready, Initiator::User)
            .is_err());
        assert!(disk
            .check_transition(State::Ready, State::Updated, Initiator::User)
            .is_ok());
        assert!(disk
            .check_transition(State::Ready, State::Deleted, Initiator::System)
            .is_err());
    }

    #[test]
    fn every_hookable_state_can_fail_into_error() {
        for graph in [image_graph(), disk_graph(), server_graph()] {
            assert!(graph
                .check_transition(State::Deleting, State::Error, Initiator::System)
                .is_ok());
        }
    }

    #[test]
    fn change_state_mutates_only_on_legal_edges() {
        use crate::model::{Disk, EntityHeader};
        let disk_machine = disk_graph();
        let mut disk = Disk {
            header: EntityHeader::new(State::Ready),
            ..Disk::default()
        };
        assert!(disk_machine
            .change_state(&mut disk, State::InUse, Initiator::User)
            .is_err());
        assert_eq!(disk.state(), State::Ready);
        disk_machine
            .change_state(&mut disk, State::InUse, Initiator::System)
            .unwrap();
        assert_eq!(disk.state(), State::InUse);
    }
}
