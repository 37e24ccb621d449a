//! Backend key layout.
//!
//! All control-plane state lives under `/minicloud`:
//!
//! - `/minicloud/db/data/<kind>/<id>` - entity records (JSON)
//! - `/minicloud/db/meta/<kind>/name/<name>` - global uniqueness claims
//! - `/minicloud/db/meta/<kind>/project/<pid>/name/<name>` - per-project claims
//! - `/minicloud/db/meta/notify-fsm/<kind>/<id>/<state>` - hook notifications
//! - `/minicloud/db/meta/notify-fsm/<kind>/<id>/<state>/lock` - worker locks
//! - `/minicloud/config/global/<name>` - dynamic options

use minicloud_core::{EntityKind, ProjectId, State};

/// Prefix of the entity data tree.
pub const DATA_PREFIX: &str = "/minicloud/db/data";

/// Prefix of the meta tree (uniqueness claims, notifications, locks).
pub const META_PREFIX: &str = "/minicloud/db/meta";

/// Prefix watched by the notification dispatcher.
pub const NOTIFY_PREFIX: &str = "/minicloud/db/meta/notify-fsm/";

/// Prefix watched by the dynamic-option loader.
pub const CONFIG_PREFIX: &str = "/minicloud/config/global/";

/// Suffix distinguishing a worker lock from its notification.
pub const LOCK_SUFFIX: &str = "/lock";

/// Returns the data key of an entity record.
#[must_use]
pub fn data_key(kind: EntityKind, id: &str) -> String {
    format!("{DATA_PREFIX}/{kind}/{id}")
}

/// Returns the data prefix of all records of a kind (trailing slash).
#[must_use]
pub fn data_prefix(kind: EntityKind) -> String {
    format!("{DATA_PREFIX}/{kind}/")
}

/// Returns the globally-scoped uniqueness claim key for a name.
#[must_use]
pub fn name_key(kind: EntityKind, name: &str) -> String {
    format!("{META_PREFIX}/{kind}/name/{name}")
}

/// Returns the per-project uniqueness claim key for a name.
#[must_use]
pub fn project_name_key(kind: EntityKind, project: ProjectId, name: &str) -> String {
    format!("{META_PREFIX}/{kind}/project/{project}/name/{name}")
}

/// Returns the notification key for an entity sitting in a hooked state.
#[must_use]
pub fn notify_key(kind: EntityKind, id: &str, state: State) -> String {
    format!("{NOTIFY_PREFIX}{kind}/{id}/{state}")
}

/// Returns the lock key guarding a notification.
#[must_use]
pub fn lock_key(notify_key: &str) -> String {
    format!("{notify_key}{LOCK_SUFFIX}")
}

/// Returns the dynamic-option key for an option name.
#[must_use]
pub fn config_key(name: &str) -> String {
    format!("{CONFIG_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicloud_core::DiskId;

    #[test]
    fn keys_are_bit_exact() {
        let disk = DiskId::generate();
        let id = disk.to_string();
        assert_eq!(
            data_key(EntityKind::Disk, &id),
            format!("/minicloud/db/data/disk/{id}")
        );
        assert_eq!(
            name_key(EntityKind::Project, "alpha"),
            "/minicloud/db/meta/project/name/alpha"
        );
        let project = ProjectId::generate();
        assert_eq!(
            project_name_key(EntityKind::Image, project, "ubuntu"),
            format!("/minicloud/db/meta/image/project/{project}/name/ubuntu")
        );
        let notify = notify_key(EntityKind::Disk, &id, State::Created);
        assert_eq!(
            notify,
            format!("/minicloud/db/meta/notify-fsm/disk/{id}/Created")
        );
        assert_eq!(lock_key(&notify), format!("{notify}/lock"));
        assert_eq!(config_key("retry_count"), "/minicloud/config/global/retry_count");
    }
}
