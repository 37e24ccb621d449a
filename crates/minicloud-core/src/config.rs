//! Dynamic configuration options.
//!
//! Options are registered process-wide at first use and updated live from
//! the coordination backend: the db layer watches
//! `/minicloud/config/global/` and feeds every change through [`apply`].
//! A key that is absent (or deleted) resets the option to its compiled-in
//! default. Updates carry the backend revision; stale revisions are
//! ignored, mirroring the watcher's replay-plus-watch startup overlap.
//!
//! Consumers declare options as statics:
//!
//! ```rust
//! use std::sync::LazyLock;
//! use minicloud_core::config::{self, ConfigOption};
//!
//! static OPT_POOL: LazyLock<&'static ConfigOption<String>> =
//!     LazyLock::new(|| config::string_opt("default_pool", "rbd"));
//!
//! assert_eq!(OPT_POOL.value(), "rbd");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};

/// A value type that can back a configuration option.
///
/// Values are stored in the backend as JSON; durations are encoded as
/// integer milliseconds.
pub trait OptionValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Parses a value from its backend JSON encoding.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the payload does not decode.
    fn parse(data: &[u8]) -> Result<Self>;
}

impl OptionValue for String {
    fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl OptionValue for i64 {
    fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl OptionValue for Duration {
    fn parse(data: &[u8]) -> Result<Self> {
        let millis: i64 = serde_json::from_slice(data)?;
        u64::try_from(millis)
            .map(Duration::from_millis)
            .map_err(|_| Error::Serialization {
                message: format!("duration must be non-negative, got {millis}ms"),
            })
    }
}

struct Slot<T> {
    value: T,
    rev: i64,
}

/// A single dynamic option with a compiled-in default.
pub struct ConfigOption<T: OptionValue> {
    name: &'static str,
    default: T,
    slot: RwLock<Slot<T>>,
    listeners: Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: OptionValue> ConfigOption<T> {
    fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            default: default.clone(),
            slot: RwLock::new(Slot {
                value: default,
                rev: -1,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the option name (the last segment of its backend key).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the current value.
    #[must_use]
    pub fn value(&self) -> T {
        self.slot.read().expect("option lock poisoned").value.clone()
    }

    /// Registers a callback invoked on every value change.
    pub fn listen(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("option lock poisoned")
            .push(Box::new(callback));
    }

    fn set(&self, new_value: T, rev: i64) {
        let changed = {
            let mut slot = self.slot.write().expect("option lock poisoned");
            if rev < slot.rev {
                tracing::debug!(option = self.name, rev, current = slot.rev, "skipping stale option update");
                return;
            }
            slot.rev = rev;
            if slot.value == new_value {
                false
            } else {
                slot.value = new_value.clone();
                true
            }
        };
        if changed {
            tracing::info!(option = self.name, rev, value = ?new_value, "option updated");
            for listener in self.listeners.lock().expect("option lock poisoned").iter() {
                listener(&new_value);
            }
        }
    }
}

trait DynOption: Send + Sync {
    fn apply_raw(&self, data: Option<&[u8]>, rev: i64);
}

impl<T: OptionValue> DynOption for ConfigOption<T> {
    fn apply_raw(&self, data: Option<&[u8]>, rev: i64) {
        match data {
            Some(bytes) => match T::parse(bytes) {
                Ok(value) => self.set(value, rev),
                Err(e) => {
                    tracing::error!(option = self.name, error = %e, "failed to parse option value");
                }
            },
            None => self.set(self.default.clone(), rev),
        }
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<&'static str, &'static dyn DynOption>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn register<T: OptionValue>(option: ConfigOption<T>) -> &'static ConfigOption<T> {
    let leaked: &'static ConfigOption<T> = Box::leak(Box::new(option));
    let mut registry = REGISTRY.lock().expect("option registry poisoned");
    assert!(
        registry.insert(leaked.name, leaked).is_none(),
        "option '{}' registered twice",
        leaked.name
    );
    leaked
}

/// Registers a string option with the given default.
#[must_use]
pub fn string_opt(name: &'static str, default: &str) -> &'static ConfigOption<String> {
    register(ConfigOption::new(name, default.to_string()))
}

/// Registers an integer option with the given default.
#[must_use]
pub fn int_opt(name: &'static str, default: i64) -> &'static ConfigOption<i64> {
    register(ConfigOption::new(name, default))
}

/// Registers a duration option (encoded as integer milliseconds).
#[must_use]
pub fn duration_opt(name: &'static str, default: Duration) -> &'static ConfigOption<Duration> {
    register(ConfigOption::new(name, default))
}

/// Routes a backend update to the named option.
///
/// `data` is `None` when the key was deleted; the option resets to its
/// default. Unknown names are ignored so that new options can be written to
/// the backend before every replica understands them.
pub fn apply(name: &str, data: Option<&[u8]>, rev: i64) {
    let option = {
        let registry = REGISTRY.lock().expect("option registry poisoned");
        registry.get(name).copied()
    };
    match option {
        Some(option) => option.apply_raw(data, rev),
        None => tracing::debug!(option = name, "ignoring update for unknown option"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn value_defaults_until_applied() {
        let opt = string_opt("test_pool_name", "rbd");
        assert_eq!(opt.value(), "rbd");

        apply("test_pool_name", Some(b"\"volumes\""), 5);
        assert_eq!(opt.value(), "volumes");
    }

    #[test]
    fn stale_revision_is_ignored() {
        let opt = int_opt("test_stale_int", 7);
        apply("test_stale_int", Some(b"10"), 20);
        apply("test_stale_int", Some(b"3"), 10);
        assert_eq!(opt.value(), 10);
    }

    #[test]
    fn delete_resets_to_default() {
        let opt = int_opt("test_reset_int", 42);
        apply("test_reset_int", Some(b"1"), 3);
        assert_eq!(opt.value(), 1);
        apply("test_reset_int", None, 4);
        assert_eq!(opt.value(), 42);
    }

    #[test]
    fn duration_parses_milliseconds() {
        let opt = duration_opt("test_duration_ms", Duration::from_secs(5));
        apply("test_duration_ms", Some(b"1500"), 2);
        assert_eq!(opt.value(), Duration::from_millis(1500));
    }

    #[test]
    fn listener_fires_on_change_only() {
        let opt = string_opt("test_listener", "a");
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        opt.listen(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        apply("test_listener", Some(b"\"b\""), 1);
        apply("test_listener", Some(b"\"b\""), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_option_is_ignored() {
        apply("test_never_registered", Some(b"1"), 1);
    }
}
