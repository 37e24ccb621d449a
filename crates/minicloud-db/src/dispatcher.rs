//! The notification dispatcher.
//!
//! Runs on every replica as a watcher/worker pair sharing a work queue.
//!
//! The **watcher** replays the notification prefix once at startup, then
//! consumes the watch stream, suppressing events older than the highest
//! revision already dispatched. Notification puts record interest and
//! enqueue work; notification deletes withdraw both; lock puts mean some
//! replica claimed the job; lock deletes re-enqueue if interest remains.
//!
//! The **worker** claims each job with a single transaction (guard that
//! the notification still exists with the observed ID, put-if-absent of
//! the lease-bound lock) and silently abandons the job when another
//! replica won or the notification was superseded. It then loads the
//! entity, re-checks the state, and invokes the state's hook. The lock
//! release is guarded on the lock still holding this replica's lease id;
//! failure to release is fatal to the replica (the lease TTL frees the
//! lock for the cluster).

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use minicloud_core::observability::hook_span;
use minicloud_core::{EntityKind, NotificationId, Result, State};

use crate::backend::RawValue;
use crate::connection::Connection;
use crate::keys::{lock_key, LOCK_SUFFIX, NOTIFY_PREFIX};
use crate::model::Record;

#[derive(Debug, Clone)]
struct Job {
    key: String,
    id: NotificationId,
}

/// Work handoff between watcher and worker.
///
/// The fast path is a non-blocking channel send; when the worker is busy
/// the job lands on a mutex-guarded deferred list instead, so discovery
/// never blocks the watcher and the channel never grows without bound.
struct WorkQueue {
    tx: mpsc::Sender<Job>,
    deferred: Mutex<Vec<Job>>,
}

impl WorkQueue {
    fn new() -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                tx,
                deferred: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    fn enqueue(&self, job: Job) {
        if let Err(send_err) = self.tx.try_send(job) {
            let job = match send_err {
                mpsc::error::TrySendError::Full(job)
                | mpsc::error::TrySendError::Closed(job) => job,
            };
            self.deferred.lock().expect("queue lock poisoned").push(job);
        }
    }

    fn remove(&self, key: &str) {
        self.deferred
            .lock()
            .expect("queue lock poisoned")
            .retain(|job| job.key != key);
    }

    fn pop_deferred(&self) -> Option<Job> {
        self.deferred.lock().expect("queue lock poisoned").pop()
    }
}

struct Watcher {
    min_rev: i64,
    interest: std::collections::HashMap<String, NotificationId>,
}

impl Watcher {
    fn new() -> Self {
        Self {
            min_rev: 0,
            interest: std::collections::HashMap::new(),
        }
    }

    fn handle_raw(&mut self, queue: &WorkQueue, raw: &RawValue, force: bool) {
        if !force && raw.modify_rev < self.min_rev {
            tracing::debug!(
                key = %raw.key,
                rev = raw.modify_rev,
                min_rev = self.min_rev,
                "skipping stale notification"
            );
            return;
        }
        if raw.modify_rev > self.min_rev {
            self.min_rev = raw.modify_rev;
        }

        if let Some(notify_key) = raw.key.strip_suffix(LOCK_SUFFIX) {
            if raw.is_absent() {
                // Lock released; re-enqueue if the notification is still live.
                tracing::debug!(key = %raw.key, "lock released");
                if let Some(id) = self.interest.get(notify_key) {
                    queue.enqueue(Job {
                        key: notify_key.to_string(),
                        id: *id,
                    });
                }
            } else {
                // Some replica claimed this notification.
                tracing::debug!(key = %raw.key, "lock taken");
                queue.remove(notify_key);
            }
        } else if raw.is_absent() {
            queue.remove(&raw.key);
            self.interest.remove(&raw.key);
        } else {
            let data = String::from_utf8_lossy(&raw.data);
            let Ok(id) = NotificationId::from_str(&data) else {
                tracing::error!(key = %raw.key, data = %data, "failed to parse notification id");
                return;
            };
            self.interest.insert(raw.key.clone(), id);
            queue.enqueue(Job {
                key: raw.key.clone(),
                id,
            });
        }
    }
}

/// Starts the watcher and worker tasks for this replica.
///
/// Reads the notification prefix once (after opening the watch, so no
/// event can fall between), replays it, then follows the stream until
/// `shutdown` fires. The in-flight hook runs to completion on shutdown.
///
/// # Errors
///
/// Returns a backend error when the initial prefix read fails.
pub async fn watch_notifications(
    shutdown: CancellationToken,
    conn: Arc<Connection>,
) -> Result<()> {
    let mut events = conn
        .backend()
        .watch_prefix(NOTIFY_PREFIX, shutdown.clone());
    let initial = conn.backend().read_prefix(NOTIFY_PREFIX).await?;
    let (queue, mut rx) = WorkQueue::new();

    let watcher_queue = queue.clone();
    let watcher_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut watcher = Watcher::new();
        for raw in &initial {
            watcher.handle_raw(&watcher_queue, raw, true);
        }
        loop {
            tokio::select! {
                () = watcher_shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(raw) = event else { break };
                    watcher.handle_raw(&watcher_queue, &raw, false);
                }
            }
        }
        tracing::info!("stopped watching state change notifications");
    });

    tokio::spawn(async move {
        loop {
            let job = if let Some(job) = queue.pop_deferred() {
                job
            } else {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        job
                    }
                }
            };
            process_job(&shutdown, &conn, &job).await;
        }
        tracing::info!("stopped working on state transitions");
    });

    Ok(())
}

async fn load_record(conn: &Connection, kind: EntityKind, id: &str) -> Result<Record> {
    match kind {
        EntityKind::Project => Ok(Record::Project(conn.projects().get(id.parse()?).await?)),
        EntityKind::Image => Ok(Record::Image(conn.images().get(id.parse()?).await?)),
        EntityKind::Disk => Ok(Record::Disk(conn.disks().get(id.parse()?).await?)),
        EntityKind::Server => Ok(Record::Server(conn.servers().get(id.parse()?).await?)),
        EntityKind::Flavor => Ok(Record::Flavor(conn.flavors().get(id.parse()?).await?)),
    }
}

async fn process_job(shutdown: &CancellationToken, conn: &Connection, job: &Job) {
    let Some(rest) = job.key.strip_prefix(NOTIFY_PREFIX) else {
        tracing::error!(key = %job.key, "invalid notification key");
        return;
    };
    let elements: Vec<&str> = rest.split('/').collect();
    let (kind, id, state) = match elements.as_slice() {
        [kind, id, state] => (*kind, *id, *state),
        _ => {
            tracing::error!(key = %job.key, "invalid notification key");
            return;
        }
    };
    let Ok(kind) = EntityKind::from_str(kind) else {
        tracing::error!(key = %job.key, "unknown entity in notification key");
        return;
    };
    let Some(state) = State::parse(state) else {
        tracing::error!(key = %job.key, "unknown state in notification key");
        return;
    };

    // Claim the notification: it must still exist with the ID we observed,
    // and no other replica may hold the lock.
    let lock = lock_key(&job.key);
    let mut tx = conn.new_transaction();
    tx.check_meta(job.key.as_str(), job.id.to_string());
    tx.acquire_lock(lock.as_str());
    match tx.commit().await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            tracing::debug!(key = %job.key, "notification already claimed or superseded");
            return;
        }
        Err(e) => {
            tracing::error!(key = %job.key, error = %e, "failed to acquire notification lock");
            return;
        }
    }

    let span = hook_span(kind.as_str(), id, state.as_str(), &job.id.to_string());
    async {
        match load_record(conn, kind, id).await {
            Ok(record) if record.state() != state => {
                tracing::info!(
                    entity = %kind,
                    id,
                    state = %record.state(),
                    expected_state = %state,
                    "entity has moved on, abandoning notification"
                );
            }
            Ok(record) => match conn.machines().for_kind(kind).hook_for(state) {
                Some(hook) => hook.run(shutdown.clone(), conn, record).await,
                None => {
                    tracing::error!(entity = %kind, state = %state, "no hook for notified state");
                }
            },
            Err(e) => {
                tracing::error!(entity = %kind, id, error = %e, "failed to load entity");
            }
        }
    }
    .instrument(span)
    .await;

    // Release under the lease-id guard. A failure here means our view of
    // the lock diverged from the backend; the replica must die and let the
    // lease TTL clean up.
    let mut tx = conn.new_transaction();
    tx.release_lock(lock.as_str());
    if let Err(e) = tx.commit().await {
        tracing::error!(key = %lock, error = %e, "failed to release notification lock");
        std::process::exit(1);
    }
}
