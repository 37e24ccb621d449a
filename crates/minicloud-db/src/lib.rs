//! # minicloud-db
//!
//! The transactional heart of the MiniCloud control plane:
//!
//! - **Backend gateway**: serializable reads, prefix watches and multi-op
//!   compare-and-set transactions over the coordination backend, with a
//!   session lease kept alive per replica
//! - **Entity model**: typed records with a common header and `original`
//!   snapshotting
//! - **Transaction builder**: one-shot atomic multi-op submissions with
//!   optimistic-concurrency guards
//! - **Managers**: per-entity CRUD enforcing validation, referential
//!   integrity and uniqueness
//! - **State machines**: declarative per-type transition graphs with
//!   side-effect hooks and notification emission
//! - **Dispatcher**: the watcher/worker pair that turns committed intent
//!   into at-most-one-worker-at-a-time hook execution across replicas
//!
//! The production backend is etcd ([`etcd::EtcdBackend`]); tests run the
//! identical semantics in process via [`memory::MemoryCluster`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod connection;
pub mod dispatcher;
pub mod etcd;
pub mod fsm;
pub mod keys;
pub mod managers;
pub mod memory;
pub mod model;
pub mod options;
pub mod txn;

pub use backend::{Compare, KvBackend, RawValue, TxnOp};
pub use connection::Connection;
pub use dispatcher::watch_notifications;
pub use etcd::EtcdBackend;
pub use fsm::{Hook, MachineSet, StateMachine};
pub use memory::{MemoryBackend, MemoryCluster};
pub use model::{Disk, Entity, EntityHeader, Flavor, Image, Project, Record, Server};
pub use options::init_options;
pub use txn::Transaction;
