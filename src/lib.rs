//! Pyrite - a client library for sharded, replicated value-store clusters
//!
//! The client locates the replicas for a key through a consistent-hashing
//! ring, fans each operation out to all of them in parallel, reconciles
//! reads by highest caller-supplied timestamp, and tolerates strict-minority
//! failures on writes and deletes. Ring updates stream in from a
//! control-plane service and are persisted to disk so restarts can resolve
//! replicas before the control plane answers.
//!
//! The per-replica transport and the control-plane protocol are consumed
//! through the [`backend`] and [`source`] traits; deployments plug in their
//! wire protocol, tests plug in fakes.

pub mod backend;
pub mod config;
mod error;
mod pool;
pub mod ring;
pub mod source;
pub mod store;

pub use config::{ConfigError, ReplConfig, TransportOptions};
pub use error::{AggregateError, AggregateKind, PyriteError, ReplicaFailure};
pub use ring::{Key, Node, Ring, RingError};
pub use store::{ReplStore, Stats};
