//! The per-replica transport contract.
//!
//! A [`ValueStore`] wraps one replica endpoint's RPC channel; a
//! [`StoreFactory`] dials them. Both are traits so the replication engine
//! stays generic over the wire protocol: real deployments plug in their
//! transport crate, unit tests plug in mocks.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::TransportOptions;
use crate::ring::Key;

/// Errors produced by a single backend store.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The key is absent on this replica. Deletes leave tombstones, so the
    /// reply still carries the tombstone's timestamp.
    #[error("not found")]
    NotFound { timestamp_micro: i64 },

    /// A recent dial for this address failed and the pool is negatively
    /// caching the failure until its retry deadline.
    #[error("store for {addr} unavailable: {reason}")]
    Unavailable { addr: String, reason: String },

    /// Transport-level failure: connect, send, receive, or decode.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation was cancelled before this replica answered.
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// True when this replica reported the key absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    /// Timestamp carried by an errored reply: tombstones report their
    /// timestamp, every other failure reports zero.
    pub(crate) fn reply_timestamp(&self) -> i64 {
        match self {
            BackendError::NotFound { timestamp_micro } => *timestamp_micro,
            _ => 0,
        }
    }
}

/// A single-endpoint value-store client.
///
/// Cancellation is enforced by the replication engine, which drops in-flight
/// call futures when the caller's token fires, so implementations must
/// tolerate being dropped mid-call.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Returns the record's timestamp and value length without the value.
    async fn lookup(&self, key: Key) -> Result<(i64, u32), BackendError>;

    /// Returns the record's timestamp and value.
    async fn read(&self, key: Key) -> Result<(i64, Vec<u8>), BackendError>;

    /// Stores `value` at `timestamp_micro`; returns the timestamp the record
    /// had before, zero if it is new. The store keeps whichever version has
    /// the higher timestamp.
    async fn write(
        &self,
        key: Key,
        timestamp_micro: i64,
        value: &[u8],
    ) -> Result<i64, BackendError>;

    /// Writes a tombstone at `timestamp_micro`; returns the prior timestamp.
    async fn delete(&self, key: Key, timestamp_micro: i64) -> Result<i64, BackendError>;

    /// Closes the connection. The handle must not be used afterwards.
    async fn shutdown(&self) -> Result<(), BackendError>;
}

/// Dials [`ValueStore`] handles for replica addresses.
///
/// `connect` must not block on the network: it builds a lazily-connecting
/// handle and lets real connection errors surface on first use. An `Err`
/// here is negatively cached by the pool for the configured retry delay.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn connect(
        &self,
        addr: &str,
        concurrency: usize,
        transport: &TransportOptions,
    ) -> Result<Arc<dyn ValueStore>, BackendError>;
}

/// Error sentinel installed in the pool when a dial fails.
///
/// Every call errors immediately, short-circuiting fan-outs to a dead
/// address until the eviction deadline lets a fresh dial happen.
#[derive(Debug)]
pub(crate) struct UnavailableStore {
    addr: String,
    reason: String,
}

impl UnavailableStore {
    pub(crate) fn new(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    fn err(&self) -> BackendError {
        BackendError::Unavailable {
            addr: self.addr.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[async_trait]
impl ValueStore for UnavailableStore {
    async fn lookup(&self, _key: Key) -> Result<(i64, u32), BackendError> {
        Err(self.err())
    }

    async fn read(&self, _key: Key) -> Result<(i64, Vec<u8>), BackendError> {
        Err(self.err())
    }

    async fn write(
        &self,
        _key: Key,
        _timestamp_micro: i64,
        _value: &[u8],
    ) -> Result<i64, BackendError> {
        Err(self.err())
    }

    async fn delete(&self, _key: Key, _timestamp_micro: i64) -> Result<i64, BackendError> {
        Err(self.err())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        Err(self.err())
    }
}
