//! The replicated store client.
//!
//! [`ReplStore`] presents a sharded, replicated cluster as one logical
//! value store. Every operation resolves the responsible replicas through
//! the current ring, fans out to all of them in parallel, and reconciles:
//! reads and lookups take the highest-timestamp reply and succeed if any
//! replica answered, writes and deletes succeed while failures stay a
//! strict minority. Ordering between writes is carried entirely by the
//! caller-supplied microsecond timestamps; the client never consults a
//! clock.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Mutex, RwLock, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{BackendError, StoreFactory};
use crate::config::{ReplConfig, TransportOptions};
use crate::error::{AggregateError, PyriteError, ReplicaFailure};
use crate::pool::{ConnectionPool, StoreEntry};
use crate::ring::{cache, Key, Node, Ring};
use crate::source::{Connector, EndpointDiscovery, RingSink, RingSource};

/// Client for a replicated value-store cluster.
///
/// The store is safe to use from many tasks at once. Operations work as
/// soon as a ring is known, whether from the on-disk cache, a
/// [`ReplStore::set_ring`] call, or the control-plane subscription started
/// by [`ReplStore::startup`].
pub struct ReplStore {
    value_cap: u32,
    ring_server: Option<String>,
    ring_server_transport: TransportOptions,
    ring_client_id: String,
    source: Arc<dyn RingSource>,
    discovery: Option<Arc<dyn EndpointDiscovery>>,
    routing: Arc<Routing>,
    connector: Mutex<Option<watch::Sender<bool>>>,
}

/// The ring plus the connection pool: everything needed to route an
/// operation. Shared between the client and its control-plane connector
/// task, which feeds rings in through [`RingSink`].
struct Routing {
    address_index: usize,
    ring_cache_path: Option<PathBuf>,
    ring: RwLock<Option<Arc<Ring>>>,
    pool: ConnectionPool,
}

impl Routing {
    fn node_address(&self, node: &Node) -> String {
        // A node without enough addresses resolves to the empty string; the
        // dial fails and the replica counts as errored, same as any other
        // unreachable store.
        node.address(self.address_index)
            .unwrap_or_default()
            .to_string()
    }

    /// Installs a new ring: persists it to the cache (best-effort), swaps
    /// the live ring, then drops and shuts down pool entries for addresses
    /// the new ring no longer references.
    async fn set_ring(&self, ring: Ring) {
        let ring = Arc::new(ring);
        {
            let mut current = self.ring.write().await;
            if let Some(path) = &self.ring_cache_path {
                cache::store(path, &ring);
            }
            *current = Some(Arc::clone(&ring));
        }
        let keep: HashSet<String> = ring
            .nodes()
            .iter()
            .map(|node| self.node_address(node))
            .collect();
        self.pool.retain(&keep).await;
    }

    /// Resolves the pooled entries responsible for `key` under the current
    /// ring.
    async fn stores_for(
        &self,
        cancel: &CancellationToken,
        key: Key,
    ) -> Result<Vec<Arc<StoreEntry>>, PyriteError> {
        let ring = self.ring.read().await.clone();
        if cancel.is_cancelled() {
            return Err(PyriteError::Cancelled);
        }
        let ring = ring.ok_or(PyriteError::NoRing)?;
        let partition = key.partition(ring.partition_bit_count());
        let addrs: Vec<String> = ring
            .responsible_nodes(partition)
            .iter()
            .map(|node| self.node_address(node))
            .collect();
        self.pool.resolve(cancel, &addrs).await
    }
}

#[async_trait]
impl RingSink for Routing {
    async fn apply_ring(&self, ring: Ring) {
        self.set_ring(ring).await;
    }
}

impl ReplStore {
    /// Builds a client from configuration plus the two transport hooks.
    /// If a ring cache path is configured and holds a valid ring, replicas
    /// can be resolved immediately, without control-plane contact.
    pub fn new(
        config: ReplConfig,
        factory: Arc<dyn StoreFactory>,
        source: Arc<dyn RingSource>,
    ) -> Self {
        let cached = config
            .ring_cache_path
            .as_deref()
            .and_then(cache::load)
            .map(Arc::new);
        Self {
            value_cap: config.value_cap,
            ring_server: config.ring_server,
            ring_server_transport: config.ring_server_transport,
            ring_client_id: config.ring_client_id,
            source,
            discovery: None,
            routing: Arc::new(Routing {
                address_index: config.address_index,
                ring_cache_path: config.ring_cache_path,
                ring: RwLock::new(cached),
                pool: ConnectionPool::new(
                    factory,
                    config.transport,
                    config.concurrent_requests_per_store,
                    config.failed_connect_retry_delay,
                ),
            }),
            connector: Mutex::new(None),
        }
    }

    /// Installs the service-discovery hook used to locate the control plane
    /// when no explicit ring server is configured.
    pub fn with_discovery(mut self, discovery: Arc<dyn EndpointDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Starts the control-plane subscription if it is not already running.
    ///
    /// Startup is optional: a client fed rings through [`Self::set_ring`]
    /// (or the cache) works without it. It never blocks on the first ring
    /// delivery; operations before any ring is known fail with
    /// [`PyriteError::NoRing`].
    pub async fn startup(&self) -> Result<(), PyriteError> {
        let mut connector = self.connector.lock().await;
        if connector.is_some() {
            return Ok(());
        }
        let (exit_tx, exit_rx) = watch::channel(false);
        let runner = Connector {
            source: Arc::clone(&self.source),
            discovery: self.discovery.clone(),
            endpoint: self.ring_server.clone(),
            client_id: self.ring_client_id.clone(),
            transport: self.ring_server_transport.clone(),
        };
        tokio::spawn(runner.run(Arc::clone(&self.routing) as Arc<dyn RingSink>, exit_rx));
        *connector = Some(exit_tx);
        Ok(())
    }

    /// Stops the control-plane subscription and closes every pooled backend
    /// connection. The client stays usable: later operations re-dial, and
    /// [`Self::startup`] must be called again to re-subscribe.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), PyriteError> {
        {
            let mut connector = self.connector.lock().await;
            if let Some(exit) = connector.take() {
                let _ = exit.send(true);
            }
        }
        self.routing.pool.shutdown_all(cancel).await
    }

    /// The current ring, if any has been received, loaded, or set.
    pub async fn ring(&self) -> Option<Arc<Ring>> {
        self.routing.ring.read().await.clone()
    }

    /// Installs a new ring directly, bypassing the control plane. See
    /// [`Routing::set_ring`] for the cache and pruning behavior.
    pub async fn set_ring(&self, ring: Ring) {
        self.routing.set_ring(ring).await;
    }

    /// Returns the highest timestamp and value length reported for `key`.
    ///
    /// Succeeds if any replica answered; a winning not-found reply surfaces
    /// as a not-found aggregate carrying the tombstone's timestamp.
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        key: Key,
    ) -> Result<(i64, u32), PyriteError> {
        let stores = self.routing.stores_for(cancel, key).await?;
        let replica_count = stores.len();

        let mut tasks: FuturesUnordered<_> = stores
            .iter()
            .map(|entry| async move {
                let reply = match acquire_permit(cancel, &entry.permits).await {
                    Ok(_permit) => tokio::select! {
                        reply = entry.store.lookup(key) => reply,
                        () = cancel.cancelled() => Err(BackendError::Cancelled),
                    },
                    Err(err) => Err(err),
                };
                (entry.addr.as_str(), reply)
            })
            .collect();

        let mut winner_ts = 0i64;
        let mut winner_len = 0u32;
        let mut not_found = false;
        let mut failures = Vec::new();
        while let Some((addr, reply)) = tasks.next().await {
            let (ts, len, err) = match reply {
                Ok((ts, len)) => (ts, len, None),
                Err(err) => (err.reply_timestamp(), 0, Some(err)),
            };
            if ts > winner_ts || winner_ts == 0 {
                winner_ts = ts;
                winner_len = len;
                not_found = err.as_ref().is_some_and(BackendError::is_not_found);
            }
            if let Some(source) = err {
                failures.push(ReplicaFailure {
                    addr: addr.to_string(),
                    source,
                });
            }
        }
        drop(tasks);

        reconcile_any("lookup", replica_count, winner_ts, not_found, failures)?;
        Ok((winner_ts, winner_len))
    }

    /// Returns the highest-timestamp value stored for `key`.
    pub async fn read(
        &self,
        cancel: &CancellationToken,
        key: Key,
    ) -> Result<(i64, Vec<u8>), PyriteError> {
        let mut value = Vec::new();
        let timestamp_micro = self.read_into(cancel, key, &mut value).await?;
        Ok((timestamp_micro, value))
    }

    /// Like [`Self::read`], but appends the winning value to `value` so
    /// callers can reuse a buffer across reads. On error nothing is
    /// appended.
    pub async fn read_into(
        &self,
        cancel: &CancellationToken,
        key: Key,
        value: &mut Vec<u8>,
    ) -> Result<i64, PyriteError> {
        let stores = self.routing.stores_for(cancel, key).await?;
        let replica_count = stores.len();

        let mut tasks: FuturesUnordered<_> = stores
            .iter()
            .map(|entry| async move {
                let reply = match acquire_permit(cancel, &entry.permits).await {
                    Ok(_permit) => tokio::select! {
                        reply = entry.store.read(key) => reply,
                        () = cancel.cancelled() => Err(BackendError::Cancelled),
                    },
                    Err(err) => Err(err),
                };
                (entry.addr.as_str(), reply)
            })
            .collect();

        let mut winner_ts = 0i64;
        let mut winner_value = Vec::new();
        let mut not_found = false;
        let mut failures = Vec::new();
        while let Some((addr, reply)) = tasks.next().await {
            let (ts, reply_value, err) = match reply {
                Ok((ts, reply_value)) => (ts, reply_value, None),
                Err(err) => (err.reply_timestamp(), Vec::new(), Some(err)),
            };
            if ts > winner_ts || winner_ts == 0 {
                winner_ts = ts;
                winner_value = reply_value;
                not_found = err.as_ref().is_some_and(BackendError::is_not_found);
            }
            if let Some(source) = err {
                failures.push(ReplicaFailure {
                    addr: addr.to_string(),
                    source,
                });
            }
        }
        drop(tasks);

        reconcile_any("read", replica_count, winner_ts, not_found, failures)?;
        value.extend_from_slice(&winner_value);
        Ok(winner_ts)
    }

    /// Stores `value` for `key` at `timestamp_micro` on every responsible
    /// replica. Returns the highest timestamp the replicas held before.
    ///
    /// Failures on a strict minority of replicas are logged and hidden; a
    /// majority of failures surfaces as an aggregate error.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        key: Key,
        timestamp_micro: i64,
        value: &[u8],
    ) -> Result<i64, PyriteError> {
        if value.len() > self.value_cap as usize {
            return Err(PyriteError::ValueTooLarge {
                len: value.len(),
                cap: self.value_cap,
            });
        }
        let stores = self.routing.stores_for(cancel, key).await?;
        let replica_count = stores.len();

        let mut tasks: FuturesUnordered<_> = stores
            .iter()
            .map(|entry| async move {
                let reply = match acquire_permit(cancel, &entry.permits).await {
                    Ok(_permit) => tokio::select! {
                        reply = entry.store.write(key, timestamp_micro, value) => reply,
                        () = cancel.cancelled() => Err(BackendError::Cancelled),
                    },
                    Err(err) => Err(err),
                };
                (entry.addr.as_str(), reply)
            })
            .collect();

        let mut old_timestamp = 0i64;
        let mut failures = Vec::new();
        while let Some((addr, reply)) = tasks.next().await {
            match reply {
                Ok(old) => old_timestamp = old_timestamp.max(old),
                Err(source) => failures.push(ReplicaFailure {
                    addr: addr.to_string(),
                    source,
                }),
            }
        }
        drop(tasks);

        reconcile_majority("write", replica_count, old_timestamp, failures)?;
        Ok(old_timestamp)
    }

    /// Writes a tombstone for `key` at `timestamp_micro` on every
    /// responsible replica, with the same tolerance rule as [`Self::write`].
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        key: Key,
        timestamp_micro: i64,
    ) -> Result<i64, PyriteError> {
        let stores = self.routing.stores_for(cancel, key).await?;
        let replica_count = stores.len();

        let mut tasks: FuturesUnordered<_> = stores
            .iter()
            .map(|entry| async move {
                let reply = match acquire_permit(cancel, &entry.permits).await {
                    Ok(_permit) => tokio::select! {
                        reply = entry.store.delete(key, timestamp_micro) => reply,
                        () = cancel.cancelled() => Err(BackendError::Cancelled),
                    },
                    Err(err) => Err(err),
                };
                (entry.addr.as_str(), reply)
            })
            .collect();

        let mut old_timestamp = 0i64;
        let mut failures = Vec::new();
        while let Some((addr, reply)) = tasks.next().await {
            match reply {
                Ok(old) => old_timestamp = old_timestamp.max(old),
                Err(source) => failures.push(ReplicaFailure {
                    addr: addr.to_string(),
                    source,
                }),
            }
        }
        drop(tasks);

        reconcile_majority("delete", replica_count, old_timestamp, failures)?;
        Ok(old_timestamp)
    }

    /// The configured maximum value length.
    pub fn value_cap(&self) -> u32 {
        self.value_cap
    }

    /// Writes are always enabled at the client tier.
    pub fn enable_writes(&self) -> Result<(), PyriteError> {
        Ok(())
    }

    /// Not available through this client.
    pub fn disable_writes(&self) -> Result<(), PyriteError> {
        Err(PyriteError::Unsupported("disabling writes"))
    }

    /// The client buffers nothing, so flush is trivially successful.
    pub fn flush(&self) -> Result<(), PyriteError> {
        Ok(())
    }

    /// Not available through this client.
    pub fn audit_pass(&self) -> Result<(), PyriteError> {
        Err(PyriteError::Unsupported("audit passes"))
    }

    /// The client tier keeps no statistics.
    pub fn stats(&self, _debug: bool) -> Stats {
        Stats
    }
}

/// Placeholder statistics for the client tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats;

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replicated store client: no stats")
    }
}

/// Waits for a permit unless the token fires first. A cancellation that
/// wins the race consumes no permit; a permit that was handed out is
/// returned when the guard drops, even if the call is cancelled mid-RPC.
async fn acquire_permit<'a>(
    cancel: &CancellationToken,
    permits: &'a Semaphore,
) -> Result<SemaphorePermit<'a>, BackendError> {
    tokio::select! {
        permit = permits.acquire() => permit.map_err(|_| BackendError::Cancelled),
        () = cancel.cancelled() => Err(BackendError::Cancelled),
    }
}

/// The liberal rule for lookups and reads: one live answer wins. Failures
/// are surfaced only when every replica errored, or as a not-found
/// aggregate when the authoritative reply was a tombstone.
fn reconcile_any(
    op: &'static str,
    replica_count: usize,
    winner_ts: i64,
    not_found: bool,
    failures: Vec<ReplicaFailure>,
) -> Result<(), PyriteError> {
    if not_found {
        return Err(AggregateError::not_found(winner_ts, failures).into());
    }
    if failures.is_empty() {
        return Ok(());
    }
    if failures.len() < replica_count {
        for failure in &failures {
            debug!(op, %failure, "replica error hidden by a live answer");
        }
        return Ok(());
    }
    Err(AggregateError::partial(winner_ts, failures).into())
}

/// The tolerance rule for writes and deletes: failures on a strict minority
/// of replicas are hidden, a majority surfaces.
fn reconcile_majority(
    op: &'static str,
    replica_count: usize,
    old_timestamp: i64,
    failures: Vec<ReplicaFailure>,
) -> Result<(), PyriteError> {
    if failures.is_empty() {
        return Ok(());
    }
    if failures.len() < (replica_count + 1) / 2 {
        for failure in &failures {
            debug!(op, %failure, "replica error within tolerance");
        }
        return Ok(());
    }
    Err(AggregateError::partial(old_timestamp, failures).into())
}
