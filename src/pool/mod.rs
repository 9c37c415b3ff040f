//! Connection pool keyed by replica address.
//!
//! Entries are created lazily on first use and die when a ring change stops
//! referencing their address or the client shuts down. A failed dial is
//! negatively cached as an [`UnavailableStore`] sentinel so repeated
//! operations against a dead address fail fast; a delayed eviction task
//! removes the sentinel after the configured retry delay, which is what
//! turns transient unreachability into a retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{StoreFactory, UnavailableStore, ValueStore};
use crate::config::TransportOptions;
use crate::error::PyriteError;

/// One pooled backend store plus the permit pool capping its in-flight
/// requests. Every operation against the store must hold one permit.
pub(crate) struct StoreEntry {
    pub(crate) addr: String,
    pub(crate) store: Arc<dyn ValueStore>,
    pub(crate) permits: Arc<Semaphore>,
}

impl std::fmt::Debug for StoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEntry")
            .field("addr", &self.addr)
            .field("permits", &self.permits)
            .finish()
    }
}

/// Lazily-populated map from replica address to store entries.
pub(crate) struct ConnectionPool {
    factory: Arc<dyn StoreFactory>,
    transport: TransportOptions,
    concurrent_requests_per_store: usize,
    failed_connect_retry_delay: Duration,
    entries: Arc<RwLock<HashMap<String, Arc<StoreEntry>>>>,
}

impl ConnectionPool {
    pub(crate) fn new(
        factory: Arc<dyn StoreFactory>,
        transport: TransportOptions,
        concurrent_requests_per_store: usize,
        failed_connect_retry_delay: Duration,
    ) -> Self {
        Self {
            factory,
            transport,
            concurrent_requests_per_store,
            failed_connect_retry_delay,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolves entries for the given addresses, dialing any that are not
    /// pooled yet. The hot path holds only the read lock; the write lock is
    /// taken just to install missing entries, re-checking each slot in case
    /// another task won the race. Cancellation is checked at every lock
    /// acquisition and after every install.
    pub(crate) async fn resolve(
        &self,
        cancel: &CancellationToken,
        addrs: &[String],
    ) -> Result<Vec<Arc<StoreEntry>>, PyriteError> {
        let mut resolved: Vec<Option<Arc<StoreEntry>>> = Vec::with_capacity(addrs.len());
        {
            let entries = self.entries.read().await;
            for addr in addrs {
                resolved.push(entries.get(addr).cloned());
            }
        }
        if cancel.is_cancelled() {
            return Err(PyriteError::Cancelled);
        }
        if resolved.iter().all(Option::is_some) {
            return Ok(resolved.into_iter().flatten().collect());
        }

        let mut entries = self.entries.write().await;
        if cancel.is_cancelled() {
            return Err(PyriteError::Cancelled);
        }
        for (slot, addr) in resolved.iter_mut().zip(addrs) {
            if slot.is_some() {
                continue;
            }
            if let Some(entry) = entries.get(addr) {
                *slot = Some(Arc::clone(entry));
                continue;
            }
            let entry = self.dial(addr).await;
            entries.insert(addr.clone(), Arc::clone(&entry));
            *slot = Some(entry);
            if cancel.is_cancelled() {
                return Err(PyriteError::Cancelled);
            }
        }
        Ok(resolved.into_iter().flatten().collect())
    }

    /// Builds an entry for `addr`. The factory's connect is lazy, so this
    /// does not wait on the network; a factory error installs the error
    /// sentinel and schedules its eviction.
    async fn dial(&self, addr: &str) -> Arc<StoreEntry> {
        let permits = Arc::new(Semaphore::new(self.concurrent_requests_per_store));
        let store: Arc<dyn ValueStore> = match self
            .factory
            .connect(addr, self.concurrent_requests_per_store, &self.transport)
            .await
        {
            Ok(store) => store,
            Err(err) => {
                debug!(%addr, %err, "could not create store, caching failure");
                let entry = Arc::new(StoreEntry {
                    addr: addr.to_string(),
                    store: Arc::new(UnavailableStore::new(addr, err.to_string())),
                    permits,
                });
                self.schedule_eviction(addr.to_string(), Arc::clone(&entry));
                return entry;
            }
        };
        Arc::new(StoreEntry {
            addr: addr.to_string(),
            store,
            permits,
        })
    }

    /// After the retry delay, drop the sentinel entry so the next resolve
    /// re-dials the address. The entry is removed only if it is still the
    /// exact sentinel installed here; a replacement installed in the
    /// meantime is left alone.
    fn schedule_eviction(&self, addr: String, sentinel: Arc<StoreEntry>) {
        let entries = Arc::clone(&self.entries);
        let delay = self.failed_connect_retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut entries = entries.write().await;
            if let Some(current) = entries.get(&addr) {
                if Arc::ptr_eq(current, &sentinel) {
                    entries.remove(&addr);
                }
            }
        });
    }

    /// Drops every entry whose address is not in `keep`, then shuts the
    /// evicted stores down. The doomed entries are snapshotted and the lock
    /// released before any shutdown call runs.
    pub(crate) async fn retain(&self, keep: &HashSet<String>) {
        let stale: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .keys()
                .filter(|addr| !keep.contains(*addr))
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let evicted: Vec<Arc<StoreEntry>> = {
            let mut entries = self.entries.write().await;
            stale
                .iter()
                .filter_map(|addr| entries.remove(addr))
                .collect()
        };
        for entry in evicted {
            if let Err(err) = entry.store.shutdown().await {
                debug!(addr = %entry.addr, %err, "error during shutdown of store");
            }
        }
    }

    /// Shuts down and drops every pooled entry. Cancellation is observed
    /// between stores, so a cancelled shutdown may leave later entries
    /// un-shut but never half-removed.
    pub(crate) async fn shutdown_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PyriteError> {
        let evicted: Vec<Arc<StoreEntry>> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in evicted {
            if let Err(err) = entry.store.shutdown().await {
                debug!(addr = %entry.addr, %err, "error during shutdown of store");
            }
            if cancel.is_cancelled() {
                return Err(PyriteError::Cancelled);
            }
        }
        Ok(())
    }
}
