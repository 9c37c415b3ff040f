//! The control-plane subscription that keeps the ring current.
//!
//! A [`Connector`] owns one long-lived subscription: resolve the endpoint
//! (configured address or service discovery), subscribe, then drain ring
//! updates until the stream errors or goes quiet, backing off exponentially
//! between attempts. Every decoded ring is handed to the store and resets
//! the backoff to its floor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error};

use crate::config::TransportOptions;
use crate::ring::Ring;

/// A ring pushed by the control plane: the serialized partition map plus a
/// version carried for logging.
#[derive(Debug, Clone)]
pub struct RingUpdate {
    pub ring: Vec<u8>,
    pub version: u64,
}

/// Errors from the control-plane subscription.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("no ring server configured and no discovery hook installed")]
    NoEndpoint,
}

/// A live subscription stream. An `Err` from [`RingStream::next`] means the
/// stream is dead and the subscription must be re-established.
#[async_trait]
pub trait RingStream: Send {
    async fn next(&mut self) -> Result<RingUpdate, SourceError>;
}

/// The control-plane service handing out rings.
#[async_trait]
pub trait RingSource: Send + Sync {
    async fn subscribe(
        &self,
        endpoint: &str,
        client_id: &str,
        transport: &TransportOptions,
    ) -> Result<Box<dyn RingStream>, SourceError>;
}

/// Resolves a control-plane endpoint when none is configured.
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn discover(
        &self,
        service: &str,
        namespace: &str,
        protocol: &str,
    ) -> Result<String, SourceError>;
}

/// Receiver for decoded rings. Implemented by the replicated store, mocked
/// in tests.
#[async_trait]
pub(crate) trait RingSink: Send + Sync {
    async fn apply_ring(&self, ring: Ring);
}

/// A stream that delivers nothing for this long is assumed dead and
/// re-dialed. The transport has no receive timeout of its own.
pub(crate) const STALE_STREAM_AFTER: Duration = Duration::from_secs(15 * 60);

const RING_SERVICE: &str = "ring";
const RING_NAMESPACE: &str = "pyrite";
const RING_PROTOCOL: &str = "tcp";

/// Resolves when the exit flag is raised. A dropped sender counts as exit.
pub(crate) async fn exited(exit: &mut watch::Receiver<bool>) {
    let _ = exit.wait_for(|stop| *stop).await;
}

/// Exponential reconnect backoff in one-second ticks, doubling from 2 up to
/// a cap of 60, reset to the floor after any successful ring delivery.
pub(crate) struct Backoff {
    ticks: u32,
}

impl Backoff {
    const FLOOR: u32 = 2;
    const CAP: u32 = 60;

    pub(crate) fn new() -> Self {
        Self { ticks: Self::FLOOR }
    }

    pub(crate) fn reset(&mut self) {
        self.ticks = Self::FLOOR;
    }

    /// Sleeps for the current delay, doubling it for the next attempt.
    /// Returns `true` when the exit signal fired mid-sleep.
    pub(crate) async fn wait(&mut self, exit: &mut watch::Receiver<bool>) -> bool {
        let ticks = self.ticks;
        self.ticks = (self.ticks * 2).min(Self::CAP);
        for _ in 0..ticks {
            tokio::select! {
                _ = exited(exit) => return true,
                _ = sleep(Duration::from_secs(1)) => {}
            }
        }
        false
    }
}

/// One subscription attempt loop, run as a background task for the lifetime
/// of the store (until `exit` is raised).
pub(crate) struct Connector {
    pub(crate) source: Arc<dyn RingSource>,
    pub(crate) discovery: Option<Arc<dyn EndpointDiscovery>>,
    pub(crate) endpoint: Option<String>,
    pub(crate) client_id: String,
    pub(crate) transport: TransportOptions,
}

impl Connector {
    pub(crate) async fn run(self, sink: Arc<dyn RingSink>, mut exit: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();
        loop {
            if *exit.borrow() {
                return;
            }
            let endpoint = match self.resolve_endpoint().await {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    error!(%err, "error resolving ring service endpoint");
                    if backoff.wait(&mut exit).await {
                        return;
                    }
                    continue;
                }
            };
            let mut stream = match self
                .source
                .subscribe(&endpoint, &self.client_id, &self.transport)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    error!(%endpoint, %err, "error subscribing to ring service");
                    if backoff.wait(&mut exit).await {
                        return;
                    }
                    continue;
                }
            };
            self.receive(&endpoint, stream.as_mut(), &sink, &mut backoff, &mut exit)
                .await;
            if *exit.borrow() {
                return;
            }
            if backoff.wait(&mut exit).await {
                return;
            }
        }
    }

    /// Drains the stream until it errors, goes stale, or the exit signal
    /// fires. Undecodable rings are noise, not stream death.
    async fn receive(
        &self,
        endpoint: &str,
        stream: &mut dyn RingStream,
        sink: &Arc<dyn RingSink>,
        backoff: &mut Backoff,
        exit: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = exited(exit) => return,
                next = timeout(STALE_STREAM_AFTER, stream.next()) => match next {
                    Err(_) => {
                        debug!(%endpoint, "ring stream idle too long, reconnecting");
                        return;
                    }
                    Ok(Err(err)) => {
                        debug!(%endpoint, %err, "error with stream to ring service");
                        return;
                    }
                    Ok(Ok(update)) => match Ring::load(update.ring.as_slice()) {
                        Ok(ring) => {
                            sink.apply_ring(ring).await;
                            backoff.reset();
                            debug!(
                                %endpoint,
                                version = update.version,
                                "got new ring from ring service"
                            );
                        }
                        Err(err) => {
                            debug!(%endpoint, %err, "error with ring received from ring service");
                        }
                    }
                }
            }
        }
    }

    async fn resolve_endpoint(&self) -> Result<String, SourceError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        match &self.discovery {
            Some(discovery) => {
                discovery
                    .discover(RING_SERVICE, RING_NAMESPACE, RING_PROTOCOL)
                    .await
            }
            None => Err(SourceError::NoEndpoint),
        }
    }
}
