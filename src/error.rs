//! Error types surfaced by the replicated store client.
//!
//! Replica-level failures are collected into an [`AggregateError`] so callers
//! can see every failing backend rather than just the first one. The
//! aggregate is tagged with an [`AggregateKind`] to distinguish plain partial
//! failure from an authoritative "not found" answer.

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;

/// Top-level error type for replicated store operations.
#[derive(Debug, Error)]
pub enum PyriteError {
    /// No ring has been received yet; replicas cannot be located.
    #[error("no ring available")]
    NoRing,

    /// The caller's cancellation token fired before or during the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A write's value exceeded the configured cap; nothing was sent.
    #[error("value length of {len} > {cap}")]
    ValueTooLarge { len: usize, cap: u32 },

    /// The operation is not available through this client.
    #[error("{0} not supported by this client")]
    Unsupported(&'static str),

    /// One or more replicas failed; see the aggregate for details.
    #[error(transparent)]
    Replicas(#[from] AggregateError),
}

impl PyriteError {
    /// True when the authoritative (highest-timestamp) replica reported the
    /// key absent. Callers can branch on this without inspecting the
    /// aggregate's entries.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PyriteError::Replicas(agg) if agg.is_not_found())
    }
}

/// Whether an aggregate represents plain partial failure or an authoritative
/// not-found answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Some or all replicas failed without an authoritative not-found.
    Partial,
    /// The winning reply said the key is absent.
    NotFound,
}

/// An ordered collection of per-replica failures from one fan-out.
#[derive(Debug)]
pub struct AggregateError {
    kind: AggregateKind,
    timestamp_micro: i64,
    errors: Vec<ReplicaFailure>,
}

impl AggregateError {
    pub(crate) fn partial(timestamp_micro: i64, errors: Vec<ReplicaFailure>) -> Self {
        Self {
            kind: AggregateKind::Partial,
            timestamp_micro,
            errors,
        }
    }

    pub(crate) fn not_found(timestamp_micro: i64, errors: Vec<ReplicaFailure>) -> Self {
        Self {
            kind: AggregateKind::NotFound,
            timestamp_micro,
            errors,
        }
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == AggregateKind::NotFound
    }

    /// Highest timestamp observed across the replies, including tombstones.
    /// Zero when no replica reported one.
    pub fn timestamp_micro(&self) -> i64 {
        self.timestamp_micro
    }

    pub fn errors(&self) -> &[ReplicaFailure] {
        &self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => match self.kind {
                AggregateKind::Partial => write!(f, "unknown error"),
                AggregateKind::NotFound => write!(f, "not found"),
            },
            [only] => write!(f, "{only}"),
            [first, ..] => write!(f, "{} errors, first is: {first}", self.errors.len()),
        }
    }
}

impl std::error::Error for AggregateError {}

/// A single replica's failure, carrying the backend's address so callers can
/// tell which store misbehaved.
#[derive(Debug, Error)]
#[error("store {addr}: {source}")]
pub struct ReplicaFailure {
    pub addr: String,
    pub source: BackendError,
}
