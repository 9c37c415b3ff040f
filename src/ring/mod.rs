//! The partition map that locates replicas for a key.
//!
//! A [`Ring`] divides the keyspace into `2^partition_bit_count` partitions
//! and assigns each partition an ordered list of responsible nodes. Keys are
//! 128-bit identifiers; placement is derived from the high bits of the first
//! half only, so related keys can share a partition by sharing that half.
//!
//! Rings arrive serialized from the control plane and from the on-disk
//! cache, so [`Ring::load`] validates structure before anything trusts it.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) mod cache;

/// A 128-bit key split into two 64-bit halves.
///
/// The partition index is derived from the high bits of `hi`; `lo`
/// disambiguates within a partition without affecting placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub hi: u64,
    pub lo: u64,
}

impl Key {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Partition index under a ring with the given partition bit count.
    /// `bit_count` must be in `1..=32`, which [`Ring`] validation
    /// guarantees for any loaded ring.
    pub fn partition(&self, bit_count: u32) -> u32 {
        (self.hi >> (64 - bit_count)) as u32
    }
}

/// One storage node in the ring. Nodes are multi-homed; which address a
/// client dials is chosen by its configured address index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub addresses: Vec<String>,
}

impl Node {
    pub fn address(&self, index: usize) -> Option<&str> {
        self.addresses.get(index).map(String::as_str)
    }
}

/// Errors from decoding or constructing a ring.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("partition bit count {0} outside 1..=32")]
    PartitionBits(u32),

    #[error("{got} partition assignments, expected {want}")]
    PartitionCount { got: usize, want: usize },

    #[error("partition {partition} references node index {index}, only {nodes} nodes")]
    NodeIndex {
        partition: usize,
        index: u32,
        nodes: usize,
    },

    #[error("node {id} has no addresses")]
    NodeWithoutAddress { id: u64 },

    #[error("ring serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The partition map: for every partition, an ordered list of responsible
/// node indexes. The order matters; reconciliation treats the list as the
/// replica set, primary first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ring {
    partition_bit_count: u32,
    nodes: Vec<Node>,
    assignments: Vec<Vec<u32>>,
    version: u64,
}

impl Ring {
    pub fn new(
        partition_bit_count: u32,
        nodes: Vec<Node>,
        assignments: Vec<Vec<u32>>,
        version: u64,
    ) -> Result<Self, RingError> {
        let ring = Self {
            partition_bit_count,
            nodes,
            assignments,
            version,
        };
        ring.validate()?;
        Ok(ring)
    }

    fn validate(&self) -> Result<(), RingError> {
        if self.partition_bit_count == 0 || self.partition_bit_count > 32 {
            return Err(RingError::PartitionBits(self.partition_bit_count));
        }
        let want = 1usize << self.partition_bit_count;
        if self.assignments.len() != want {
            return Err(RingError::PartitionCount {
                got: self.assignments.len(),
                want,
            });
        }
        for node in &self.nodes {
            if node.addresses.is_empty() {
                return Err(RingError::NodeWithoutAddress { id: node.id });
            }
        }
        for (partition, replicas) in self.assignments.iter().enumerate() {
            for &index in replicas {
                if index as usize >= self.nodes.len() {
                    return Err(RingError::NodeIndex {
                        partition,
                        index,
                        nodes: self.nodes.len(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn partition_bit_count(&self) -> u32 {
        self.partition_bit_count
    }

    pub fn partition_count(&self) -> usize {
        1usize << self.partition_bit_count
    }

    /// Control-plane version, carried for logging only.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every node in the ring, referenced or not.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The ordered replica set for a partition. Out-of-range partitions
    /// yield an empty set rather than a panic; validated rings make that
    /// unreachable for indexes produced by [`Key::partition`].
    pub fn responsible_nodes(&self, partition: u32) -> Vec<&Node> {
        self.assignments
            .get(partition as usize)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter_map(|&index| self.nodes.get(index as usize))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serializes the ring for the cache or the wire.
    pub fn persist<W: io::Write>(&self, writer: W) -> Result<(), RingError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Decodes and validates a serialized ring.
    pub fn load<R: io::Read>(reader: R) -> Result<Self, RingError> {
        let ring: Ring = serde_json::from_reader(reader)?;
        ring.validate()?;
        Ok(ring)
    }
}

#[cfg(test)]
mod test;
