//! Type-safe wrappers and core types for the matching engine.
//!
//! Newtypes here prevent primitive obsession in the index and query paths:
//! item identifiers, dense storage slots, and vector dimensions each get
//! their own type with validation at the boundary.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Opaque item identifier token.
///
/// Identifiers are treated as opaque strings: the engine never parses them,
/// only compares them for equality and ordering (ordering is used for
/// deterministic tie-breaking in ranked results).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Arc<str>);

impl ItemId {
    #[must_use]
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// Returns the identifier token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for ItemId {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Dense index of an item within a loaded artifact.
///
/// Slots are assigned contiguously at build time; the id map translates
/// slot -> [`ItemId`] and back. Slot zero is valid (first item).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u32);

impl Slot {
    #[must_use]
    pub const fn new(slot: u32) -> Self {
        Self(slot)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Returns the slot as a usize array index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Creates from little-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent dimension
/// mismatches between queries, stored vectors, and quantizer structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure queries and stored vectors come from the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Dimension {dimension} is not divisible by {subspaces} sub-vectors\nSuggestion: Choose a sub-vector count that divides the embedding dimension"
    )]
    IndivisibleSubspaces { dimension: usize, subspaces: usize },

    #[error("Storage error: {0}\nSuggestion: Check disk space and file permissions")]
    Storage(#[from] std::io::Error),

    #[error(
        "Clustering failed: {0}\nSuggestion: Ensure sufficient vectors are available for clustering (minimum: k clusters)"
    )]
    ClusteringFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_ordering() {
        let a = ItemId::from("apple");
        let b = ItemId::from("banana");
        assert!(a < b);
        assert_eq!(a, ItemId::new("apple"));
        assert_eq!(a.as_str(), "apple");
    }

    #[test]
    fn test_slot_roundtrip() {
        let slot = Slot::new(42);
        assert_eq!(slot.get(), 42);
        assert_eq!(slot.index(), 42);
        assert_eq!(Slot::from_bytes(slot.to_bytes()), slot);

        // Slot zero is a valid first slot
        assert_eq!(Slot::new(0).index(), 0);
    }

    #[test]
    fn test_vector_dimension() {
        let dim = VectorDimension::new(8).unwrap();
        assert_eq!(dim.get(), 8);

        assert!(VectorDimension::new(0).is_err());

        let vec = vec![0.1; 8];
        assert!(dim.validate_vector(&vec).is_ok());

        let wrong = vec![0.1; 4];
        assert!(dim.validate_vector(&wrong).is_err());
    }
}
