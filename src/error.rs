//! Error types for placement map construction and mutation.

use std::collections::TryReserveError;

use thiserror::Error;

use crate::bucket::{BucketAlg, BucketId};
use crate::map::MAX_RULES;

/// A specialized `Result` type for placement map operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or mutating a placement map.
///
/// Every mutating operation reports success or failure explicitly. The
/// builder performs no automatic rollback of partially applied structural
/// changes, so callers must abort the larger construction sequence when an
/// operation fails.
#[derive(Debug, Error)]
pub enum Error {
    /// Growing a registry or item array failed.
    #[error("allocation failure: {0}")]
    Allocation(#[from] TryReserveError),

    /// A weight sum or product would exceed the 32-bit weight width.
    #[error("weight arithmetic overflow")]
    Overflow,

    /// Rule identifier at or beyond the fixed maximum.
    #[error("rule id {0} exceeds the maximum of {MAX_RULES}")]
    RuleCapacity(u32),

    /// Explicit bucket identifier already assigned to another bucket.
    #[error("bucket id {0} is already in use")]
    DuplicateBucketId(BucketId),

    /// Explicit rule identifier already assigned to another rule.
    #[error("rule id {0} is already in use")]
    DuplicateRuleId(u32),

    /// The bucket's algorithm is not enabled on the map.
    #[error("bucket algorithm {0:?} is not enabled on this map")]
    UnsupportedAlgorithm(BucketAlg),

    /// No bucket registered under the given identifier.
    #[error("bucket {0} is not registered")]
    BucketNotFound(BucketId),

    /// No rule registered under the given identifier.
    #[error("rule {0} is not registered")]
    RuleNotFound(u32),

    /// The item is not present in the bucket.
    #[error("item {item} not found in bucket {bucket}")]
    ItemNotFound {
        /// Identifier of the bucket that was searched.
        bucket: BucketId,
        /// The item that was not found.
        item: i32,
    },

    /// The bucket is still listed as an item of another registered bucket.
    #[error("bucket {bucket} is still referenced as an item of bucket {parent}")]
    BucketInUse {
        /// The bucket whose removal was requested.
        bucket: BucketId,
        /// A registered bucket that still references it.
        parent: BucketId,
    },

    /// Uniform buckets share a single item weight; adding an item with a
    /// different weight is rejected.
    #[error("uniform bucket requires item weight {expected}, got {got}")]
    UniformWeightMismatch {
        /// The bucket's shared item weight.
        expected: u32,
        /// The weight passed to the add.
        got: u32,
    },

    /// Bucket identifiers must be negative.
    #[error("bucket id must be negative, got {0}")]
    InvalidBucketId(i32),

    /// Step position beyond the rule's fixed length.
    #[error("step position {pos} out of range for rule of length {len}")]
    StepOutOfRange {
        /// The requested step position.
        pos: usize,
        /// The rule's step count.
        len: usize,
    },
}
