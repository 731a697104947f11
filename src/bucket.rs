//! Buckets and the four weight algorithms.
//!
//! A bucket groups items under an aggregate weight. Items are plain ids:
//! non-negative for leaf devices, negative for references to other buckets
//! registered in the same map. Each algorithm owns its own per-item weight
//! storage and update formulas:
//!
//! - **Uniform**: one scalar shared by every item; aggregate is
//!   `count x scalar`. Fast, but every item must carry the same weight.
//! - **List**: parallel weight array in insertion order; aggregate is the
//!   array sum.
//! - **Straw2**: parallel weight array, arbitrary order; aggregate is the
//!   array sum. Recommended for production topologies.
//! - **Tree**: weights held in an implicit binary aggregation tree
//!   ([`TreeWeights`]); aggregate is the root sum and adjustments touch only
//!   the leaf-to-root path.
//!
//! All weight math is overflow-checked against the `u32` weight width; an
//! operation that would overflow fails without wrapping and without
//! modifying the bucket.

use serde::{Deserialize, Serialize};

use crate::arith::{addition_is_unsafe, multiplication_is_unsafe};
use crate::error::{Error, Result};
use crate::tree::TreeWeights;

/// Unique identifier for a bucket (negative once registered in a map).
pub type BucketId = i32;

/// Fixed-point weight convention: `1.0` is `0x10000` (16.16). The scale is
/// a convention shared with the selection engine, never enforced here.
pub const WEIGHT_ONE: u32 = 0x1_0000;

/// Bucket selection algorithm.
///
/// The set is closed: weight math matches exhaustively on it, so an
/// unrecognized tag is unrepresentable. A map can still refuse algorithms
/// via its enabled-algorithm bitmask, which is where
/// [`Error::UnsupportedAlgorithm`] comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketAlg {
    /// All items share a single weight.
    Uniform,
    /// Summed parallel weights, insertion order.
    List,
    /// Implicit binary aggregation tree.
    Tree,
    /// Summed parallel weights, arbitrary order.
    Straw2,
}

impl BucketAlg {
    /// Bit used in a map's enabled-algorithm mask.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Self::Uniform => 1 << 1,
            Self::List => 1 << 2,
            Self::Tree => 1 << 3,
            Self::Straw2 => 1 << 4,
        }
    }
}

/// Algorithm-specific per-item weight storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WeightStore {
    /// Single scalar shared by every item.
    Uniform {
        /// The shared per-item weight.
        item_weight: u32,
    },
    /// Parallel weight array, insertion order.
    List {
        /// Weight of each item, same order as the item list.
        item_weights: Vec<u32>,
    },
    /// Parallel weight array, arbitrary order.
    Straw2 {
        /// Weight of each item, same order as the item list.
        item_weights: Vec<u32>,
    },
    /// Implicit binary aggregation tree in leaf order.
    Tree(TreeWeights),
}

/// A bucket in the placement hierarchy.
///
/// The aggregate [`weight`](Self::weight) always equals the algorithm's
/// formula over the current per-item weights; the invariant is violated only
/// transiently inside a mutating call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    /// Unique id; assigned (negative) when the bucket is registered.
    pub id: BucketId,
    /// Caller-defined type tag, matched against rule step arguments.
    pub kind: i32,
    /// Opaque hash-function identifier recorded for the selection engine.
    pub hash: u32,
    items: Vec<i32>,
    weight: u32,
    store: WeightStore,
}

fn try_to_vec<T: Copy>(src: &[T]) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(src.len())?;
    v.extend_from_slice(src);
    Ok(v)
}

fn item_count(items: &[i32]) -> Result<u32> {
    u32::try_from(items.len()).map_err(|_| Error::Overflow)
}

impl Bucket {
    /// Create a bucket, dispatching on `alg`.
    ///
    /// For [`BucketAlg::Uniform`] the shared item weight is `weights[0]`
    /// (zero when `weights` is empty); for the other algorithms `weights`
    /// parallels `items`.
    ///
    /// # Panics
    ///
    /// Panics if `items` and `weights` differ in length for a non-uniform
    /// algorithm.
    pub fn new(
        alg: BucketAlg,
        kind: i32,
        hash: u32,
        items: &[i32],
        weights: &[u32],
    ) -> Result<Self> {
        match alg {
            BucketAlg::Uniform => {
                Self::new_uniform(kind, hash, items, weights.first().copied().unwrap_or(0))
            }
            BucketAlg::List => Self::new_list(kind, hash, items, weights),
            BucketAlg::Tree => Self::new_tree(kind, hash, items, weights),
            BucketAlg::Straw2 => Self::new_straw2(kind, hash, items, weights),
        }
    }

    /// Create a uniform bucket where every item carries `item_weight`.
    pub fn new_uniform(kind: i32, hash: u32, items: &[i32], item_weight: u32) -> Result<Self> {
        let count = item_count(items)?;
        if multiplication_is_unsafe(count, item_weight) {
            return Err(Error::Overflow);
        }
        Ok(Self {
            id: 0,
            kind,
            hash,
            items: try_to_vec(items)?,
            weight: count * item_weight,
            store: WeightStore::Uniform { item_weight },
        })
    }

    /// Create a list bucket from parallel item and weight arrays.
    ///
    /// # Panics
    ///
    /// Panics if `items` and `weights` differ in length.
    pub fn new_list(kind: i32, hash: u32, items: &[i32], weights: &[u32]) -> Result<Self> {
        assert_eq!(items.len(), weights.len(), "items and weights must be parallel");
        let weight = checked_sum(weights)?;
        Ok(Self {
            id: 0,
            kind,
            hash,
            items: try_to_vec(items)?,
            weight,
            store: WeightStore::List { item_weights: try_to_vec(weights)? },
        })
    }

    /// Create a straw2 bucket from parallel item and weight arrays.
    ///
    /// # Panics
    ///
    /// Panics if `items` and `weights` differ in length.
    pub fn new_straw2(kind: i32, hash: u32, items: &[i32], weights: &[u32]) -> Result<Self> {
        assert_eq!(items.len(), weights.len(), "items and weights must be parallel");
        let weight = checked_sum(weights)?;
        Ok(Self {
            id: 0,
            kind,
            hash,
            items: try_to_vec(items)?,
            weight,
            store: WeightStore::Straw2 { item_weights: try_to_vec(weights)? },
        })
    }

    /// Create a tree bucket from parallel item and weight arrays, items in
    /// leaf order.
    ///
    /// # Panics
    ///
    /// Panics if `items` and `weights` differ in length.
    pub fn new_tree(kind: i32, hash: u32, items: &[i32], weights: &[u32]) -> Result<Self> {
        assert_eq!(items.len(), weights.len(), "items and weights must be parallel");
        let tree = TreeWeights::build(weights)?;
        Ok(Self {
            id: 0,
            kind,
            hash,
            items: try_to_vec(items)?,
            weight: tree.root_weight(),
            store: WeightStore::Tree(tree),
        })
    }

    /// The bucket's algorithm, derived from its weight storage.
    #[must_use]
    pub fn alg(&self) -> BucketAlg {
        match self.store {
            WeightStore::Uniform { .. } => BucketAlg::Uniform,
            WeightStore::List { .. } => BucketAlg::List,
            WeightStore::Straw2 { .. } => BucketAlg::Straw2,
            WeightStore::Tree(_) => BucketAlg::Tree,
        }
    }

    /// Item ids in bucket order (non-negative device, negative child bucket).
    #[must_use]
    pub fn items(&self) -> &[i32] {
        &self.items
    }

    /// Number of items.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Aggregate weight per the algorithm's formula.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The algorithm-specific weight storage.
    #[must_use]
    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    /// Weight of the item at `pos`.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= self.size()`.
    #[must_use]
    pub fn item_weight(&self, pos: usize) -> u32 {
        assert!(pos < self.items.len(), "item position {pos} out of range");
        match &self.store {
            WeightStore::Uniform { item_weight } => *item_weight,
            WeightStore::List { item_weights } | WeightStore::Straw2 { item_weights } => {
                item_weights[pos]
            }
            WeightStore::Tree(tree) => tree.leaf_weight(pos),
        }
    }

    /// Weight of `item`, or `None` if the bucket does not contain it.
    #[must_use]
    pub fn weight_of(&self, item: i32) -> Option<u32> {
        self.position(item).map(|pos| self.item_weight(pos))
    }

    /// Add `item` with `weight`, growing the aggregate accordingly.
    ///
    /// Uniform buckets reject a weight different from the shared scalar with
    /// [`Error::UniformWeightMismatch`]. Overflow of the aggregate fails
    /// with [`Error::Overflow`] before any structural change, so the item
    /// list is unchanged on error.
    pub fn add_item(&mut self, item: i32, weight: u32) -> Result<()> {
        match &mut self.store {
            WeightStore::Uniform { item_weight } => {
                if weight != *item_weight {
                    return Err(Error::UniformWeightMismatch {
                        expected: *item_weight,
                        got: weight,
                    });
                }
                if addition_is_unsafe(self.weight, weight) {
                    return Err(Error::Overflow);
                }
                self.items.try_reserve(1)?;
                self.items.push(item);
                self.weight += weight;
            }
            WeightStore::List { item_weights } | WeightStore::Straw2 { item_weights } => {
                if addition_is_unsafe(self.weight, weight) {
                    return Err(Error::Overflow);
                }
                self.items.try_reserve(1)?;
                item_weights.try_reserve(1)?;
                self.items.push(item);
                item_weights.push(weight);
                self.weight += weight;
            }
            WeightStore::Tree(tree) => {
                self.items.try_reserve(1)?;
                tree.push_leaf(weight)?;
                self.items.push(item);
                self.weight = tree.root_weight();
            }
        }
        Ok(())
    }

    /// Remove `item`, subtracting its weight from the aggregate.
    ///
    /// If the subtraction would underflow, the aggregate is clamped to zero
    /// rather than failing.
    pub fn remove_item(&mut self, item: i32) -> Result<()> {
        let pos = self
            .position(item)
            .ok_or(Error::ItemNotFound { bucket: self.id, item })?;
        match &mut self.store {
            WeightStore::Uniform { item_weight } => {
                let w = *item_weight;
                self.items.remove(pos);
                self.weight = self.weight.saturating_sub(w);
            }
            WeightStore::List { item_weights } | WeightStore::Straw2 { item_weights } => {
                let w = item_weights.remove(pos);
                self.items.remove(pos);
                self.weight = self.weight.saturating_sub(w);
            }
            WeightStore::Tree(tree) => {
                tree.remove_leaf(pos)?;
                self.items.remove(pos);
                self.weight = tree.root_weight();
            }
        }
        Ok(())
    }

    /// Set the weight of `item`, returning the signed aggregate delta
    /// (new minus old) so the caller can propagate the change into ancestor
    /// buckets. Only this bucket is touched.
    ///
    /// For uniform buckets `item` is ignored: the shared scalar is replaced
    /// and the aggregate recomputed as `count x scalar`, with the delta
    /// covering the whole bucket.
    pub fn adjust_item_weight(&mut self, item: i32, weight: u32) -> Result<i64> {
        match &mut self.store {
            WeightStore::Uniform { item_weight } => {
                let count = item_count(&self.items)?;
                if multiplication_is_unsafe(count, weight) {
                    return Err(Error::Overflow);
                }
                let old = self.weight;
                *item_weight = weight;
                self.weight = count * weight;
                Ok(i64::from(self.weight) - i64::from(old))
            }
            WeightStore::List { item_weights } | WeightStore::Straw2 { item_weights } => {
                let pos = self
                    .items
                    .iter()
                    .position(|&i| i == item)
                    .ok_or(Error::ItemNotFound { bucket: self.id, item })?;
                let old = item_weights[pos];
                let base = self.weight.saturating_sub(old);
                if addition_is_unsafe(base, weight) {
                    return Err(Error::Overflow);
                }
                item_weights[pos] = weight;
                self.weight = base + weight;
                Ok(i64::from(weight) - i64::from(old))
            }
            WeightStore::Tree(tree) => {
                let pos = self
                    .items
                    .iter()
                    .position(|&i| i == item)
                    .ok_or(Error::ItemNotFound { bucket: self.id, item })?;
                let delta = tree.set_leaf(pos, weight)?;
                self.weight = tree.root_weight();
                Ok(delta)
            }
        }
    }

    /// Recompute the aggregate from current per-item weights, taking fresh
    /// weights for child buckets from `child_weights` (`None` entries are
    /// devices and keep their stored weight).
    ///
    /// Used by [`crate::PlacementMap::reweight_bucket`]; `child_weights`
    /// parallels the item list.
    pub(crate) fn apply_reweight(&mut self, child_weights: &[Option<u32>]) -> Result<()> {
        debug_assert_eq!(child_weights.len(), self.items.len());
        match &mut self.store {
            WeightStore::Uniform { item_weight } => {
                // child weights are not representable under a shared scalar
                let count = item_count(&self.items)?;
                if multiplication_is_unsafe(count, *item_weight) {
                    return Err(Error::Overflow);
                }
                self.weight = count * *item_weight;
            }
            WeightStore::List { item_weights } | WeightStore::Straw2 { item_weights } => {
                let mut total = 0u32;
                for (pos, refreshed) in child_weights.iter().enumerate() {
                    if let Some(w) = refreshed {
                        item_weights[pos] = *w;
                    }
                    if addition_is_unsafe(total, item_weights[pos]) {
                        return Err(Error::Overflow);
                    }
                    total += item_weights[pos];
                }
                self.weight = total;
            }
            WeightStore::Tree(tree) => {
                let mut leaves = tree.leaf_weights();
                for (pos, refreshed) in child_weights.iter().enumerate() {
                    if let Some(w) = refreshed {
                        leaves[pos] = *w;
                    }
                }
                *tree = TreeWeights::build(&leaves)?;
                self.weight = tree.root_weight();
            }
        }
        Ok(())
    }

    fn position(&self, item: i32) -> Option<usize> {
        self.items.iter().position(|&i| i == item)
    }
}

fn checked_sum(weights: &[u32]) -> Result<u32> {
    let mut total = 0u32;
    for &w in weights {
        if addition_is_unsafe(total, w) {
            return Err(Error::Overflow);
        }
        total += w;
    }
    Ok(total)
}
