//! Implicit binary aggregation tree backing the Tree bucket algorithm.
//!
//! Leaves sit at odd node indices (leaf `i` at `((i + 1) << 1) - 1`), each
//! interior node holds the sum of its two children, and the root lives at
//! `num_nodes >> 1`. A weight change therefore only has to walk the
//! leaf-to-root path instead of rescanning every item, which is what makes
//! Tree buckets cheap to adjust in large topologies.

use serde::{Deserialize, Serialize};

use crate::arith::addition_is_unsafe;
use crate::error::{Error, Result};

/// Node index of leaf `i`.
fn leaf_node(i: usize) -> usize {
    ((i + 1) << 1) - 1
}

/// Height of a node: the number of trailing zero bits in its index.
fn height(node: usize) -> usize {
    node.trailing_zeros() as usize
}

/// Parent of a node in the implicit tree.
fn parent(node: usize) -> usize {
    let h = height(node);
    if node & (1 << (h + 1)) != 0 { node - (1 << h) } else { node + (1 << h) }
}

/// Tree depth needed to hold `size` leaves.
fn calc_depth(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let mut depth = 1;
    let mut t = size - 1;
    while t != 0 {
        t >>= 1;
        depth += 1;
    }
    depth
}

/// Weight storage for the Tree bucket algorithm.
///
/// Keeps per-leaf weights in leaf order plus the interior subtree sums that
/// make the aggregate (the root sum) maintainable in `O(log n)` per
/// adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeWeights {
    /// Number of leaves currently stored.
    len: usize,
    /// Depth of the implicit tree; `num_nodes == 1 << depth`.
    depth: usize,
    /// Node array: leaves at odd indices, sums at even indices.
    node_weights: Vec<u32>,
}

impl TreeWeights {
    /// Build the tree from per-item weights in leaf order.
    ///
    /// Fails with [`Error::Overflow`] if any subtree sum overflows, or
    /// [`Error::Allocation`] if the node array cannot be allocated.
    pub fn build(weights: &[u32]) -> Result<Self> {
        let len = weights.len();
        let depth = calc_depth(len);
        let num_nodes = if depth == 0 { 0 } else { 1usize << depth };

        let mut node_weights = Vec::new();
        node_weights.try_reserve_exact(num_nodes)?;
        node_weights.resize(num_nodes, 0);

        let mut tree = Self { len: 0, depth, node_weights };
        for (i, &w) in weights.iter().enumerate() {
            tree.init_leaf(i, w)?;
        }
        tree.len = len;
        Ok(tree)
    }

    /// Number of leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree holds no leaves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tree depth; the node array holds `1 << depth` entries.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The full node array (leaves at odd indices, subtree sums at even).
    #[must_use]
    pub fn node_weights(&self) -> &[u32] {
        &self.node_weights
    }

    /// The aggregate weight: the root subtree sum.
    #[must_use]
    pub fn root_weight(&self) -> u32 {
        if self.node_weights.is_empty() { 0 } else { self.node_weights[self.root_node()] }
    }

    /// Weight of leaf `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    #[must_use]
    pub fn leaf_weight(&self, i: usize) -> u32 {
        assert!(i < self.len, "leaf index {i} out of range for {} leaves", self.len);
        self.node_weights[leaf_node(i)]
    }

    /// Per-leaf weights in leaf order.
    #[must_use]
    pub fn leaf_weights(&self) -> Vec<u32> {
        (0..self.len).map(|i| self.node_weights[leaf_node(i)]).collect()
    }

    /// Set leaf `i` to `weight`, updating only the leaf-to-root path.
    ///
    /// Returns the signed difference between the new and the former leaf
    /// weight. The path is validated before any node is written, so an
    /// overflow leaves the tree unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    pub fn set_leaf(&mut self, i: usize, weight: u32) -> Result<i64> {
        assert!(i < self.len, "leaf index {i} out of range for {} leaves", self.len);
        let leaf = leaf_node(i);
        let old = self.node_weights[leaf];
        let root = self.root_node();

        let mut node = leaf;
        loop {
            let base = self.node_weights[node].saturating_sub(old);
            if addition_is_unsafe(base, weight) {
                return Err(Error::Overflow);
            }
            if node == root {
                break;
            }
            node = parent(node);
        }

        let mut node = leaf;
        loop {
            let base = self.node_weights[node].saturating_sub(old);
            self.node_weights[node] = base + weight;
            if node == root {
                break;
            }
            node = parent(node);
        }

        Ok(i64::from(weight) - i64::from(old))
    }

    /// Append a leaf with `weight`, growing the tree depth when the current
    /// node array is full.
    ///
    /// Overflow along the new leaf's path is detected before any node is
    /// written; on failure the tree is unchanged.
    pub fn push_leaf(&mut self, weight: u32) -> Result<()> {
        let new_len = self.len + 1;
        if calc_depth(new_len) > self.depth {
            let mut leaves = self.leaf_weights();
            leaves.try_reserve(1)?;
            leaves.push(weight);
            *self = Self::build(&leaves)?;
            return Ok(());
        }

        // The new leaf slot is zero, so walking the path adds exactly
        // `weight` to every ancestor.
        let leaf = leaf_node(self.len);
        let root = self.root_node();

        let mut node = leaf;
        loop {
            if addition_is_unsafe(self.node_weights[node], weight) {
                return Err(Error::Overflow);
            }
            if node == root {
                break;
            }
            node = parent(node);
        }

        let mut node = leaf;
        loop {
            self.node_weights[node] += weight;
            if node == root {
                break;
            }
            node = parent(node);
        }

        self.len = new_len;
        Ok(())
    }

    /// Remove leaf `i`, compacting the remaining leaves and rebuilding the
    /// subtree sums at the resulting depth.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    pub fn remove_leaf(&mut self, i: usize) -> Result<()> {
        assert!(i < self.len, "leaf index {i} out of range for {} leaves", self.len);
        let mut leaves = self.leaf_weights();
        leaves.remove(i);
        *self = Self::build(&leaves)?;
        Ok(())
    }

    fn root_node(&self) -> usize {
        self.node_weights.len() >> 1
    }

    /// Initialize leaf `i` in a freshly zeroed tree and propagate its weight
    /// to the root.
    fn init_leaf(&mut self, i: usize, weight: u32) -> Result<()> {
        let root = self.root_node();
        let mut node = leaf_node(i);
        self.node_weights[node] = weight;
        while node != root {
            node = parent(node);
            if addition_is_unsafe(self.node_weights[node], weight) {
                return Err(Error::Overflow);
            }
            self.node_weights[node] += weight;
        }
        Ok(())
    }
}
