//! The placement map: registry of buckets and rules.
//!
//! The map owns every registered bucket and rule. Buckets are keyed by
//! negative id (slot `b` holds id `-(b + 1)`), rules by a non-negative id
//! below [`MAX_RULES`]; both namespaces reuse freed ids, auto-assigning the
//! lowest free one. Item entries that point at other buckets are non-owning
//! references into this registry, which is why
//! [`remove_bucket`](PlacementMap::remove_bucket) refuses to drop a bucket
//! that is still referenced elsewhere.
//!
//! After any structural mutation, [`finalize`](PlacementMap::finalize) must
//! run before the map is handed to the selection engine.

use serde::{Deserialize, Serialize};

use crate::bucket::{Bucket, BucketId};
use crate::error::{Error, Result};
use crate::rule::Rule;

/// Upper bound (exclusive) on rule identifiers.
pub const MAX_RULES: u32 = 256;

/// Retry and descent parameters stored for the selection engine.
///
/// The builder only stores these; their semantics live entirely in the
/// engine. Defaults are the recommended modern settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Local retries before falling back during a choose step.
    pub choose_local_tries: u32,
    /// Local fallback retries during a choose step.
    pub choose_local_fallback_tries: u32,
    /// Total descent attempts before the engine gives up.
    pub choose_total_tries: u32,
    /// Descend through each chooseleaf step at most once.
    pub chooseleaf_descend_once: bool,
    /// Vary the replica number across chooseleaf retries.
    pub chooseleaf_vary_r: bool,
    /// Stable replica numbering across topology changes.
    pub chooseleaf_stable: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            choose_local_tries: 0,
            choose_local_fallback_tries: 0,
            choose_total_tries: 50,
            chooseleaf_descend_once: true,
            chooseleaf_vary_r: true,
            chooseleaf_stable: true,
        }
    }
}

/// The hierarchical weighted topology plus its placement rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementMap {
    buckets: Vec<Option<Bucket>>,
    rules: Vec<Option<Rule>>,
    /// Retry/descent parameters consumed by the selection engine.
    pub tunables: Tunables,
    /// Bitmask of enabled bucket algorithms (see [`crate::BucketAlg::bit`]).
    pub allowed_bucket_algs: u32,
    max_devices: i32,
}

impl Default for PlacementMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementMap {
    /// Create an empty map with default tunables and every bucket algorithm
    /// enabled.
    #[must_use]
    pub fn new() -> Self {
        use crate::bucket::BucketAlg;
        Self {
            buckets: Vec::new(),
            rules: Vec::new(),
            tunables: Tunables::default(),
            allowed_bucket_algs: BucketAlg::Uniform.bit()
                | BucketAlg::List.bit()
                | BucketAlg::Tree.bit()
                | BucketAlg::Straw2.bit(),
            max_devices: 0,
        }
    }

    /// The bucket registered under `id`, if any.
    #[must_use]
    pub fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(slot_of(id).ok()?)?.as_ref()
    }

    /// Mutable access to the bucket registered under `id`.
    ///
    /// Weight changes made through this reference are not propagated to
    /// ancestor buckets; run [`reweight_bucket`](Self::reweight_bucket) (or
    /// apply the returned deltas manually) afterwards.
    #[must_use]
    pub fn bucket_mut(&mut self, id: BucketId) -> Option<&mut Bucket> {
        self.buckets.get_mut(slot_of(id).ok()?)?.as_mut()
    }

    /// Iterate over all registered buckets.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter().flatten()
    }

    /// Number of registered buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.iter().flatten().count()
    }

    /// The rule registered under `id`, if any.
    #[must_use]
    pub fn rule(&self, id: u32) -> Option<&Rule> {
        self.rules.get(id as usize)?.as_ref()
    }

    /// Iterate over registered rules with their ids.
    pub fn rules(&self) -> impl Iterator<Item = (u32, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(id, r)| r.as_ref().map(|r| (id as u32, r)))
    }

    /// Number of registered rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.iter().flatten().count()
    }

    /// The id the next auto-assigned bucket would receive: the free id of
    /// smallest magnitude. Pure query, consistent with
    /// [`add_bucket`](Self::add_bucket).
    #[must_use]
    pub fn next_bucket_id(&self) -> BucketId {
        for (slot, b) in self.buckets.iter().enumerate() {
            if b.is_none() {
                return id_of(slot);
            }
        }
        id_of(self.buckets.len())
    }

    /// Register `bucket`, assigning it an id.
    ///
    /// With `id == None` the free id of smallest magnitude is used;
    /// otherwise the explicit id must be negative and free. On any failure
    /// the registry is left unmodified.
    pub fn add_bucket(&mut self, id: Option<BucketId>, mut bucket: Bucket) -> Result<BucketId> {
        let alg = bucket.alg();
        if self.allowed_bucket_algs & alg.bit() == 0 {
            return Err(Error::UnsupportedAlgorithm(alg));
        }

        let id = match id {
            Some(id) => {
                let slot = slot_of(id)?;
                if self.buckets.get(slot).is_some_and(Option::is_some) {
                    return Err(Error::DuplicateBucketId(id));
                }
                id
            }
            None => self.next_bucket_id(),
        };

        let slot = slot_of(id)?;
        if slot >= self.buckets.len() {
            self.buckets.try_reserve(slot + 1 - self.buckets.len())?;
            self.buckets.resize_with(slot + 1, || None);
        }

        bucket.id = id;
        tracing::debug!(bucket = id, alg = ?alg, items = bucket.size(), "registered bucket");
        self.buckets[slot] = Some(bucket);
        Ok(id)
    }

    /// Detach and return the bucket registered under `id`.
    ///
    /// Fails with [`Error::BucketInUse`] while any other registered bucket
    /// still lists `id` as an item; callers must scrub those references
    /// first.
    pub fn remove_bucket(&mut self, id: BucketId) -> Result<Bucket> {
        let slot = slot_of(id)?;
        if !self.buckets.get(slot).is_some_and(Option::is_some) {
            return Err(Error::BucketNotFound(id));
        }
        for other in self.buckets.iter().flatten() {
            if other.id != id && other.items().contains(&id) {
                return Err(Error::BucketInUse { bucket: id, parent: other.id });
            }
        }
        let bucket = self.buckets[slot].take().ok_or(Error::BucketNotFound(id))?;
        tracing::debug!(bucket = id, "removed bucket");
        Ok(bucket)
    }

    /// Register `rule`, assigning it an id.
    ///
    /// With `id == None` the lowest free id is used; an explicit id must be
    /// below [`MAX_RULES`] and free. Returns the assigned id.
    pub fn add_rule(&mut self, id: Option<u32>, rule: Rule) -> Result<u32> {
        let id = match id {
            Some(id) => {
                if id >= MAX_RULES {
                    return Err(Error::RuleCapacity(id));
                }
                if self.rules.get(id as usize).is_some_and(Option::is_some) {
                    return Err(Error::DuplicateRuleId(id));
                }
                id
            }
            None => {
                let free =
                    self.rules.iter().position(Option::is_none).unwrap_or(self.rules.len()) as u32;
                if free >= MAX_RULES {
                    return Err(Error::RuleCapacity(free));
                }
                free
            }
        };

        let slot = id as usize;
        if slot >= self.rules.len() {
            self.rules.try_reserve(slot + 1 - self.rules.len())?;
            self.rules.resize_with(slot + 1, || None);
        }

        tracing::debug!(rule = id, steps = rule.len(), "registered rule");
        self.rules[slot] = Some(rule);
        Ok(id)
    }

    /// Detach and return the rule registered under `id`, freeing the id for
    /// reuse.
    pub fn remove_rule(&mut self, id: u32) -> Result<Rule> {
        let rule = self
            .rules
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(Error::RuleNotFound(id))?;
        tracing::debug!(rule = id, "removed rule");
        Ok(rule)
    }

    /// Highest device id referenced by any bucket, plus one. Derived by
    /// [`finalize`](Self::finalize).
    #[must_use]
    pub fn max_devices(&self) -> i32 {
        self.max_devices
    }

    /// Recompute derived state the selection engine depends on.
    ///
    /// Must run after any structural mutation and before the map is used;
    /// idempotent on an unmutated map.
    pub fn finalize(&mut self) {
        let mut max_devices = 0i32;
        for bucket in self.buckets.iter().flatten() {
            for &item in bucket.items() {
                if item >= max_devices {
                    max_devices = item + 1;
                }
            }
        }
        self.max_devices = max_devices;
        tracing::debug!(
            max_devices,
            buckets = self.bucket_count(),
            rules = self.rule_count(),
            "finalized map"
        );
    }

    /// Recompute aggregate weights across the subtree rooted at `id`, deep
    /// first, children before parents.
    ///
    /// Devices keep their stored per-item weights; every child-bucket slot
    /// is refreshed from the child's recomputed aggregate. This is the
    /// authoritative repair pass after local
    /// [`adjust_item_weight`](Bucket::adjust_item_weight) calls whose deltas
    /// were not propagated upward. Returns the root's new aggregate.
    ///
    /// Traversal follows item references through the registry; reference
    /// cycles are the caller's responsibility to avoid, as with every other
    /// operation on the bucket graph.
    pub fn reweight_bucket(&mut self, id: BucketId) -> Result<u32> {
        let order = self.subtree_postorder(id)?;
        for &bid in &order {
            let items = self
                .bucket(bid)
                .ok_or(Error::BucketNotFound(bid))?
                .items()
                .to_vec();
            let mut child_weights = Vec::new();
            child_weights.try_reserve_exact(items.len())?;
            for &item in &items {
                if item < 0 {
                    let w = self.bucket(item).ok_or(Error::BucketNotFound(item))?.weight();
                    child_weights.push(Some(w));
                } else {
                    child_weights.push(None);
                }
            }
            let bucket = self.bucket_mut(bid).ok_or(Error::BucketNotFound(bid))?;
            bucket.apply_reweight(&child_weights)?;
            tracing::trace!(bucket = bid, weight = bucket.weight(), "reweighted bucket");
        }
        self.bucket(id).map(Bucket::weight).ok_or(Error::BucketNotFound(id))
    }

    /// Bucket ids of the subtree rooted at `root`, children before parents.
    fn subtree_postorder(&self, root: BucketId) -> Result<Vec<BucketId>> {
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            let bucket = self.bucket(id).ok_or(Error::BucketNotFound(id))?;
            for &item in bucket.items() {
                if item < 0 {
                    stack.push((item, false));
                }
            }
        }
        Ok(order)
    }
}

fn slot_of(id: BucketId) -> Result<usize> {
    if id >= 0 {
        return Err(Error::InvalidBucketId(id));
    }
    Ok((-1 - id) as usize)
}

fn id_of(slot: usize) -> BucketId {
    -1 - slot as BucketId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketAlg;
    use crate::rule::StepOp;

    fn straw(items: &[i32], weights: &[u32]) -> Bucket {
        Bucket::new_straw2(1, 0, items, weights).unwrap()
    }

    #[test]
    fn test_auto_assignment_is_consecutive() {
        let mut map = PlacementMap::new();
        for n in 1..=4 {
            assert_eq!(map.next_bucket_id(), -n);
            let id = map.add_bucket(None, straw(&[], &[])).unwrap();
            assert_eq!(id, -n);
        }
        assert_eq!(map.bucket_count(), 4);
    }

    #[test]
    fn test_removed_id_is_reused() {
        let mut map = PlacementMap::new();
        for _ in 0..3 {
            map.add_bucket(None, straw(&[], &[])).unwrap();
        }
        map.remove_bucket(-2).unwrap();
        assert_eq!(map.next_bucket_id(), -2);
        let id = map.add_bucket(None, straw(&[], &[])).unwrap();
        assert_eq!(id, -2);
    }

    #[test]
    fn test_explicit_duplicate_bucket_id() {
        let mut map = PlacementMap::new();
        map.add_bucket(Some(-5), straw(&[], &[])).unwrap();
        let err = map.add_bucket(Some(-5), straw(&[], &[])).unwrap_err();
        assert!(matches!(err, Error::DuplicateBucketId(-5)));
        // a failed insert leaves the registry usable
        assert_eq!(map.bucket_count(), 1);
    }

    #[test]
    fn test_non_negative_bucket_id_rejected() {
        let mut map = PlacementMap::new();
        assert!(matches!(
            map.add_bucket(Some(0), straw(&[], &[])),
            Err(Error::InvalidBucketId(0))
        ));
        assert!(matches!(
            map.add_bucket(Some(3), straw(&[], &[])),
            Err(Error::InvalidBucketId(3))
        ));
    }

    #[test]
    fn test_registered_bucket_carries_assigned_id() {
        let mut map = PlacementMap::new();
        let id = map.add_bucket(None, straw(&[1, 2], &[10, 10])).unwrap();
        assert_eq!(map.bucket(id).unwrap().id, id);
    }

    #[test]
    fn test_disallowed_algorithm() {
        let mut map = PlacementMap::new();
        map.allowed_bucket_algs &= !BucketAlg::Uniform.bit();
        let bucket = Bucket::new_uniform(1, 0, &[1], 10).unwrap();
        assert!(matches!(
            map.add_bucket(None, bucket),
            Err(Error::UnsupportedAlgorithm(BucketAlg::Uniform))
        ));
    }

    #[test]
    fn test_remove_referenced_bucket_rejected() {
        let mut map = PlacementMap::new();
        let child = map.add_bucket(None, straw(&[1, 2], &[10, 10])).unwrap();
        let parent = map
            .add_bucket(None, straw(&[child], &[20]))
            .unwrap();
        let err = map.remove_bucket(child).unwrap_err();
        assert!(matches!(err, Error::BucketInUse { bucket, parent: p }
            if bucket == child && p == parent));

        // scrub the reference, then removal succeeds
        map.bucket_mut(parent).unwrap().remove_item(child).unwrap();
        map.remove_bucket(child).unwrap();
        assert!(map.bucket(child).is_none());
    }

    #[test]
    fn test_remove_unregistered_bucket() {
        let mut map = PlacementMap::new();
        assert!(matches!(map.remove_bucket(-9), Err(Error::BucketNotFound(-9))));
    }

    #[test]
    fn test_rule_auto_assignment_and_reuse() {
        let mut map = PlacementMap::new();
        let r0 = map.add_rule(None, Rule::new(1, 0, 1, 1, 3).unwrap()).unwrap();
        let r1 = map.add_rule(None, Rule::new(1, 0, 1, 1, 3).unwrap()).unwrap();
        assert_eq!((r0, r1), (0, 1));

        map.remove_rule(0).unwrap();
        let reused = map.add_rule(None, Rule::new(1, 0, 1, 1, 3).unwrap()).unwrap();
        assert_eq!(reused, 0);
    }

    #[test]
    fn test_rule_capacity() {
        let mut map = PlacementMap::new();
        let err = map.add_rule(Some(MAX_RULES), Rule::new(1, 0, 1, 1, 3).unwrap()).unwrap_err();
        assert!(matches!(err, Error::RuleCapacity(id) if id == MAX_RULES));
    }

    #[test]
    fn test_duplicate_rule_id() {
        let mut map = PlacementMap::new();
        map.add_rule(Some(7), Rule::new(1, 0, 1, 1, 3).unwrap()).unwrap();
        assert!(matches!(
            map.add_rule(Some(7), Rule::new(1, 0, 1, 1, 3).unwrap()),
            Err(Error::DuplicateRuleId(7))
        ));
    }

    #[test]
    fn test_rule_round_trip_on_empty_map() {
        let mut map = PlacementMap::new();
        let mut rule = Rule::new(3, 0, 1, 1, 10).unwrap();
        rule.set_step(0, StepOp::Take, -1, 0).unwrap();
        rule.set_step(1, StepOp::ChooseLeafFirstN, 0, 2).unwrap();
        rule.set_step(2, StepOp::Emit, 0, 0).unwrap();

        let id = map.add_rule(None, rule).unwrap();
        assert_eq!(id, 0);

        let stored = map.rule(0).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored.steps()[0].op, StepOp::Take);
        assert_eq!(stored.steps()[0].arg1, -1);
        assert_eq!(stored.steps()[1].op, StepOp::ChooseLeafFirstN);
        assert_eq!((stored.steps()[1].arg1, stored.steps()[1].arg2), (0, 2));
        assert_eq!(stored.steps()[2].op, StepOp::Emit);
    }

    #[test]
    fn test_finalize_computes_max_devices() {
        let mut map = PlacementMap::new();
        map.add_bucket(None, straw(&[0, 7, 3], &[10, 10, 10])).unwrap();
        map.finalize();
        assert_eq!(map.max_devices(), 8);

        // idempotent on an unmutated map
        map.finalize();
        assert_eq!(map.max_devices(), 8);

        map.bucket_mut(-1).unwrap().add_item(12, 10).unwrap();
        map.finalize();
        assert_eq!(map.max_devices(), 13);
    }

    #[test]
    fn test_finalize_ignores_bucket_references() {
        let mut map = PlacementMap::new();
        let child = map.add_bucket(None, straw(&[2], &[10])).unwrap();
        map.add_bucket(None, straw(&[child], &[10])).unwrap();
        map.finalize();
        assert_eq!(map.max_devices(), 3);
    }

    #[test]
    fn test_reweight_repairs_unpropagated_adjustments() {
        let mut map = PlacementMap::new();
        let host1 = map.add_bucket(None, straw(&[0, 1], &[10, 10])).unwrap();
        let host2 = map.add_bucket(None, straw(&[2, 3], &[10, 10])).unwrap();
        let root = map
            .add_bucket(None, straw(&[host1, host2], &[20, 20]))
            .unwrap();

        // local adjustment, deliberately not propagated to the root
        map.bucket_mut(host1).unwrap().adjust_item_weight(0, 50).unwrap();
        assert_eq!(map.bucket(host1).unwrap().weight(), 60);
        assert_eq!(map.bucket(root).unwrap().weight(), 40);

        let w = map.reweight_bucket(root).unwrap();
        assert_eq!(w, 80);
        assert_eq!(map.bucket(root).unwrap().weight_of(host1), Some(60));

        // idempotent: a second pass changes nothing
        assert_eq!(map.reweight_bucket(root).unwrap(), 80);
    }

    #[test]
    fn test_reweight_all_algorithms() {
        for alg in [BucketAlg::Uniform, BucketAlg::List, BucketAlg::Tree, BucketAlg::Straw2] {
            let mut map = PlacementMap::new();
            let child = map
                .add_bucket(None, Bucket::new(alg, 1, 0, &[0, 1, 2], &[10, 10, 10]).unwrap())
                .unwrap();
            let root = map.add_bucket(None, straw(&[child], &[30])).unwrap();

            let delta = map.bucket_mut(child).unwrap().adjust_item_weight(1, 40).unwrap();
            assert_ne!(delta, 0);

            let w = map.reweight_bucket(root).unwrap();
            let expected = map.bucket(child).unwrap().weight();
            assert_eq!(w, expected, "alg {alg:?}");
            assert_eq!(map.reweight_bucket(root).unwrap(), expected, "alg {alg:?}");
        }
    }

    #[test]
    fn test_reweight_overflow() {
        let mut map = PlacementMap::new();
        let a = map.add_bucket(None, straw(&[0], &[u32::MAX])).unwrap();
        let b = map.add_bucket(None, straw(&[1], &[u32::MAX])).unwrap();
        let root = map.add_bucket(None, straw(&[a, b], &[1, 1])).unwrap();
        assert!(matches!(map.reweight_bucket(root), Err(Error::Overflow)));
    }

    #[test]
    fn test_reweight_unregistered_root() {
        let mut map = PlacementMap::new();
        assert!(matches!(map.reweight_bucket(-1), Err(Error::BucketNotFound(-1))));
    }

    #[test]
    fn test_tunable_defaults() {
        let t = Tunables::default();
        assert_eq!(t.choose_local_tries, 0);
        assert_eq!(t.choose_local_fallback_tries, 0);
        assert_eq!(t.choose_total_tries, 50);
        assert!(t.chooseleaf_descend_once);
        assert!(t.chooseleaf_vary_r);
        assert!(t.chooseleaf_stable);
    }
}
