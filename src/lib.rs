//! Builder for CRUSH-style hierarchical weighted placement maps.
//!
//! This crate constructs and mutates a weighted topology of storage devices
//! grouped into nested buckets, plus the declarative placement rules that a
//! separate deterministic selection engine interprets at request time. The
//! builder's job is structural integrity and weight bookkeeping: identifier
//! allocation, per-algorithm aggregate-weight invariants under insertion,
//! removal and reweighting, overflow-checked arithmetic, and the rule step
//! encoding. The selection walk itself (hashing, retries, FIRSTN/INDEP
//! numbering) is out of scope and never calls back into this crate.
//!
//! # Topology
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  PlacementMap                        │
//! ├──────────────────────────────────────────────────────┤
//! │                   ┌─────────┐                        │
//! │                   │  root   │  bucket -3             │
//! │                   └────┬────┘                        │
//! │              ┌─────────┴─────────┐                   │
//! │         ┌────┴────┐         ┌────┴────┐              │
//! │         │  host1  │ -1      │  host2  │ -2           │
//! │         └────┬────┘         └────┬────┘              │
//! │         ┌────┴────┐         ┌────┴────┐              │
//! │         │ 0  1  2 │         │ 3  4  5 │  devices     │
//! │         └─────────┘         └─────────┘              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Buckets carry negative ids, leaf devices non-negative ids; a bucket's
//! item list may nest other buckets by id. Each bucket runs one of four
//! weight algorithms (uniform, list, tree, straw2) with its own aggregate
//! formula; all weight math is overflow-checked over the `u32` fixed-point
//! width.
//!
//! # Usage
//!
//! ```
//! use placement_map::{Bucket, BucketAlg, PlacementMap, Rule, StepOp, WEIGHT_ONE};
//!
//! let mut map = PlacementMap::new();
//!
//! // One host bucket holding three devices.
//! let host = Bucket::new(BucketAlg::Straw2, 1, 0, &[0, 1, 2], &[WEIGHT_ONE; 3])?;
//! let host_id = map.add_bucket(None, host)?;
//!
//! // A root bucket nesting the host at its aggregate weight.
//! let root = Bucket::new(BucketAlg::Straw2, 10, 0, &[host_id], &[3 * WEIGHT_ONE])?;
//! let root_id = map.add_bucket(None, root)?;
//!
//! // A replication rule: take the root, choose leaves, emit.
//! let mut rule = Rule::new(3, 0, 1, 1, 10)?;
//! rule.set_step(0, StepOp::Take, root_id, 0)?;
//! rule.set_step(1, StepOp::ChooseLeafFirstN, 0, 1)?;
//! rule.set_step(2, StepOp::Emit, 0, 0)?;
//! map.add_rule(None, rule)?;
//!
//! // Prepare derived state before handing the map to the selection engine.
//! map.finalize();
//! assert_eq!(map.max_devices(), 3);
//! # Ok::<(), placement_map::Error>(())
//! ```
//!
//! The map is single-writer by contract: serialize all mutating calls, then
//! share it read-only with any number of selection-engine consumers until
//! the next mutation round.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod arith;
pub mod bucket;
pub mod error;
pub mod map;
pub mod rule;
pub mod tree;

pub use arith::{addition_is_unsafe, multiplication_is_unsafe};
pub use bucket::{Bucket, BucketAlg, BucketId, WeightStore, WEIGHT_ONE};
pub use error::{Error, Result};
pub use map::{PlacementMap, Tunables, MAX_RULES};
pub use rule::{Rule, RuleStep, StepOp};
pub use tree::TreeWeights;
