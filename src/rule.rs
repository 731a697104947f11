//! Placement rules: fixed-length step programs for the selection engine.
//!
//! A rule is an ordered sequence of steps, each an opcode plus two integer
//! arguments. The builder only records the program; the deterministic
//! selection engine interprets it when the map is used. `ruleset`, `kind`
//! and the `[min_size, max_size]` range are caller-defined values the engine
//! consults, never validated here.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rule step opcode, interpreted by the external selection engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOp {
    /// No effect.
    #[default]
    Noop,
    /// Push item `arg1` as an initial selection root.
    Take,
    /// From the current selection, descend into each selected bucket and
    /// select `arg1` items of type `arg2`, first-n retry discipline.
    ChooseFirstN,
    /// Like [`StepOp::ChooseFirstN`] with the independent retry discipline.
    ChooseIndep,
    /// Like [`StepOp::ChooseFirstN`] but descend to leaves inside buckets
    /// of type `arg2`.
    ChooseLeafFirstN,
    /// Like [`StepOp::ChooseLeafFirstN`] with the independent discipline.
    ChooseLeafIndep,
    /// Append the current selection to the rule output and clear it.
    Emit,
}

impl StepOp {
    /// True for the four choose-style opcodes, where `arg1 == 0` means
    /// "derive the count from the result size requested at evaluation time".
    #[must_use]
    pub const fn is_choose(self) -> bool {
        matches!(
            self,
            Self::ChooseFirstN | Self::ChooseIndep | Self::ChooseLeafFirstN | Self::ChooseLeafIndep
        )
    }
}

/// One encoded rule step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStep {
    /// The opcode.
    pub op: StepOp,
    /// First argument; meaning depends on `op`.
    pub arg1: i32,
    /// Second argument; meaning depends on `op`.
    pub arg2: i32,
}

impl RuleStep {
    /// Create a step.
    #[must_use]
    pub const fn new(op: StepOp, arg1: i32, arg2: i32) -> Self {
        Self { op, arg1, arg2 }
    }
}

/// A complete placement rule: a fixed-length step program plus the
/// caller-defined tags the selection engine matches against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Caller-defined ruleset tag.
    pub ruleset: i32,
    /// Caller-defined rule type tag.
    pub kind: i32,
    /// Minimum result size this rule is valid for.
    pub min_size: i32,
    /// Maximum result size this rule is valid for.
    pub max_size: i32,
    steps: Vec<RuleStep>,
}

impl Rule {
    /// Allocate a rule with `len` steps, all initialized to
    /// [`StepOp::Noop`]. Steps are then written individually with
    /// [`set_step`](Self::set_step).
    pub fn new(len: usize, ruleset: i32, kind: i32, min_size: i32, max_size: i32) -> Result<Self> {
        let mut steps = Vec::new();
        steps.try_reserve_exact(len)?;
        steps.resize_with(len, RuleStep::default);
        Ok(Self { ruleset, kind, min_size, max_size, steps })
    }

    /// Write the step at `pos`.
    ///
    /// Only the position is validated; no opcode/argument coherence checks
    /// are performed.
    pub fn set_step(&mut self, pos: usize, op: StepOp, arg1: i32, arg2: i32) -> Result<()> {
        let len = self.steps.len();
        let step = self.steps.get_mut(pos).ok_or(Error::StepOutOfRange { pos, len })?;
        *step = RuleStep::new(op, arg1, arg2);
        Ok(())
    }

    /// The encoded steps, in program order.
    #[must_use]
    pub fn steps(&self) -> &[RuleStep] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the rule holds no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rule_is_noop_filled() {
        let rule = Rule::new(3, 0, 1, 1, 10).unwrap();
        assert_eq!(rule.len(), 3);
        assert!(rule.steps().iter().all(|s| s.op == StepOp::Noop));
    }

    #[test]
    fn test_step_round_trip() {
        let mut rule = Rule::new(3, 0, 1, 1, 10).unwrap();
        rule.set_step(0, StepOp::Take, -1, 0).unwrap();
        rule.set_step(1, StepOp::ChooseLeafFirstN, 0, 2).unwrap();
        rule.set_step(2, StepOp::Emit, 0, 0).unwrap();

        assert_eq!(
            rule.steps(),
            &[
                RuleStep::new(StepOp::Take, -1, 0),
                RuleStep::new(StepOp::ChooseLeafFirstN, 0, 2),
                RuleStep::new(StepOp::Emit, 0, 0),
            ]
        );
    }

    #[test]
    fn test_set_step_out_of_range() {
        let mut rule = Rule::new(2, 0, 1, 1, 10).unwrap();
        let err = rule.set_step(2, StepOp::Emit, 0, 0).unwrap_err();
        assert!(matches!(err, Error::StepOutOfRange { pos: 2, len: 2 }));
    }

    #[test]
    fn test_overwrite_step() {
        let mut rule = Rule::new(1, 0, 1, 1, 1).unwrap();
        rule.set_step(0, StepOp::Take, -5, 0).unwrap();
        rule.set_step(0, StepOp::Take, -7, 0).unwrap();
        assert_eq!(rule.steps()[0], RuleStep::new(StepOp::Take, -7, 0));
    }

    #[test]
    fn test_is_choose() {
        assert!(StepOp::ChooseFirstN.is_choose());
        assert!(StepOp::ChooseIndep.is_choose());
        assert!(StepOp::ChooseLeafFirstN.is_choose());
        assert!(StepOp::ChooseLeafIndep.is_choose());
        assert!(!StepOp::Take.is_choose());
        assert!(!StepOp::Emit.is_choose());
        assert!(!StepOp::Noop.is_choose());
    }
}
