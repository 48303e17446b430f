use crate::value::SymbolicValue;
use std::ops::{Add, AddAssign};

/// The policy object for one state-merge operation.
///
/// A merger carries the branch condition under which two states are being joined;
/// value-level combination consults it to build `if condition then incoming else
/// current` expressions. Symbolic states refuse to merge through a merger with no
/// condition: dropping the controlling condition would silently erase the path
/// information the surrounding analysis depends on, so that path is a fatal
/// contract violation rather than a recoverable error.
#[derive(Debug, Clone)]
pub struct Merger<'ctx> {
    condition: Option<SymbolicValue<'ctx>>,
}

impl<'ctx> Merger<'ctx> {
    /// A merger joining two states under `condition` (true selects the incoming state).
    pub fn conditional(condition: SymbolicValue<'ctx>) -> Self {
        Self {
            condition: Some(condition),
        }
    }

    /// A merger with no join condition. Valid as a value, but any symbolic-value
    /// combination through it panics.
    pub fn unconditional() -> Self {
        Self { condition: None }
    }

    pub fn condition(&self) -> Option<&SymbolicValue<'ctx>> {
        self.condition.as_ref()
    }

    pub(crate) fn require_condition(&self) -> &SymbolicValue<'ctx> {
        match &self.condition {
            Some(condition) => condition,
            None => panic!(
                "contract violation: symbolic states may only be merged under an explicit join condition"
            ),
        }
    }
}

/// Whether a merge left the receiving state changed.
///
/// Outcomes from independent sub-merges (registers, memory) fold together with `+`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MergeOutcome {
    Unchanged,
    Changed,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Changed)
    }
}

impl Add for MergeOutcome {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Unchanged, Self::Unchanged) => Self::Unchanged,
            _ => Self::Changed,
        }
    }
}

impl AddAssign for MergeOutcome {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
