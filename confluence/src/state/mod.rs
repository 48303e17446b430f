pub mod memory;
pub mod registers;

use crate::merge::{MergeOutcome, Merger};
use crate::ops::SemanticOps;
use crate::state::memory::MemoryState;
use crate::state::registers::{RegisterSet, RegisterState};
use crate::value::SymbolicValue;
use confluence_arch::RegisterDictionary;
use internment::Intern;
use z3::{Context, Solver};

/// Comparison across two snapshots of the same state type.
///
/// Fixed-point drivers only need to ask two questions of a state: "has it
/// stopped changing" and "what changed". Keeping those behind a trait lets a
/// driver iterate registers-only states, full machine states, or richer
/// wrappers with the same loop.
pub trait StateComparable<'ctx> {
    /// What [`StateComparable::diff`] reports.
    type Delta;

    /// Whether the two snapshots agree, treating incompleteness as wildcard
    /// agreement on both sides.
    fn equals(&self, other: &Self) -> bool;

    /// The portions of `self` that differ from `other`, by may-differ
    /// reasoning: anything not provably equal is reported.
    fn diff(&self, other: &Self, solver: Option<&Solver<'ctx>>) -> Self::Delta;
}

/// In-place joining of a state with the state arriving over another
/// control-flow edge.
pub trait StateMergeable<'ctx>: StateComparable<'ctx> {
    /// Fold `other` into `self` under `condition` (true selects `other`);
    /// reports whether `self` changed. Merging is how a fixed-point loop
    /// accumulates paths, so a caller that observes [`MergeOutcome::Unchanged`]
    /// at every in-edge of a node has converged there.
    fn merge(
        &mut self,
        other: &Self,
        ops: &dyn SemanticOps<'ctx>,
        condition: &SymbolicValue<'ctx>,
    ) -> MergeOutcome;
}

/// The full machine state at one program point: registers plus memory.
#[derive(Debug, Clone)]
pub struct SymbolicState<'ctx> {
    registers: RegisterState<'ctx>,
    memory: MemoryState<'ctx>,
}

impl<'ctx> SymbolicState<'ctx> {
    pub fn new(z3: &'ctx Context, dictionary: Intern<RegisterDictionary>) -> Self {
        Self {
            registers: RegisterState::new(z3, dictionary),
            memory: MemoryState::new(z3),
        }
    }

    pub fn registers(&self) -> &RegisterState<'ctx> {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterState<'ctx> {
        &mut self.registers
    }

    pub fn memory(&self) -> &MemoryState<'ctx> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryState<'ctx> {
        &mut self.memory
    }

    pub fn dictionary(&self) -> Intern<RegisterDictionary> {
        self.registers.dictionary()
    }

    pub fn equals(&self, other: &Self) -> bool {
        self.registers.equals(&other.registers) && self.memory.equals(&other.memory)
    }

    /// The registers that may differ between the two states. Memory has no
    /// stable naming to report differences against, so the delta is
    /// register-only; memory disagreement still shows up through
    /// [`SymbolicState::equals`].
    pub fn diff(&self, other: &Self, solver: Option<&Solver<'ctx>>) -> RegisterSet {
        self.registers.diff(&other.registers, solver)
    }

    /// Fold the state arriving over another control-flow edge into this one.
    /// `condition` is the branch condition selecting that edge; there is no
    /// conditionless variant at this level because a full-state join without
    /// the controlling condition is a driver bug.
    pub fn merge(
        &mut self,
        other: &Self,
        ops: &dyn SemanticOps<'ctx>,
        condition: &SymbolicValue<'ctx>,
    ) -> MergeOutcome {
        let merger = Merger::conditional(condition.clone());
        self.registers.merge(&other.registers, &merger, ops)
            + self.memory.merge(&other.memory, &merger, ops, ops)
    }
}

impl<'ctx> StateComparable<'ctx> for SymbolicState<'ctx> {
    type Delta = RegisterSet;

    fn equals(&self, other: &Self) -> bool {
        SymbolicState::equals(self, other)
    }

    fn diff(&self, other: &Self, solver: Option<&Solver<'ctx>>) -> RegisterSet {
        SymbolicState::diff(self, other, solver)
    }
}

impl<'ctx> StateMergeable<'ctx> for SymbolicState<'ctx> {
    fn merge(
        &mut self,
        other: &Self,
        ops: &dyn SemanticOps<'ctx>,
        condition: &SymbolicValue<'ctx>,
    ) -> MergeOutcome {
        SymbolicState::merge(self, other, ops, condition)
    }
}

#[cfg(test)]
mod tests {
    use super::StateMergeable;
    use crate::context::ConfluenceContext;
    use crate::merge::MergeOutcome;
    use crate::ops::SemanticOps;
    use crate::value::SymbolicValue;
    use confluence_arch::RegisterDictionary;
    use z3::ast::BV;
    use z3::{Config, Context};

    #[test]
    fn fresh_states_compare_equal_and_diff_empty() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let a = ctx.fresh_state();
        let b = ctx.fresh_state();
        assert!(a.equals(&b));
        assert!(a.diff(&b, None).is_empty());
    }

    #[test]
    fn merge_reaches_both_registers_and_memory() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let rax = ctx.dictionary.register("rax").unwrap();
        let address = SymbolicValue::new(BV::new_const(&z3, "p", 64), false);

        let mut taken = ctx.fresh_state();
        taken
            .registers_mut()
            .write_register(rax, SymbolicValue::constant(&z3, 1, 64))
            .unwrap();
        taken
            .memory_mut()
            .write(address.clone(), SymbolicValue::constant(&z3, 3, 8));

        let mut fallthrough = ctx.fresh_state();
        fallthrough
            .registers_mut()
            .write_register(rax, SymbolicValue::constant(&z3, 2, 64))
            .unwrap();
        fallthrough
            .memory_mut()
            .write(address.clone(), SymbolicValue::constant(&z3, 4, 8));

        let condition = SymbolicValue::variable(&z3, "took_branch", 1);
        let outcome = taken.merge(&fallthrough, &ctx, &condition);
        assert_eq!(outcome, MergeOutcome::Changed);

        let merged_rax = taken.registers().inspect_register(rax).unwrap();
        assert_ne!(merged_rax.expression(), SymbolicValue::constant(&z3, 1, 64).expression());
        assert_ne!(merged_rax.expression(), SymbolicValue::constant(&z3, 2, 64).expression());
        assert!(!fallthrough.equals(&taken));
    }

    #[test]
    fn merging_a_state_with_itself_changes_nothing() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::i386());
        let eax = ctx.dictionary.register("eax").unwrap();
        let mut state = ctx.fresh_state();
        state
            .registers_mut()
            .write_register(eax, SymbolicValue::constant(&z3, 7, 32))
            .unwrap();
        let snapshot = state.clone();
        let condition = SymbolicValue::variable(&z3, "c", 1);
        assert_eq!(
            state.merge(&snapshot, &ctx, &condition),
            MergeOutcome::Unchanged
        );
        assert!(state.equals(&snapshot));
    }

    #[test]
    fn diff_names_the_family_that_moved() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let rbx = ctx.dictionary.register("rbx").unwrap();
        let mut before = ctx.fresh_state();
        let mut after = before.clone();
        before
            .registers_mut()
            .write_register(rbx, SymbolicValue::constant(&z3, 1, 64))
            .unwrap();
        after
            .registers_mut()
            .write_register(rbx, SymbolicValue::constant(&z3, 2, 64))
            .unwrap();
        let delta = before.diff(&after, None);
        assert!(delta.contains(&rbx));
    }

    // A convergence loop written against the traits alone, the way a
    // fixed-point driver would be.
    fn join_until_stable<'ctx, S: StateMergeable<'ctx>>(
        dest: &mut S,
        src: &S,
        ops: &dyn SemanticOps<'ctx>,
        condition: &SymbolicValue<'ctx>,
        limit: usize,
    ) -> usize {
        for round in 0..limit {
            if !dest.merge(src, ops, condition).changed() {
                return round;
            }
        }
        limit
    }

    #[test]
    fn generic_drivers_converge_through_the_traits() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let rcx = ctx.dictionary.register("rcx").unwrap();
        let rdx = ctx.dictionary.register("rdx").unwrap();
        let mut dest = ctx.fresh_state();
        let mut src = ctx.fresh_state();
        // rcx agrees on both paths; rdx only ever existed on dest's path
        dest.registers_mut()
            .write_register(rcx, SymbolicValue::constant(&z3, 9, 64))
            .unwrap();
        dest.registers_mut()
            .write_register(rdx, SymbolicValue::constant(&z3, 5, 64))
            .unwrap();
        src.registers_mut()
            .write_register(rcx, SymbolicValue::constant(&z3, 9, 64))
            .unwrap();
        let condition = SymbolicValue::variable(&z3, "c", 1);
        let rounds = join_until_stable(&mut dest, &src, &ctx, &condition, 8);
        // round one weakens rdx toward incompleteness, round two is stable
        assert_eq!(rounds, 1);
        assert!(dest.equals(&src));
    }
}
