use crate::merge::Merger;
use crate::ops::SemanticOps;
use std::fmt::{Display, Formatter};
use z3::ast::{Ast, BV, Bool};
use z3::{Context, SatResult, Solver};

/// A [`SymbolicValue`] is the unit of data an analysis state maps registers and
/// memory cells to: a bit-vector expression plus a completeness flag.
///
/// The expression is a handle into z3's hash-consed term graph, so clones share
/// structure and equality of handles is structural equality of terms. The
/// *incomplete* flag marks values known only approximately, such as unmodeled
/// inputs or the residue of weakening a one-sided cell at a control-flow join.
/// The flag rides on the value, not the expression: the same term can back a
/// complete value in one state and an incomplete one in another.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SymbolicValue<'ctx> {
    expr: BV<'ctx>,
    incomplete: bool,
}

impl<'ctx> SymbolicValue<'ctx> {
    pub fn new(expr: BV<'ctx>, incomplete: bool) -> Self {
        Self { expr, incomplete }
    }

    /// A complete value backed by a named free variable.
    pub fn variable(z3: &'ctx Context, name: &str, nbits: u32) -> Self {
        Self::new(BV::new_const(z3, name, nbits), false)
    }

    /// An incomplete value backed by a fresh, uniquely-named variable.
    pub fn fresh_incomplete(z3: &'ctx Context, nbits: u32) -> Self {
        Self::new(BV::fresh_const(z3, "inc", nbits), true)
    }

    /// A complete constant.
    pub fn constant(z3: &'ctx Context, value: u64, nbits: u32) -> Self {
        Self::new(BV::from_u64(z3, value, nbits), false)
    }

    pub fn expression(&self) -> &BV<'ctx> {
        &self.expr
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn nbits(&self) -> u32 {
        self.expr.get_size()
    }

    /// The three-valued convergence comparison. Two incomplete values agree no
    /// matter what terms back them; an incomplete value never agrees with a
    /// complete one; two complete values agree when their terms are structurally
    /// equal. "Disagreement" here means a fixed-point driver should keep
    /// iterating, not that the values are provably distinct.
    pub fn agrees_with(&self, other: &SymbolicValue<'ctx>) -> bool {
        if self.incomplete && other.incomplete {
            return true;
        }
        if self.incomplete != other.incomplete {
            return false;
        }
        self.expr == other.expr
    }

    /// Solver-backed equality, stronger than [`Self::agrees_with`]: true only when
    /// the two terms denote the same value in every model. Falls back to
    /// structural comparison of raw and simplified terms when no solver is given.
    /// Completeness flags are not consulted.
    pub fn must_equal(&self, other: &SymbolicValue<'ctx>, solver: Option<&Solver<'ctx>>) -> bool {
        if self.nbits() != other.nbits() {
            return false;
        }
        if self.expr == other.expr {
            return true;
        }
        if self.expr.simplify() == other.expr.simplify() {
            return true;
        }
        if let Some(solver) = solver {
            solver.push();
            solver.assert(&self.expr._eq(&other.expr).not());
            let proven = solver.check() == SatResult::Unsat;
            solver.pop(1);
            return proven;
        }
        false
    }

    /// Combine this value with the value arriving from another control-flow path,
    /// or with `None` when the other path has no value for this location.
    ///
    /// Returns `None` when no new value is required: both values incomplete, both
    /// provably equal, or a one-sided value that is already incomplete. Otherwise
    /// the result is `if condition then other else self` with completeness OR-ed
    /// (for a one-sided complete value: a fresh incomplete value of the same
    /// width). Panics if the merger carries no join condition.
    pub fn merge_with(
        &self,
        other: Option<&SymbolicValue<'ctx>>,
        merger: &Merger<'ctx>,
        ops: &dyn SemanticOps<'ctx>,
    ) -> Option<SymbolicValue<'ctx>> {
        let Some(other) = other else {
            if self.incomplete {
                return None;
            }
            return Some(Self::fresh_incomplete(ops.z3(), self.nbits()));
        };
        if self.incomplete && other.incomplete {
            return None;
        }
        if !self.incomplete && !other.incomplete && self.must_equal(other, ops.solver()) {
            return None;
        }
        let condition = merger.require_condition().as_condition();
        let (incoming, current) = widen_pair(&other.expr, &self.expr);
        Some(Self::new(
            condition.ite(&incoming, &current),
            self.incomplete || other.incomplete,
        ))
    }

    /// This value reinterpreted as a branch test: true iff the term is nonzero.
    fn as_condition(&self) -> Bool<'ctx> {
        let zero = BV::from_u64(self.expr.get_ctx(), 0, self.nbits());
        self.expr._eq(&zero).not()
    }

    /// The bit range `[offset, offset + nbits)` of this value.
    pub fn extract_bits(&self, offset: u16, nbits: u16) -> SymbolicValue<'ctx> {
        let high = (offset + nbits - 1) as u32;
        Self::new(self.expr.extract(high, offset as u32), self.incomplete)
    }
}

impl Display for SymbolicValue<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.incomplete {
            write!(f, " (incomplete)")?;
        }
        Ok(())
    }
}

/// Zero-extend the narrower of two terms so both share the wider width.
pub(crate) fn widen_pair<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> (BV<'ctx>, BV<'ctx>) {
    let (wa, wb) = (a.get_size(), b.get_size());
    if wa < wb {
        (a.zero_ext(wb - wa), b.clone())
    } else if wb < wa {
        (a.clone(), b.zero_ext(wa - wb))
    } else {
        (a.clone(), b.clone())
    }
}
