use z3::{Context, Solver};

/// The operator context threaded through comparison, merge, and chunking calls.
///
/// The instruction-semantics layer that drives a state through a program owns the
/// expression context and (usually) a solver scoped to the current analysis pass.
/// Everything here receives that capability as an explicit argument; nothing
/// reaches for process-wide state.
pub trait SemanticOps<'ctx> {
    /// The expression context that every value handled through this object lives in.
    fn z3(&self) -> &'ctx Context;

    /// A solver for must-equal queries. Operations fall back to structural
    /// comparison when none is available.
    fn solver(&self) -> Option<&Solver<'ctx>> {
        None
    }
}

/// A minimal [`SemanticOps`]: an expression context and an optional dedicated solver.
///
/// Real semantics layers will have richer contexts; this one is enough to drive
/// every operation in this crate and is what the tests and examples use.
pub struct BasicOps<'ctx> {
    z3: &'ctx Context,
    solver: Option<Solver<'ctx>>,
}

impl<'ctx> BasicOps<'ctx> {
    pub fn new(z3: &'ctx Context) -> Self {
        Self { z3, solver: None }
    }

    pub fn with_solver(z3: &'ctx Context) -> Self {
        Self {
            z3,
            solver: Some(Solver::new(z3)),
        }
    }
}

impl<'ctx> SemanticOps<'ctx> for BasicOps<'ctx> {
    fn z3(&self) -> &'ctx Context {
        self.z3
    }

    fn solver(&self) -> Option<&Solver<'ctx>> {
        self.solver.as_ref()
    }
}
