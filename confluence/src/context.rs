use crate::ops::SemanticOps;
use crate::state::SymbolicState;
use confluence_arch::RegisterDictionary;
use internment::Intern;
use z3::Context;

/// Everything needed to mint and drive analysis states: a z3 context and an
/// interned register dictionary.
///
/// Interning the dictionary makes the handle [`Copy`] and makes "were these two
/// states built against the same architecture" a pointer comparison.
#[derive(Debug, Clone)]
pub struct ConfluenceContext<'ctx> {
    pub z3: &'ctx Context,
    pub dictionary: Intern<RegisterDictionary>,
}

impl<'ctx> ConfluenceContext<'ctx> {
    pub fn new(z3: &'ctx Context, dictionary: RegisterDictionary) -> Self {
        Self {
            z3,
            dictionary: Intern::new(dictionary),
        }
    }

    /// A new, empty state: no register families materialized, no memory cells.
    pub fn fresh_state(&self) -> SymbolicState<'ctx> {
        SymbolicState::new(self.z3, self.dictionary)
    }
}

impl<'ctx> SemanticOps<'ctx> for ConfluenceContext<'ctx> {
    fn z3(&self) -> &'ctx Context {
        self.z3
    }
}

#[cfg(test)]
mod tests {
    use super::ConfluenceContext;
    use confluence_arch::RegisterDictionary;
    use z3::{Config, Context};

    #[test]
    fn equal_dictionaries_intern_to_the_same_handle() {
        let z3 = Context::new(&Config::new());
        let a = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let b = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let c = ConfluenceContext::new(&z3, RegisterDictionary::i386());
        assert_eq!(a.dictionary, b.dictionary);
        assert_ne!(a.dictionary, c.dictionary);
    }

    #[test]
    fn fresh_states_start_empty() {
        let z3 = Context::new(&Config::new());
        let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
        let state = ctx.fresh_state();
        assert!(state.memory().is_empty());
        assert!(state.registers().is_empty());
    }
}
