use crate::error::ConfluenceError;
use crate::merge::{MergeOutcome, Merger};
use crate::ops::SemanticOps;
use crate::value::SymbolicValue;
use confluence_arch::{RegisterDescriptor, RegisterDictionary};
use internment::Intern;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use z3::{Context, Solver};

/// The set of registers a diff reports as changed, keyed by base descriptor.
pub type RegisterSet = BTreeSet<RegisterDescriptor>;

/// Maps register families to symbolic values for one program point.
///
/// Storage is one slot per register *family* (the base register); reads and
/// writes of sub-registers extract from or splice into the family value, so
/// `eax` and `ah` always see the matching bits of `rax`. Completeness is
/// tracked per family: a partial write into a never-written family leaves the
/// family incomplete, since its remaining bits are still unknown.
///
/// An ordinary read of an untouched family materializes a fresh incomplete
/// value for it; [`RegisterState::inspect_register`] is the side-effect-free
/// alternative.
#[derive(Debug, Clone)]
pub struct RegisterState<'ctx> {
    z3: &'ctx Context,
    dictionary: Intern<RegisterDictionary>,
    values: BTreeMap<RegisterDescriptor, SymbolicValue<'ctx>>,
}

impl<'ctx> RegisterState<'ctx> {
    pub fn new(z3: &'ctx Context, dictionary: Intern<RegisterDictionary>) -> Self {
        Self {
            z3,
            dictionary,
            values: BTreeMap::new(),
        }
    }

    pub fn dictionary(&self) -> Intern<RegisterDictionary> {
        self.dictionary
    }

    /// Whether any register family has been materialized yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The materialized families and their values, in descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = (&RegisterDescriptor, &SymbolicValue<'ctx>)> {
        self.values.iter()
    }

    /// Read a register, materializing a fresh incomplete family value if this
    /// state has never touched the register's family.
    pub fn read_register(
        &mut self,
        descriptor: RegisterDescriptor,
    ) -> Result<SymbolicValue<'ctx>, ConfluenceError> {
        let base = self.dictionary.base_of(&descriptor)?;
        let z3 = self.z3;
        let family = self
            .values
            .entry(base)
            .or_insert_with(|| SymbolicValue::fresh_incomplete(z3, base.nbits as u32));
        Ok(view_of(family, &base, &descriptor))
    }

    /// Write a register, splicing sub-register writes into the family value.
    pub fn write_register(
        &mut self,
        descriptor: RegisterDescriptor,
        value: SymbolicValue<'ctx>,
    ) -> Result<(), ConfluenceError> {
        let base = self.dictionary.base_of(&descriptor)?;
        if value.nbits() != descriptor.nbits as u32 {
            return Err(ConfluenceError::MismatchedRegisterWrite {
                register_nbits: descriptor.nbits,
                value_nbits: value.nbits(),
            });
        }
        if descriptor.offset == 0 && descriptor.nbits == base.nbits {
            self.values.insert(base, value);
            return Ok(());
        }
        let z3 = self.z3;
        let family = self
            .values
            .entry(base)
            .or_insert_with(|| SymbolicValue::fresh_incomplete(z3, base.nbits as u32));
        *family = splice(family, &descriptor, &value, base.nbits);
        Ok(())
    }

    /// A guarded read: resolves and extracts exactly like [`Self::read_register`]
    /// but never materializes storage. Returns `None` for untouched families and
    /// for descriptors the dictionary does not know.
    pub fn inspect_register(&self, descriptor: RegisterDescriptor) -> Option<SymbolicValue<'ctx>> {
        let base = self.dictionary.base_of(&descriptor).ok()?;
        let family = self.values.get(&base)?;
        Some(view_of(family, &base, &descriptor))
    }

    /// The fixed-point convergence test. Walks every family either state has
    /// materialized; an absent family compares like an incomplete value, so two
    /// states that are unknown about the same register still converge.
    pub fn equals(&self, other: &Self) -> bool {
        for base in self.values.keys().merge(other.values.keys()).dedup() {
            match (self.values.get(base), other.values.get(base)) {
                (Some(value), Some(ovalue)) => {
                    if !value.agrees_with(ovalue) {
                        debug!(
                            "register {} diverged: {} vs {}",
                            base.display(&self.dictionary),
                            value,
                            ovalue
                        );
                        return false;
                    }
                }
                (Some(one_sided), None) | (None, Some(one_sided)) => {
                    if !one_sided.is_incomplete() {
                        debug!(
                            "register {} is definite on only one side",
                            base.display(&self.dictionary)
                        );
                        return false;
                    }
                }
                (None, None) => unreachable!("merged family keys come from one of the two maps"),
            }
        }
        true
    }

    /// The registers whose values provably changed between `self` and `other`.
    ///
    /// Reporting policy differs from [`Self::equals`] on purpose: families the
    /// other state cannot inspect count as unchanged, the instruction pointer is
    /// never reported, and comparison is the solver-backed must-equal so that
    /// syntactically different spellings of the same value do not show up as
    /// spurious changes.
    pub fn diff(&self, other: &Self, solver: Option<&Solver<'ctx>>) -> RegisterSet {
        let ip = self.dictionary.instruction_pointer();
        let mut changed = RegisterSet::new();
        for (base, value) in &self.values {
            if base.same_family(&ip) {
                continue;
            }
            let Some(ovalue) = other.inspect_register(*base) else {
                continue;
            };
            if !value.must_equal(&ovalue, solver) {
                changed.insert(*base);
            }
        }
        changed
    }

    /// Merge the register slice of a control-flow join, family by family, with
    /// the same weaken-toward-incomplete policy the memory merge uses for cells
    /// present on only one path.
    pub fn merge(
        &mut self,
        other: &Self,
        merger: &Merger<'ctx>,
        ops: &dyn SemanticOps<'ctx>,
    ) -> MergeOutcome {
        self.ensure_compatible(other);
        let mut outcome = MergeOutcome::Unchanged;
        for (base, ovalue) in &other.values {
            let merged = match self.values.get(base) {
                Some(value) => value.merge_with(Some(ovalue), merger, ops),
                None => ovalue.merge_with(None, merger, ops),
            };
            if let Some(merged) = merged {
                self.values.insert(*base, merged);
                outcome += MergeOutcome::Changed;
            }
        }
        for (base, value) in self.values.iter_mut() {
            if other.values.contains_key(base) {
                continue;
            }
            if let Some(weakened) = value.merge_with(None, merger, ops) {
                *value = weakened;
                outcome += MergeOutcome::Changed;
            }
        }
        outcome
    }

    fn ensure_compatible(&self, other: &Self) {
        if !std::ptr::eq(self.z3, other.z3) {
            panic!("contract violation: cannot merge register states from different expression contexts");
        }
        if self.dictionary != other.dictionary {
            panic!("contract violation: cannot merge register states built against different dictionaries");
        }
    }
}

/// The slice of `family` that `descriptor` names. Full-width views hand back the
/// family value itself so structural equality is preserved.
fn view_of<'ctx>(
    family: &SymbolicValue<'ctx>,
    base: &RegisterDescriptor,
    descriptor: &RegisterDescriptor,
) -> SymbolicValue<'ctx> {
    if descriptor.offset == 0 && descriptor.nbits == base.nbits {
        family.clone()
    } else {
        family.extract_bits(descriptor.offset, descriptor.nbits)
    }
}

/// Replace bits `[offset, offset + nbits)` of `family` with `value`, keeping the
/// surrounding bits. Completeness flags are OR-ed.
fn splice<'ctx>(
    family: &SymbolicValue<'ctx>,
    descriptor: &RegisterDescriptor,
    value: &SymbolicValue<'ctx>,
    family_nbits: u16,
) -> SymbolicValue<'ctx> {
    let low_end = descriptor.offset;
    let high_start = descriptor.offset + descriptor.nbits;
    let mut expr = value.expression().clone();
    if high_start < family_nbits {
        let high = family
            .expression()
            .extract(family_nbits as u32 - 1, high_start as u32);
        expr = high.concat(&expr);
    }
    if low_end > 0 {
        let low = family.expression().extract(low_end as u32 - 1, 0);
        expr = expr.concat(&low);
    }
    SymbolicValue::new(expr, family.is_incomplete() || value.is_incomplete())
}

#[cfg(test)]
mod tests {
    use super::RegisterState;
    use crate::error::ConfluenceError;
    use crate::merge::Merger;
    use crate::ops::BasicOps;
    use crate::value::SymbolicValue;
    use confluence_arch::{RegisterDescriptor, RegisterDictionary};
    use internment::Intern;
    use z3::{Config, Context};

    fn amd64() -> Intern<RegisterDictionary> {
        Intern::new(RegisterDictionary::amd64())
    }

    fn merger<'ctx>(z3: &'ctx Context) -> Merger<'ctx> {
        Merger::conditional(SymbolicValue::variable(z3, "c", 1))
    }

    #[test]
    fn reads_auto_vivify_and_are_stable() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        let first = state.read_register(rax).unwrap();
        let second = state.read_register(rax).unwrap();
        assert!(first.is_incomplete());
        assert_eq!(first, second);
        assert!(!state.is_empty());
    }

    #[test]
    fn inspect_never_creates_storage() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        assert!(state.inspect_register(rax).is_none());
        assert!(state.is_empty());
        state
            .write_register(rax, SymbolicValue::constant(&z3, 3, 64))
            .unwrap();
        assert!(state.inspect_register(rax).is_some());
    }

    #[test]
    fn inspect_of_an_unknown_family_is_none_not_an_error() {
        let z3 = Context::new(&Config::new());
        let state = RegisterState::new(&z3, amd64());
        let bogus = RegisterDescriptor::new(9, 9, 0, 8);
        assert!(state.inspect_register(bogus).is_none());
    }

    #[test]
    fn subregister_reads_see_family_bits() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let eax = dict.register("eax").unwrap();
        let ah = dict.register("ah").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        let value = SymbolicValue::constant(&z3, 0x1122_3344_5566_7788, 64);
        state.write_register(rax, value.clone()).unwrap();
        let read = state.read_register(eax).unwrap();
        assert_eq!(read.expression(), &value.expression().extract(31, 0));
        assert!(!read.is_incomplete());
        let read = state.read_register(ah).unwrap();
        assert_eq!(read.expression(), &value.expression().extract(15, 8));
    }

    #[test]
    fn subregister_writes_splice_into_the_family() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let eax = dict.register("eax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        state
            .write_register(rax, SymbolicValue::constant(&z3, 0, 64))
            .unwrap();
        let narrow = SymbolicValue::constant(&z3, 0x1234, 32);
        state.write_register(eax, narrow.clone()).unwrap();
        let low = state.read_register(eax).unwrap();
        assert_eq!(low.nbits(), 32);
        assert!(!low.is_incomplete());
        let family = state.read_register(rax).unwrap();
        assert_eq!(family.nbits(), 64);
    }

    #[test]
    fn partial_writes_into_unknown_families_stay_incomplete() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let ax = dict.register("ax").unwrap();
        let rax = dict.register("rax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        state
            .write_register(ax, SymbolicValue::constant(&z3, 7, 16))
            .unwrap();
        // the family's upper bits were never written, so the family stays approximate
        assert!(state.read_register(rax).unwrap().is_incomplete());
    }

    #[test]
    fn mismatched_write_width_errors() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        let narrow = SymbolicValue::constant(&z3, 1, 32);
        assert!(matches!(
            state.write_register(rax, narrow),
            Err(ConfluenceError::MismatchedRegisterWrite { .. })
        ));
    }

    #[test]
    fn equals_is_reflexive_and_tolerates_shared_incompleteness() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        assert!(a.equals(&b));
        // different incomplete terms on both sides still converge
        a.read_register(rax).unwrap();
        b.read_register(rax).unwrap();
        assert!(a.equals(&b));
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn equals_fails_when_exactly_one_side_is_definite() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        a.read_register(rax).unwrap();
        b.write_register(rax, SymbolicValue::constant(&z3, 0, 64))
            .unwrap();
        assert!(!a.equals(&b));
        assert!(!b.equals(&a));
        // a definite family missing entirely from the other side also fails
        let empty = RegisterState::new(&z3, dict);
        assert!(!b.equals(&empty));
        assert!(!empty.equals(&b));
        // but an incomplete family missing from the other side converges
        assert!(a.equals(&empty));
    }

    #[test]
    fn equals_compares_definite_values_structurally() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rbx = dict.register("rbx").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        a.write_register(rbx, SymbolicValue::constant(&z3, 1, 64))
            .unwrap();
        b.write_register(rbx, SymbolicValue::constant(&z3, 1, 64))
            .unwrap();
        assert!(a.equals(&b));
        b.write_register(rbx, SymbolicValue::constant(&z3, 2, 64))
            .unwrap();
        assert!(!a.equals(&b));
    }

    #[test]
    fn diff_reports_changed_registers_but_never_the_instruction_pointer() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let rip = dict.register("rip").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        for (state, rax_val, rip_val) in [(&mut a, 1, 0x1000), (&mut b, 2, 0x2000)] {
            state
                .write_register(rax, SymbolicValue::constant(&z3, rax_val, 64))
                .unwrap();
            state
                .write_register(rip, SymbolicValue::constant(&z3, rip_val, 64))
                .unwrap();
        }
        let changed = a.diff(&b, None);
        assert!(changed.contains(&rax));
        assert!(!changed.iter().any(|d| d.same_family(&rip)));
        assert!(a.diff(&a.clone(), None).is_empty());
    }

    #[test]
    fn diff_skips_registers_the_other_state_never_saw() {
        let z3 = Context::new(&Config::new());
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        a.write_register(rax, SymbolicValue::constant(&z3, 5, 64))
            .unwrap();
        let b = RegisterState::new(&z3, dict);
        assert!(a.diff(&b, None).is_empty());
    }

    #[test]
    fn self_merge_changes_nothing() {
        let z3 = Context::new(&Config::new());
        let ops = BasicOps::new(&z3);
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut state = RegisterState::new(&z3, dict);
        state
            .write_register(rax, SymbolicValue::constant(&z3, 9, 64))
            .unwrap();
        let snapshot = state.clone();
        let outcome = state.merge(&snapshot, &merger(&z3), &ops);
        assert!(!outcome.changed());
        assert!(state.equals(&snapshot));
    }

    #[test]
    fn merge_builds_conditionals_for_diverging_families() {
        let z3 = Context::new(&Config::new());
        let ops = BasicOps::new(&z3);
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        a.write_register(rax, SymbolicValue::constant(&z3, 1, 64))
            .unwrap();
        b.write_register(rax, SymbolicValue::constant(&z3, 2, 64))
            .unwrap();
        let outcome = a.merge(&b, &merger(&z3), &ops);
        assert!(outcome.changed());
        let merged = a.inspect_register(rax).unwrap();
        assert_ne!(merged, SymbolicValue::constant(&z3, 1, 64));
        assert_ne!(merged, SymbolicValue::constant(&z3, 2, 64));
    }

    #[test]
    fn merge_weakens_one_sided_definite_families() {
        let z3 = Context::new(&Config::new());
        let ops = BasicOps::new(&z3);
        let dict = amd64();
        let rax = dict.register("rax").unwrap();
        let rbx = dict.register("rbx").unwrap();
        let mut a = RegisterState::new(&z3, dict);
        let mut b = RegisterState::new(&z3, dict);
        a.write_register(rax, SymbolicValue::constant(&z3, 5, 64))
            .unwrap();
        b.write_register(rbx, SymbolicValue::constant(&z3, 6, 64))
            .unwrap();
        let outcome = a.merge(&b, &merger(&z3), &ops);
        assert!(outcome.changed());
        // both one-sided values weaken rather than surviving verbatim
        assert!(a.inspect_register(rax).unwrap().is_incomplete());
        assert!(a.inspect_register(rbx).unwrap().is_incomplete());
    }

    #[test]
    #[should_panic(expected = "different dictionaries")]
    fn merging_across_dictionaries_is_fatal() {
        let z3 = Context::new(&Config::new());
        let ops = BasicOps::new(&z3);
        let mut a = RegisterState::new(&z3, amd64());
        let b = RegisterState::new(&z3, Intern::new(RegisterDictionary::i386()));
        a.merge(&b, &merger(&z3), &ops);
    }
}
