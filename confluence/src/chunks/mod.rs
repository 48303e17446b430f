mod decompose;

use crate::chunks::decompose::decompose;
use crate::state::SymbolicState;
use crate::value::widen_pair;
use std::fmt::{Display, Formatter};
use tracing::instrument;
use z3::ast::{Ast, BV, Bool};

/// What a run of memory cells is addressed relative to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChunkBase<'ctx> {
    /// A symbolic term; offsets are displacements from it.
    Symbolic(BV<'ctx>),
    /// No symbolic part; offsets are absolute addresses.
    Absolute,
}

impl ChunkBase<'_> {
    pub fn is_symbolic(&self) -> bool {
        matches!(self, ChunkBase::Symbolic(_))
    }
}

impl Display for ChunkBase<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkBase::Symbolic(base) => write!(f, "{base}"),
            ChunkBase::Absolute => write!(f, "absolute"),
        }
    }
}

struct Section<'ctx> {
    base: ChunkBase<'ctx>,
    slots: Vec<(i64, BV<'ctx>)>,
}

/// A reorganized, read-only view of one program point's memory: every cell's
/// address is decomposed into (base, offset) readings and the cells are bucketed
/// by base. Built from a finished (input, output) state pair; the view is a
/// snapshot and does not track later mutation of the states.
///
/// Two cells can decompose to the same slot (the bases alias); the slot then
/// holds `if fresh then newer else older` over a fresh opaque condition, standing
/// for "one of these, we cannot say which".
///
/// The designated direction flag is pinned first: its current term in the input
/// state is substituted by the constant `direction_flag` through every address,
/// since the flag cannot vary within a single program point and leaving it
/// symbolic would split otherwise-identical bases.
pub struct MemoryChunks<'ctx> {
    sections: Vec<Section<'ctx>>,
}

impl<'ctx> MemoryChunks<'ctx> {
    #[instrument(skip_all)]
    pub fn new(
        input: &SymbolicState<'ctx>,
        output: &SymbolicState<'ctx>,
        direction_flag: bool,
    ) -> Self {
        let substitution = output.dictionary().direction_flag().and_then(|df| {
            let current = input.registers().inspect_register(df)?;
            let fixed = BV::from_u64(
                current.expression().get_ctx(),
                direction_flag as u64,
                current.nbits(),
            );
            Some((current.expression().clone(), fixed))
        });
        let mut sections: Vec<Section<'ctx>> = Vec::new();
        for cell in output.memory().cells() {
            let mut address = cell.address().expression().clone();
            if let Some((from, to)) = &substitution {
                address = address.substitute(&[(from, to)]);
            }
            let address = address.simplify();
            for (base, offsets) in decompose(&address) {
                let Some(offset) = offsets.first() else {
                    continue;
                };
                add_slot(&mut sections, base, *offset, cell.value().expression().clone());
            }
        }
        for section in &mut sections {
            section.slots.sort_by_key(|(offset, _)| *offset);
        }
        Self { sections }
    }

    /// A forward cursor over maximal runs of strictly consecutive offsets,
    /// section by section. The iterator borrows this view; build a new view to
    /// restart or to observe later writes.
    pub fn iter(&self) -> Chunks<'_, 'ctx> {
        Chunks {
            sections: &self.sections,
            section: 0,
            slot: 0,
        }
    }
}

impl<'a, 'ctx> IntoIterator for &'a MemoryChunks<'ctx> {
    type Item = Chunk<'a, 'ctx>;
    type IntoIter = Chunks<'a, 'ctx>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Route one (base, offset, value) reading into its section, multiplexing
/// aliased slots behind a fresh opaque condition.
fn add_slot<'ctx>(
    sections: &mut Vec<Section<'ctx>>,
    base: Option<BV<'ctx>>,
    offset: i64,
    value: BV<'ctx>,
) {
    let base = match base {
        Some(term) => ChunkBase::Symbolic(term),
        None => ChunkBase::Absolute,
    };
    let index = match sections.iter().position(|s| s.base == base) {
        Some(i) => i,
        None => {
            sections.push(Section {
                base,
                slots: Vec::new(),
            });
            sections.len() - 1
        }
    };
    let section = &mut sections[index];
    match section.slots.iter_mut().find(|(o, _)| *o == offset) {
        Some((_, prior)) => {
            let condition = Bool::fresh_const(value.get_ctx(), "alias");
            let (newer, older) = widen_pair(&value, prior);
            *prior = condition.ite(&newer, &older);
        }
        None => section.slots.push((offset, value)),
    }
}

/// One maximal run of cells sharing a base and strictly consecutive offsets.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a, 'ctx> {
    base: &'a ChunkBase<'ctx>,
    cells: &'a [(i64, BV<'ctx>)],
}

impl<'a, 'ctx> Chunk<'a, 'ctx> {
    pub fn base(&self) -> &'a ChunkBase<'ctx> {
        self.base
    }

    pub fn is_symbolic(&self) -> bool {
        self.base.is_symbolic()
    }

    /// The (offset, value) cells of this run, in ascending offset order.
    pub fn cells(&self) -> &'a [(i64, BV<'ctx>)] {
        self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Display for Chunk<'_, '_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.cells.first(), self.cells.last()) {
            (Some((first, _)), Some((last, _))) => {
                write!(f, "{}[{}..{}]", self.base, first, last.saturating_add(1))
            }
            _ => write!(f, "{}[]", self.base),
        }
    }
}

/// See [`MemoryChunks::iter`].
pub struct Chunks<'a, 'ctx> {
    sections: &'a [Section<'ctx>],
    section: usize,
    slot: usize,
}

impl<'a, 'ctx> Iterator for Chunks<'a, 'ctx> {
    type Item = Chunk<'a, 'ctx>;

    fn next(&mut self) -> Option<Self::Item> {
        while self
            .sections
            .get(self.section)
            .is_some_and(|s| self.slot >= s.slots.len())
        {
            self.section += 1;
            self.slot = 0;
        }
        let section = self.sections.get(self.section)?;
        let start = self.slot;
        let mut end = start + 1;
        while end < section.slots.len()
            && section.slots[end - 1]
                .0
                .checked_add(1)
                .is_some_and(|next| next == section.slots[end].0)
        {
            end += 1;
        }
        self.slot = end;
        Some(Chunk {
            base: &section.base,
            cells: &section.slots[start..end],
        })
    }
}
