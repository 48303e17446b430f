use crate::error::ConfluenceError;
use crate::merge::{MergeOutcome, Merger};
use crate::ops::SemanticOps;
use crate::value::SymbolicValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, instrument};
use z3::Context;
use z3::ast::{Ast, BV};

/// How a memory cell has been accessed over the analyzed region.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum IoProperty {
    Read,
    Written,
    Initialized,
    ReadBeforeWrite,
    ReadAfterWrite,
    ReadUninitialized,
}

/// One addressed slot of symbolic memory.
///
/// Besides its value, a cell carries provenance: the *writers* (addresses of the
/// instructions that produced the value) and the access-pattern flags. A direct
/// [`MemoryState::write`] replaces all three; only the merge algorithm combines
/// them, writers and properties by set union.
#[derive(Debug, Clone)]
pub struct MemoryCell<'ctx> {
    address: SymbolicValue<'ctx>,
    /// Canonical form of the address term, the map key for alias detection
    key: BV<'ctx>,
    value: SymbolicValue<'ctx>,
    writers: BTreeSet<u64>,
    io_properties: BTreeSet<IoProperty>,
}

impl<'ctx> MemoryCell<'ctx> {
    pub fn address(&self) -> &SymbolicValue<'ctx> {
        &self.address
    }

    pub fn value(&self) -> &SymbolicValue<'ctx> {
        &self.value
    }

    pub fn writers(&self) -> &BTreeSet<u64> {
        &self.writers
    }

    pub fn io_properties(&self) -> &BTreeSet<IoProperty> {
        &self.io_properties
    }

    /// Record the instruction at `address` as a source of this cell's value.
    pub fn add_writer(&mut self, address: u64) {
        self.writers.insert(address);
    }

    pub fn add_io_property(&mut self, property: IoProperty) {
        self.io_properties.insert(property);
    }
}

/// The memory half of a symbolic state: an open, address-keyed map of cells.
///
/// Cells are keyed by the canonical (simplified) form of their address term, so
/// two writes whose addresses simplify to the same term land in one cell no
/// matter how they were spelled. At most one cell exists per canonical key.
/// Iteration order is insertion order, which keeps chunking and diagnostics
/// deterministic.
#[derive(Debug, Clone)]
pub struct MemoryState<'ctx> {
    z3: &'ctx Context,
    cells: Vec<MemoryCell<'ctx>>,
}

impl<'ctx> MemoryState<'ctx> {
    pub fn new(z3: &'ctx Context) -> Self {
        Self {
            z3,
            cells: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// All cells, in insertion order.
    pub fn cells(&self) -> impl Iterator<Item = &MemoryCell<'ctx>> {
        self.cells.iter()
    }

    /// The cell whose address canonicalizes to the same key as `address`.
    pub fn find_cell(&self, address: &SymbolicValue<'ctx>) -> Option<&MemoryCell<'ctx>> {
        let key = canonical_key(address);
        self.cells.iter().find(|c| c.key == key)
    }

    /// Store `value` at `address`, replacing any existing cell with the same
    /// canonical address. The returned cell starts with empty writer and
    /// property sets; the caller fills in provenance.
    pub fn write(
        &mut self,
        address: SymbolicValue<'ctx>,
        value: SymbolicValue<'ctx>,
    ) -> &mut MemoryCell<'ctx> {
        let key = canonical_key(&address);
        let cell = MemoryCell {
            address,
            key,
            value,
            writers: BTreeSet::new(),
            io_properties: BTreeSet::new(),
        };
        let slot = match self.cells.iter().position(|c| c.key == cell.key) {
            Some(i) => {
                self.cells[i] = cell;
                i
            }
            None => {
                self.cells.push(cell);
                self.cells.len() - 1
            }
        };
        &mut self.cells[slot]
    }

    /// Read `nbits` from `address`. An untouched address yields a fresh
    /// incomplete value and creates no cell. A hit narrower than the stored
    /// value extracts its low bits; a hit wider than the stored value cannot
    /// see the missing neighboring bytes and degrades to a fresh incomplete
    /// value.
    pub fn read(
        &self,
        address: &SymbolicValue<'ctx>,
        nbits: u32,
        ops: &dyn SemanticOps<'ctx>,
    ) -> Result<SymbolicValue<'ctx>, ConfluenceError> {
        if nbits == 0 {
            return Err(ConfluenceError::ZeroSizedAccess);
        }
        let Some(cell) = self.find_cell(address) else {
            return Ok(SymbolicValue::fresh_incomplete(ops.z3(), nbits));
        };
        match cell.value.nbits().cmp(&nbits) {
            Ordering::Equal => Ok(cell.value.clone()),
            Ordering::Greater => Ok(cell.value.extract_bits(0, nbits as u16)),
            Ordering::Less => {
                debug!(
                    "read of {nbits} bits at {} overruns its {}-bit cell",
                    cell.address,
                    cell.value.nbits()
                );
                Ok(SymbolicValue::fresh_incomplete(ops.z3(), nbits))
            }
        }
    }

    /// Memory convergence test: every cell must find its counterpart by
    /// canonical address in the other state and agree with it under the
    /// three-valued rule, in both directions. The one tolerated asymmetry is a
    /// cell whose *address* is incomplete: speculative storage like that may
    /// legitimately be absent from the other state.
    pub fn equals(&self, other: &Self) -> bool {
        self.half_equals(other) && other.half_equals(self)
    }

    fn half_equals(&self, other: &Self) -> bool {
        for cell in &self.cells {
            match other.cells.iter().find(|c| c.key == cell.key) {
                Some(ocell) => {
                    if !cell.value.agrees_with(&ocell.value) {
                        debug!("memory at {} diverged: {} vs {}", cell.address, cell.value, ocell.value);
                        return false;
                    }
                }
                None => {
                    if !cell.address.is_incomplete() {
                        debug!("cell at {} exists on only one side", cell.address);
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Merge the memory arriving from another control-flow path into this state.
    ///
    /// Cells present in both states combine value-wise through the merger and
    /// union their writers and properties. Cells present on one side only are
    /// the subtle case: they existed on one path and not the other, so their
    /// values are weakened toward incompleteness (or deliberately not tracked,
    /// if the merger declines) rather than kept or dropped outright.
    #[instrument(skip_all)]
    pub fn merge(
        &mut self,
        other: &Self,
        merger: &Merger<'ctx>,
        addr_ops: &dyn SemanticOps<'ctx>,
        val_ops: &dyn SemanticOps<'ctx>,
    ) -> MergeOutcome {
        self.ensure_compatible(other, addr_ops);
        let mut outcome = MergeOutcome::Unchanged;
        let mut processed: Vec<BV<'ctx>> = Vec::new();
        for ocell in &other.cells {
            processed.push(ocell.key.clone());
            match self.cells.iter().position(|c| c.key == ocell.key) {
                Some(i) => {
                    let cell = &self.cells[i];
                    let merged = cell.value.merge_with(Some(&ocell.value), merger, val_ops);
                    let writers_grew = !ocell.writers.is_subset(&cell.writers);
                    let properties_grew = !ocell.io_properties.is_subset(&cell.io_properties);
                    if merged.is_some() || writers_grew || properties_grew {
                        let cell = &mut self.cells[i];
                        if let Some(value) = merged {
                            cell.value = value;
                        }
                        cell.writers.extend(ocell.writers.iter().copied());
                        cell.io_properties.extend(ocell.io_properties.iter().copied());
                        outcome += MergeOutcome::Changed;
                    }
                }
                None => {
                    if let Some(weakened) = ocell.value.merge_with(None, merger, val_ops) {
                        let cell = self.write(ocell.address.clone(), weakened);
                        cell.writers = ocell.writers.clone();
                        cell.io_properties = ocell.io_properties.clone();
                        outcome += MergeOutcome::Changed;
                    }
                }
            }
        }
        for cell in self.cells.iter_mut() {
            if processed.contains(&cell.key) {
                continue;
            }
            if let Some(weakened) = cell.value.merge_with(None, merger, val_ops) {
                cell.value = weakened;
                outcome += MergeOutcome::Changed;
            }
        }
        outcome
    }

    fn ensure_compatible(&self, other: &Self, ops: &dyn SemanticOps<'ctx>) {
        if !std::ptr::eq(self.z3, other.z3) || !std::ptr::eq(self.z3, ops.z3()) {
            panic!(
                "contract violation: cannot merge memory states from different expression contexts"
            );
        }
    }
}

/// The canonical map key for an address term.
fn canonical_key<'ctx>(address: &SymbolicValue<'ctx>) -> BV<'ctx> {
    address.expression().simplify()
}
