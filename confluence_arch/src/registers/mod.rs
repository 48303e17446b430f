pub mod display;

pub use crate::registers::display::RegisterDisplay;

use crate::dictionary::RegisterDictionary;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A [`RegisterDescriptor`] identifies a machine register as a bit range within a
/// register *family*: the widest architectural register containing it. `eax`, `ax`,
/// `al`, and `ah` all share `rax`'s family on amd64 and differ only in `offset` and
/// `nbits`.
///
/// Descriptors are plain identity: two descriptors are equal when they describe the
/// same storage, independent of whatever value an analysis currently maps them to.
/// They are the key type for register states and register diff sets.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// The register class (general purpose, instruction pointer, flags, ...)
    pub major: u16,
    /// The family index within the class
    pub minor: u16,
    /// The first bit of this register within its family's base register
    pub offset: u16,
    /// The width of this register in bits
    pub nbits: u16,
}

impl RegisterDescriptor {
    pub fn new(major: u16, minor: u16, offset: u16, nbits: u16) -> Self {
        Self {
            major,
            minor,
            offset,
            nbits,
        }
    }

    /// Whether two descriptors name storage inside the same base register.
    pub fn same_family(&self, other: &RegisterDescriptor) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    /// Whether this descriptor's bit range fully contains `other`'s.
    pub fn covers(&self, other: &RegisterDescriptor) -> bool {
        if !self.same_family(other) {
            return false;
        }
        let self_range: Range<u16> = self.into();
        let other_range: Range<u16> = other.into();
        self_range.start <= other_range.start && self_range.end >= other_range.end
    }

    /// Resolve this descriptor to something printable, using `dictionary` for the
    /// architecture-defined name when one exists.
    pub fn display(&self, dictionary: &RegisterDictionary) -> RegisterDisplay {
        match dictionary.name_of(self) {
            Some(name) => RegisterDisplay::Named(name.to_string()),
            None => RegisterDisplay::Raw(*self),
        }
    }
}

impl From<&RegisterDescriptor> for Range<u16> {
    fn from(value: &RegisterDescriptor) -> Self {
        Range {
            start: value.offset,
            end: value.offset + value.nbits,
        }
    }
}
