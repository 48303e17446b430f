use crate::error::ArchError;
use crate::registers::RegisterDescriptor;
use std::collections::BTreeMap;

/// Register class for general-purpose registers
const CLASS_GENERAL: u16 = 0;
/// Register class for the instruction pointer
const CLASS_IP: u16 = 1;
/// Register class for the flags register and its individual bits
const CLASS_FLAGS: u16 = 2;

const GP64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const GP32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const GP16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const GP8_LOW: [&str; 8] = ["al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil"];
const GP8_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];

/// Status/control bits within the flags register, as (name, bit offset)
const FLAG_BITS: [(&str, u16); 9] = [
    ("cf", 0),
    ("pf", 2),
    ("af", 4),
    ("zf", 6),
    ("sf", 7),
    ("tf", 8),
    ("if", 9),
    ("df", 10),
    ("of", 11),
];

/// A [`RegisterDictionary`] is the per-architecture table an analysis resolves register
/// names and aliases against: name → descriptor, register family → base width, plus the
/// two registers the comparison machinery treats specially (the instruction pointer,
/// which diffs ignore, and the direction flag, which chunking pins to a constant).
///
/// Dictionaries are immutable once built. States hold them behind an interned handle,
/// so compatibility between two states is a pointer comparison.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RegisterDictionary {
    architecture: String,
    word_nbits: u16,
    names: BTreeMap<String, RegisterDescriptor>,
    families: BTreeMap<(u16, u16), u16>,
    instruction_pointer: RegisterDescriptor,
    direction_flag: Option<RegisterDescriptor>,
}

impl RegisterDictionary {
    fn with_instruction_pointer(
        architecture: &str,
        word_nbits: u16,
        instruction_pointer: RegisterDescriptor,
    ) -> Self {
        let mut dict = Self {
            architecture: architecture.to_string(),
            word_nbits,
            names: BTreeMap::new(),
            families: BTreeMap::new(),
            instruction_pointer,
            direction_flag: None,
        };
        dict.family(
            instruction_pointer.major,
            instruction_pointer.minor,
            instruction_pointer.nbits,
        );
        dict
    }

    fn family(&mut self, major: u16, minor: u16, nbits: u16) {
        self.families.insert((major, minor), nbits);
    }

    fn insert(&mut self, name: &str, major: u16, minor: u16, offset: u16, nbits: u16) {
        self.names
            .insert(name.to_string(), RegisterDescriptor::new(major, minor, offset, nbits));
    }

    fn insert_flag_bits(&mut self) {
        for (name, offset) in FLAG_BITS {
            self.insert(name, CLASS_FLAGS, 0, offset, 1);
        }
        self.direction_flag = self.names.get("df").copied();
    }

    /// The 64-bit x86 dictionary.
    pub fn amd64() -> Self {
        let ip = RegisterDescriptor::new(CLASS_IP, 0, 0, 64);
        let mut dict = Self::with_instruction_pointer("amd64", 64, ip);
        dict.insert("rip", CLASS_IP, 0, 0, 64);
        for (minor, name) in GP64.iter().enumerate() {
            dict.family(CLASS_GENERAL, minor as u16, 64);
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 64);
        }
        for (minor, name) in GP32.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 32);
        }
        for minor in 8u16..16 {
            dict.insert(&format!("r{minor}d"), CLASS_GENERAL, minor, 0, 32);
        }
        for (minor, name) in GP16.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 16);
        }
        for (minor, name) in GP8_LOW.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 8);
        }
        for (minor, name) in GP8_HIGH.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 8, 8);
        }
        dict.family(CLASS_FLAGS, 0, 64);
        dict.insert("rflags", CLASS_FLAGS, 0, 0, 64);
        dict.insert("eflags", CLASS_FLAGS, 0, 0, 32);
        dict.insert_flag_bits();
        dict
    }

    /// The 32-bit x86 dictionary.
    pub fn i386() -> Self {
        let ip = RegisterDescriptor::new(CLASS_IP, 0, 0, 32);
        let mut dict = Self::with_instruction_pointer("i386", 32, ip);
        dict.insert("eip", CLASS_IP, 0, 0, 32);
        for (minor, name) in GP32.iter().enumerate() {
            dict.family(CLASS_GENERAL, minor as u16, 32);
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 32);
        }
        for (minor, name) in GP16.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 16);
        }
        for (minor, name) in GP8_LOW.iter().take(4).enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 0, 8);
        }
        for (minor, name) in GP8_HIGH.iter().enumerate() {
            dict.insert(name, CLASS_GENERAL, minor as u16, 8, 8);
        }
        dict.family(CLASS_FLAGS, 0, 32);
        dict.insert("eflags", CLASS_FLAGS, 0, 0, 32);
        dict.insert_flag_bits();
        dict
    }

    /// Look a dictionary up by architecture name.
    pub fn by_name(name: &str) -> Result<Self, ArchError> {
        match name {
            "amd64" | "x86_64" => Ok(Self::amd64()),
            "i386" | "x86" => Ok(Self::i386()),
            other => Err(ArchError::UnknownArchitecture(other.to_string())),
        }
    }

    /// Resolve a register name to its descriptor.
    pub fn register(&self, name: &str) -> Result<RegisterDescriptor, ArchError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| ArchError::UnknownRegisterName {
                architecture: self.architecture.clone(),
                name: name.to_string(),
            })
    }

    /// The architecture-defined name for a descriptor, when it has one.
    pub fn name_of(&self, descriptor: &RegisterDescriptor) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, d)| *d == descriptor)
            .map(|(name, _)| name.as_str())
    }

    /// Resolve a descriptor to the base register of its family: the widest register
    /// containing it, at offset zero. This is the aliasing step that sends `eax`,
    /// `ax`, `al`, and `ah` all to `rax`'s storage.
    pub fn base_of(&self, descriptor: &RegisterDescriptor) -> Result<RegisterDescriptor, ArchError> {
        let base_nbits = *self
            .families
            .get(&(descriptor.major, descriptor.minor))
            .ok_or(ArchError::UnknownRegisterFamily {
                major: descriptor.major,
                minor: descriptor.minor,
            })?;
        if descriptor.offset as u32 + descriptor.nbits as u32 > base_nbits as u32 {
            return Err(ArchError::DescriptorOutOfRange {
                offset: descriptor.offset,
                nbits: descriptor.nbits,
                base_nbits,
            });
        }
        Ok(RegisterDescriptor::new(
            descriptor.major,
            descriptor.minor,
            0,
            base_nbits,
        ))
    }

    pub fn instruction_pointer(&self) -> RegisterDescriptor {
        self.instruction_pointer
    }

    pub fn direction_flag(&self) -> Option<RegisterDescriptor> {
        self.direction_flag
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// The natural pointer width of the architecture, in bits.
    pub fn word_nbits(&self) -> u16 {
        self.word_nbits
    }

    /// All named registers, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterDescriptor)> {
        self.names.iter().map(|(name, d)| (name.as_str(), d))
    }
}
