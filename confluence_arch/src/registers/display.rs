use crate::registers::RegisterDescriptor;
use std::fmt::{Display, Formatter};

/// A resolved, printable form of a [`RegisterDescriptor`].
///
/// Registers the dictionary knows by name display as that name (`rax`, `df`);
/// anything else falls back to `major.minor[offset]:nbits`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RegisterDisplay {
    Named(String),
    Raw(RegisterDescriptor),
}

impl Display for RegisterDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterDisplay::Named(name) => write!(f, "{name}"),
            RegisterDisplay::Raw(d) => {
                write!(f, "{}.{}[{}]:{}", d.major, d.minor, d.offset, d.nbits)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::dictionary::RegisterDictionary;
    use crate::registers::RegisterDescriptor;

    #[test]
    fn named_register_displays_by_name() {
        let dict = RegisterDictionary::amd64();
        let rax = dict.register("rax").unwrap();
        assert_eq!(format!("{}", rax.display(&dict)), "rax");
    }

    #[test]
    fn unnamed_register_displays_raw() {
        let dict = RegisterDictionary::amd64();
        let odd = RegisterDescriptor::new(0, 0, 3, 5);
        assert_eq!(format!("{}", odd.display(&dict)), "0.0[3]:5");
    }
}
