use thiserror::Error;

/// An error in resolving machine registers against a dictionary
#[derive(Debug, Error)]
pub enum ArchError {
    /// The user asked for a dictionary by a name we have no table for
    #[error("No register dictionary is defined for architecture \"{0}\"")]
    UnknownArchitecture(String),
    /// A register name lookup failed against the selected dictionary
    #[error("The {architecture} register dictionary defines no register named \"{name}\"")]
    UnknownRegisterName {
        architecture: String,
        name: String,
    },
    /// A descriptor referenced a register family the dictionary never declared
    #[error("Descriptor references an undeclared register family ({major}, {minor})")]
    UnknownRegisterFamily { major: u16, minor: u16 },
    /// A descriptor's bit range falls outside its family's base register
    #[error("Descriptor bit range [{offset}, {offset}+{nbits}) exceeds its {base_nbits}-bit base register")]
    DescriptorOutOfRange {
        offset: u16,
        nbits: u16,
        base_nbits: u16,
    },
}
