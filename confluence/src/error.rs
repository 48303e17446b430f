use confluence_arch::ArchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfluenceError {
    #[error("Error resolving a machine register")]
    Arch(#[from] ArchError),
    #[error("Attempted to write a {value_nbits}-bit value into a {register_nbits}-bit register")]
    MismatchedRegisterWrite {
        register_nbits: u16,
        value_nbits: u32,
    },
    #[error("Attempted a memory access of zero bits")]
    ZeroSizedAccess,
}
