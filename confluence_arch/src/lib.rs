pub(crate) mod dictionary;
pub(crate) mod error;
pub(crate) mod registers;

pub use dictionary::RegisterDictionary;
pub use error::ArchError;
pub use registers::{RegisterDescriptor, RegisterDisplay};
