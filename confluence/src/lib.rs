pub mod chunks;
mod context;
mod error;
mod merge;
mod ops;
pub mod state;
mod value;

pub use confluence_arch as arch;

pub use context::ConfluenceContext;
pub use error::ConfluenceError;
pub use merge::{MergeOutcome, Merger};
pub use ops::{BasicOps, SemanticOps};
pub use value::SymbolicValue;
