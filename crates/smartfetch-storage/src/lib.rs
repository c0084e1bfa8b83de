//! Object and reference storage for smartfetch.
//!
//! The fetch client only talks to storage through the [`ObjectStore`] and
//! [`RefStore`] traits. Two implementations ship with the crate: an in-memory
//! repository used by tests and embedders, and an on-disk repository that
//! reads and writes a regular git directory (loose objects, loose refs,
//! metadata files such as `shallow`).

mod error;
mod fs;
mod memory;
mod object;
mod traits;

pub use error::StorageError;
pub use fs::FsRepository;
pub use memory::MemoryRepository;
pub use object::{ObjectId, ObjectType, RawObject};
pub use traits::{ObjectStore, RefStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
