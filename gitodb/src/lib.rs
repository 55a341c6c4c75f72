//! A Git-compatible object database: loose-object storage, in-memory
//! ("fake") databases for scratch tree work, and the repository operations
//! the build tool relies on (tree synthesis, snapshot commits, keep tags,
//! and local fetches).

pub mod objects;
pub mod odb;
pub mod refs;
pub mod repo;

pub use objects::{GitId, GitObjectType, TreeEntries, TreeEntry};
pub use odb::{GitOdb, InMemoryBackend, LooseBackend, ObjectHeader, OdbBackend, WriteThroughBackend};
pub use repo::{GitRepo, LookupError, SymlinksCheckFunc, GIT_LOCK_NUM_TRIES, GIT_LOCK_WAIT};
