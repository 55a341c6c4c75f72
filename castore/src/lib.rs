//! Content-addressed storage core: digest identity, the on-disk CAS, and
//! the garbage-collection lock shared by every request.

mod digests;
mod errors;

pub mod cas;
pub mod fixtures;
pub mod gc;
pub mod path;

pub use cas::LocalCas;
pub use digests::{
    is_tree_hash, unprefix, Digest, HashFunction, ObjectInfo, ObjectKind, SHA1_LEN, SHA256_LEN,
};
pub use errors::Error;
pub use gc::{GarbageCollector, GcLock};
pub use path::path_is_non_upwards;
