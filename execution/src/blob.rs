use bytes::Bytes;

use quarry_castore::{Digest, HashFunction};

/// A blob held in memory together with its digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub digest: Digest,
    pub data: Bytes,
    pub is_executable: bool,
}

impl Blob {
    /// A regular or executable file blob; the digest is computed from the
    /// content.
    pub fn new(hash: HashFunction, data: Bytes, is_executable: bool) -> Self {
        let digest = hash.compute_blob_digest(&data);
        Self {
            digest,
            data,
            is_executable,
        }
    }

    /// A tree blob (a serialized Git tree or `Directory` message).
    pub fn tree(hash: HashFunction, data: Bytes) -> Self {
        let digest = hash.compute_tree_digest(&data);
        Self {
            digest,
            data,
            is_executable: false,
        }
    }
}
