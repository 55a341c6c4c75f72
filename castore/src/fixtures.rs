//! Shared test fixtures.

use lazy_static::lazy_static;

use crate::digests::{Digest, HashFunction};

pub const HELLO_BLOB_CONTENTS: &[u8] = b"hi\n";
pub const BYE_BLOB_CONTENTS: &[u8] = b"bye\n";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref HELLO_BLOB_DIGEST: Digest =
        HashFunction::Compatible.compute_blob_digest(HELLO_BLOB_CONTENTS);
    pub static ref BYE_BLOB_DIGEST: Digest =
        HashFunction::Compatible.compute_blob_digest(BYE_BLOB_CONTENTS);
    pub static ref EMPTY_BLOB_DIGEST: Digest =
        HashFunction::Compatible.compute_blob_digest(EMPTY_BLOB_CONTENTS);

    pub static ref HELLO_BLOB_DIGEST_NATIVE: Digest =
        HashFunction::Native.compute_blob_digest(HELLO_BLOB_CONTENTS);
    pub static ref EMPTY_TREE_DIGEST_NATIVE: Digest =
        HashFunction::Native.compute_tree_digest(b"");
}
