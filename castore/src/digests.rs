use data_encoding::HEXLOWER;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

use quarry_reapi::remexec;

/// Raw length of a SHA-1 hash.
pub const SHA1_LEN: usize = 20;
/// Raw length of a SHA-256 hash.
pub const SHA256_LEN: usize = 32;

/// Marker byte prepended to the raw hash of a tree digest in native mode,
/// before hex encoding. It keeps tree digests distinguishable from blob
/// digests that share the same Git object identity.
const TREE_MARKER: u8 = 0x74;

/// The two hex characters the marker byte encodes to.
const TREE_MARKER_HEX: &str = "74";

/// Strips the native-mode tree marker from a hex hash, if present.
///
/// Applied at all log and wire boundaries consumed by plain Remote
/// Execution clients. Hashes without a marker pass through unchanged.
pub fn unprefix(hash: &str) -> &str {
    if (hash.len() == 2 * (SHA1_LEN + 1) || hash.len() == 2 * (SHA256_LEN + 1))
        && hash.starts_with(TREE_MARKER_HEX)
    {
        &hash[TREE_MARKER_HEX.len()..]
    } else {
        hash
    }
}

/// Returns true if the hex hash carries the native-mode tree marker.
pub fn is_tree_hash(hash: &str) -> bool {
    hash.len() != unprefix(hash).len()
}

/// The digest of a stored object: its (possibly marker-prefixed) hex hash,
/// its size in bytes, and whether it names a tree.
///
/// Two digests are equal iff all three fields are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub hash: String,
    pub size: i64,
    pub is_tree: bool,
}

impl Digest {
    pub fn new(hash: String, size: i64, is_tree: bool) -> Self {
        Self {
            hash,
            size,
            is_tree,
        }
    }

    /// The hex hash with any native-mode tree marker stripped.
    pub fn unprefixed_hash(&self) -> &str {
        unprefix(&self.hash)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&Digest> for remexec::Digest {
    fn from(value: &Digest) -> Self {
        remexec::Digest {
            hash: value.hash.clone(),
            size_bytes: value.size,
        }
    }
}

impl From<&remexec::Digest> for Digest {
    // Tree-ness is recovered from the native-mode marker; compatible-mode
    // digests are indistinguishable on the wire and default to blob.
    fn from(value: &remexec::Digest) -> Self {
        Digest {
            hash: value.hash.clone(),
            size: value.size_bytes,
            is_tree: is_tree_hash(&value.hash),
        }
    }
}

/// The type of a stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    File,
    Executable,
    Tree,
    Symlink,
}

impl ObjectKind {
    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectKind::Tree)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, ObjectKind::Symlink)
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, ObjectKind::Executable)
    }
}

/// A digest together with the type of the object it names. Symlinks carry
/// their target string as blob content, so a symlink's digest is the hash
/// of its target path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub digest: Digest,
    pub kind: ObjectKind,
}

impl std::fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}:{:?}]",
            self.digest.unprefixed_hash(),
            self.digest.size,
            self.kind
        )
    }
}

/// The hash function of one server instance. An instance runs in exactly
/// one mode for its entire lifetime.
///
/// Native mode hashes the Git object encoding (SHA-1 over a `blob`/`tree`
/// header plus content), so blob digests coincide with Git blob ids and
/// tree digests with Git tree ids. Compatible mode hashes plain content
/// with SHA-256, the Remote Execution API default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashFunction {
    Native,
    Compatible,
}

impl HashFunction {
    pub fn is_compatible(&self) -> bool {
        matches!(self, HashFunction::Compatible)
    }

    /// Digest of a blob (file, executable, or symlink target).
    pub fn compute_blob_digest(&self, data: &[u8]) -> Digest {
        match self {
            HashFunction::Native => Digest {
                hash: HEXLOWER.encode(&git_object_hash(b"blob", data)),
                size: data.len() as i64,
                is_tree: false,
            },
            HashFunction::Compatible => Digest {
                hash: HEXLOWER.encode(&Sha256::digest(data)),
                size: data.len() as i64,
                is_tree: false,
            },
        }
    }

    /// Digest of a tree object. In native mode the hash carries the tree
    /// marker; in compatible mode trees are plain blobs.
    pub fn compute_tree_digest(&self, data: &[u8]) -> Digest {
        match self {
            HashFunction::Native => {
                let raw = git_object_hash(b"tree", data);
                let mut prefixed = Vec::with_capacity(raw.len() + 1);
                prefixed.push(TREE_MARKER);
                prefixed.extend_from_slice(&raw);
                Digest {
                    hash: HEXLOWER.encode(&prefixed),
                    size: data.len() as i64,
                    is_tree: true,
                }
            }
            HashFunction::Compatible => Digest {
                hash: HEXLOWER.encode(&Sha256::digest(data)),
                size: data.len() as i64,
                is_tree: true,
            },
        }
    }
}

/// SHA-1 over the Git loose object encoding: `"<kind> <len>\0"` + content.
fn git_object_hash(kind: &[u8], data: &[u8]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(kind);
    hasher.update(b" ");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_blob_digest_matches_git() {
        // `printf 'hi\n' | git hash-object --stdin`
        let d = HashFunction::Native.compute_blob_digest(b"hi\n");
        assert_eq!(d.hash, "45b983be36b73c0788dc9cbcb76cbb80fc7bb057");
        assert_eq!(d.size, 3);
        assert!(!d.is_tree);
    }

    #[test]
    fn native_tree_digest_is_marked() {
        // The empty Git tree has a well-known id.
        let d = HashFunction::Native.compute_tree_digest(b"");
        assert_eq!(
            d.hash,
            format!(
                "{}{}",
                TREE_MARKER_HEX, "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
            )
        );
        assert_eq!(
            d.unprefixed_hash(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
        assert!(d.is_tree);
    }

    #[test]
    fn compatible_digest_is_plain_sha256() {
        let d = HashFunction::Compatible.compute_blob_digest(b"hello");
        assert_eq!(
            d.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        // no marker in compatible mode, even for trees
        let t = HashFunction::Compatible.compute_tree_digest(b"hello");
        assert_eq!(t.hash, d.hash);
        assert_eq!(unprefix(&t.hash), t.hash);
    }

    #[test]
    fn digest_equality_is_all_three_fields() {
        let blob = HashFunction::Compatible.compute_blob_digest(b"x");
        let tree = HashFunction::Compatible.compute_tree_digest(b"x");
        assert_eq!(blob.hash, tree.hash);
        assert_ne!(blob, tree);
    }

    #[test]
    fn unprefix_passes_plain_hashes_through() {
        let hash = "45b983be36b73c0788dc9cbcb76cbb80fc7bb057";
        assert_eq!(unprefix(hash), hash);
        assert!(!is_tree_hash(hash));
    }

    #[test]
    fn proto_round_trip_keeps_tree_marker() {
        let d = HashFunction::Native.compute_tree_digest(b"");
        let proto: remexec::Digest = (&d).into();
        let back: Digest = (&proto).into();
        assert_eq!(d, back);
    }
}
