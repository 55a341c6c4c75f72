//! The in-memory directory tree uploaded as an action input root, and its
//! native-mode mirror of precomputed Git tree blobs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bytes::Bytes;

use quarry_castore::{Error, HashFunction, ObjectKind};
use quarry_gitodb::{objects, GitId, TreeEntries, TreeEntry};

use crate::blob::Blob;

/// One entry of a [`DirectoryTree`]. Leaves carry their content inline.
#[derive(Clone, Debug)]
pub enum DirectoryEntry {
    File { data: Bytes, executable: bool },
    Symlink { target: String },
    Dir(DirectoryTree),
}

/// A directory about to be uploaded, ordered by entry name.
#[derive(Clone, Debug, Default)]
pub struct DirectoryTree {
    pub entries: BTreeMap<String, DirectoryEntry>,
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, entry: DirectoryEntry) {
        self.entries.insert(name.into(), entry);
    }

    /// Reads a directory tree from disk.
    pub fn from_path(root: &Path) -> Result<Self, Error> {
        let mut tree = DirectoryTree::new();
        for dir_entry in fs::read_dir(root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let file_type = dir_entry.file_type()?;

            let entry = if file_type.is_symlink() {
                DirectoryEntry::Symlink {
                    target: fs::read_link(dir_entry.path())?
                        .to_string_lossy()
                        .into_owned(),
                }
            } else if file_type.is_dir() {
                DirectoryEntry::Dir(DirectoryTree::from_path(&dir_entry.path())?)
            } else {
                let executable = {
                    use std::os::unix::fs::PermissionsExt;
                    dir_entry.metadata()?.permissions().mode() & 0o111 != 0
                };
                DirectoryEntry::File {
                    data: fs::read(dir_entry.path())?.into(),
                    executable,
                }
            };
            tree.add(name, entry);
        }
        Ok(tree)
    }
}

/// The native-mode mirror of a [`DirectoryTree`]: every node carries its
/// serialized blob and precomputed digest. Inner nodes are Git tree
/// objects, leaves are file or symlink-target blobs.
pub struct BlobTree {
    blob: Blob,
    entries: Vec<BlobTree>,
}

impl BlobTree {
    /// Builds the blob mirror bottom-up. Only meaningful in native mode,
    /// where tree digests are Git tree ids.
    pub fn from_directory_tree(tree: &DirectoryTree, hash: HashFunction) -> Option<BlobTree> {
        let mut children = Vec::with_capacity(tree.entries.len());
        let mut git_entries = TreeEntries::new();

        for (name, entry) in &tree.entries {
            let (node, kind) = match entry {
                DirectoryEntry::File { data, executable } => (
                    BlobTree {
                        blob: Blob::new(hash, data.clone(), *executable),
                        entries: Vec::new(),
                    },
                    if *executable {
                        ObjectKind::Executable
                    } else {
                        ObjectKind::File
                    },
                ),
                DirectoryEntry::Symlink { target } => (
                    BlobTree {
                        blob: Blob::new(hash, Bytes::from(target.clone().into_bytes()), false),
                        entries: Vec::new(),
                    },
                    ObjectKind::Symlink,
                ),
                DirectoryEntry::Dir(subtree) => (
                    BlobTree::from_directory_tree(subtree, hash)?,
                    ObjectKind::Tree,
                ),
            };

            let raw_id = GitId::from_hex(node.blob.digest.unprefixed_hash()).ok()?;
            git_entries.entry(raw_id).or_default().push(TreeEntry {
                name: name.clone(),
                kind,
            });
            children.push(node);
        }

        let data = objects::encode_tree(&git_entries).ok()?;
        Some(BlobTree {
            blob: Blob::tree(hash, data.into()),
            entries: children,
        })
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn is_tree(&self) -> bool {
        self.blob.digest.is_tree
    }

    pub fn entries(&self) -> &[BlobTree] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_file_tree() -> DirectoryTree {
        let mut tree = DirectoryTree::new();
        tree.add(
            "a",
            DirectoryEntry::File {
                data: Bytes::from_static(b"hi\n"),
                executable: false,
            },
        );
        tree.add(
            "b",
            DirectoryEntry::File {
                data: Bytes::from_static(b"bye\n"),
                executable: false,
            },
        );
        tree
    }

    #[test]
    fn blob_tree_root_is_a_git_tree() {
        let blob_tree =
            BlobTree::from_directory_tree(&two_file_tree(), HashFunction::Native).unwrap();
        assert!(blob_tree.is_tree());
        assert_eq!(blob_tree.entries().len(), 2);

        // the root digest is the Git id of the serialized tree
        let raw = GitId::from_hex(blob_tree.blob().digest.unprefixed_hash()).unwrap();
        assert_eq!(
            objects::hash_object(quarry_gitodb::GitObjectType::Tree, &blob_tree.blob().data),
            raw
        );
    }

    #[test]
    fn symlink_leaf_digest_is_the_target_hash() {
        let mut tree = DirectoryTree::new();
        tree.add(
            "l",
            DirectoryEntry::Symlink {
                target: "inside/file".into(),
            },
        );
        let blob_tree = BlobTree::from_directory_tree(&tree, HashFunction::Native).unwrap();

        let leaf = &blob_tree.entries()[0];
        assert_eq!(
            leaf.blob().digest,
            HashFunction::Native.compute_blob_digest(b"inside/file")
        );
    }

    #[test]
    fn identical_subtrees_share_ids() {
        let mut tree = DirectoryTree::new();
        tree.add("one", DirectoryEntry::Dir(two_file_tree()));
        tree.add("two", DirectoryEntry::Dir(two_file_tree()));

        let blob_tree = BlobTree::from_directory_tree(&tree, HashFunction::Native).unwrap();
        assert_eq!(
            blob_tree.entries()[0].blob().digest,
            blob_tree.entries()[1].blob().digest
        );
    }
}
