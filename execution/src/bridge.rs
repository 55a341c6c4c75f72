//! Conversions between the native Git tree representation and the flat
//! Remote Execution `Directory`/`Tree` representation.

use std::collections::HashMap;
use std::fs;

use bytes::Bytes;
use prost::Message;
use tracing::{debug, warn};

use quarry_castore::{Digest, Error, HashFunction, LocalCas};
use quarry_gitodb::{objects, TreeEntries};
use quarry_reapi::remexec;

use crate::blob::Blob;
use crate::tree::{DirectoryEntry, DirectoryTree};

/// Parses a serialized protobuf message, logging instead of panicking on
/// malformed input.
pub fn message_from_string<M: Message + Default>(data: &[u8]) -> Option<M> {
    match M::decode(data) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(%err, "failed to parse protobuf message");
            None
        }
    }
}

/// Serializes a `Directory` message in protobuf canonical form.
pub fn directory_to_bytes(dir: &remexec::Directory) -> Bytes {
    dir.encode_to_vec().into()
}

/// Serializes flat Git tree entries in the Git wire format.
pub fn git_tree_to_bytes(entries: &TreeEntries) -> Result<Bytes, Error> {
    objects::encode_tree(entries).map(Bytes::from)
}

/// Builds the `Directory` message graph for a build root bottom-up,
/// emitting every serialized `Directory` as a blob, and returns the root
/// directory digest.
///
/// Symlink digests resolve intrinsically because the tree carries its
/// targets inline.
pub fn directory_digest_from_tree<F>(
    tree: &DirectoryTree,
    hash: HashFunction,
    emit_blob: &mut F,
) -> Option<Digest>
where
    F: FnMut(Blob),
{
    let mut dir = remexec::Directory::default();

    // BTreeMap order keeps all three child lists name-sorted.
    for (name, entry) in &tree.entries {
        match entry {
            DirectoryEntry::File { data, executable } => {
                let digest = hash.compute_blob_digest(data);
                dir.files.push(remexec::FileNode {
                    name: name.clone(),
                    digest: Some((&digest).into()),
                    is_executable: *executable,
                });
            }
            DirectoryEntry::Symlink { target } => {
                dir.symlinks.push(remexec::SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                });
            }
            DirectoryEntry::Dir(subtree) => {
                let digest = directory_digest_from_tree(subtree, hash, emit_blob)?;
                dir.directories.push(remexec::DirectoryNode {
                    name: name.clone(),
                    digest: Some((&digest).into()),
                });
            }
        }
    }

    let data = directory_to_bytes(&dir);
    let digest = hash.compute_tree_digest(&data);
    emit_blob(Blob {
        digest: digest.clone(),
        data,
        is_executable: false,
    });
    Some(digest)
}

/// Checks the `Directory` wire invariants: each child list sorted by name,
/// no duplicate names across the three lists.
pub fn validate_directory(dir: &remexec::Directory) -> Result<(), Error> {
    fn check<'a>(
        seen: &mut std::collections::HashSet<&'a str>,
        names: Vec<&'a str>,
    ) -> Result<(), Error> {
        let mut previous = "";
        for name in names {
            if name < previous {
                return Err(Error::Parse(format!("{:?} is not sorted", name)));
            }
            previous = name;
            if !seen.insert(name) {
                return Err(Error::Parse(format!("{:?} is a duplicate name", name)));
            }
        }
        Ok(())
    }
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    check(
        &mut seen,
        dir.files.iter().map(|node| node.name.as_str()).collect(),
    )?;
    check(
        &mut seen,
        dir.directories
            .iter()
            .map(|node| node.name.as_str())
            .collect(),
    )?;
    check(
        &mut seen,
        dir.symlinks.iter().map(|node| node.name.as_str()).collect(),
    )?;
    Ok(())
}

fn directory_from_digest(
    digest: &remexec::Digest,
    cas: &LocalCas,
) -> Option<remexec::Directory> {
    let local: Digest = digest.into();
    let path = cas.blob_path(&local, /*is_executable=*/ false)?;
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) => {
            debug!(%err, hash = %local.unprefixed_hash(), "reading directory blob failed");
            return None;
        }
    };
    let dir = message_from_string::<remexec::Directory>(&content)?;
    if let Err(err) = validate_directory(&dir) {
        warn!(%err, hash = %local.unprefixed_hash(), "directory failed validation");
        return None;
    }
    Some(dir)
}

/// All `Directory` messages transitively reachable from `root` (excluding
/// `root` itself), deduplicated by digest and sorted by ascending hash.
pub(crate) fn collect_child_directories(
    root: &remexec::Directory,
    cas: &LocalCas,
) -> Option<Vec<remexec::Directory>> {
    let mut by_hash: HashMap<String, remexec::Directory> = HashMap::new();
    let mut queue: Vec<remexec::Digest> = root
        .directories
        .iter()
        .filter_map(|node| node.digest.clone())
        .collect();

    while let Some(digest) = queue.pop() {
        if by_hash.contains_key(&digest.hash) {
            continue;
        }
        let dir = directory_from_digest(&digest, cas)?;
        queue.extend(dir.directories.iter().filter_map(|node| node.digest.clone()));
        by_hash.insert(digest.hash.clone(), dir);
    }

    let mut hashes: Vec<String> = by_hash.keys().cloned().collect();
    hashes.sort();
    Some(
        hashes
            .into_iter()
            .filter_map(|hash| by_hash.remove(&hash))
            .collect(),
    )
}

/// Synthesizes the `Tree` message for a stored root `Directory`, stores
/// its serialization as a blob, and returns the blob's digest.
///
/// The children list is the full transitive closure reachable from the
/// root, duplicate-free and in ascending digest-hash order.
pub fn tree_digest_from_directory_digest(
    dir_digest: &remexec::Digest,
    cas: &LocalCas,
) -> Option<remexec::Digest> {
    let root = directory_from_digest(dir_digest, cas)?;
    let children = collect_child_directories(&root, cas)?;

    let tree = remexec::Tree {
        root: Some(root),
        children,
    };
    let content = tree.encode_to_vec();
    match cas.store_blob(&content, /*is_executable=*/ false) {
        Ok(digest) => Some((&digest).into()),
        Err(err) => {
            debug!(%err, "storing tree message failed");
            None
        }
    }
}
