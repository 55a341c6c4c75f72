use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::digests::{Digest, HashFunction};
use crate::errors::Error;

/// On-disk content-addressed store.
///
/// One storage root holds blobs, executable blobs and tree objects in
/// separate subdirectories, the action cache, and a scratch directory for
/// temp files. Object files are named by their hex digest, sharded by the
/// first two characters. All writes go through a temp file on the same
/// filesystem followed by an atomic rename, so partial writes are never
/// observable and concurrent writers of identical content are idempotent.
pub struct LocalCas {
    root: PathBuf,
    hash: HashFunction,
}

impl LocalCas {
    /// Opens (and lays out) the store under the given root.
    pub fn open(root: impl Into<PathBuf>, hash: HashFunction) -> Result<Self, Error> {
        let cas = Self {
            root: root.into(),
            hash,
        };
        for dir in [
            cas.blobs_root(false),
            cas.blobs_root(true),
            cas.trees_root(),
            cas.action_cache_root(),
            cas.tmp_root(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(cas)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    fn blobs_root(&self, is_executable: bool) -> PathBuf {
        if is_executable {
            self.root.join("execs")
        } else {
            self.root.join("blobs")
        }
    }

    // In compatibility mode trees are plain blobs and share the blob
    // directory.
    fn trees_root(&self) -> PathBuf {
        if self.hash.is_compatible() {
            self.blobs_root(false)
        } else {
            self.root.join("trees")
        }
    }

    fn action_cache_root(&self) -> PathBuf {
        self.root.join("ac")
    }

    fn tmp_root(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn object_path(dir: PathBuf, hex: &str) -> PathBuf {
        // Shard by the leading two hex characters to keep directories small.
        dir.join(&hex[..2.min(hex.len())]).join(&hex[2.min(hex.len())..])
    }

    /// Stores a blob, returning its digest. Re-storing identical content is
    /// a no-op success.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub fn store_blob(&self, data: &[u8], is_executable: bool) -> Result<Digest, Error> {
        let digest = self.hash.compute_blob_digest(data);
        let dest = Self::object_path(self.blobs_root(is_executable), digest.unprefixed_hash());
        self.atomic_write(&dest, data, is_executable)?;
        Ok(digest)
    }

    /// Stores a tree object, returning its digest. In compatibility mode
    /// this lands in the blob directory.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub fn store_tree(&self, data: &[u8]) -> Result<Digest, Error> {
        let digest = self.hash.compute_tree_digest(data);
        let dest = Self::object_path(self.trees_root(), digest.unprefixed_hash());
        self.atomic_write(&dest, data, false)?;
        Ok(digest)
    }

    /// Returns a readable path for a stored blob, or `None` if absent.
    ///
    /// The path stays readable for the lifetime of the current shared
    /// garbage-collection lock.
    pub fn blob_path(&self, digest: &Digest, is_executable: bool) -> Option<PathBuf> {
        let path = Self::object_path(
            self.blobs_root(is_executable),
            digest.unprefixed_hash(),
        );
        path.is_file().then_some(path)
    }

    /// Returns a readable path for a stored tree object. Only meaningful in
    /// native mode; compatibility-mode trees live with the blobs.
    pub fn tree_path(&self, digest: &Digest) -> Option<PathBuf> {
        if self.hash.is_compatible() {
            debug!("tree path requested in compatibility mode");
            return None;
        }
        let path = Self::object_path(self.trees_root(), digest.unprefixed_hash());
        path.is_file().then_some(path)
    }

    /// Stores a serialized action result keyed by its action digest.
    /// Entries are mutable overwrites.
    pub fn store_action_result(&self, action: &Digest, data: &[u8]) -> Result<(), Error> {
        let dest = Self::object_path(self.action_cache_root(), action.unprefixed_hash());
        self.atomic_write_overwrite(&dest, data)
    }

    /// Reads back a serialized action result, or `None` if absent.
    pub fn read_action_result(&self, action: &Digest) -> Option<Vec<u8>> {
        let path = Self::object_path(self.action_cache_root(), action.unprefixed_hash());
        match fs::read(&path) {
            Ok(data) => Some(data),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "reading action cache entry failed");
                }
                None
            }
        }
    }

    fn atomic_write(&self, dest: &Path, data: &[u8], is_executable: bool) -> Result<(), Error> {
        if dest.is_file() {
            // Content-addressed: an existing file already has this content.
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_root().join(uuid::Uuid::new_v4().to_string());
        {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(data)?;
            let mode = if is_executable { 0o555 } else { 0o444 };
            file.set_permissions(fs::Permissions::from_mode(mode))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dest)?;

        // Make the rename itself durable.
        if let Some(parent) = dest.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    fn atomic_write_overwrite(&self, dest: &Path, data: &[u8]) -> Result<(), Error> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_root().join(uuid::Uuid::new_v4().to_string());
        {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cas(hash: HashFunction) -> (TempDir, LocalCas) {
        let dir = TempDir::new().unwrap();
        let cas = LocalCas::open(dir.path().join("storage"), hash).unwrap();
        (dir, cas)
    }

    #[test]
    fn stored_blob_digest_matches_content() {
        let (_dir, cas) = test_cas(HashFunction::Compatible);

        let digest = cas.store_blob(b"hello", false).unwrap();
        assert_eq!(digest, HashFunction::Compatible.compute_blob_digest(b"hello"));
        assert_eq!(digest.size, 5);

        let path = cas.blob_path(&digest, false).expect("blob must exist");
        assert_eq!(fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn store_is_idempotent() {
        let (_dir, cas) = test_cas(HashFunction::Native);

        let first = cas.store_blob(b"same content", false).unwrap();
        let second = cas.store_blob(b"same content", false).unwrap();
        assert_eq!(first, second);
        assert!(cas.blob_path(&first, false).is_some());
    }

    #[test]
    fn executables_are_stored_separately() {
        let (_dir, cas) = test_cas(HashFunction::Native);

        let digest = cas.store_blob(b"#!/bin/sh\n", true).unwrap();
        assert!(cas.blob_path(&digest, true).is_some());
        assert!(cas.blob_path(&digest, false).is_none());

        let path = cas.blob_path(&digest, true).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "executable bit must be set");
    }

    #[test]
    fn native_trees_have_their_own_directory() {
        let (_dir, cas) = test_cas(HashFunction::Native);

        let digest = cas.store_tree(b"").unwrap();
        assert!(cas.tree_path(&digest).is_some());
        assert!(cas.blob_path(&digest, false).is_none());
    }

    #[test]
    fn compatible_trees_alias_blobs() {
        let (_dir, cas) = test_cas(HashFunction::Compatible);

        let digest = cas.store_tree(b"some directory message").unwrap();
        assert!(cas.tree_path(&digest).is_none());
        assert!(cas.blob_path(&digest, false).is_some());
    }

    #[test]
    fn absent_digest_has_no_path() {
        let (_dir, cas) = test_cas(HashFunction::Compatible);
        let digest = HashFunction::Compatible.compute_blob_digest(b"never stored");
        assert!(cas.blob_path(&digest, false).is_none());
    }

    #[test]
    fn action_results_are_overwritable() {
        let (_dir, cas) = test_cas(HashFunction::Compatible);
        let action = HashFunction::Compatible.compute_blob_digest(b"action");

        assert!(cas.read_action_result(&action).is_none());
        cas.store_action_result(&action, b"first").unwrap();
        assert_eq!(cas.read_action_result(&action).unwrap(), b"first");
        cas.store_action_result(&action, b"second").unwrap();
        assert_eq!(cas.read_action_result(&action).unwrap(), b"second");
    }
}
