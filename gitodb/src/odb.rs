//! Object database backends and the backend stack.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::warn;

use quarry_castore::Error;

use crate::objects::{
    decode_loose, encode_loose, hash_object, GitId, GitObjectType, TreeEntries,
};

/// Object type and size, answerable without materializing the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: GitObjectType,
    pub size: usize,
}

/// One storage backend of an object database.
///
/// The method set mirrors what a backend must answer for the repository
/// operations built on top: full reads, header-only reads, existence, and
/// writes. Backends are stacked; a read is served by the first backend
/// that knows the id.
pub trait OdbBackend: Send + Sync {
    fn read(&self, id: &GitId) -> Result<Option<(GitObjectType, Vec<u8>)>, Error>;
    fn read_header(&self, id: &GitId) -> Result<Option<ObjectHeader>, Error>;
    fn exists(&self, id: &GitId) -> bool;
    fn write(&self, kind: GitObjectType, id: &GitId, data: &[u8]) -> Result<(), Error>;
}

/// Loose objects under `<gitdir>/objects/xx/<rest>`.
pub struct LooseBackend {
    objects_dir: PathBuf,
}

impl LooseBackend {
    pub fn new(objects_dir: PathBuf) -> Self {
        Self { objects_dir }
    }

    fn object_file(&self, id: &GitId) -> PathBuf {
        let hex = id.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

impl OdbBackend for LooseBackend {
    fn read(&self, id: &GitId) -> Result<Option<(GitObjectType, Vec<u8>)>, Error> {
        let path = self.object_file(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (kind, payload) = decode_loose(&compressed)?;
        Ok(Some((kind, payload)))
    }

    fn read_header(&self, id: &GitId) -> Result<Option<ObjectHeader>, Error> {
        Ok(self.read(id)?.map(|(kind, payload)| ObjectHeader {
            kind,
            size: payload.len(),
        }))
    }

    fn exists(&self, id: &GitId) -> bool {
        self.object_file(id).is_file()
    }

    fn write(&self, kind: GitObjectType, id: &GitId, data: &[u8]) -> Result<(), Error> {
        static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

        let dest = self.object_file(id);
        if dest.is_file() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        fs::write(&tmp, encode_loose(kind, data)?)?;
        fs::rename(&tmp, &dest)?;
        Ok(())
    }
}

/// The "fake" backend: an in-memory store for tree objects, optionally
/// seeded with a tree-entries map whose ids answer header and existence
/// queries for objects that are referenced but not stored.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: Option<TreeEntries>,
    trees: RwLock<HashMap<GitId, Vec<u8>>>,
}

impl InMemoryBackend {
    /// A backend that pretends every id in `entries` exists, so trees
    /// referencing them can be created without their payloads.
    pub fn with_entries(entries: TreeEntries) -> Self {
        Self {
            entries: Some(entries),
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// A backend seeded with one solid tree object.
    pub fn with_tree(id: GitId, data: Vec<u8>) -> Self {
        Self {
            entries: None,
            trees: RwLock::new(HashMap::from([(id, data)])),
        }
    }

    /// Returns the serialized bytes of a tree written into this backend.
    pub fn tree_data(&self, id: &GitId) -> Option<Vec<u8>> {
        self.trees.read().ok()?.get(id).cloned()
    }
}

impl OdbBackend for InMemoryBackend {
    fn read(&self, id: &GitId) -> Result<Option<(GitObjectType, Vec<u8>)>, Error> {
        let trees = self
            .trees
            .read()
            .map_err(|_| Error::Fatal("in-memory backend lock poisoned".into()))?;
        Ok(trees
            .get(id)
            .map(|data| (GitObjectType::Tree, data.clone())))
    }

    fn read_header(&self, id: &GitId) -> Result<Option<ObjectHeader>, Error> {
        let trees = self
            .trees
            .read()
            .map_err(|_| Error::Fatal("in-memory backend lock poisoned".into()))?;
        if let Some(data) = trees.get(id) {
            return Ok(Some(ObjectHeader {
                kind: GitObjectType::Tree,
                size: data.len(),
            }));
        }
        if let Some(entries) = &self.entries {
            if let Some(nodes) = entries.get(id) {
                if let Some(first) = nodes.first() {
                    // Pretend the object is present; the size is not known.
                    return Ok(Some(ObjectHeader {
                        kind: if first.kind.is_tree() {
                            GitObjectType::Tree
                        } else {
                            GitObjectType::Blob
                        },
                        size: 0,
                    }));
                }
            }
        }
        Ok(None)
    }

    fn exists(&self, id: &GitId) -> bool {
        if let Some(entries) = &self.entries {
            if entries.contains_key(id) {
                return true;
            }
        }
        self.trees
            .read()
            .map(|trees| trees.contains_key(id))
            .unwrap_or(false)
    }

    fn write(&self, kind: GitObjectType, id: &GitId, data: &[u8]) -> Result<(), Error> {
        if kind != GitObjectType::Tree {
            return Err(Error::Unsupported(
                "in-memory backend stores only tree objects".into(),
            ));
        }
        let mut trees = self
            .trees
            .write()
            .map_err(|_| Error::Fatal("in-memory backend lock poisoned".into()))?;
        trees.entry(*id).or_insert_with(|| data.to_vec());
        Ok(())
    }
}

/// A backend that forwards existence checks and writes to another object
/// database. Installed with highest priority into a scratch repository, it
/// streams everything a fetch receives straight into the target.
pub struct WriteThroughBackend {
    target: Arc<GitOdb>,
}

impl WriteThroughBackend {
    pub fn new(target: Arc<GitOdb>) -> Self {
        Self { target }
    }
}

impl OdbBackend for WriteThroughBackend {
    fn read(&self, _id: &GitId) -> Result<Option<(GitObjectType, Vec<u8>)>, Error> {
        Ok(None)
    }

    fn read_header(&self, _id: &GitId) -> Result<Option<ObjectHeader>, Error> {
        Ok(None)
    }

    fn exists(&self, id: &GitId) -> bool {
        self.target.exists(id)
    }

    fn write(&self, kind: GitObjectType, id: &GitId, data: &[u8]) -> Result<(), Error> {
        self.target.write_checked(kind, id, data).map(|_| ())
    }
}

/// An ordered stack of backends behind one readers/writer lock.
///
/// Reads take the shared side, object writes and backend installation the
/// exclusive side. Fake (purely in-memory) databases carry the same lock
/// for uniform semantics.
pub struct GitOdb {
    backends: RwLock<Vec<Arc<dyn OdbBackend>>>,
}

impl GitOdb {
    pub fn new(backend: Arc<dyn OdbBackend>) -> Self {
        Self {
            backends: RwLock::new(vec![backend]),
        }
    }

    /// Installs an additional backend. With `high_priority` it is consulted
    /// before all existing ones.
    pub fn add_backend(&self, backend: Arc<dyn OdbBackend>, high_priority: bool) {
        let mut backends = match self.backends.write() {
            Ok(backends) => backends,
            Err(_) => {
                warn!("odb lock poisoned while adding backend");
                return;
            }
        };
        if high_priority {
            backends.insert(0, backend);
        } else {
            backends.push(backend);
        }
    }

    pub fn read_object(&self, id: &GitId) -> Result<Option<(GitObjectType, Vec<u8>)>, Error> {
        let backends = self
            .backends
            .read()
            .map_err(|_| Error::Fatal("odb lock poisoned".into()))?;
        for backend in backends.iter() {
            if let Some(found) = backend.read(id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn read_header(&self, id: &GitId) -> Result<Option<ObjectHeader>, Error> {
        let backends = self
            .backends
            .read()
            .map_err(|_| Error::Fatal("odb lock poisoned".into()))?;
        for backend in backends.iter() {
            if let Some(found) = backend.read_header(id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn exists(&self, id: &GitId) -> bool {
        match self.backends.read() {
            Ok(backends) => backends.iter().any(|backend| backend.exists(id)),
            Err(_) => false,
        }
    }

    /// Hashes and stores an object, returning its id. Already-present
    /// objects are a no-op success.
    pub fn write_object(&self, kind: GitObjectType, data: &[u8]) -> Result<GitId, Error> {
        let id = hash_object(kind, data);
        self.write_checked(kind, &id, data)
    }

    fn write_checked(&self, kind: GitObjectType, id: &GitId, data: &[u8]) -> Result<GitId, Error> {
        let backends = self
            .backends
            .write()
            .map_err(|_| Error::Fatal("odb lock poisoned".into()))?;
        if backends.iter().any(|backend| backend.exists(id)) {
            return Ok(*id);
        }
        let mut last_err = Error::Fatal("object database has no backends".into());
        for backend in backends.iter() {
            match backend.write(kind, id, data) {
                Ok(()) => return Ok(*id),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::TreeEntry;
    use quarry_castore::ObjectKind;
    use tempfile::TempDir;

    #[test]
    fn loose_backend_round_trips() {
        let dir = TempDir::new().unwrap();
        let backend = LooseBackend::new(dir.path().to_path_buf());

        let id = hash_object(GitObjectType::Blob, b"payload");
        assert!(!backend.exists(&id));

        backend.write(GitObjectType::Blob, &id, b"payload").unwrap();
        assert!(backend.exists(&id));
        assert_eq!(
            backend.read(&id).unwrap(),
            Some((GitObjectType::Blob, b"payload".to_vec()))
        );
        assert_eq!(
            backend.read_header(&id).unwrap(),
            Some(ObjectHeader {
                kind: GitObjectType::Blob,
                size: 7
            })
        );
    }

    #[test]
    fn in_memory_backend_rejects_blobs() {
        let backend = InMemoryBackend::default();
        let id = hash_object(GitObjectType::Blob, b"x");
        assert!(matches!(
            backend.write(GitObjectType::Blob, &id, b"x"),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn in_memory_backend_pretends_seeded_entries_exist() {
        let blob_id = hash_object(GitObjectType::Blob, b"content");
        let mut entries = TreeEntries::new();
        entries.insert(
            blob_id,
            vec![TreeEntry {
                name: "f".into(),
                kind: ObjectKind::File,
            }],
        );
        let backend = InMemoryBackend::with_entries(entries);

        assert!(backend.exists(&blob_id));
        let header = backend.read_header(&blob_id).unwrap().unwrap();
        assert_eq!(header.kind, GitObjectType::Blob);
        // but there is nothing to actually read
        assert!(backend.read(&blob_id).unwrap().is_none());
    }

    #[test]
    fn write_through_lands_in_target() {
        let target = Arc::new(GitOdb::new(Arc::new(InMemoryBackend::default())));
        let scratch = GitOdb::new(Arc::new(InMemoryBackend::default()));
        scratch.add_backend(
            Arc::new(WriteThroughBackend::new(target.clone())),
            /*high_priority=*/ true,
        );

        let id = scratch
            .write_object(GitObjectType::Tree, b"")
            .expect("write must succeed");
        assert!(target.exists(&id));
    }
}
