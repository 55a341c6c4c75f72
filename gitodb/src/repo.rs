//! Repository-level operations over the object database.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument};

use quarry_castore::{Digest, Error, ObjectKind};

use crate::objects::{
    commit_tree_id, encode_commit, encode_tag, encode_tree, prettify_message, referenced_ids,
    GitId, GitObjectType, TreeEntries, TreeEntry,
};
use crate::odb::{GitOdb, InMemoryBackend, LooseBackend, OdbBackend, WriteThroughBackend};
use crate::refs;

/// Bounded retry policy for operations that can hit transient ref or
/// repository locks.
pub const GIT_LOCK_NUM_TRIES: usize = 10;
pub const GIT_LOCK_WAIT: Duration = Duration::from_millis(100);

/// Batch check applied to the contents of every symlink found in a strict
/// tree walk. Receives the blob digests of the symlink targets; returns
/// false if any content is unacceptable (e.g. ascends above the tree).
pub type SymlinksCheckFunc = dyn Fn(&[Digest]) -> bool + Send + Sync;

/// Failure mode of [`GitRepo::subtree_from_commit`]: callers fall back on
/// `NotFound` (e.g. fetch and retry) but surface `Fatal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    NotFound,
    Fatal,
}

/// A Git repository handle: an object database plus, for real (on-disk)
/// repositories, the git directory and optional work tree.
///
/// Fake repositories carry only an in-memory object database; staging,
/// committing, tagging and fetching require a real one.
pub struct GitRepo {
    odb: Arc<GitOdb>,
    gitdir: Option<PathBuf>,
    work_tree: Option<PathBuf>,
}

impl GitRepo {
    /// Opens an existing repository at `path` (either a work tree with a
    /// `.git` directory or a bare git directory).
    pub fn open(path: &Path) -> Option<GitRepo> {
        let (gitdir, work_tree) = discover(path)?;
        let odb = GitOdb::new(Arc::new(LooseBackend::new(gitdir.join("objects"))));
        Some(GitRepo {
            odb: Arc::new(odb),
            gitdir: Some(gitdir),
            work_tree,
        })
    }

    /// Wraps an object database in a repository handle without any on-disk
    /// state. Only object-level operations are valid on the result.
    pub fn open_fake(odb: Arc<GitOdb>) -> GitRepo {
        GitRepo {
            odb,
            gitdir: None,
            work_tree: None,
        }
    }

    /// Idempotently creates and opens a repository, retrying a bounded
    /// number of times when another process holds the init lock.
    #[instrument(skip_all, fields(path = %path.display(), bare = is_bare))]
    pub fn init_and_open(path: &Path, is_bare: bool) -> Option<GitRepo> {
        let mut last_err = None;
        for attempt in 0..GIT_LOCK_NUM_TRIES {
            if let Some(repo) = GitRepo::open(path) {
                return Some(repo);
            }
            match try_init(path, is_bare) {
                Ok(()) => return GitRepo::open(path),
                Err(err) if err.is_locked() => {
                    // init may have finished in another process meanwhile
                    if let Some(repo) = GitRepo::open(path) {
                        return Some(repo);
                    }
                    debug!(attempt, "repository init lock held, retrying");
                    last_err = Some(err);
                    std::thread::sleep(GIT_LOCK_WAIT);
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }
        error!(
            path = %path.display(),
            err = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "initializing git repository failed"
        );
        None
    }

    pub fn is_fake(&self) -> bool {
        self.gitdir.is_none()
    }

    pub fn odb(&self) -> &Arc<GitOdb> {
        &self.odb
    }

    pub fn git_path(&self) -> Option<&Path> {
        self.gitdir.as_deref()
    }

    /// Reads a tree object flat (immediate entries only).
    ///
    /// With `ignore_special` unsupported entry modes are silently skipped.
    /// Otherwise every symlink's blob content must pass the caller's batch
    /// check; trees with upwards symlinks read as absent.
    pub fn read_tree(
        &self,
        id: &GitId,
        check_symlinks: Option<&SymlinksCheckFunc>,
        ignore_special: bool,
    ) -> Option<TreeEntries> {
        let (kind, data) = match self.odb.read_object(id) {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!(%id, "failed to look up git tree");
                return None;
            }
            Err(err) => {
                debug!(%id, %err, "reading git tree failed");
                return None;
            }
        };
        if kind != GitObjectType::Tree {
            debug!(%id, ?kind, "object is not a tree");
            return None;
        }

        let entries = match crate::objects::decode_tree(&data, ignore_special) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(%id, %err, "failed to walk git tree");
                return None;
            }
        };

        // Non-upwardness of symlinks cannot be checked during the walk
        // itself; gather the candidates and check them in bulk.
        if !ignore_special {
            let mut symlinks = Vec::new();
            for (entry_id, nodes) in &entries {
                if nodes.iter().any(|node| node.kind.is_symlink()) {
                    symlinks.push(Digest::new(entry_id.to_hex(), 0, false));
                }
            }
            let Some(check) = check_symlinks else {
                debug!("symlink check callable is empty");
                return None;
            };
            if !check(&symlinks) {
                error!(%id, "found upwards symlinks in git tree");
                return None;
            }
        }

        debug_assert!(entries_are_consistent(&entries));
        Some(entries)
    }

    /// Builds a tree object deterministically from the given entries and
    /// stores it.
    pub fn create_tree(&self, entries: &TreeEntries) -> Option<GitId> {
        debug_assert!(entries_are_consistent(entries));
        let data = match encode_tree(entries) {
            Ok(data) => data,
            Err(err) => {
                debug!(%err, "failed to serialize git tree");
                return None;
            }
        };
        match self.odb.write_object(GitObjectType::Tree, &data) {
            Ok(id) => Some(id),
            Err(err) => {
                debug!(%err, "failed to store git tree");
                None
            }
        }
    }

    /// Creates a tree in a fresh in-memory database and returns both its
    /// id and its serialized bytes.
    pub fn create_shallow_tree(entries: &TreeEntries) -> Option<(GitId, Vec<u8>)> {
        let backend = Arc::new(InMemoryBackend::with_entries(entries.clone()));
        let odb = GitOdb::new(backend.clone() as Arc<dyn OdbBackend>);
        let repo = GitRepo::open_fake(Arc::new(odb));
        let id = repo.create_tree(entries)?;
        let data = backend.tree_data(&id)?;
        Some((id, data))
    }

    /// Parses serialized tree bytes without needing a repository on disk:
    /// the bytes are seeded into a fresh in-memory database first.
    pub fn read_tree_data(
        data: &[u8],
        id: &GitId,
        check_symlinks: Option<&SymlinksCheckFunc>,
    ) -> Option<TreeEntries> {
        let backend = Arc::new(InMemoryBackend::with_tree(*id, data.to_vec()));
        let odb = GitOdb::new(backend as Arc<dyn OdbBackend>);
        let repo = GitRepo::open_fake(Arc::new(odb));
        repo.read_tree(id, check_symlinks, /*ignore_special=*/ false)
    }

    /// Stages every file of the work tree and commits the result with a
    /// deterministic signature. Returns the commit hash.
    #[instrument(skip_all)]
    pub fn stage_and_commit_all(&self, message: &str) -> Option<String> {
        if self.is_fake() {
            error!("cannot stage and commit files using a fake repository");
            return None;
        }
        let Some(work_tree) = self.work_tree.as_deref() else {
            error!("cannot stage and commit files in a bare repository");
            return None;
        };
        let gitdir = self.gitdir.as_deref()?;

        let tree_id = match self.ingest_directory(work_tree) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "staging files in git repository failed");
                return None;
            }
        };

        let commit = encode_commit(&tree_id, &prettify_message(message));
        let commit_id = match self.odb.write_object(GitObjectType::Commit, &commit) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "git commit failed");
                return None;
            }
        };

        let target = match refs::head_target(gitdir) {
            Ok(target) => target,
            Err(err) => {
                error!(%err, "resolving HEAD failed");
                return None;
            }
        };
        if let Err(err) = refs::write_ref(gitdir, &target, &commit_id.to_hex()) {
            error!(%err, "updating HEAD branch failed");
            return None;
        }
        Some(commit_id.to_hex())
    }

    // Builds blob and tree objects bottom-up from a directory. Every file
    // is added explicitly; a bulk forced add would misapply ignore rules.
    fn ingest_directory(&self, dir: &Path) -> Result<GitId, Error> {
        let mut entries = TreeEntries::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let file_type = dir_entry.file_type()?;

            let (id, kind) = if file_type.is_symlink() {
                let target = fs::read_link(dir_entry.path())?;
                let id = self.odb.write_object(
                    GitObjectType::Blob,
                    target.to_string_lossy().as_bytes(),
                )?;
                (id, ObjectKind::Symlink)
            } else if file_type.is_dir() {
                if name == ".git" {
                    continue;
                }
                let id = self.ingest_directory(&dir_entry.path())?;
                (id, ObjectKind::Tree)
            } else {
                let data = fs::read(dir_entry.path())?;
                let id = self.odb.write_object(GitObjectType::Blob, &data)?;
                let executable = {
                    use std::os::unix::fs::PermissionsExt;
                    dir_entry.metadata()?.permissions().mode() & 0o111 != 0
                };
                (
                    id,
                    if executable {
                        ObjectKind::Executable
                    } else {
                        ObjectKind::File
                    },
                )
            };
            entries.entry(id).or_default().push(TreeEntry { name, kind });
        }

        let data = encode_tree(&entries)?;
        self.odb.write_object(GitObjectType::Tree, &data)
    }

    /// Tags a commit with a force tag named `keep-<commit>`. Succeeds if
    /// the tag already exists, possibly created by a concurrent process.
    pub fn keep_tag(&self, commit: &str, message: &str) -> bool {
        self.keep_object(commit, GitObjectType::Commit, message)
    }

    /// Tags a tree object with a force tag named `keep-<tree>`.
    pub fn keep_tree(&self, tree_id: &str, message: &str) -> bool {
        self.keep_object(tree_id, GitObjectType::Tree, message)
    }

    fn keep_object(&self, id_hex: &str, expected: GitObjectType, message: &str) -> bool {
        if self.is_fake() {
            error!("cannot tag objects using a fake repository");
            return false;
        }
        let Some(gitdir) = self.gitdir.as_deref() else {
            return false;
        };

        let id = match GitId::from_hex(id_hex) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "object id parsing failed");
                return false;
            }
        };
        match self.odb.read_header(&id) {
            Ok(Some(header)) if header.kind == expected => {}
            Ok(_) => {
                error!(id = %id_hex, "tag target missing or of unexpected type");
                return false;
            }
            Err(err) => {
                error!(%err, "tag target lookup failed");
                return false;
            }
        }

        let tag_name = format!("keep-{}", id_hex);
        let ref_name = format!("refs/tags/{}", tag_name);

        // already added, possibly by another process
        if refs::ref_exists(gitdir, &ref_name) {
            return true;
        }

        let tag = encode_tag(&id, expected, &tag_name, &prettify_message(message));
        let tag_id = match self.odb.write_object(GitObjectType::Tag, &tag) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "storing tag object failed");
                return false;
            }
        };

        for _ in 0..GIT_LOCK_NUM_TRIES {
            match refs::write_ref(gitdir, &ref_name, &tag_id.to_hex()) {
                Ok(()) => return true,
                Err(err) if err.is_locked() => {
                    if refs::ref_exists(gitdir, &ref_name) {
                        return true;
                    }
                    std::thread::sleep(GIT_LOCK_WAIT);
                }
                Err(err) => {
                    error!(%err, "tag creation in git repository failed");
                    return false;
                }
            }
        }
        error!(tag = %ref_name, "tag creation kept hitting the ref lock");
        false
    }

    /// The commit HEAD currently points to.
    pub fn head_commit(&self) -> Option<String> {
        if self.is_fake() {
            error!("cannot access HEAD using a fake repository");
            return None;
        }
        let gitdir = self.gitdir.as_deref()?;
        match refs::resolve_head(gitdir) {
            Ok(Some(commit)) => Some(commit),
            Ok(None) => {
                error!("retrieving head commit failed: unborn branch");
                None
            }
            Err(err) => {
                error!(%err, "retrieving head commit failed");
                None
            }
        }
    }

    /// Resolves the tree id of `subdir` inside the given commit's tree.
    ///
    /// `NotFound` means the commit is absent (callers may fetch and
    /// retry); every other failure is `Fatal`.
    pub fn subtree_from_commit(&self, commit: &str, subdir: &str) -> Result<String, LookupError> {
        let id = GitId::from_hex(commit).map_err(|err| {
            error!(%err, "commit id parsing failed");
            LookupError::Fatal
        })?;

        let (kind, data) = match self.odb.read_object(&id) {
            Ok(Some(found)) => found,
            Ok(None) => return Err(LookupError::NotFound),
            Err(err) => {
                error!(%err, commit, "retrieving commit failed");
                return Err(LookupError::Fatal);
            }
        };
        if kind != GitObjectType::Commit {
            return Err(LookupError::NotFound);
        }

        let tree = commit_tree_id(&data).map_err(|err| {
            error!(%err, commit, "retrieving tree for commit failed");
            LookupError::Fatal
        })?;

        self.descend(tree, subdir)
            .map(|id| id.to_hex())
            .map_err(|err| {
                error!(%err, commit, subdir, "retrieving subtree failed");
                LookupError::Fatal
            })
    }

    // Follows the path components of `subdir` through nested tree
    // objects, returning the id of the final entry.
    fn descend(&self, tree: GitId, subdir: &str) -> Result<GitId, Error> {
        let mut current = tree;
        for component in subdir
            .split('/')
            .filter(|component| !component.is_empty() && *component != ".")
        {
            let (kind, data) = self
                .odb
                .read_object(&current)?
                .ok_or_else(|| Error::NotFound(format!("tree {}", current)))?;
            if kind != GitObjectType::Tree {
                return Err(Error::Fatal(format!("object {} is not a tree", current)));
            }
            let entries = crate::objects::decode_tree(&data, /*ignore_special=*/ true)?;
            let next = entries.iter().find_map(|(id, nodes)| {
                nodes
                    .iter()
                    .any(|node| node.name == component)
                    .then_some(*id)
            });
            current = next.ok_or_else(|| {
                Error::NotFound(format!("entry {} in tree {}", component, current))
            })?;
        }
        Ok(current)
    }

    /// Resolves the tree id of `subdir` inside the given tree.
    pub fn subtree_from_tree(&self, tree_id: &str, subdir: &str) -> Option<String> {
        if subdir == "." {
            return Some(tree_id.to_owned());
        }
        let id = match GitId::from_hex(tree_id) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "tree id parsing failed");
                return None;
            }
        };
        match self.descend(id, subdir) {
            Ok(found) => Some(found.to_hex()),
            Err(err) => {
                error!(%err, tree_id, subdir, "retrieving subtree failed");
                None
            }
        }
    }

    /// Resolves the subtree id for a filesystem path inside the repository
    /// checkout that `head_commit` describes.
    pub fn subtree_from_path(&self, fpath: &Path, head_commit: &str) -> Option<String> {
        let root = GitRepo::repo_root_from_path(fpath)?;
        let subdir = match fpath.strip_prefix(&root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_owned(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => return None,
        };
        self.subtree_from_commit(head_commit, &subdir).ok()
    }

    /// Walks upwards from a path to the enclosing repository root.
    pub fn repo_root_from_path(path: &Path) -> Option<PathBuf> {
        let mut current = Some(path);
        while let Some(p) = current {
            if p.join(".git").exists() || is_gitdir(p) {
                return Some(p.to_path_buf());
            }
            current = p.parent();
        }
        None
    }

    pub fn check_commit_exists(&self, commit: &str) -> Option<bool> {
        self.check_object_exists(commit, GitObjectType::Commit)
    }

    pub fn check_tree_exists(&self, tree_id: &str) -> Option<bool> {
        self.check_object_exists(tree_id, GitObjectType::Tree)
    }

    pub fn check_blob_exists(&self, blob_id: &str) -> Option<bool> {
        self.check_object_exists(blob_id, GitObjectType::Blob)
    }

    fn check_object_exists(&self, id_hex: &str, expected: GitObjectType) -> Option<bool> {
        let id = match GitId::from_hex(id_hex) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "object id parsing failed");
                return None;
            }
        };
        match self.odb.read_header(&id) {
            Ok(Some(header)) => Some(header.kind == expected),
            Ok(None) => Some(false),
            Err(err) => {
                error!(%err, id = %id_hex, "object lookup failed");
                None
            }
        }
    }

    /// Reads a blob if present. `Err` signals a fatal database failure,
    /// `Ok(None)` a merely absent blob.
    pub fn try_read_blob(&self, blob_id: &str) -> Result<Option<Vec<u8>>, Error> {
        let id = GitId::from_hex(blob_id)?;
        match self.odb.read_object(&id)? {
            Some((GitObjectType::Blob, data)) => Ok(Some(data)),
            _ => Ok(None),
        }
    }

    /// Stores a blob, returning its hex id.
    pub fn write_blob(&self, content: &[u8]) -> Option<String> {
        match self.odb.write_object(GitObjectType::Blob, content) {
            Ok(id) => Some(id.to_hex()),
            Err(err) => {
                error!(%err, "writing blob failed");
                None
            }
        }
    }

    /// Fetches from a repository on the local filesystem: all objects
    /// reachable from the named branch (looked up both under `refs/heads`
    /// and `refs/tags`), or from all refs when no branch is given.
    ///
    /// Only the object database is populated; no local refs are created
    /// and FETCH_HEAD is not touched.
    #[instrument(skip(self), fields(path = %repo_path.display()))]
    pub fn fetch_from_path(&self, repo_path: &Path, branch: Option<&str>) -> bool {
        if self.is_fake() {
            error!("cannot fetch using a fake repository");
            return false;
        }

        let Some(source) = GitRepo::open(repo_path) else {
            error!(path = %repo_path.display(), "creating remote for local repository failed");
            return false;
        };
        let Some(source_gitdir) = source.gitdir.as_deref() else {
            return false;
        };

        let mut tips = Vec::new();
        match branch {
            Some(branch) => {
                // a branch name may denote a head or a tag
                for ref_name in [
                    format!("refs/heads/{}", branch),
                    format!("refs/tags/{}", branch),
                ] {
                    match refs::read_ref(source_gitdir, &ref_name) {
                        Ok(Some(value)) => tips.push(value),
                        Ok(None) => {}
                        Err(err) => {
                            error!(%err, ref_name, "reading remote ref failed");
                            return false;
                        }
                    }
                }
                if tips.is_empty() {
                    error!(branch, "fetching branch in local repository failed: no such ref");
                    return false;
                }
            }
            None => match refs::list_refs(source_gitdir) {
                Ok(all) => tips.extend(all.into_iter().map(|(_, value)| value)),
                Err(err) => {
                    error!(%err, "listing remote refs failed");
                    return false;
                }
            },
        }

        let mut seen = HashSet::new();
        for tip in tips {
            let id = match GitId::from_hex(&tip) {
                Ok(id) => id,
                // unborn or symbolic refs do not carry objects
                Err(_) => continue,
            };
            if let Err(err) = self.copy_reachable(&source, id, &mut seen) {
                error!(%err, tip, "fetching in local repository failed");
                return false;
            }
        }
        true
    }

    fn copy_reachable(
        &self,
        source: &GitRepo,
        tip: GitId,
        seen: &mut HashSet<GitId>,
    ) -> Result<(), Error> {
        let mut worklist = vec![tip];
        while let Some(id) = worklist.pop() {
            if !seen.insert(id) {
                continue;
            }
            if self.odb.exists(&id) {
                continue;
            }
            let (kind, data) = source
                .odb
                .read_object(&id)?
                .ok_or_else(|| Error::NotFound(format!("object {}", id)))?;
            worklist.extend(referenced_ids(kind, &data)?);
            self.odb.write_object(kind, &data)?;
        }
        Ok(())
    }

    /// Fetches through a temporary bare repository whose object database
    /// forwards everything into this repository's database. Objects stream
    /// straight into the target while the scratch repository stays empty.
    pub fn local_fetch_via_tmp_repo(&self, repo_path: &Path, branch: Option<&str>) -> bool {
        let tmp_dir = match tempfile::Builder::new().prefix("quarry-fetch").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                error!(%err, "failed to create temp dir for git repository");
                return false;
            }
        };
        let Some(tmp_repo) = GitRepo::init_and_open(tmp_dir.path(), /*is_bare=*/ true) else {
            return false;
        };
        tmp_repo.odb.add_backend(
            Arc::new(WriteThroughBackend::new(self.odb.clone())),
            /*high_priority=*/ true,
        );
        tmp_repo.fetch_from_path(repo_path, branch)
    }
}

fn is_gitdir(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir()
}

fn discover(path: &Path) -> Option<(PathBuf, Option<PathBuf>)> {
    let dot_git = path.join(".git");
    if dot_git.is_dir() && is_gitdir(&dot_git) {
        return Some((dot_git, Some(path.to_path_buf())));
    }
    if is_gitdir(path) {
        return Some((path.to_path_buf(), None));
    }
    None
}

fn try_init(path: &Path, is_bare: bool) -> Result<(), Error> {
    let gitdir = if is_bare {
        path.to_path_buf()
    } else {
        path.join(".git")
    };
    fs::create_dir_all(&gitdir)?;

    // The config lock doubles as the init lock: whoever creates it first
    // finishes the layout; everyone else sees `Locked` and backs off.
    let lock = gitdir.join("config.lock");
    let mut lock_file = match OpenOptions::new().write(true).create_new(true).open(&lock) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(Error::Locked(format!(
                "repository {} is being initialized",
                gitdir.display()
            )));
        }
        Err(err) => return Err(err.into()),
    };

    match write_layout(&gitdir, is_bare, &mut lock_file) {
        Ok(()) => {
            fs::rename(&lock, gitdir.join("config"))?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&lock);
            Err(err)
        }
    }
}

fn write_layout(gitdir: &Path, is_bare: bool, lock_file: &mut fs::File) -> Result<(), Error> {
    fs::create_dir_all(gitdir.join("objects"))?;
    fs::create_dir_all(gitdir.join("refs").join("heads"))?;
    fs::create_dir_all(gitdir.join("refs").join("tags"))?;
    let head = gitdir.join("HEAD");
    if !head.is_file() {
        fs::write(head, "ref: refs/heads/master\n")?;
    }
    write!(
        lock_file,
        "[core]\n\trepositoryformatversion = 0\n\tbare = {}\n",
        is_bare
    )?;
    lock_file.sync_all()?;
    Ok(())
}

fn entries_are_consistent(entries: &TreeEntries) -> bool {
    // for a given raw id, either all entries are trees or none of them
    entries.values().all(|nodes| {
        nodes.iter().all(|node| node.kind.is_tree())
            || !nodes.iter().any(|node| node.kind.is_tree())
    })
}
