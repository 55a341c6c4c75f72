//! Loose reference files with git-style lock discipline.
//!
//! A ref update creates `<ref>.lock` exclusively, writes the new value,
//! and renames it into place. A pre-existing lock file surfaces as
//! [`Error::Locked`] so callers can apply their bounded retry policy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use quarry_castore::Error;

fn ref_path(gitdir: &Path, name: &str) -> PathBuf {
    gitdir.join(name)
}

pub fn ref_exists(gitdir: &Path, name: &str) -> bool {
    ref_path(gitdir, name).is_file()
}

/// Reads a loose ref; `None` if it does not exist.
pub fn read_ref(gitdir: &Path, name: &str) -> Result<Option<String>, Error> {
    match fs::read_to_string(ref_path(gitdir, name)) {
        Ok(content) => Ok(Some(content.trim().to_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Creates or overwrites a loose ref.
pub fn write_ref(gitdir: &Path, name: &str, value: &str) -> Result<(), Error> {
    let dest = ref_path(gitdir, name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut lock = dest.clone().into_os_string();
    lock.push(".lock");
    let lock = PathBuf::from(lock);
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(Error::Locked(format!("ref {} is locked", name)));
        }
        Err(err) => return Err(err.into()),
    };

    let result = file
        .write_all(value.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_all());
    drop(file);
    if let Err(err) = result {
        let _ = fs::remove_file(&lock);
        return Err(err.into());
    }

    fs::rename(&lock, &dest)?;
    Ok(())
}

/// The symbolic target of HEAD, e.g. `refs/heads/master`.
pub fn head_target(gitdir: &Path) -> Result<String, Error> {
    let head = fs::read_to_string(gitdir.join("HEAD"))?;
    let head = head.trim();
    match head.strip_prefix("ref: ") {
        Some(target) => Ok(target.to_owned()),
        // detached HEAD carries the id directly
        None => Ok(head.to_owned()),
    }
}

/// Resolves HEAD to a commit id; `None` on an unborn branch.
pub fn resolve_head(gitdir: &Path) -> Result<Option<String>, Error> {
    let target = head_target(gitdir)?;
    if !target.starts_with("refs/") {
        return Ok(Some(target));
    }
    read_ref(gitdir, &target)
}

/// All loose refs under `refs/`, as `(name, value)` pairs.
pub fn list_refs(gitdir: &Path) -> Result<Vec<(String, String)>, Error> {
    let refs_root = gitdir.join("refs");
    let mut refs = Vec::new();
    if !refs_root.is_dir() {
        return Ok(refs);
    }
    for entry in walkdir::WalkDir::new(&refs_root) {
        let entry = entry.map_err(|err| Error::Io(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .ends_with(".lock")
        {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(gitdir)
            .map_err(|_| Error::Fatal("ref path outside gitdir".into()))?
            .to_string_lossy()
            .into_owned();
        let value = fs::read_to_string(entry.path())?.trim().to_owned();
        refs.push((name, value));
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gitdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let gitdir = dir.path().join("repo");
        fs::create_dir_all(gitdir.join("refs")).unwrap();
        (dir, gitdir)
    }

    #[test]
    fn write_and_read_round_trip() {
        let (_dir, gitdir) = gitdir();
        let id = "45b983be36b73c0788dc9cbcb76cbb80fc7bb057";

        assert!(read_ref(&gitdir, "refs/heads/main").unwrap().is_none());
        write_ref(&gitdir, "refs/heads/main", id).unwrap();
        assert_eq!(read_ref(&gitdir, "refs/heads/main").unwrap().unwrap(), id);
    }

    #[test]
    fn overwrite_is_allowed() {
        let (_dir, gitdir) = gitdir();
        write_ref(&gitdir, "refs/tags/keep-abc", "a".repeat(40).as_str()).unwrap();
        write_ref(&gitdir, "refs/tags/keep-abc", "b".repeat(40).as_str()).unwrap();
        assert_eq!(
            read_ref(&gitdir, "refs/tags/keep-abc").unwrap().unwrap(),
            "b".repeat(40)
        );
    }

    #[test]
    fn held_lock_file_surfaces_as_locked() {
        let (_dir, gitdir) = gitdir();
        fs::create_dir_all(gitdir.join("refs/heads")).unwrap();
        fs::write(gitdir.join("refs/heads/main.lock"), b"").unwrap();

        let err = write_ref(&gitdir, "refs/heads/main", "c".repeat(40).as_str()).unwrap_err();
        assert!(err.is_locked());
    }

    #[test]
    fn list_refs_skips_lock_files() {
        let (_dir, gitdir) = gitdir();
        write_ref(&gitdir, "refs/heads/main", "d".repeat(40).as_str()).unwrap();
        fs::write(gitdir.join("refs/heads/other.lock"), b"").unwrap();

        let refs = list_refs(&gitdir).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "refs/heads/main");
    }

    #[test]
    fn head_resolution_follows_the_symref() {
        let (_dir, gitdir) = gitdir();
        fs::write(gitdir.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        assert!(resolve_head(&gitdir).unwrap().is_none());
        write_ref(&gitdir, "refs/heads/main", "e".repeat(40).as_str()).unwrap();
        assert_eq!(resolve_head(&gitdir).unwrap().unwrap(), "e".repeat(40));
    }
}
