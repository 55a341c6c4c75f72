//! Repository-level integration tests: init retry behavior, tree
//! round-trips, symlink checks, snapshot commits, keep tags, and local
//! fetches.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use quarry_castore::{path_is_non_upwards, Digest, ObjectKind};
use quarry_gitodb::{
    GitId, GitRepo, LookupError, TreeEntries, TreeEntry, GIT_LOCK_NUM_TRIES,
};

fn entry(name: &str, kind: ObjectKind) -> TreeEntry {
    TreeEntry {
        name: name.into(),
        kind,
    }
}

/// A check that accepts everything; used where no symlinks can occur.
fn accept_all(_: &[Digest]) -> bool {
    true
}

#[test]
fn shallow_tree_round_trip() {
    let blob_a = quarry_gitodb::objects::hash_object(quarry_gitodb::GitObjectType::Blob, b"hi\n");
    let blob_b = quarry_gitodb::objects::hash_object(quarry_gitodb::GitObjectType::Blob, b"bye\n");

    let mut entries = TreeEntries::new();
    entries.insert(blob_a, vec![entry("a", ObjectKind::File)]);
    entries.insert(blob_b, vec![entry("b", ObjectKind::Executable)]);

    let (id, data) = GitRepo::create_shallow_tree(&entries).expect("must create tree");
    let read_back =
        GitRepo::read_tree_data(&data, &id, Some(&accept_all)).expect("must parse back");
    assert_eq!(read_back, entries);
}

#[test]
fn shallow_tree_is_deterministic() {
    let mut entries = TreeEntries::new();
    let blob = GitId::from_hex("45b983be36b73c0788dc9cbcb76cbb80fc7bb057").unwrap();
    entries.insert(blob, vec![entry("x", ObjectKind::File)]);

    let (id_one, data_one) = GitRepo::create_shallow_tree(&entries).unwrap();
    let (id_two, data_two) = GitRepo::create_shallow_tree(&entries).unwrap();
    assert_eq!(id_one, id_two);
    assert_eq!(data_one, data_two);
}

#[test]
fn upwards_symlinks_poison_the_tree() {
    // A tree with a symlink entry; the content check decides acceptance.
    let target_outside = b"../outside".to_vec();
    let target_inside = b"inside/file".to_vec();

    for (target, expected_ok) in [(target_outside, false), (target_inside, true)] {
        let link_blob = quarry_gitodb::objects::hash_object(
            quarry_gitodb::GitObjectType::Blob,
            &target,
        );

        let mut entries = TreeEntries::new();
        entries.insert(link_blob, vec![entry("l", ObjectKind::Symlink)]);
        let (id, data) = GitRepo::create_shallow_tree(&entries).unwrap();

        // The checker reads the target content for each reported digest,
        // as a network- or CAS-backed caller would.
        let target_clone = target.clone();
        let check = move |digests: &[Digest]| {
            digests
                .iter()
                .all(|_d| path_is_non_upwards(&target_clone))
        };
        let result = GitRepo::read_tree_data(&data, &id, Some(&check));
        assert_eq!(result.is_some(), expected_ok, "target {:?}", target);
    }
}

#[test]
fn strict_read_without_checker_fails() {
    let blob = GitId::from_hex("45b983be36b73c0788dc9cbcb76cbb80fc7bb057").unwrap();
    let mut entries = TreeEntries::new();
    entries.insert(blob, vec![entry("l", ObjectKind::Symlink)]);
    let (id, data) = GitRepo::create_shallow_tree(&entries).unwrap();

    assert!(GitRepo::read_tree_data(&data, &id, None).is_none());
}

#[test]
fn blob_round_trip_through_a_real_repository() {
    let dir = tempfile::TempDir::new().unwrap();
    let repo = GitRepo::init_and_open(&dir.path().join("repo"), /*is_bare=*/ true).unwrap();

    let id = repo.write_blob(b"some file content\n").unwrap();
    assert_eq!(repo.check_blob_exists(&id), Some(true));
    assert_eq!(repo.check_tree_exists(&id), Some(false));
    assert_eq!(
        repo.try_read_blob(&id).unwrap().unwrap(),
        b"some file content\n"
    );

    let absent = "0123456789012345678901234567890123456789";
    assert_eq!(repo.check_blob_exists(absent), Some(false));
    assert!(repo.try_read_blob(absent).unwrap().is_none());
    assert!(repo.try_read_blob("junk").is_err());
}

#[test]
fn init_and_open_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("repo");

    let first = GitRepo::init_and_open(&path, /*is_bare=*/ true).expect("init must succeed");
    assert!(!first.is_fake());

    let second = GitRepo::init_and_open(&path, true).expect("reopen must succeed");
    assert!(!second.is_fake());
}

#[test]
fn init_retries_while_the_lock_is_held() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("repo");
    let gitdir = path.clone();
    fs::create_dir_all(&gitdir).unwrap();
    fs::write(gitdir.join("config.lock"), b"").unwrap();

    // Release the lock while init_and_open is backing off; a successful
    // retry must produce a valid handle.
    let unlock_path = gitdir.join("config.lock");
    let unlocker = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(250));
        fs::remove_file(unlock_path).unwrap();
    });

    let repo = GitRepo::init_and_open(&path, true);
    unlocker.join().unwrap();
    let repo = repo.expect("init must succeed once the lock is gone");
    assert!(repo.head_commit().is_none()); // unborn branch, but valid repo
}

#[test]
fn init_gives_up_after_bounded_retries() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("repo");
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("config.lock"), b"").unwrap();

    let started = std::time::Instant::now();
    assert!(GitRepo::init_and_open(&path, true).is_none());
    // N-1 sleeps of the configured wait time must have happened.
    let min_wait = quarry_gitodb::GIT_LOCK_WAIT * (GIT_LOCK_NUM_TRIES as u32 - 1);
    assert!(started.elapsed() >= min_wait);
}

fn write_exec(path: &Path, content: &[u8]) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn sample_worktree(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("README"), b"about\n").unwrap();
    fs::write(root.join("src/lib.c"), b"int f() { return 0; }\n").unwrap();
    write_exec(&root.join("run.sh"), b"#!/bin/sh\n");
    symlink("src/lib.c", root.join("link")).unwrap();
}

#[test]
fn stage_and_commit_builds_a_reachable_tree() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("work");
    fs::create_dir_all(&root).unwrap();
    let repo = GitRepo::init_and_open(&root, /*is_bare=*/ false).unwrap();
    sample_worktree(&root);

    let commit = repo
        .stage_and_commit_all("snapshot\n")
        .expect("commit must succeed");
    assert_eq!(repo.head_commit().unwrap(), commit);
    assert_eq!(repo.check_commit_exists(&commit), Some(true));

    // the whole root tree resolves, as does the subdirectory
    let root_tree = repo
        .subtree_from_commit(&commit, ".")
        .expect("root tree must resolve");
    assert_eq!(repo.check_tree_exists(&root_tree), Some(true));

    let sub_tree = repo
        .subtree_from_commit(&commit, "src")
        .expect("subdir tree must resolve");
    assert_eq!(repo.check_tree_exists(&sub_tree), Some(true));
    assert_eq!(repo.subtree_from_tree(&root_tree, "src").unwrap(), sub_tree);

    // committing is deterministic: same content, same signature, no parent
    let again = repo.stage_and_commit_all("snapshot\n").unwrap();
    assert_eq!(commit, again);
}

#[test]
fn subtree_from_commit_distinguishes_absent_from_broken() {
    let dir = tempfile::TempDir::new().unwrap();
    let repo = GitRepo::init_and_open(&dir.path().join("repo"), true).unwrap();

    let absent = "0123456789012345678901234567890123456789";
    assert_eq!(
        repo.subtree_from_commit(absent, "."),
        Err(LookupError::NotFound)
    );
    assert_eq!(
        repo.subtree_from_commit("not-a-hex-id", "."),
        Err(LookupError::Fatal)
    );
}

#[test]
fn subtree_from_path_resolves_relative_to_the_repo_root() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("work");
    fs::create_dir_all(&root).unwrap();
    let repo = GitRepo::init_and_open(&root, false).unwrap();
    sample_worktree(&root);
    let commit = repo.stage_and_commit_all("snapshot\n").unwrap();

    let via_path = repo
        .subtree_from_path(&root.join("src"), &commit)
        .expect("path must resolve");
    let via_subdir = repo.subtree_from_commit(&commit, "src").unwrap();
    assert_eq!(via_path, via_subdir);
}

#[test]
fn keep_tag_is_race_tolerant() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("work");
    fs::create_dir_all(&root).unwrap();
    let repo = GitRepo::init_and_open(&root, false).unwrap();
    fs::write(root.join("f"), b"content\n").unwrap();
    let commit = repo.stage_and_commit_all("snapshot\n").unwrap();

    assert!(repo.keep_tag(&commit, "keep it"));
    // a second keeper (or a concurrent process) succeeds trivially
    assert!(repo.keep_tag(&commit, "keep it"));

    let tree = repo.subtree_from_commit(&commit, ".").unwrap();
    assert!(repo.keep_tree(&tree, "keep the tree"));
    // mixing up object kinds is refused
    assert!(!repo.keep_tree(&commit, "a commit is not a tree"));
}

#[test]
fn fetch_from_path_copies_reachable_objects_only_into_the_odb() {
    let dir = tempfile::TempDir::new().unwrap();

    let source_root = dir.path().join("source");
    fs::create_dir_all(&source_root).unwrap();
    let source = GitRepo::init_and_open(&source_root, false).unwrap();
    sample_worktree(&source_root);
    let commit = source.stage_and_commit_all("snapshot\n").unwrap();

    let target = GitRepo::init_and_open(&dir.path().join("target"), true).unwrap();
    assert_eq!(target.check_commit_exists(&commit), Some(false));

    assert!(target.fetch_from_path(&source_root, Some("master")));
    assert_eq!(target.check_commit_exists(&commit), Some(true));
    let tree = target.subtree_from_commit(&commit, "src").unwrap();
    assert_eq!(target.check_tree_exists(&tree), Some(true));

    // no local refs are created by a fetch
    assert!(target.head_commit().is_none());
}

#[test]
fn fetch_of_a_missing_branch_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let source_root = dir.path().join("source");
    fs::create_dir_all(&source_root).unwrap();
    let source = GitRepo::init_and_open(&source_root, false).unwrap();
    fs::write(source_root.join("f"), b"x\n").unwrap();
    source.stage_and_commit_all("snapshot\n").unwrap();

    let target = GitRepo::init_and_open(&dir.path().join("target"), true).unwrap();
    assert!(!target.fetch_from_path(&source_root, Some("no-such-branch")));
}

#[test]
fn local_fetch_via_tmp_repo_streams_into_the_target() {
    let dir = tempfile::TempDir::new().unwrap();

    let source_root = dir.path().join("source");
    fs::create_dir_all(&source_root).unwrap();
    let source = GitRepo::init_and_open(&source_root, false).unwrap();
    sample_worktree(&source_root);
    let commit = source.stage_and_commit_all("snapshot\n").unwrap();

    let target = GitRepo::init_and_open(&dir.path().join("target"), true).unwrap();
    assert!(target.local_fetch_via_tmp_repo(&source_root, Some("master")));
    assert_eq!(target.check_commit_exists(&commit), Some(true));
}

#[test]
fn read_tree_ignores_special_entries_on_request() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("work");
    fs::create_dir_all(&root).unwrap();
    let repo = GitRepo::init_and_open(&root, false).unwrap();
    fs::write(root.join("plain"), b"data\n").unwrap();
    symlink("plain", root.join("link")).unwrap();
    let commit = repo.stage_and_commit_all("snapshot\n").unwrap();
    let tree_hex = repo.subtree_from_commit(&commit, ".").unwrap();
    let tree_id = GitId::from_hex(&tree_hex).unwrap();

    let lenient = repo
        .read_tree(&tree_id, None, /*ignore_special=*/ true)
        .expect("lenient walk must succeed");
    let names: Vec<_> = lenient
        .values()
        .flatten()
        .map(|entry| entry.name.clone())
        .collect();
    assert!(names.contains(&"plain".to_owned()));
    assert!(!names.contains(&"link".to_owned()));

    let strict = repo
        .read_tree(&tree_id, Some(&accept_all), false)
        .expect("strict walk must succeed");
    let names: Vec<_> = strict
        .values()
        .flatten()
        .map(|entry| entry.name.clone())
        .collect();
    assert!(names.contains(&"link".to_owned()));
}
