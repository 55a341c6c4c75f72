//! The Git object codec: ids, loose-object framing, and the tree, commit
//! and tag formats.

use std::collections::HashMap;
use std::io::Read;

use data_encoding::HEXLOWER;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest as _, Sha1};

use quarry_castore::{Error, ObjectKind};

/// Raw length of a Git object id.
pub const RAW_ID_LEN: usize = 20;

/// Deterministic identity used for every commit and tag this tool writes.
const SIGNATURE: &str = "Nobody <nobody@example.org> 0 +0000";

/// A raw Git object id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitId([u8; RAW_ID_LEN]);

impl GitId {
    pub fn from_raw(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; RAW_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("invalid raw object id length {}", bytes.len())))?;
        Ok(Self(raw))
    }

    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        let bytes = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|_| Error::Parse(format!("invalid hex object id {:?}", hex)))?;
        Self::from_raw(&bytes)
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for GitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for GitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GitId({})", self.to_hex())
    }
}

/// The four storable Git object types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GitObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl GitObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitObjectType::Blob => "blob",
            GitObjectType::Tree => "tree",
            GitObjectType::Commit => "commit",
            GitObjectType::Tag => "tag",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match bytes {
            b"blob" => Ok(GitObjectType::Blob),
            b"tree" => Ok(GitObjectType::Tree),
            b"commit" => Ok(GitObjectType::Commit),
            b"tag" => Ok(GitObjectType::Tag),
            other => Err(Error::Parse(format!(
                "unknown git object type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Computes the id of an object: SHA-1 over `"<type> <len>\0"` + payload.
pub fn hash_object(kind: GitObjectType, data: &[u8]) -> GitId {
    let mut hasher = Sha1::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    GitId(hasher.finalize().into())
}

/// Zlib-compresses the framed loose-object representation.
pub fn encode_loose(kind: GitObjectType, data: &[u8]) -> Result<Vec<u8>, Error> {
    use std::io::Write as _;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(kind.as_str().as_bytes())?;
    encoder.write_all(b" ")?;
    encoder.write_all(data.len().to_string().as_bytes())?;
    encoder.write_all(b"\0")?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompresses a loose object and strips its header frame.
pub fn decode_loose(compressed: &[u8]) -> Result<(GitObjectType, Vec<u8>), Error> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let nul = raw
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Parse("loose object without header terminator".into()))?;
    let header = &raw[..nul];
    let payload = raw[nul + 1..].to_vec();

    let space = header
        .iter()
        .position(|b| *b == b' ')
        .ok_or_else(|| Error::Parse("malformed loose object header".into()))?;
    let kind = GitObjectType::from_bytes(&header[..space])?;
    let size: usize = std::str::from_utf8(&header[space + 1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse("malformed loose object size".into()))?;
    if size != payload.len() {
        return Err(Error::Parse(format!(
            "loose object size mismatch: header says {}, payload is {}",
            size,
            payload.len()
        )));
    }
    Ok((kind, payload))
}

/// A single name bound to an object id inside a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: ObjectKind,
}

/// A flat tree, keyed by raw object id. Multiple names may share one id
/// (identical sub-objects deduplicate); for a given id, either all bound
/// names are trees or none are.
pub type TreeEntries = HashMap<GitId, Vec<TreeEntry>>;

fn kind_to_mode(kind: ObjectKind) -> &'static [u8] {
    match kind {
        ObjectKind::File => b"100644",
        ObjectKind::Executable => b"100755",
        ObjectKind::Tree => b"40000",
        ObjectKind::Symlink => b"120000",
    }
}

fn mode_to_kind(mode: &[u8]) -> Option<ObjectKind> {
    match mode {
        b"100644" => Some(ObjectKind::File),
        b"100755" => Some(ObjectKind::Executable),
        b"40000" | b"040000" => Some(ObjectKind::Tree),
        b"120000" => Some(ObjectKind::Symlink),
        _ => None,
    }
}

/// Modes that are neither special nor symlinks; the only ones kept by a
/// walk with `ignore_special`.
fn mode_is_non_special(mode: &[u8]) -> bool {
    matches!(mode, b"100644" | b"100755" | b"40000" | b"040000")
}

fn valid_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Serializes a tree deterministically in the Git wire format. Entries are
/// ordered by the Git name ordering, where a subtree sorts as `name/`.
pub fn encode_tree(entries: &TreeEntries) -> Result<Vec<u8>, Error> {
    let mut flat: Vec<(&TreeEntry, &GitId)> = Vec::new();
    for (id, nodes) in entries {
        for entry in nodes {
            if !valid_entry_name(&entry.name) {
                return Err(Error::Parse(format!(
                    "invalid tree entry name {:?}",
                    entry.name
                )));
            }
            flat.push((entry, id));
        }
    }
    flat.sort_by(|(a, _), (b, _)| {
        let a_key = sort_key(a);
        let b_key = sort_key(b);
        a_key.cmp(&b_key)
    });

    let mut out = Vec::new();
    for (entry, id) in flat {
        out.extend_from_slice(kind_to_mode(entry.kind));
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
        out.extend_from_slice(id.as_bytes());
    }
    Ok(out)
}

fn sort_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.as_bytes().to_vec();
    if entry.kind.is_tree() {
        key.push(b'/');
    }
    key
}

/// Splits a serialized tree into raw `(mode, name, id)` triples without
/// interpreting the modes.
fn parse_tree_raw(data: &[u8]) -> Result<Vec<(Vec<u8>, String, GitId)>, Error> {
    let mut triples = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| Error::Parse("truncated tree entry mode".into()))?;
        let mode = rest[..space].to_vec();
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Parse("truncated tree entry name".into()))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::Parse("non-utf8 tree entry name".into()))?
            .to_owned();
        rest = &rest[nul + 1..];

        if rest.len() < RAW_ID_LEN {
            return Err(Error::Parse("truncated tree entry id".into()));
        }
        let id = GitId::from_raw(&rest[..RAW_ID_LEN])?;
        rest = &rest[RAW_ID_LEN..];

        triples.push((mode, name, id));
    }
    Ok(triples)
}

/// Parses a serialized tree into its flat entries.
///
/// With `ignore_special`, entries with unsupported modes (including
/// symlinks) are silently skipped; otherwise an unsupported mode is an
/// error and symlinks are kept for the caller to check.
pub fn decode_tree(data: &[u8], ignore_special: bool) -> Result<TreeEntries, Error> {
    let mut entries: TreeEntries = HashMap::new();
    for (mode, name, id) in parse_tree_raw(data)? {
        if ignore_special && !mode_is_non_special(&mode) {
            continue;
        }
        let kind = mode_to_kind(&mode).ok_or_else(|| {
            Error::Unsupported(format!(
                "unsupported git filemode {:?} for entry {:?}",
                String::from_utf8_lossy(&mode),
                name
            ))
        })?;
        entries.entry(id).or_default().push(TreeEntry { name, kind });
    }
    Ok(entries)
}

/// Serializes a parent-less commit of the given tree.
pub fn encode_commit(tree: &GitId, message: &str) -> Vec<u8> {
    format!(
        "tree {}\nauthor {}\ncommitter {}\n\n{}",
        tree.to_hex(),
        SIGNATURE,
        SIGNATURE,
        message
    )
    .into_bytes()
}

/// Extracts the tree id from a serialized commit.
pub fn commit_tree_id(data: &[u8]) -> Result<GitId, Error> {
    let line = data
        .split(|b| *b == b'\n')
        .next()
        .ok_or_else(|| Error::Parse("empty commit object".into()))?;
    let hex = line
        .strip_prefix(b"tree ")
        .ok_or_else(|| Error::Parse("commit object does not start with a tree line".into()))?;
    GitId::from_hex(
        std::str::from_utf8(hex).map_err(|_| Error::Parse("non-utf8 tree id in commit".into()))?,
    )
}

/// Serializes an annotated tag object.
pub fn encode_tag(
    object: &GitId,
    object_type: GitObjectType,
    tag_name: &str,
    message: &str,
) -> Vec<u8> {
    format!(
        "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
        object.to_hex(),
        object_type.as_str(),
        tag_name,
        SIGNATURE,
        message
    )
    .into_bytes()
}

/// Normalizes a commit or tag message: strips `#` comment lines, trims
/// trailing whitespace, and guarantees a single trailing newline.
pub fn prettify_message(message: &str) -> String {
    let mut out: String = message
        .lines()
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    while out.ends_with(['\n', ' ', '\t']) {
        out.pop();
    }
    out.push('\n');
    out
}

/// Ids referenced by a serialized object: a commit references its tree, a
/// tree its entries, a tag its target. Used by the fetch object walk.
pub fn referenced_ids(kind: GitObjectType, data: &[u8]) -> Result<Vec<GitId>, Error> {
    match kind {
        GitObjectType::Blob => Ok(Vec::new()),
        GitObjectType::Tree => {
            // Every entry with a mode we know how to store, symlinks
            // included; gitlinks point outside the repository and are
            // skipped.
            Ok(parse_tree_raw(data)?
                .into_iter()
                .filter(|(mode, _, _)| mode_to_kind(mode).is_some())
                .map(|(_, _, id)| id)
                .collect())
        }
        GitObjectType::Commit => {
            let mut ids = vec![commit_tree_id(data)?];
            for line in data.split(|b| *b == b'\n') {
                if line.is_empty() {
                    break; // header ends at the first blank line
                }
                if let Some(hex) = line.strip_prefix(b"parent ") {
                    if let Ok(parent) = std::str::from_utf8(hex).map(GitId::from_hex) {
                        ids.push(parent?);
                    }
                }
            }
            Ok(ids)
        }
        GitObjectType::Tag => {
            let line = data
                .split(|b| *b == b'\n')
                .next()
                .ok_or_else(|| Error::Parse("empty tag object".into()))?;
            let hex = line
                .strip_prefix(b"object ")
                .ok_or_else(|| Error::Parse("tag object without target line".into()))?;
            Ok(vec![GitId::from_hex(std::str::from_utf8(hex).map_err(
                |_| Error::Parse("non-utf8 object id in tag".into()),
            )?)?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loose_round_trip() {
        let encoded = encode_loose(GitObjectType::Blob, b"hello").unwrap();
        let (kind, payload) = decode_loose(&encoded).unwrap();
        assert_eq!(kind, GitObjectType::Blob);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn blob_hash_matches_git() {
        // `printf 'hi\n' | git hash-object --stdin`
        let id = hash_object(GitObjectType::Blob, b"hi\n");
        assert_eq!(id.to_hex(), "45b983be36b73c0788dc9cbcb76cbb80fc7bb057");
    }

    #[test]
    fn tree_encoding_sorts_subtrees_with_slash() {
        // Git orders "sub" (a tree) after "sub.c" because trees compare as
        // "sub/".
        let blob_id = hash_object(GitObjectType::Blob, b"int main() {}\n");
        let tree_id = hash_object(GitObjectType::Tree, b"");

        let mut entries = TreeEntries::new();
        entries.insert(
            blob_id,
            vec![TreeEntry {
                name: "sub.c".into(),
                kind: ObjectKind::File,
            }],
        );
        entries.insert(
            tree_id,
            vec![TreeEntry {
                name: "sub".into(),
                kind: ObjectKind::Tree,
            }],
        );

        let encoded = encode_tree(&entries).unwrap();
        let sub_c = encoded
            .windows(b"sub.c".len())
            .position(|w| w == b"sub.c")
            .unwrap();
        let sub = encoded
            .windows(b"sub\0".len())
            .position(|w| w == b"sub\0")
            .unwrap();
        assert!(sub_c < sub);
    }

    #[test]
    fn tree_round_trip_keeps_entries() {
        let blob_id = hash_object(GitObjectType::Blob, b"contents");
        let mut entries = TreeEntries::new();
        entries.insert(
            blob_id,
            vec![
                TreeEntry {
                    name: "a".into(),
                    kind: ObjectKind::File,
                },
                TreeEntry {
                    name: "b".into(),
                    kind: ObjectKind::File,
                },
            ],
        );

        let encoded = encode_tree(&entries).unwrap();
        let mut decoded = decode_tree(&encoded, false).unwrap();
        decoded.get_mut(&blob_id).unwrap().sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(decoded, entries);
    }

    #[test]
    fn decode_skips_special_modes_when_asked() {
        let id = hash_object(GitObjectType::Blob, b"x");
        let mut raw = Vec::new();
        // a gitlink-style entry followed by a regular file
        raw.extend_from_slice(b"160000 submodule\0");
        raw.extend_from_slice(id.as_bytes());
        raw.extend_from_slice(b"100644 plain\0");
        raw.extend_from_slice(id.as_bytes());

        let lenient = decode_tree(&raw, true).unwrap();
        assert_eq!(lenient[&id].len(), 1);
        assert_eq!(lenient[&id][0].name, "plain");

        assert!(matches!(
            decode_tree(&raw, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn decode_skips_symlinks_when_ignoring_special() {
        let id = hash_object(GitObjectType::Blob, b"target");
        let mut raw = Vec::new();
        raw.extend_from_slice(b"120000 link\0");
        raw.extend_from_slice(id.as_bytes());

        let lenient = decode_tree(&raw, true).unwrap();
        assert!(lenient.is_empty());

        let strict = decode_tree(&raw, false).unwrap();
        assert_eq!(strict[&id][0].kind, ObjectKind::Symlink);
    }

    #[test]
    fn commit_format_is_deterministic() {
        let tree = hash_object(GitObjectType::Tree, b"");
        let commit = encode_commit(&tree, "snapshot\n");
        let text = String::from_utf8(commit.clone()).unwrap();
        assert!(text.starts_with(&format!("tree {}\n", tree.to_hex())));
        assert!(text.contains("author Nobody <nobody@example.org> 0 +0000\n"));
        assert!(text.contains("committer Nobody <nobody@example.org> 0 +0000\n"));
        assert_eq!(commit_tree_id(&commit).unwrap(), tree);
    }

    #[test]
    fn prettify_strips_comments() {
        assert_eq!(prettify_message("keep\n# drop\nalso keep"), "keep\nalso keep\n");
        assert_eq!(prettify_message("msg\n\n\n"), "msg\n");
    }

    #[test]
    fn referenced_ids_of_a_commit_is_its_tree() {
        let tree = hash_object(GitObjectType::Tree, b"");
        let commit = encode_commit(&tree, "m\n");
        assert_eq!(
            referenced_ids(GitObjectType::Commit, &commit).unwrap(),
            vec![tree]
        );
    }
}
