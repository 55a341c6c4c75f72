//! High-level tree upload: bottom-up with batched missing-blob probing in
//! native mode, flat `Directory` batches in compatibility mode.

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, instrument};

use quarry_castore::Digest;

use crate::blob::Blob;
use crate::bridge;
use crate::remote::RemoteExecutionClient;
use crate::tree::{BlobTree, DirectoryTree};

/// Uploads a build root in native mode and returns its tree digest.
///
/// The root tree blob is uploaded last, so a root reported available
/// implies its whole closure is.
#[instrument(skip_all)]
pub async fn upload_tree_native(
    client: &RemoteExecutionClient,
    root: &DirectoryTree,
) -> Option<Digest> {
    let blob_tree = BlobTree::from_directory_tree(root, client.hash_function())?;
    let tree_blob = blob_tree.blob().clone();

    // Upload the closure only if the root tree blob is not yet known
    // remotely (content first, root last).
    if !client.is_available_single(&tree_blob.digest).await {
        if !upload_blob_tree(client, &blob_tree).await {
            debug!("failed to upload blob tree for build root");
            return None;
        }
        if !client
            .upload_blobs(vec![tree_blob.clone()], /*skip_find_missing=*/ true)
            .await
        {
            debug!("failed to upload tree blob for build root");
            return None;
        }
    }
    Some(tree_blob.digest)
}

/// Recursive step of the native upload: probe all immediate children in
/// one batch, recurse into missing subtrees first, then upload the missing
/// children themselves.
fn upload_blob_tree<'a>(
    client: &'a RemoteExecutionClient,
    node: &'a BlobTree,
) -> BoxFuture<'a, bool> {
    async move {
        let digests: Vec<Digest> = node
            .entries()
            .iter()
            .map(|child| child.blob().digest.clone())
            .collect();
        let missing = client.is_available(&digests).await;
        let missing: std::collections::HashSet<String> =
            missing.into_iter().map(|digest| digest.hash).collect();

        let mut to_upload = Vec::new();
        for child in node.entries() {
            if !missing.contains(&child.blob().digest.hash) {
                continue;
            }
            if child.is_tree() && !upload_blob_tree(client, child).await {
                return false;
            }
            to_upload.push(child.blob().clone());
        }
        if to_upload.is_empty() {
            return true;
        }
        client
            .upload_blobs(to_upload, /*skip_find_missing=*/ true)
            .await
    }
    .boxed()
}

/// Uploads a build root in compatibility mode: flatten to `Directory`
/// messages and upload everything (directories and file contents) in one
/// probed batch.
#[instrument(skip_all)]
pub async fn upload_tree_compatible(
    client: &RemoteExecutionClient,
    root: &DirectoryTree,
) -> Option<Digest> {
    let mut blobs = Vec::new();
    collect_file_blobs(client, root, &mut blobs);
    let digest = bridge::directory_digest_from_tree(
        root,
        client.hash_function(),
        &mut |blob: Blob| blobs.push(blob),
    )?;
    if !client.upload_blobs(blobs, /*skip_find_missing=*/ false).await {
        debug!("failed to upload blobs for build root");
        return None;
    }
    Some(digest)
}

fn collect_file_blobs(
    client: &RemoteExecutionClient,
    tree: &DirectoryTree,
    blobs: &mut Vec<Blob>,
) {
    for entry in tree.entries.values() {
        match entry {
            crate::tree::DirectoryEntry::File { data, executable } => blobs.push(Blob::new(
                client.hash_function(),
                data.clone(),
                *executable,
            )),
            crate::tree::DirectoryEntry::Dir(subtree) => {
                collect_file_blobs(client, subtree, blobs)
            }
            crate::tree::DirectoryEntry::Symlink { .. } => {}
        }
    }
}
