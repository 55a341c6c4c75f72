//! The client stack towards an upstream CAS / action cache / execution
//! endpoint speaking the Remote Execution wire protocol.

mod ac;
mod bytestream;
mod cas;
mod exec;

pub use bytestream::{ByteStreamClient, IncrementalReader, BYTESTREAM_CHUNK_SIZE};
pub use exec::ExecutionOutput;

use tonic::transport::Channel;
use tracing::{debug, instrument, warn};

use quarry_castore::{Digest, Error, HashFunction};
use quarry_reapi::remexec;

use crate::blob::Blob;

/// Maximum total payload of one batched CAS transfer. Blobs larger than
/// this travel over the byte-stream protocol. Leaves headroom below the
/// default 4 MiB gRPC message limit for the message framing itself.
pub const MAX_BATCH_TRANSFER_SIZE: usize = 3 * 1024 * 1024;

/// A connected upstream endpoint. Blob traffic is partitioned by size
/// between batched RPCs and byte streams; split/splice is used where the
/// server advertises it.
pub struct RemoteExecutionClient {
    instance_name: String,
    hash: HashFunction,
    cas: cas::CasClient,
    bytestream: ByteStreamClient,
    ac: ac::AcClient,
    exec: exec::ExecClient,
}

impl RemoteExecutionClient {
    /// Connects to `host:port` over an insecure channel.
    pub async fn connect(
        address: &str,
        instance_name: impl Into<String>,
        hash: HashFunction,
    ) -> Result<Self, Error> {
        let channel = Channel::from_shared(format!("http://{}", address))
            .map_err(|err| Error::Unsupported(format!("invalid endpoint address: {}", err)))?
            .connect()
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))?;
        Ok(Self::from_channel(channel, instance_name, hash))
    }

    pub fn from_channel(
        channel: Channel,
        instance_name: impl Into<String>,
        hash: HashFunction,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            hash,
            cas: cas::CasClient::new(channel.clone(), hash),
            bytestream: ByteStreamClient::new(channel.clone()),
            ac: ac::AcClient::new(channel.clone()),
            exec: exec::ExecClient::new(channel),
        }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    /// Which of the given digests the server is missing. A failed probe
    /// reports everything missing, so callers err towards re-uploading.
    #[instrument(skip_all, fields(count = digests.len()))]
    pub async fn is_available(&self, digests: &[Digest]) -> Vec<Digest> {
        let wire: Vec<remexec::Digest> = digests.iter().map(Into::into).collect();
        match self.cas.find_missing_blobs(&self.instance_name, wire).await {
            Ok(missing) => missing.iter().map(Into::into).collect(),
            Err(err) => {
                warn!(%err, "missing-blob probe failed");
                digests.to_vec()
            }
        }
    }

    /// True if a single digest is known to the server.
    pub async fn is_available_single(&self, digest: &Digest) -> bool {
        self.is_available(std::slice::from_ref(digest)).await.is_empty()
    }

    /// Uploads a set of blobs.
    ///
    /// Unless `skip_find_missing`, the set is first reduced to what the
    /// server reports missing. The reduced set is stably partitioned by
    /// size: small blobs go through batched RPCs, large ones through the
    /// byte stream. Success means every blob was acknowledged.
    #[instrument(skip_all, fields(count = blobs.len(), skip_find_missing))]
    pub async fn upload_blobs(&self, blobs: Vec<Blob>, skip_find_missing: bool) -> bool {
        if skip_find_missing {
            return self.do_upload_blobs(blobs.iter().collect()).await;
        }

        let digests: Vec<Digest> = blobs.iter().map(|blob| blob.digest.clone()).collect();
        let missing = self.is_available(&digests).await;
        if missing.is_empty() {
            return true;
        }
        // membership by hash: the wire loses the tree flag in
        // compatibility mode
        let missing: std::collections::HashSet<String> =
            missing.into_iter().map(|digest| digest.hash).collect();
        let subset: Vec<&Blob> = blobs
            .iter()
            .filter(|blob| missing.contains(&blob.digest.hash))
            .collect();
        self.do_upload_blobs(subset).await
    }

    async fn do_upload_blobs(&self, blobs: Vec<&Blob>) -> bool {
        // Stable partition by size: batchable blobs first, oversized ones
        // via the byte stream.
        let mut small = Vec::new();
        let mut large = Vec::new();
        for blob in blobs {
            if blob.data.len() <= MAX_BATCH_TRANSFER_SIZE {
                small.push(blob);
            } else {
                large.push(blob);
            }
        }

        let acknowledged = self
            .cas
            .batch_update_blobs(&self.instance_name, &small)
            .await;
        if acknowledged != small.len() {
            debug!(acknowledged, expected = small.len(), "batch upload incomplete");
            return false;
        }

        for blob in large {
            let resource = format!(
                "{}/uploads/{}/blobs/{}/{}",
                self.instance_name,
                uuid::Uuid::new_v4(),
                blob.digest.hash,
                blob.digest.size
            );
            if !self.bytestream.write(resource, blob.data.clone()).await {
                return false;
            }
        }
        true
    }

    /// A lazy reader over the given digests, yielding blob batches on
    /// demand until an empty batch signals the end.
    pub fn read_blobs(&self, digests: Vec<Digest>) -> BlobReader<'_> {
        BlobReader {
            client: self,
            ids: digests.iter().map(Into::into).collect(),
            begin: 0,
            current: 0,
        }
    }

    /// Opens a chunked byte-stream read of a single blob.
    pub async fn incremental_read_single_blob(
        &self,
        digest: &Digest,
    ) -> Result<IncrementalReader, Error> {
        self.bytestream
            .read(self.blob_resource(&digest.into()))
            .await
    }

    fn blob_resource(&self, digest: &remexec::Digest) -> String {
        format!(
            "{}/blobs/{}/{}",
            self.instance_name, digest.hash, digest.size_bytes
        )
    }

    async fn read_single_blob(&self, digest: &remexec::Digest) -> Option<Blob> {
        let reader = match self.bytestream.read(self.blob_resource(digest)).await {
            Ok(reader) => reader,
            Err(err) => {
                debug!(%err, hash = %digest.hash, "single blob read failed to open");
                return None;
            }
        };
        match reader.collect().await {
            Ok(data) => Some(Blob {
                digest: digest.into(),
                data,
                is_executable: false,
            }),
            Err(err) => {
                debug!(%err, hash = %digest.hash, "single blob read failed");
                None
            }
        }
    }

    pub async fn split_blob(&self, digest: &Digest) -> Option<Vec<Digest>> {
        let chunks = self
            .cas
            .split_blob(&self.instance_name, &digest.into())
            .await?;
        Some(chunks.iter().map(Into::into).collect())
    }

    pub async fn splice_blob(&self, digest: &Digest, chunks: &[Digest]) -> Option<Digest> {
        let spliced = self
            .cas
            .splice_blob(
                &self.instance_name,
                &digest.into(),
                chunks.iter().map(Into::into).collect(),
            )
            .await?;
        Some((&spliced).into())
    }

    pub async fn blob_split_support(&self) -> bool {
        self.cas.blob_split_support(&self.instance_name).await
    }

    pub async fn blob_splice_support(&self) -> bool {
        self.cas.blob_splice_support(&self.instance_name).await
    }

    /// Executes an action remotely and waits for the result.
    pub async fn execute_action_sync(&self, action: &Digest) -> Option<ExecutionOutput> {
        self.exec
            .execute(
                &self.instance_name,
                &action.into(),
                /*skip_cache_lookup=*/ false,
            )
            .await
    }

    /// Looks up the action cache.
    pub async fn get_cached_action_result(
        &self,
        action: &Digest,
        output_files: Vec<String>,
    ) -> Option<remexec::ActionResult> {
        self.ac
            .get_action_result(&self.instance_name, &action.into(), false, false, output_files)
            .await
    }

    /// Fetches the full directory closure below a root `Directory`.
    /// Compatibility mode only.
    pub async fn query_full_tree(&self, digest: &Digest) -> Option<Vec<remexec::Directory>> {
        if !self.hash.is_compatible() {
            return None;
        }
        self.cas
            .get_tree(
                &self.instance_name,
                &digest.into(),
                MAX_BATCH_TRANSFER_SIZE as i32,
            )
            .await
            .ok()
    }
}

/// Pull-based blob download: groups digests into batched reads where their
/// cumulative size allows, and falls back to single byte-stream reads for
/// unknown-size or oversized entries.
pub struct BlobReader<'a> {
    client: &'a RemoteExecutionClient,
    ids: Vec<remexec::Digest>,
    begin: usize,
    current: usize,
}

impl BlobReader<'_> {
    /// The next batch of blobs; empty when the reader is exhausted.
    pub async fn next(&mut self) -> Vec<Blob> {
        let mut size = 0usize;
        let mut blobs = Vec::new();

        while self.current < self.ids.len() {
            let blob_size = self.ids[self.current].size_bytes.max(0) as usize;
            size += blob_size;
            // read single if the size is 0 (unknown) or exceeds the
            // transfer limit
            if blob_size == 0 || size > MAX_BATCH_TRANSFER_SIZE {
                if self.begin == self.current {
                    if let Some(blob) =
                        self.client.read_single_blob(&self.ids[self.begin]).await
                    {
                        blobs.push(blob);
                    }
                    self.current += 1;
                } else {
                    blobs = self.batch_read_range().await;
                }
                self.begin = self.current;
                return blobs;
            }
            self.current += 1;
        }

        if self.begin != self.current {
            blobs = self.batch_read_range().await;
            self.begin = self.current;
        }
        blobs
    }

    async fn batch_read_range(&self) -> Vec<Blob> {
        let range = self.ids[self.begin..self.current].to_vec();
        match self
            .client
            .cas
            .batch_read_blobs(&self.client.instance_name, range)
            .await
        {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(%err, "reading blobs failed");
                Vec::new()
            }
        }
    }
}
