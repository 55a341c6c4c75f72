//! The CAS-side RPCs: availability probing, batched transfers, and the
//! optional blob split/splice extension.

use bytes::Bytes;
use tokio::sync::OnceCell;
use tonic::transport::Channel;
use tonic::Code;
use tracing::{debug, instrument, warn};

use quarry_castore::{Digest, Error, HashFunction};
use quarry_reapi::remexec::{
    batch_update_blobs_request,
    content_addressable_storage_client::ContentAddressableStorageClient, BatchReadBlobsRequest,
    BatchUpdateBlobsRequest, FindMissingBlobsRequest, GetTreeRequest, SpliceBlobRequest,
    SplitBlobRequest,
};
use quarry_reapi::remexec;

use super::MAX_BATCH_TRANSFER_SIZE;
use crate::blob::Blob;

pub struct CasClient {
    client: ContentAddressableStorageClient<Channel>,
    hash: HashFunction,
    split_support: OnceCell<bool>,
    splice_support: OnceCell<bool>,
}

impl CasClient {
    pub fn new(channel: Channel, hash: HashFunction) -> Self {
        Self {
            client: ContentAddressableStorageClient::new(channel),
            hash,
            split_support: OnceCell::new(),
            splice_support: OnceCell::new(),
        }
    }

    /// One RPC asking which of the given digests the server lacks.
    pub async fn find_missing_blobs(
        &self,
        instance_name: &str,
        digests: Vec<remexec::Digest>,
    ) -> Result<Vec<remexec::Digest>, Error> {
        let response = self
            .client
            .clone()
            .find_missing_blobs(FindMissingBlobsRequest {
                instance_name: instance_name.to_owned(),
                blob_digests: digests,
            })
            .await
            .map_err(|status| Error::Io(std::io::Error::other(status)))?;
        Ok(response.into_inner().missing_blob_digests)
    }

    /// Uploads small blobs in as many `BatchUpdateBlobs` RPCs as needed to
    /// stay below the transfer limit. Returns how many blobs the server
    /// acknowledged.
    #[instrument(skip_all, fields(count = blobs.len()))]
    pub async fn batch_update_blobs(&self, instance_name: &str, blobs: &[&Blob]) -> usize {
        let mut acknowledged = 0;
        let mut batch: Vec<batch_update_blobs_request::Request> = Vec::new();
        let mut batch_size = 0usize;

        for blob in blobs {
            if batch_size + blob.data.len() > MAX_BATCH_TRANSFER_SIZE && !batch.is_empty() {
                acknowledged += self
                    .send_update_batch(instance_name, std::mem::take(&mut batch))
                    .await;
                batch_size = 0;
            }
            batch_size += blob.data.len();
            batch.push(batch_update_blobs_request::Request {
                digest: Some((&blob.digest).into()),
                data: blob.data.to_vec(),
            });
        }
        if !batch.is_empty() {
            acknowledged += self.send_update_batch(instance_name, batch).await;
        }
        acknowledged
    }

    async fn send_update_batch(
        &self,
        instance_name: &str,
        requests: Vec<batch_update_blobs_request::Request>,
    ) -> usize {
        match self
            .client
            .clone()
            .batch_update_blobs(BatchUpdateBlobsRequest {
                instance_name: instance_name.to_owned(),
                requests,
            })
            .await
        {
            Ok(response) => response
                .into_inner()
                .responses
                .into_iter()
                .filter(|blob_response| {
                    blob_response
                        .status
                        .as_ref()
                        .map(|status| status.code == Code::Ok as i32)
                        .unwrap_or(true)
                })
                .count(),
            Err(status) => {
                warn!(%status, "batch blob upload failed");
                0
            }
        }
    }

    /// One `BatchReadBlobs` RPC; only successfully served blobs are
    /// returned.
    pub async fn batch_read_blobs(
        &self,
        instance_name: &str,
        digests: Vec<remexec::Digest>,
    ) -> Result<Vec<Blob>, Error> {
        let response = self
            .client
            .clone()
            .batch_read_blobs(BatchReadBlobsRequest {
                instance_name: instance_name.to_owned(),
                digests,
            })
            .await
            .map_err(|status| Error::Io(std::io::Error::other(status)))?;

        Ok(response
            .into_inner()
            .responses
            .into_iter()
            .filter(|blob_response| {
                blob_response
                    .status
                    .as_ref()
                    .map(|status| status.code == Code::Ok as i32)
                    .unwrap_or(true)
            })
            .filter_map(|blob_response| {
                let digest: Digest = (&blob_response.digest?).into();
                Some(Blob {
                    digest,
                    data: Bytes::from(blob_response.data),
                    is_executable: false,
                })
            })
            .collect())
    }

    /// Drains the `GetTree` stream into the full list of directories.
    pub async fn get_tree(
        &self,
        instance_name: &str,
        root_digest: &remexec::Digest,
        page_size: i32,
    ) -> Result<Vec<remexec::Directory>, Error> {
        let mut stream = self
            .client
            .clone()
            .get_tree(GetTreeRequest {
                instance_name: instance_name.to_owned(),
                root_digest: Some(root_digest.clone()),
                page_size,
                page_token: String::new(),
            })
            .await
            .map_err(|status| Error::Io(std::io::Error::other(status)))?
            .into_inner();

        let mut directories = Vec::new();
        while let Some(page) = stream
            .message()
            .await
            .map_err(|status| Error::Io(std::io::Error::other(status)))?
        {
            directories.extend(page.directories);
        }
        Ok(directories)
    }

    /// Asks the server to split a blob into chunks. `None` when the server
    /// lacks the extension or the blob is absent.
    pub async fn split_blob(
        &self,
        instance_name: &str,
        blob_digest: &remexec::Digest,
    ) -> Option<Vec<remexec::Digest>> {
        match self
            .client
            .clone()
            .split_blob(SplitBlobRequest {
                instance_name: instance_name.to_owned(),
                blob_digest: Some(blob_digest.clone()),
            })
            .await
        {
            Ok(response) => Some(response.into_inner().chunk_digests),
            Err(status) => {
                debug!(%status, "blob split request failed");
                None
            }
        }
    }

    /// Asks the server to splice a blob from known chunks.
    pub async fn splice_blob(
        &self,
        instance_name: &str,
        blob_digest: &remexec::Digest,
        chunk_digests: Vec<remexec::Digest>,
    ) -> Option<remexec::Digest> {
        match self
            .client
            .clone()
            .splice_blob(SpliceBlobRequest {
                instance_name: instance_name.to_owned(),
                blob_digest: Some(blob_digest.clone()),
                chunk_digests,
            })
            .await
        {
            Ok(response) => response.into_inner().blob_digest,
            Err(status) => {
                debug!(%status, "blob splice request failed");
                None
            }
        }
    }

    /// Probes split support once by splitting the empty blob; any answer
    /// other than UNIMPLEMENTED means the extension is available.
    pub async fn blob_split_support(&self, instance_name: &str) -> bool {
        *self
            .split_support
            .get_or_init(|| async {
                let empty = self.hash.compute_blob_digest(b"");
                self.probe_unimplemented_split(instance_name, &(&empty).into())
                    .await
            })
            .await
    }

    async fn probe_unimplemented_split(
        &self,
        instance_name: &str,
        digest: &remexec::Digest,
    ) -> bool {
        match self
            .client
            .clone()
            .split_blob(SplitBlobRequest {
                instance_name: instance_name.to_owned(),
                blob_digest: Some(digest.clone()),
            })
            .await
        {
            Ok(_) => true,
            Err(status) => status.code() != Code::Unimplemented,
        }
    }

    /// Probes splice support once by splicing the empty blob from no
    /// chunks.
    pub async fn blob_splice_support(&self, instance_name: &str) -> bool {
        *self
            .splice_support
            .get_or_init(|| async {
                let empty = self.hash.compute_blob_digest(b"");
                match self
                    .client
                    .clone()
                    .splice_blob(SpliceBlobRequest {
                        instance_name: instance_name.to_owned(),
                        blob_digest: Some((&empty).into()),
                        chunk_digests: Vec::new(),
                    })
                    .await
                {
                    Ok(_) => true,
                    Err(status) => status.code() != Code::Unimplemented,
                }
            })
            .await
    }
}
