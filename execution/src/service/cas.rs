//! The server-side CAS: availability probes, batched transfers, the
//! directory-closure query, and the blob split/splice extension.

use std::fs;
use std::sync::Arc;

use futures::stream::BoxStream;
use prost::Message;
use tonic::{async_trait, Request, Response, Status};
use tracing::instrument;

use quarry_castore::{Digest, GarbageCollector, LocalCas};
use quarry_reapi::google::rpc;
use quarry_reapi::remexec::{
    batch_read_blobs_response, batch_update_blobs_response,
    content_addressable_storage_server::ContentAddressableStorage, BatchReadBlobsRequest,
    BatchReadBlobsResponse, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse,
    FindMissingBlobsRequest, FindMissingBlobsResponse, GetTreeRequest, GetTreeResponse,
    SpliceBlobRequest, SpliceBlobResponse, SplitBlobRequest, SplitBlobResponse,
};

use crate::bridge;

/// Fixed chunk size used by the server-side blob splitter.
pub const SPLIT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

pub struct CasService {
    storage: Arc<LocalCas>,
}

impl CasService {
    pub fn new(storage: Arc<LocalCas>) -> Self {
        Self { storage }
    }

    fn gc_lock(&self) -> Result<quarry_castore::GcLock, Status> {
        GarbageCollector::shared_lock(self.storage.root())
            .ok_or_else(|| Status::internal("could not acquire shared gc lock"))
    }

    fn object_present(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_some()
    }

    // A wire digest may name a regular blob, an executable one, or (in
    // native mode) a tree object.
    fn object_path(&self, digest: &Digest) -> Option<std::path::PathBuf> {
        if digest.is_tree && !self.storage.hash_function().is_compatible() {
            return self.storage.tree_path(digest);
        }
        self.storage
            .blob_path(digest, false)
            .or_else(|| self.storage.blob_path(digest, true))
    }

    fn store_verified(&self, claimed: &Digest, data: &[u8]) -> Result<(), Status> {
        let computed = if claimed.is_tree {
            self.storage.hash_function().compute_tree_digest(data)
        } else {
            self.storage.hash_function().compute_blob_digest(data)
        };
        if computed.hash != claimed.hash || computed.size != claimed.size {
            return Err(Status::invalid_argument(format!(
                "digest mismatch: claimed {} with size {}, computed {}",
                claimed.unprefixed_hash(),
                claimed.size,
                computed.unprefixed_hash()
            )));
        }
        let stored = if claimed.is_tree {
            self.storage.store_tree(data)
        } else {
            self.storage.store_blob(data, false)
        };
        stored
            .map(|_| ())
            .map_err(|err| Status::internal(err.to_string()))
    }
}

fn status_ok() -> rpc::Status {
    rpc::Status {
        code: tonic::Code::Ok as i32,
        message: String::new(),
        details: Vec::new(),
    }
}

fn status_from(status: &Status) -> rpc::Status {
    rpc::Status {
        code: status.code() as i32,
        message: status.message().to_owned(),
        details: Vec::new(),
    }
}

#[async_trait]
impl ContentAddressableStorage for CasService {
    #[instrument(skip_all, fields(count = request.get_ref().blob_digests.len()))]
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();

        let missing = request
            .blob_digests
            .into_iter()
            .filter(|wire| !self.object_present(&wire.into()))
            .collect();
        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing,
        }))
    }

    #[instrument(skip_all, fields(count = request.get_ref().requests.len()))]
    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();

        let mut responses = Vec::with_capacity(request.requests.len());
        for blob_request in request.requests {
            let Some(wire) = blob_request.digest else {
                return Err(Status::invalid_argument("blob upload without digest"));
            };
            let claimed: Digest = (&wire).into();
            let status = match self.store_verified(&claimed, &blob_request.data) {
                Ok(()) => status_ok(),
                Err(status) => status_from(&status),
            };
            responses.push(batch_update_blobs_response::Response {
                digest: Some(wire),
                status: Some(status),
            });
        }
        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    #[instrument(skip_all, fields(count = request.get_ref().digests.len()))]
    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();

        let mut responses = Vec::with_capacity(request.digests.len());
        for wire in request.digests {
            let digest: Digest = (&wire).into();
            let (data, status) = match self.object_path(&digest).map(fs::read) {
                Some(Ok(data)) => (data, status_ok()),
                Some(Err(err)) => (
                    Vec::new(),
                    status_from(&Status::internal(err.to_string())),
                ),
                None => (
                    Vec::new(),
                    status_from(&Status::not_found(format!(
                        "blob {} not found in cas",
                        digest.unprefixed_hash()
                    ))),
                ),
            };
            responses.push(batch_read_blobs_response::Response {
                digest: Some(wire),
                data,
                status: Some(status),
            });
        }
        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream = BoxStream<'static, Result<GetTreeResponse, Status>>;

    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        let _gc_lock = self.gc_lock()?;
        if !self.storage.hash_function().is_compatible() {
            return Err(Status::failed_precondition(
                "GetTree is only available in compatibility mode",
            ));
        }
        let request = request.into_inner();
        let root_digest = request
            .root_digest
            .ok_or_else(|| Status::invalid_argument("GetTree without root digest"))?;

        let root = self.read_directory(&root_digest).ok_or_else(|| {
            Status::not_found(format!("directory {} not found in cas", root_digest.hash))
        })?;
        let children = bridge::collect_child_directories(&root, &self.storage)
            .ok_or_else(|| Status::not_found("incomplete directory closure in cas"))?;
        let mut directories = vec![root];
        directories.extend(children);

        Ok(Response::new(Box::pin(tokio_stream::once(Ok(
            GetTreeResponse {
                directories,
                next_page_token: String::new(),
            },
        )))))
    }

    async fn split_blob(
        &self,
        request: Request<SplitBlobRequest>,
    ) -> Result<Response<SplitBlobResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();
        let digest: Digest = request
            .blob_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("SplitBlob without digest"))?
            .into();

        let path = self.object_path(&digest).ok_or_else(|| {
            Status::not_found(format!(
                "blob {} not found in cas",
                digest.unprefixed_hash()
            ))
        })?;
        let data = fs::read(path).map_err(|err| Status::internal(err.to_string()))?;

        let mut chunk_digests = Vec::with_capacity(data.len() / SPLIT_CHUNK_SIZE + 1);
        for chunk in data.chunks(SPLIT_CHUNK_SIZE.max(1)) {
            let chunk_digest = self
                .storage
                .store_blob(chunk, false)
                .map_err(|err| Status::internal(err.to_string()))?;
            chunk_digests.push((&chunk_digest).into());
        }
        Ok(Response::new(SplitBlobResponse { chunk_digests }))
    }

    async fn splice_blob(
        &self,
        request: Request<SpliceBlobRequest>,
    ) -> Result<Response<SpliceBlobResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();
        let claimed: Digest = request
            .blob_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("SpliceBlob without digest"))?
            .into();

        let mut data = Vec::new();
        for wire in &request.chunk_digests {
            let chunk: Digest = wire.into();
            let path = self
                .storage
                .blob_path(&chunk, false)
                .ok_or_else(|| {
                    Status::not_found(format!(
                        "chunk {} not found in cas",
                        chunk.unprefixed_hash()
                    ))
                })?;
            data.extend(fs::read(path).map_err(|err| Status::internal(err.to_string()))?);
        }

        self.store_verified(&claimed, &data)?;
        Ok(Response::new(SpliceBlobResponse {
            blob_digest: request.blob_digest,
        }))
    }
}

impl CasService {
    fn read_directory(
        &self,
        wire: &quarry_reapi::remexec::Digest,
    ) -> Option<quarry_reapi::remexec::Directory> {
        let digest: Digest = wire.into();
        let path = self.storage.blob_path(&digest, false)?;
        let content = fs::read(path).ok()?;
        quarry_reapi::remexec::Directory::decode(content.as_slice()).ok()
    }
}
