//! The server-side byte-stream: chunked reads and client-streamed writes
//! of blobs addressed through resource names.

use std::fs;
use std::sync::Arc;

use futures::stream::BoxStream;
use tonic::{async_trait, Request, Response, Status, Streaming};
use tracing::instrument;

use quarry_castore::{Digest, GarbageCollector, LocalCas};
use quarry_reapi::google::bytestream::{
    byte_stream_server::ByteStream, QueryWriteStatusRequest, QueryWriteStatusResponse,
    ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};

use crate::remote::BYTESTREAM_CHUNK_SIZE;

pub struct ByteStreamService {
    storage: Arc<LocalCas>,
}

impl ByteStreamService {
    pub fn new(storage: Arc<LocalCas>) -> Self {
        Self { storage }
    }

    fn gc_lock(&self) -> Result<quarry_castore::GcLock, Status> {
        GarbageCollector::shared_lock(self.storage.root())
            .ok_or_else(|| Status::internal("could not acquire shared gc lock"))
    }

    fn object_path(&self, digest: &Digest) -> Option<std::path::PathBuf> {
        if digest.is_tree && !self.storage.hash_function().is_compatible() {
            return self.storage.tree_path(digest);
        }
        self.storage
            .blob_path(digest, false)
            .or_else(|| self.storage.blob_path(digest, true))
    }
}

/// Extracts `(hash, size)` from a resource name of the form
/// `{instance}/blobs/{hash}/{size}` or
/// `{instance}/uploads/{uuid}/blobs/{hash}/{size}`.
fn parse_resource_name(resource: &str) -> Result<Digest, Status> {
    let segments: Vec<&str> = resource.split('/').collect();
    let blobs_at = segments
        .iter()
        .rposition(|segment| *segment == "blobs")
        .ok_or_else(|| {
            Status::invalid_argument(format!("malformed resource name {:?}", resource))
        })?;
    let hash = segments.get(blobs_at + 1).ok_or_else(|| {
        Status::invalid_argument(format!("resource name without hash: {:?}", resource))
    })?;
    let size: i64 = segments
        .get(blobs_at + 2)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            Status::invalid_argument(format!("resource name without size: {:?}", resource))
        })?;
    Ok(Digest::new(
        (*hash).to_owned(),
        size,
        quarry_castore::is_tree_hash(hash),
    ))
}

#[async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = BoxStream<'static, Result<ReadResponse, Status>>;

    #[instrument(skip_all, fields(resource = %request.get_ref().resource_name))]
    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();
        let digest = parse_resource_name(&request.resource_name)?;

        let path = self.object_path(&digest).ok_or_else(|| {
            Status::not_found(format!(
                "blob {} not found in cas",
                digest.unprefixed_hash()
            ))
        })?;
        let mut data = fs::read(path).map_err(|err| Status::internal(err.to_string()))?;

        if request.read_offset > 0 {
            let offset = (request.read_offset as usize).min(data.len());
            data.drain(..offset);
        }
        if request.read_limit > 0 {
            data.truncate(request.read_limit as usize);
        }

        let chunks: Vec<Result<ReadResponse, Status>> = if data.is_empty() {
            vec![Ok(ReadResponse { data })]
        } else {
            data.chunks(BYTESTREAM_CHUNK_SIZE)
                .map(|chunk| Ok(ReadResponse {
                    data: chunk.to_vec(),
                }))
                .collect()
        };
        Ok(Response::new(Box::pin(tokio_stream::iter(chunks))))
    }

    #[instrument(skip_all)]
    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let mut stream = request.into_inner();

        let mut claimed: Option<Digest> = None;
        let mut data: Vec<u8> = Vec::new();
        let mut finished = false;

        while let Some(message) = stream.message().await? {
            if claimed.is_none() {
                claimed = Some(parse_resource_name(&message.resource_name)?);
            }
            if message.write_offset != data.len() as i64 {
                return Err(Status::invalid_argument(format!(
                    "unexpected write offset {} at position {}",
                    message.write_offset,
                    data.len()
                )));
            }
            data.extend_from_slice(&message.data);
            if message.finish_write {
                finished = true;
                break;
            }
        }

        let claimed =
            claimed.ok_or_else(|| Status::invalid_argument("empty write stream"))?;
        if !finished {
            return Err(Status::invalid_argument(
                "write stream ended without finish_write",
            ));
        }

        let computed = if claimed.is_tree {
            self.storage.hash_function().compute_tree_digest(&data)
        } else {
            self.storage.hash_function().compute_blob_digest(&data)
        };
        if computed.hash != claimed.hash {
            return Err(Status::invalid_argument(format!(
                "content does not match digest {}",
                claimed.unprefixed_hash()
            )));
        }

        let stored = if claimed.is_tree {
            self.storage.store_tree(&data)
        } else {
            self.storage.store_blob(&data, false)
        };
        stored.map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(WriteResponse {
            committed_size: data.len() as i64,
        }))
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let _gc_lock = self.gc_lock()?;
        let digest = parse_resource_name(&request.into_inner().resource_name)?;

        let response = match self.object_path(&digest) {
            Some(_) => QueryWriteStatusResponse {
                committed_size: digest.size,
                complete: true,
            },
            None => QueryWriteStatusResponse {
                committed_size: 0,
                complete: false,
            },
        };
        Ok(Response::new(response))
    }
}
