//! Byte-stream transfers for blobs exceeding the batch limits.

use bytes::Bytes;
use tonic::transport::Channel;
use tracing::{instrument, warn};

use quarry_castore::Error;
use quarry_reapi::google::bytestream::{
    byte_stream_client::ByteStreamClient as GrpcByteStreamClient, ReadRequest, WriteRequest,
};

/// Upper bound for a single byte-stream message payload.
pub const BYTESTREAM_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ByteStreamClient {
    client: GrpcByteStreamClient<Channel>,
}

impl ByteStreamClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: GrpcByteStreamClient::new(channel),
        }
    }

    /// Opens a chunked read of the named resource.
    pub async fn read(&self, resource_name: String) -> Result<IncrementalReader, Error> {
        let stream = self
            .client
            .clone()
            .read(ReadRequest {
                resource_name,
                read_offset: 0,
                read_limit: 0,
            })
            .await
            .map_err(|status| Error::Io(std::io::Error::other(status)))?
            .into_inner();
        Ok(IncrementalReader { stream })
    }

    /// Writes the full content under the given resource name. Success
    /// requires the server to acknowledge the complete size.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn write(&self, resource_name: String, data: Bytes) -> bool {
        let total = data.len();
        let mut requests = Vec::with_capacity(total / BYTESTREAM_CHUNK_SIZE + 1);
        let mut offset = 0usize;
        loop {
            let end = (offset + BYTESTREAM_CHUNK_SIZE).min(total);
            let last = end == total;
            requests.push(WriteRequest {
                resource_name: if offset == 0 {
                    resource_name.clone()
                } else {
                    String::new()
                },
                write_offset: offset as i64,
                finish_write: last,
                data: data.slice(offset..end).to_vec(),
            });
            if last {
                break;
            }
            offset = end;
        }

        match self
            .client
            .clone()
            .write(tokio_stream::iter(requests))
            .await
        {
            Ok(response) => {
                let committed = response.into_inner().committed_size;
                if committed != total as i64 {
                    warn!(committed, total, "byte stream write was not fully committed");
                    return false;
                }
                true
            }
            Err(status) => {
                warn!(%status, "byte stream write failed");
                false
            }
        }
    }
}

/// A pull-based chunk reader: yields arbitrary-sized chunks until EOF
/// (`None`).
pub struct IncrementalReader {
    stream: tonic::codec::Streaming<quarry_reapi::google::bytestream::ReadResponse>,
}

impl IncrementalReader {
    pub async fn next(&mut self) -> Option<Result<Bytes, Error>> {
        match self.stream.message().await {
            Ok(Some(response)) => Some(Ok(Bytes::from(response.data))),
            Ok(None) => None,
            Err(status) => Some(Err(Error::Io(std::io::Error::other(status)))),
        }
    }

    /// Drains the remaining chunks into one buffer.
    pub async fn collect(mut self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.into())
    }
}
