//! The Execute RPC, driven synchronously: the operation stream is drained
//! until the final (done) operation carries the response.

use prost::Message;
use tonic::transport::Channel;
use tracing::warn;

use quarry_castore::unprefix;
use quarry_reapi::google::longrunning::{operation, Operation};
use quarry_reapi::remexec::{
    execution_client::ExecutionClient, Digest, ExecuteRequest, ExecuteResponse,
};

/// Suffix the packed response must carry in its `Any` type URL.
const EXECUTE_RESPONSE_TYPE: &str = "build.bazel.remote.execution.v2.ExecuteResponse";

/// The outcome of a finished remote execution.
pub struct ExecutionOutput {
    pub action_result: quarry_reapi::remexec::ActionResult,
    pub cached_result: bool,
    pub message: String,
}

pub struct ExecClient {
    client: ExecutionClient<Channel>,
}

impl ExecClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ExecutionClient::new(channel),
        }
    }

    /// Runs an action and blocks until the operation finishes. `None` if
    /// the operation ends in any state other than finished-with-output.
    pub async fn execute(
        &self,
        instance_name: &str,
        action_digest: &Digest,
        skip_cache_lookup: bool,
    ) -> Option<ExecutionOutput> {
        let mut stream = match self
            .client
            .clone()
            .execute(ExecuteRequest {
                instance_name: instance_name.to_owned(),
                skip_cache_lookup,
                action_digest: Some(action_digest.clone()),
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!(
                    %status,
                    action = unprefix(&action_digest.hash),
                    "failed to execute action"
                );
                return None;
            }
        };

        let mut finished: Option<Operation> = None;
        loop {
            match stream.message().await {
                Ok(Some(op)) if op.done => {
                    finished = Some(op);
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(status) => {
                    warn!(
                        %status,
                        action = unprefix(&action_digest.hash),
                        "execution stream failed"
                    );
                    return None;
                }
            }
        }

        let op = finished?;
        match op.result? {
            operation::Result::Error(status) => {
                warn!(
                    code = status.code,
                    message = %status.message,
                    action = unprefix(&action_digest.hash),
                    "remote execution reported an error"
                );
                None
            }
            operation::Result::Response(any) => {
                if !any.type_url.ends_with(EXECUTE_RESPONSE_TYPE) {
                    warn!(type_url = %any.type_url, "unexpected operation response type");
                    return None;
                }
                let response = match ExecuteResponse::decode(any.value.as_slice()) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(%err, "failed to parse execute response");
                        return None;
                    }
                };
                Some(ExecutionOutput {
                    action_result: response.result?,
                    cached_result: response.cached_result,
                    message: response.message,
                })
            }
        }
    }
}
