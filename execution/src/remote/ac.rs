//! Action-cache lookups against the upstream endpoint.

use tonic::transport::Channel;
use tonic::Code;
use tracing::warn;

use quarry_castore::unprefix;
use quarry_reapi::remexec::{
    action_cache_client::ActionCacheClient, ActionResult, Digest, GetActionResultRequest,
};

pub struct AcClient {
    client: ActionCacheClient<Channel>,
}

impl AcClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ActionCacheClient::new(channel),
        }
    }

    /// Fetches the cached result for an action digest, if any.
    pub async fn get_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
        inline_stdout: bool,
        inline_stderr: bool,
        inline_output_files: Vec<String>,
    ) -> Option<ActionResult> {
        match self
            .client
            .clone()
            .get_action_result(GetActionResultRequest {
                instance_name: instance_name.to_owned(),
                action_digest: Some(action_digest.clone()),
                inline_stdout,
                inline_stderr,
                inline_output_files,
            })
            .await
        {
            Ok(response) => Some(response.into_inner()),
            Err(status) if status.code() == Code::NotFound => None,
            Err(status) => {
                warn!(
                    %status,
                    action = unprefix(&action_digest.hash),
                    "action cache lookup failed"
                );
                None
            }
        }
    }
}
