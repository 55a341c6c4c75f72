//! Server capability advertisement. Exactly one digest function is
//! reported per instance, matching its hash mode.

use tonic::{async_trait, Request, Response, Status};

use quarry_castore::HashFunction;
use quarry_reapi::remexec::{
    capabilities_server::Capabilities, digest_function, symlink_absolute_path_strategy,
    ActionCacheUpdateCapabilities, CacheCapabilities, ExecutionCapabilities,
    GetCapabilitiesRequest, ServerCapabilities,
};
use quarry_reapi::semver::SemVer;

use crate::remote::MAX_BATCH_TRANSFER_SIZE;

pub struct CapabilitiesService {
    hash: HashFunction,
}

impl CapabilitiesService {
    pub fn new(hash: HashFunction) -> Self {
        Self { hash }
    }

    fn digest_function(&self) -> digest_function::Value {
        if self.hash.is_compatible() {
            digest_function::Value::Sha256
        } else {
            digest_function::Value::Sha1
        }
    }
}

#[async_trait]
impl Capabilities for CapabilitiesService {
    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        let digest_function = self.digest_function();
        Ok(Response::new(ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_function: vec![digest_function as i32],
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    update_enabled: true,
                }),
                max_batch_total_size_bytes: MAX_BATCH_TRANSFER_SIZE as i64,
                symlink_absolute_path_strategy: symlink_absolute_path_strategy::Value::Disallowed
                    as i32,
            }),
            execution_capabilities: Some(ExecutionCapabilities {
                digest_function: digest_function as i32,
                exec_enabled: true,
            }),
            low_api_version: Some(SemVer {
                major: 2,
                minor: 0,
                patch: 0,
                prerelease: String::new(),
            }),
            high_api_version: Some(SemVer {
                major: 2,
                minor: 1,
                patch: 0,
                prerelease: String::new(),
            }),
        }))
    }
}
